// Core modules for option schemas, line framing, window planning and errors.
pub mod error;
pub mod lines;
pub mod options;
pub mod window;
