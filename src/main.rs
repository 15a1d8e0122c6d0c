//! Purpose: `couchfeed` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, consumes feeds and result windows, emits JSON lines.
//! Invariants: Stdout carries one JSON value per line and nothing else.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: SIGINT stops consumption at the next row boundary.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum, error::ErrorKind as ClapErrorKind};
use couchfeed::api::{
    ApiResult, Error, ErrorKind, Feed, FeedMode, FeedOptions, FeedRow, InfiniteFeed, Query,
    QueryOptions, QueryResult, Resource, ResultOptions, Seq, Session, SessionConfig, StopHandle,
    Style, UreqSession, View, ViewResult, to_exit_code,
};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

/// Exit code after a SIGINT-driven stop.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn finished(stop: &StopHandle) -> Self {
        if stop.is_stopped() {
            Self {
                exit_code: INTERRUPTED_EXIT_CODE,
            }
        } else {
            Self::ok()
        }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Argument)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `couchfeed --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    dispatch(cli.command, &cli.connection).map_err(|err| (err, color_mode))
}

fn dispatch(command: Command, connection: &ConnectionArgs) -> Result<RunOutcome, Error> {
    match command {
        Command::Changes(args) => run_changes(connection, args),
        Command::DbUpdates(args) => run_db_updates(connection, args),
        Command::Rows(args) => run_rows(connection, args),
        Command::Find(args) => run_find(connection, args),
    }
}

#[derive(Parser)]
#[command(
    name = "couchfeed",
    version,
    about = "Stream CouchDB/Cloudant changes and page through views and queries",
    long_about = None,
    after_help = r#"EXAMPLES
  $ couchfeed changes http://localhost:5984/animals --include-docs
  $ couchfeed changes http://localhost:5984/animals --infinite --heartbeat 10000
  $ couchfeed db-updates https://acct.cloudant.com --cloudant --feed continuous
  $ couchfeed rows http://localhost:5984/animals --design zoo --view by_kind --page-size 500
  $ couchfeed find http://localhost:5984/animals --selector '{"kind": "bird"}'

Output is one JSON value per line. Ctrl-C stops at the next row or heartbeat.
Set RUST_LOG=debug to trace requests on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    #[arg(
        long,
        global = true,
        value_name = "VALUE",
        help = "Authorization header value sent on every request"
    )]
    auth_header: Option<String>,
    #[arg(long, global = true, value_name = "MS", default_value_t = 30_000)]
    connect_timeout_ms: u64,
    #[arg(
        long,
        global = true,
        value_name = "MS",
        help = "Idle read timeout; infinite feeds reconnect when it fires"
    )]
    read_timeout_ms: Option<u64>,
}

impl ConnectionArgs {
    fn session(&self, url: &str) -> Result<Arc<dyn Session>, Error> {
        let mut config = SessionConfig::new(url)?
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if let Some(millis) = self.read_timeout_ms {
            config = config.with_read_timeout(Duration::from_millis(millis));
        }
        if let Some(value) = &self.auth_header {
            config = config.with_authorization(value.clone());
        }
        Ok(Arc::new(UreqSession::new(config)))
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FeedModeArg {
    Normal,
    Longpoll,
    Continuous,
}

impl From<FeedModeArg> for FeedMode {
    fn from(mode: FeedModeArg) -> Self {
        match mode {
            FeedModeArg::Normal => FeedMode::Normal,
            FeedModeArg::Longpoll => FeedMode::Longpoll,
            FeedModeArg::Continuous => FeedMode::Continuous,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StyleArg {
    MainOnly,
    AllDocs,
}

impl From<StyleArg> for Style {
    fn from(style: StyleArg) -> Self {
        match style {
            StyleArg::MainOnly => Style::MainOnly,
            StyleArg::AllDocs => Style::AllDocs,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Read a database's _changes feed")]
    Changes(ChangesArgs),
    #[command(about = "Read a server's _db_updates feed")]
    DbUpdates(DbUpdatesArgs),
    #[command(about = "Read view or _all_docs rows, paging as needed")]
    Rows(RowsArgs),
    #[command(about = "Run a _find selector query, paging as needed")]
    Find(FindArgs),
}

#[derive(Args)]
struct FeedArgs {
    #[arg(long, value_enum)]
    feed: Option<FeedModeArg>,
    #[arg(long, help = "Start after this sequence (`now` for the current end)")]
    since: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long, value_name = "MS")]
    heartbeat: Option<u64>,
    #[arg(long, value_name = "MS", help = "Server-side timeout for one connection")]
    timeout: Option<u64>,
    #[arg(long)]
    descending: bool,
    #[arg(long, help = "Reconnect from the last sequence whenever the stream ends")]
    infinite: bool,
    #[arg(long, help = "Emit undecoded lines instead of change rows")]
    raw: bool,
    #[arg(long, help = "Print {\"last_seq\": ...} after a finite feed ends")]
    emit_last_seq: bool,
}

impl FeedArgs {
    fn options(&self) -> FeedOptions {
        let mut options = FeedOptions::new();
        if let Some(mode) = self.feed {
            options = options.feed(mode.into());
        }
        if let Some(since) = &self.since {
            options = options.since(parse_since(since));
        }
        if let Some(limit) = self.limit {
            options = options.limit(limit);
        }
        if let Some(millis) = self.heartbeat {
            options = options.heartbeat(millis);
        }
        if let Some(millis) = self.timeout {
            options = options.timeout(millis);
        }
        if self.descending {
            options = options.descending(true);
        }
        options
    }
}

#[derive(Args)]
struct ChangesArgs {
    #[arg(help = "Database url, e.g. http://localhost:5984/animals")]
    db_url: String,
    #[command(flatten)]
    feed: FeedArgs,
    #[arg(long)]
    include_docs: bool,
    #[arg(long)]
    conflicts: bool,
    #[arg(long, value_enum)]
    style: Option<StyleArg>,
    #[arg(long, value_name = "DDOC/NAME")]
    filter: Option<String>,
    #[arg(
        long = "param",
        value_name = "NAME=VALUE",
        help = "Extra query parameter for a custom filter (repeatable)"
    )]
    params: Vec<String>,
    #[arg(long = "doc-id", value_name = "ID", help = "Restrict to these ids (repeatable)")]
    doc_ids: Vec<String>,
}

#[derive(Args)]
struct DbUpdatesArgs {
    #[arg(help = "Server url, e.g. http://localhost:5984")]
    server_url: String,
    #[arg(long, help = "Target a Cloudant server (supports continuous feeds)")]
    cloudant: bool,
    #[command(flatten)]
    feed: FeedArgs,
}

#[derive(Args)]
struct RowsArgs {
    #[arg(help = "Database url")]
    db_url: String,
    #[arg(long, requires = "view", value_name = "DDOC")]
    design: Option<String>,
    #[arg(long, requires = "design")]
    view: Option<String>,
    #[arg(long, value_name = "JSON")]
    key: Option<String>,
    #[arg(long, value_name = "JSON_ARRAY")]
    keys: Option<String>,
    #[arg(long, value_name = "JSON")]
    startkey: Option<String>,
    #[arg(long, value_name = "JSON")]
    endkey: Option<String>,
    #[arg(long)]
    skip: Option<u64>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    include_docs: bool,
    #[arg(long)]
    descending: bool,
    #[arg(long)]
    reduce: Option<bool>,
    #[arg(long)]
    group_level: Option<u64>,
    #[arg(long)]
    page_size: Option<u64>,
}

#[derive(Args)]
struct FindArgs {
    #[arg(help = "Database url")]
    db_url: String,
    #[arg(long, value_name = "JSON")]
    selector: String,
    #[arg(long, value_delimiter = ',', value_name = "FIELD,...")]
    fields: Vec<String>,
    #[arg(long, value_name = "JSON_ARRAY")]
    sort: Option<String>,
    #[arg(long, value_name = "DDOC")]
    use_index: Option<String>,
    #[arg(long)]
    skip: Option<u64>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    page_size: Option<u64>,
}

fn run_changes(connection: &ConnectionArgs, args: ChangesArgs) -> Result<RunOutcome, Error> {
    let session = connection.session(&args.db_url)?;
    let resource = Resource::database(&args.db_url)?;
    let mut options = args.feed.options();
    if args.include_docs {
        options = options.include_docs(true);
    }
    if args.conflicts {
        options = options.conflicts(true);
    }
    if let Some(style) = args.style {
        options = options.style(style.into());
    }
    if let Some(filter) = &args.filter {
        options = options.filter(filter.clone());
    }
    if !args.doc_ids.is_empty() {
        options = options.doc_ids(args.doc_ids.iter().cloned());
    }
    for param in &args.params {
        let (name, value) = parse_param(param)?;
        options = options.filter_param(name, value);
    }
    consume_feed(session, resource, options, &args.feed)
}

fn run_db_updates(connection: &ConnectionArgs, args: DbUpdatesArgs) -> Result<RunOutcome, Error> {
    let session = connection.session(&args.server_url)?;
    let resource = if args.cloudant {
        Resource::cloudant_server(&args.server_url)?
    } else {
        Resource::couch_server(&args.server_url)?
    };
    let options = args.feed.options();
    consume_feed(session, resource, options, &args.feed)
}

fn consume_feed(
    session: Arc<dyn Session>,
    resource: Resource,
    options: FeedOptions,
    args: &FeedArgs,
) -> Result<RunOutcome, Error> {
    let mut out = Output::new();
    if args.infinite {
        if args.raw {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("--raw cannot be combined with --infinite")
                .with_hint("Raw lines carry no cursor to resume from."));
        }
        let mut feed = InfiniteFeed::new(session, resource, options);
        let stop = feed.stop_handle();
        install_sigint(&stop)?;
        drain_feed(&mut feed, &mut out, &stop)?;
        return Ok(RunOutcome::finished(&stop));
    }

    let mut feed = Feed::new(session, resource, options);
    if args.raw {
        feed = feed.raw();
    }
    let stop = feed.stop_handle();
    install_sigint(&stop)?;
    drain_feed(&mut feed, &mut out, &stop)?;
    if args.emit_last_seq {
        if let Some(seq) = feed.last_seq() {
            out.emit(&last_seq_json(seq, feed.pending()))?;
        }
    }
    Ok(RunOutcome::finished(&stop))
}

fn drain_feed<I>(rows: &mut I, out: &mut Output, stop: &StopHandle) -> Result<(), Error>
where
    I: Iterator<Item = ApiResult<FeedRow>>,
{
    for row in rows {
        let open = match row? {
            FeedRow::Heartbeat => true,
            FeedRow::Change(event) => out.emit(&event.to_value())?,
            FeedRow::Raw(line) => out.write_line(&line)?,
        };
        if !open {
            stop.stop();
            break;
        }
    }
    Ok(())
}

fn run_rows(connection: &ConnectionArgs, args: RowsArgs) -> Result<RunOutcome, Error> {
    let session = connection.session(&args.db_url)?;
    let view = match (&args.design, &args.view) {
        (Some(ddoc), Some(name)) => View::design(session, &args.db_url, ddoc, name)?,
        _ => View::all_docs(session, &args.db_url)?,
    };
    let mut options = ResultOptions::new();
    if let Some(key) = &args.key {
        options = options.key(parse_json_arg("--key", key)?);
    }
    if let Some(keys) = &args.keys {
        options = options.set("keys", parse_json_arg("--keys", keys)?);
    }
    if let Some(key) = &args.startkey {
        options = options.startkey(parse_json_arg("--startkey", key)?);
    }
    if let Some(key) = &args.endkey {
        options = options.endkey(parse_json_arg("--endkey", key)?);
    }
    if let Some(skip) = args.skip {
        options = options.skip(skip);
    }
    if let Some(limit) = args.limit {
        options = options.limit(limit);
    }
    if args.include_docs {
        options = options.include_docs(true);
    }
    if args.descending {
        options = options.descending(true);
    }
    if let Some(reduce) = args.reduce {
        options = options.reduce(reduce);
    }
    if let Some(level) = args.group_level {
        options = options.group_level(level);
    }
    if let Some(page_size) = args.page_size {
        options = options.page_size(page_size);
    }

    let windowed = args.skip.is_some() || args.limit.is_some();
    let result = ViewResult::new(view, options)?;
    let stop = StopHandle::new();
    install_sigint(&stop)?;
    let mut out = Output::new();
    if windowed || args.keys.is_some() {
        // The window is one index slice; a keys list is one POST.
        let rows = if windowed { result.slice(0..)? } else { result.all()? };
        for row in rows {
            if !out.emit(&row.to_value())? {
                break;
            }
        }
    } else {
        for row in result.iter()? {
            if stop.is_stopped() || !out.emit(&row?.to_value())? {
                break;
            }
        }
    }
    Ok(RunOutcome::finished(&stop))
}

fn run_find(connection: &ConnectionArgs, args: FindArgs) -> Result<RunOutcome, Error> {
    let session = connection.session(&args.db_url)?;
    let mut query_options = QueryOptions::new().selector(parse_json_arg("--selector", &args.selector)?);
    if !args.fields.is_empty() {
        query_options = query_options.fields(args.fields.iter().cloned());
    }
    if let Some(sort) = &args.sort {
        query_options = query_options.sort(parse_json_arg("--sort", sort)?);
    }
    if let Some(index) = &args.use_index {
        query_options = query_options.use_index(index.clone());
    }
    let query = Query::new(session, &args.db_url, query_options)?;

    let mut options = QueryOptions::new();
    if let Some(skip) = args.skip {
        options = options.skip(skip);
    }
    if let Some(limit) = args.limit {
        options = options.limit(limit);
    }
    if let Some(page_size) = args.page_size {
        options = options.page_size(page_size);
    }
    let result = QueryResult::new(query, options)?;

    let stop = StopHandle::new();
    install_sigint(&stop)?;
    let mut out = Output::new();
    if args.limit.is_some() {
        for doc in result.all()? {
            if !out.emit(&doc.to_value())? {
                break;
            }
        }
    } else {
        for doc in result.iter()? {
            if stop.is_stopped() || !out.emit(&doc?.to_value())? {
                break;
            }
        }
    }
    Ok(RunOutcome::finished(&stop))
}

fn install_sigint(stop: &StopHandle) -> Result<(), Error> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.flag())
        .map(|_| ())
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to install SIGINT handler")
                .with_source(err)
        })
}

/// Line-oriented stdout; reports `false` once the reader has gone away.
struct Output {
    out: io::StdoutLock<'static>,
}

impl Output {
    fn new() -> Self {
        Self {
            out: io::stdout().lock(),
        }
    }

    fn emit(&mut self, value: &Value) -> Result<bool, Error> {
        let line = serde_json::to_vec(value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode output json")
                .with_source(err)
        })?;
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &[u8]) -> Result<bool, Error> {
        let written = self
            .out
            .write_all(line)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        match written {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(false),
            Err(err) => Err(Error::new(ErrorKind::Internal)
                .with_message("failed to write output")
                .with_source(err)),
        }
    }
}

fn parse_since(raw: &str) -> Seq {
    match raw.parse::<u64>() {
        Ok(number) => Seq::from(number),
        Err(_) => Seq::from(raw),
    }
}

fn parse_param(raw: &str) -> Result<(String, String), Error> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(Error::new(ErrorKind::Argument)
            .with_message(format!("invalid --param {raw}"))
            .with_hint("Use NAME=VALUE, e.g. --param owner=alice.")),
    }
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Argument)
            .with_message(format!("{flag} is not valid JSON"))
            .with_hint("Quote string keys as JSON, e.g. --key '\"alice\"'.")
            .with_source(err)
    })
}

fn last_seq_json(seq: &Seq, pending: Option<u64>) -> Value {
    let mut value = Map::new();
    value.insert("last_seq".to_string(), seq.as_value().clone());
    if let Some(pending) = pending {
        value.insert("pending".to_string(), json!(pending));
    }
    Value::Object(value)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Argument => "invalid argument".to_string(),
        ErrorKind::Protocol => "unsupported consumption".to_string(),
        ErrorKind::Transport => "transport error".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(option) = err.option() {
        inner.insert("option".to_string(), json!(option));
    }
    if let Some(status) = err.status() {
        inner.insert("status".to_string(), json!(status));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(option) = err.option() {
        lines.push(format!(
            "{} {option}",
            colorize_label("option:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(status) = err.status() {
        lines.push(format!(
            "{} {status}",
            colorize_label("status:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
