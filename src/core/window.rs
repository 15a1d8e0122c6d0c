// Skip/limit arithmetic for ordinal access into a remote result window.
// Pure functions: callers decide which request to issue from the plan.
use crate::core::error::{Error, ErrorKind};
use std::ops::{Bound, RangeBounds};

/// Fixed baseline of a result wrapper.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Window {
    pub skip: u64,
    pub limit: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Plan {
    /// Out of range; answer with no rows and issue no request.
    Empty,
    /// `limit` may be negative when an inverted slice is forwarded as-is.
    Fetch { skip: u64, limit: Option<i64> },
}

impl Window {
    pub fn new(skip: u64, limit: Option<u64>) -> Self {
        Self { skip, limit }
    }

    pub fn index(&self, index: i64) -> Result<Plan, Error> {
        let index = non_negative(index, "index")?;
        if self.limit.is_some_and(|limit| index >= limit) {
            return Ok(Plan::Empty);
        }
        Ok(Plan::Fetch {
            skip: offset(self.skip, index)?,
            limit: Some(1),
        })
    }

    pub fn slice(&self, start: Option<i64>, stop: Option<i64>) -> Result<Plan, Error> {
        let start = start.map(|value| non_negative(value, "slice start")).transpose()?;
        let stop = stop.map(|value| non_negative(value, "slice stop")).transpose()?;
        let start = start.unwrap_or(0);
        if stop == Some(start) {
            return Ok(Plan::Empty);
        }
        if self.limit.is_some_and(|limit| start >= limit) {
            return Ok(Plan::Empty);
        }
        let skip = offset(self.skip, start)?;
        let remaining = self.limit.map(|limit| limit - start);
        let limit = match stop {
            Some(stop) if stop < start => Some(stop as i64 - start as i64),
            Some(stop) => {
                let wanted = stop - start;
                Some(remaining.map_or(wanted, |left| wanted.min(left)) as i64)
            }
            None => remaining.map(|left| left as i64),
        };
        Ok(Plan::Fetch { skip, limit })
    }
}

/// Half-open `(start, stop)` of an index range; unbounded ends are `None`.
pub fn range_ends(range: &impl RangeBounds<i64>) -> (Option<i64>, Option<i64>) {
    let start = match range.start_bound() {
        Bound::Included(start) => Some(*start),
        Bound::Excluded(start) => Some(start.saturating_add(1)),
        Bound::Unbounded => None,
    };
    let stop = match range.end_bound() {
        Bound::Included(stop) => Some(stop.saturating_add(1)),
        Bound::Excluded(stop) => Some(*stop),
        Bound::Unbounded => None,
    };
    (start, stop)
}

/// `base + delta`, or an argument error when the sum leaves the `u64` range.
pub fn offset(base: u64, delta: u64) -> Result<u64, Error> {
    base.checked_add(delta).ok_or_else(|| {
        Error::new(ErrorKind::Argument)
            .with_message(format!("skip {base} + {delta} overflows"))
            .with_option("skip")
    })
}

fn non_negative(value: i64, what: &str) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| {
        Error::new(ErrorKind::Argument)
            .with_message(format!("negative {what} {value} is not supported"))
            .with_hint("Remote result windows have no notion of counting from the end.")
    })
}
