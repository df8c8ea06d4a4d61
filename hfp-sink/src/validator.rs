use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;

use crate::event::Record;

/// A side-effect-free plausibility check. A record failing any validator is still
/// written, but into the `_invalid` variant of its bucket.
pub trait EventValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_valid(&self, record: &Record) -> bool;
}

/// `tst` must fall within `[receivedAt - max_past, receivedAt + max_future]`.
#[derive(Debug, Clone)]
pub struct TimestampValidator {
    max_past: Duration,
    max_future: Duration,
}

impl TimestampValidator {
    pub fn new(max_past: Duration, max_future: Duration) -> Self {
        Self {
            max_past,
            max_future,
        }
    }
}

impl EventValidator for TimestampValidator {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn is_valid(&self, record: &Record) -> bool {
        let Some(received_at) = record.received_at else {
            return false;
        };
        // receipt times near the representable range have no window and are invalid
        let (Some(earliest), Some(latest)) = (
            received_at.checked_sub_signed(self.max_past),
            received_at.checked_add_signed(self.max_future),
        ) else {
            return false;
        };
        let tst = record.tst.to_utc();
        tst >= earliest && tst <= latest
    }
}

/// The operating day must be within `max_past`/`max_future` days of the local date the
/// record was received on.
#[derive(Debug, Clone)]
pub struct OdayValidator {
    timezone: Tz,
    max_past_days: i64,
    max_future_days: i64,
}

impl OdayValidator {
    pub fn new(timezone: Tz, max_past_days: i64, max_future_days: i64) -> Self {
        Self {
            timezone,
            max_past_days,
            max_future_days,
        }
    }

    fn received_day(&self, record: &Record) -> Option<NaiveDate> {
        record
            .received_at
            .map(|at| at.with_timezone(&self.timezone).date_naive())
    }
}

impl EventValidator for OdayValidator {
    fn name(&self) -> &'static str {
        "oday"
    }

    fn is_valid(&self, record: &Record) -> bool {
        // Deadruns and other non-revenue events are not expected to carry an oday
        let Some(oday) = record.oday else {
            return !record.is_revenue();
        };
        let Some(received_day) = self.received_day(record) else {
            return false;
        };

        let days_late = received_day.signed_duration_since(oday).num_days();
        days_late <= self.max_past_days && -days_late <= self.max_future_days
    }
}

/// Every configured validator must pass. An empty set accepts everything.
#[derive(Default)]
pub struct ValidatorSet {
    validators: Vec<Box<dyn EventValidator>>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Box<dyn EventValidator>>) -> Self {
        Self { validators }
    }

    pub fn with(mut self, validator: impl EventValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Names of the validators the record fails; empty means valid.
    pub fn failures(&self, record: &Record) -> Vec<&'static str> {
        self.validators
            .iter()
            .filter(|v| !v.is_valid(record))
            .map(|v| v.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}
