//! Best-effort tracker of the slowest per-unit processing rate.
//!
//! The read-compare-write below is not serialized between workers. Two
//! workers reporting at the same time may overwrite each other, which only
//! makes the estimate less pessimistic for a while. Nothing downstream
//! depends on it.

use super::{
    util::{read_record, unix_now, write_atomic, RunDir},
    SyncError,
};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;
const SECONDS_PER_HOUR: u64 = 60 * 60;
const SECONDS_PER_MINUTE: u64 = 60;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("rate record has {0} lines, expected 4")]
    LineCount(usize),
    #[error("invalid number in rate record: {0:?}")]
    Number(String),
    #[error("invalid ETA in rate record: {0:?}")]
    Eta(String),
}

/// Remaining time broken into whole days, hours, minutes and seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Eta {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Eta {
    /// `rate` seconds per unit for `remaining` more units, truncated to whole seconds
    pub fn from_remaining(rate: f64, remaining: usize) -> Self {
        // saturating cast, negative or NaN projections collapse to 0
        Self::from_seconds((rate * remaining as f64) as u64)
    }

    pub fn from_seconds(mut seconds: u64) -> Self {
        let days = seconds / SECONDS_PER_DAY;
        seconds -= days * SECONDS_PER_DAY;
        let hours = seconds / SECONDS_PER_HOUR;
        seconds -= hours * SECONDS_PER_HOUR;
        let minutes = seconds / SECONDS_PER_MINUTE;
        seconds -= minutes * SECONDS_PER_MINUTE;

        Self {
            days,
            hours,
            minutes,
            seconds,
        }
    }

    /// Total seconds, saturating at `u64::MAX`
    pub fn as_seconds(&self) -> u64 {
        self.checked_seconds().unwrap_or(u64::MAX)
    }

    fn checked_seconds(&self) -> Option<u64> {
        self.days
            .checked_mul(SECONDS_PER_DAY)?
            .checked_add(self.hours.checked_mul(SECONDS_PER_HOUR)?)?
            .checked_add(self.minutes.checked_mul(SECONDS_PER_MINUTE)?)?
            .checked_add(self.seconds)
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d{}h{}m{}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

impl FromStr for Eta {
    type Err = RecordError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || RecordError::Eta(input.to_owned());
        let mut rest = input;
        let mut parts = [0u64; 4];

        for (part, unit) in parts.iter_mut().zip(['d', 'h', 'm', 's']) {
            let (number, tail) = rest.split_once(unit).ok_or_else(invalid)?;
            *part = number.parse().map_err(|_| invalid())?;
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(invalid());
        }

        let [days, hours, minutes, seconds] = parts;
        let eta = Self {
            days,
            hours,
            minutes,
            seconds,
        };

        // an ETA that cannot be expressed in seconds was not written by a worker
        match eta.checked_seconds() {
            Some(_) => Ok(eta),
            None => Err(invalid()),
        }
    }
}

/// Contents of `rate.txt`: rate, timestamp, message and ETA, one per line
#[derive(Debug, Clone, PartialEq)]
pub struct RateRecord {
    /// seconds per unit
    pub rate: f64,
    /// unix time of the measurement
    pub timestamp: f64,
    pub message: String,
    pub eta: Eta,
}

impl RateRecord {
    pub fn new(core: usize, rate: f64, eta: Eta) -> Self {
        Self {
            rate,
            timestamp: unix_now(),
            message: format!("Core {core} is slowest: {rate} seconds/unit"),
            eta,
        }
    }
}

impl fmt::Display for RateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.rate)?;
        writeln!(f, "{}", self.timestamp)?;
        writeln!(f, "{}", self.message)?;
        writeln!(f, "{}", self.eta)
    }
}

impl FromStr for RateRecord {
    type Err = RecordError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let lines = input.lines().collect::<Vec<_>>();

        match lines.as_slice() {
            [rate, timestamp, message, eta] => {
                let number = |line: &str| {
                    line.trim()
                        .parse::<f64>()
                        .map_err(|_| RecordError::Number(line.to_owned()))
                };

                Ok(Self {
                    rate: number(rate)?,
                    timestamp: number(timestamp)?,
                    message: message.to_string(),
                    eta: eta.trim().parse()?,
                })
            }
            lines => Err(RecordError::LineCount(lines.len())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateEstimator {
    path: PathBuf,
}

impl RateEstimator {
    pub fn new(run_dir: &RunDir) -> Self {
        Self {
            path: run_dir.rate(),
        }
    }

    /// current record, absent, empty and malformed files all count as no record
    pub fn read(&self) -> Result<Option<RateRecord>, SyncError> {
        let contents = match read_record(&self.path)? {
            Some(contents) if !contents.trim().is_empty() => contents,
            _ => return Ok(None),
        };

        match contents.parse() {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                warn!(path = ?self.path, error = %error, "Ignoring malformed rate record");

                Ok(None)
            }
        }
    }

    /// fold one measurement of `core` into the shared record
    ///
    /// The record is only replaced when `elapsed / units_done` is slower than
    /// what is already recorded. The ETA projects the new rate over the units
    /// left in the reporting worker's partition.
    #[instrument(skip(self), level = "debug")]
    pub fn estimate(
        &self,
        core: usize,
        elapsed: Duration,
        units_done: usize,
        partition_units: usize,
    ) -> Result<RateRecord, SyncError> {
        // callers report after finishing a unit, guard the division anyway
        let current = elapsed.as_secs_f64() / units_done.max(1) as f64;

        let record = match self.read()? {
            Some(record) if record.rate >= current => {
                debug!(recorded = record.rate, current, "Keeping slower rate");

                record
            }
            _ => {
                let eta = Eta::from_remaining(current, partition_units.saturating_sub(units_done));
                info!(core, rate = current, eta = %eta, "New slowest rate");

                RateRecord::new(core, current, eta)
            }
        };

        write_atomic(&self.path, &record.to_string())?;

        Ok(record)
    }

    /// empty the shared record, the next measurement starts a new maximum
    pub fn clear(&self) -> Result<(), SyncError> {
        write_atomic(&self.path, "")?;

        Ok(())
    }
}
