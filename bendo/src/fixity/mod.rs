//! Scheduled content verification. Every item gets a standing appointment
//! in the fixity database; a background checker walks due records,
//! re-hashes the item's bundles against their manifests and the item
//! record, and books the next appointment. A scanner sweeps daily for
//! items that have fallen off the schedule.

pub mod checker;
pub mod sqlite;

pub use checker::{validate_item, FixityTask};
pub use sqlite::SqliteFixity;

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Outcome classification of a fixity check. `Scheduled` marks a pending
/// appointment; the other three are results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixityStatus {
    Scheduled,
    Ok,
    Error,
    Mismatch,
}

impl Display for FixityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixityStatus::Scheduled => "scheduled",
            FixityStatus::Ok => "ok",
            FixityStatus::Error => "error",
            FixityStatus::Mismatch => "mismatch",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FixityStatus {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "scheduled" => Ok(FixityStatus::Scheduled),
            "ok" => Ok(FixityStatus::Ok),
            "error" => Ok(FixityStatus::Error),
            "mismatch" => Ok(FixityStatus::Mismatch),
            other => Err(Error::Malformed(format!("bad fixity status {:?}", other))),
        }
    }
}

/// One appointment or result row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fixity {
    #[serde(rename = "ID")]
    pub id: i64,

    #[serde(rename = "Item")]
    pub item: String,

    #[serde(rename = "ScheduledTime")]
    pub scheduled_time: DateTime<Utc>,

    #[serde(rename = "Status")]
    pub status: FixityStatus,

    #[serde(rename = "Notes", default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

/// The persistent fixity queue. All operations are transactional in the
/// backing database.
pub trait FixityDb: Send + Sync {
    /// The id of the earliest `scheduled` record due at or before
    /// `cutoff`, or 0 when none is due.
    fn next_fixity(&self, cutoff: DateTime<Utc>) -> CResult<i64>;

    fn get_fixity(&self, id: i64) -> CResult<Option<Fixity>>;

    /// Searches by time window, item, and status; `None` fields are
    /// wildcards. A window with start after end matches nothing.
    fn search_fixity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        item: Option<&str>,
        status: Option<FixityStatus>,
    ) -> CResult<Vec<Fixity>>;

    /// Creates the record when `rec.id` is 0; otherwise updates it, but
    /// only while its stored status is still `scheduled`. Returns the id.
    fn update_fixity(&self, rec: &Fixity) -> CResult<i64>;

    /// Deletes the record only while its status is `scheduled`; otherwise
    /// a no-op.
    fn delete_fixity(&self, id: i64) -> CResult<()>;

    /// The earliest scheduled appointment for an item, if any.
    fn lookup_check(&self, item: &str) -> CResult<Option<DateTime<Utc>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        for (status, s) in [
            (FixityStatus::Scheduled, "scheduled"),
            (FixityStatus::Ok, "ok"),
            (FixityStatus::Error, "error"),
            (FixityStatus::Mismatch, "mismatch"),
        ] {
            assert_eq!(status.to_string(), s);
            assert_eq!(s.parse::<FixityStatus>().ok(), Some(status));
        }
        assert!("pending".parse::<FixityStatus>().is_err());
        assert!("".parse::<FixityStatus>().is_err());
    }
}
