use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CResult, Error};
use crate::fixity::{Fixity, FixityDb, FixityStatus};

/// The embedded fixity database. Times are stored as integer microseconds
/// since the epoch so window comparisons stay exact.
pub struct SqliteFixity {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fixity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item TEXT NOT NULL,
    scheduled_time INTEGER NOT NULL,
    status TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS fixity_due ON fixity (status, scheduled_time);
CREATE INDEX IF NOT EXISTS fixity_item ON fixity (item);
";

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> CResult<DateTime<Utc>> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) as u32) * 1_000;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Parse(format!("bad stored time {}", us)))
}

impl SqliteFixity {
    /// Opens (and migrates) the database at `path`, or an in-memory
    /// database when `path` is None.
    pub fn open(path: Option<&Path>) -> CResult<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteFixity { conn: Mutex::new(conn) })
    }

    fn row_to_fixity(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, i64, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn build(raw: (i64, String, i64, String, String)) -> CResult<Fixity> {
        let (id, item, at, status, notes) = raw;
        Ok(Fixity {
            id,
            item,
            scheduled_time: from_micros(at)?,
            status: FixityStatus::from_str(&status)?,
            notes,
        })
    }
}

impl FixityDb for SqliteFixity {
    fn next_fixity(&self, cutoff: DateTime<Utc>) -> CResult<i64> {
        let conn = self.conn.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM fixity
                 WHERE status = 'scheduled' AND scheduled_time <= ?1
                 ORDER BY scheduled_time, id LIMIT 1",
                params![to_micros(cutoff)],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    fn get_fixity(&self, id: i64) -> CResult<Option<Fixity>> {
        let conn = self.conn.lock()?;
        let raw = conn
            .query_row(
                "SELECT id, item, scheduled_time, status, notes FROM fixity WHERE id = ?1",
                params![id],
                Self::row_to_fixity,
            )
            .optional()?;
        raw.map(Self::build).transpose()
    }

    fn search_fixity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        item: Option<&str>,
        status: Option<FixityStatus>,
    ) -> CResult<Vec<Fixity>> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let mut sql =
            "SELECT id, item, scheduled_time, status, notes FROM fixity WHERE 1 = 1".to_string();
        let mut args: Vec<Value> = Vec::new();
        if let Some(start) = start {
            sql.push_str(&format!(" AND scheduled_time >= ?{}", args.len() + 1));
            args.push(Value::Integer(to_micros(start)));
        }
        if let Some(end) = end {
            sql.push_str(&format!(" AND scheduled_time <= ?{}", args.len() + 1));
            args.push(Value::Integer(to_micros(end)));
        }
        if let Some(item) = item {
            sql.push_str(&format!(" AND item = ?{}", args.len() + 1));
            args.push(Value::Text(item.to_string()));
        }
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Value::Text(status.to_string()));
        }
        sql.push_str(" ORDER BY scheduled_time, id");

        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), Self::row_to_fixity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::build(row?)?);
        }
        Ok(out)
    }

    fn update_fixity(&self, rec: &Fixity) -> CResult<i64> {
        let conn = self.conn.lock()?;
        if rec.id == 0 {
            conn.execute(
                "INSERT INTO fixity (item, scheduled_time, status, notes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![rec.item, to_micros(rec.scheduled_time), rec.status.to_string(), rec.notes],
            )?;
            return Ok(conn.last_insert_rowid());
        }
        // Terminal rows are immutable: the update applies only while the
        // stored status is still scheduled.
        conn.execute(
            "UPDATE fixity SET item = ?1, scheduled_time = ?2, status = ?3, notes = ?4
             WHERE id = ?5 AND status = 'scheduled'",
            params![
                rec.item,
                to_micros(rec.scheduled_time),
                rec.status.to_string(),
                rec.notes,
                rec.id
            ],
        )?;
        Ok(rec.id)
    }

    fn delete_fixity(&self, id: i64) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM fixity WHERE id = ?1 AND status = 'scheduled'", params![id])?;
        Ok(())
    }

    fn lookup_check(&self, item: &str) -> CResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock()?;
        let at = conn
            .query_row(
                "SELECT MIN(scheduled_time) FROM fixity
                 WHERE item = ?1 AND status = 'scheduled'",
                params![item],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        at.map(from_micros).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SqliteFixity {
        SqliteFixity::open(None).expect("in-memory database")
    }

    fn insert(db: &SqliteFixity, item: &str, status: FixityStatus, at: DateTime<Utc>) -> i64 {
        db.update_fixity(&Fixity {
            id: 0,
            item: item.to_string(),
            scheduled_time: at,
            status,
            notes: String::new(),
        })
        .expect("insert")
    }

    #[test]
    fn create_and_get() -> CResult<()> {
        let db = db();
        let at = Utc::now();
        let id = insert(&db, "abc", FixityStatus::Scheduled, at);
        assert!(id > 0);

        let rec = db.get_fixity(id)?.expect("row exists");
        assert_eq!(rec.item, "abc");
        assert_eq!(rec.status, FixityStatus::Scheduled);
        // Times survive the round trip to microsecond precision.
        assert_eq!(rec.scheduled_time.timestamp_micros(), at.timestamp_micros());

        assert_eq!(db.get_fixity(999)?, None);
        Ok(())
    }

    #[test]
    fn next_fixity_honors_cutoff_and_order() -> CResult<()> {
        let db = db();
        let now = Utc::now();
        let later = insert(&db, "b", FixityStatus::Scheduled, now + chrono::Duration::hours(2));
        let sooner = insert(&db, "a", FixityStatus::Scheduled, now - chrono::Duration::hours(1));
        insert(&db, "c", FixityStatus::Ok, now - chrono::Duration::hours(2));

        assert_eq!(db.next_fixity(now)?, sooner);
        assert_eq!(db.next_fixity(now + chrono::Duration::hours(3))?, sooner);
        db.delete_fixity(sooner)?;
        assert_eq!(db.next_fixity(now)?, 0);
        assert_eq!(db.next_fixity(now + chrono::Duration::hours(3))?, later);
        Ok(())
    }

    #[test]
    fn search_filters_and_wildcards() -> CResult<()> {
        let db = db();
        let now = Utc::now();
        insert(&db, "abc", FixityStatus::Ok, now - chrono::Duration::hours(2));
        insert(&db, "abc", FixityStatus::Error, now - chrono::Duration::hours(1));
        let scheduled = insert(&db, "abc", FixityStatus::Scheduled, now);
        insert(&db, "zzz", FixityStatus::Scheduled, now);

        // Item + status narrows to one row.
        let hits = db.search_fixity(None, None, Some("abc"), Some(FixityStatus::Scheduled))?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, scheduled);

        // Wildcards return everything.
        assert_eq!(db.search_fixity(None, None, None, None)?.len(), 4);

        // Time windows.
        let recent = db.search_fixity(Some(now - chrono::Duration::minutes(90)), None, None, None)?;
        assert_eq!(recent.len(), 3);

        // An inverted window matches nothing.
        let none =
            db.search_fixity(Some(now), Some(now - chrono::Duration::hours(5)), None, None)?;
        assert!(none.is_empty());
        Ok(())
    }

    #[test]
    fn terminal_rows_are_immutable() -> CResult<()> {
        let db = db();
        let now = Utc::now();
        let ok_id = insert(&db, "abc", FixityStatus::Ok, now);

        let mut rec = db.get_fixity(ok_id)?.expect("row exists");
        rec.status = FixityStatus::Scheduled;
        rec.notes = "should not stick".to_string();
        db.update_fixity(&rec)?;

        let unchanged = db.get_fixity(ok_id)?.expect("row exists");
        assert_eq!(unchanged.status, FixityStatus::Ok);
        assert_eq!(unchanged.notes, "");

        // Deleting a non-scheduled row is a no-op.
        db.delete_fixity(ok_id)?;
        assert!(db.get_fixity(ok_id)?.is_some());
        Ok(())
    }

    #[test]
    fn scheduled_rows_update_and_delete() -> CResult<()> {
        let db = db();
        let now = Utc::now();
        let id = insert(&db, "abc", FixityStatus::Scheduled, now);

        let mut rec = db.get_fixity(id)?.expect("row exists");
        rec.status = FixityStatus::Mismatch;
        rec.notes = "blob 2 failed its MD5 check".to_string();
        db.update_fixity(&rec)?;
        let stored = db.get_fixity(id)?.expect("row exists");
        assert_eq!(stored.status, FixityStatus::Mismatch);

        let id = insert(&db, "abc", FixityStatus::Scheduled, now);
        db.delete_fixity(id)?;
        assert_eq!(db.get_fixity(id)?, None);
        Ok(())
    }

    #[test]
    fn lookup_check_finds_earliest_appointment() -> CResult<()> {
        let db = db();
        let now = Utc::now();
        assert_eq!(db.lookup_check("abc")?, None);

        insert(&db, "abc", FixityStatus::Ok, now - chrono::Duration::days(1));
        assert_eq!(db.lookup_check("abc")?, None);

        insert(&db, "abc", FixityStatus::Scheduled, now + chrono::Duration::days(7));
        insert(&db, "abc", FixityStatus::Scheduled, now + chrono::Duration::days(3));
        let at = db.lookup_check("abc")?.expect("appointment exists");
        assert_eq!(
            at.timestamp_micros(),
            (now + chrono::Duration::days(3)).timestamp_micros()
        );
        Ok(())
    }
}
