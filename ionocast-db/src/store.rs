use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::db;
use crate::models::{sort_and_dedup, Measurement};

/// Source de mesures historiques.
///
/// `range(start, end)` retourne les mesures de [start, end) en ordre chronologique.
pub trait HistoricalStore: Send + Sync {
    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measurement>>;

    /// Les `limit` dernières mesures strictement avant `before`.
    fn latest_before(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Measurement>>;
}

/// Store en mémoire, trié à la construction.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Vec<Measurement>,
}

impl MemoryStore {
    pub fn new(mut records: Vec<Measurement>) -> Self {
        sort_and_dedup(&mut records);
        Self { records }
    }

    pub fn records(&self) -> &[Measurement] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn index_of(&self, ts: DateTime<Utc>) -> usize {
        self.records.partition_point(|m| m.timestamp < ts)
    }
}

impl HistoricalStore for MemoryStore {
    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measurement>> {
        if end <= start {
            return Ok(Vec::new());
        }
        Ok(self.records[self.index_of(start)..self.index_of(end)].to_vec())
    }

    fn latest_before(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Measurement>> {
        let end = self.index_of(before);
        let start = end.saturating_sub(limit);
        Ok(self.records[start..end].to_vec())
    }
}

/// Store SQLite. La connexion rusqlite n'est pas Sync, d'où le verrou.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        db::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

impl HistoricalStore for SqliteStore {
    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measurement>> {
        if end <= start {
            return Ok(Vec::new());
        }
        db::fetch_range(&self.conn.lock(), start, end)
    }

    fn latest_before(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Measurement>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp FROM measurements WHERE timestamp < ?1 ORDER BY timestamp DESC LIMIT 1 OFFSET ?2",
        )?;
        // Borne basse : horodatage de la `limit`-ième mesure avant `before`.
        let offset = limit.saturating_sub(1) as i64;
        let lower: Option<i64> = stmt
            .query_map(rusqlite::params![before.timestamp(), offset], |row| row.get(0))?
            .next()
            .transpose()?;
        drop(stmt);
        let start = match lower.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)) {
            Some(ts) => ts,
            None => DateTime::<Utc>::MIN_UTC,
        };
        db::fetch_range(&conn, start, before)
    }
}

/// Vue "as-of" : aucune requête ne peut voir une mesure horodatée >= as_of.
pub struct AsOfStore<'a> {
    inner: &'a dyn HistoricalStore,
    as_of: DateTime<Utc>,
}

impl<'a> AsOfStore<'a> {
    pub fn new(inner: &'a dyn HistoricalStore, as_of: DateTime<Utc>) -> Self {
        Self { inner, as_of }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }
}

impl HistoricalStore for AsOfStore<'_> {
    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measurement>> {
        let records = self.inner.range(start, end.min(self.as_of))?;
        if let Some(leak) = records.iter().find(|m| m.timestamp >= self.as_of) {
            bail!("Le store a retourné une mesure future ({} >= {})", leak.timestamp, self.as_of);
        }
        Ok(records)
    }

    fn latest_before(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Measurement>> {
        self.inner.latest_before(before.min(self.as_of), limit)
    }
}
