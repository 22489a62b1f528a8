use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use std::path::Path;

use crate::models::Measurement;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS measurements (
    timestamp           INTEGER PRIMARY KEY,
    kp_index            REAL,
    dst_index           REAL NOT NULL,
    solar_wind_speed    REAL NOT NULL,
    solar_wind_density  REAL NOT NULL,
    imf_bz              REAL NOT NULL,
    f107_flux           REAL NOT NULL,
    tec_mean            REAL NOT NULL,
    tec_std             REAL NOT NULL,
    storm_probability   REAL
);
";

const COLUMNS: &str = "timestamp, kp_index, dst_index, solar_wind_speed, solar_wind_density, imf_bz, f107_flux, tec_mean, tec_std, storm_probability";

pub fn db_path() -> std::path::PathBuf {
    let mut path = std::env::current_dir().unwrap_or_default();
    path.push("data");
    path.push("ionocast.db");
    path
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Impossible de créer le répertoire {:?}", parent))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Impossible d'ouvrir la base {:?}", path))?;
    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Échec de la migration")?;
    Ok(())
}

pub fn insert_measurement(conn: &Connection, m: &Measurement) -> Result<bool> {
    let changed = conn.execute(
        &format!("INSERT OR IGNORE INTO measurements ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        rusqlite::params![
            m.timestamp.timestamp(),
            m.kp_index,
            m.dst_index,
            m.solar_wind_speed,
            m.solar_wind_density,
            m.imf_bz,
            m.f107_flux,
            m.tec_mean,
            m.tec_std,
            m.storm_probability,
        ],
    ).context("Échec de l'insertion")?;
    Ok(changed > 0)
}

/// Insère un lot dans une seule transaction. Retourne le nombre de nouvelles lignes.
pub fn insert_measurements(conn: &mut Connection, records: &[Measurement]) -> Result<usize> {
    let tx = conn.transaction().context("Impossible d'ouvrir la transaction")?;
    let mut inserted = 0;
    for m in records {
        if insert_measurement(&tx, m)? {
            inserted += 1;
        }
    }
    tx.commit().context("Échec du commit")?;
    Ok(inserted)
}

fn row_to_measurement(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    let secs: i64 = row.get(0)?;
    let timestamp = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(0, secs)
    })?;
    Ok(Measurement {
        timestamp,
        kp_index: row.get(1)?,
        dst_index: row.get(2)?,
        solar_wind_speed: row.get(3)?,
        solar_wind_density: row.get(4)?,
        imf_bz: row.get(5)?,
        f107_flux: row.get(6)?,
        tec_mean: row.get(7)?,
        tec_std: row.get(8)?,
        storm_probability: row.get(9)?,
    })
}

/// Mesures dans [start, end), ordre chronologique.
pub fn fetch_range(conn: &Connection, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Measurement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM measurements WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC"
    ))?;
    let records = stmt
        .query_map([start.timestamp(), end.timestamp()], row_to_measurement)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Dernières mesures, ordre chronologique (la plus récente en dernier).
pub fn fetch_latest(conn: &Connection, limit: u32) -> Result<Vec<Measurement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM measurements ORDER BY timestamp DESC LIMIT ?1"
    ))?;
    let mut records = stmt
        .query_map([limit], row_to_measurement)?
        .collect::<Result<Vec<_>, _>>()?;
    records.reverse();
    Ok(records)
}

pub fn fetch_all(conn: &Connection) -> Result<Vec<Measurement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM measurements ORDER BY timestamp ASC"
    ))?;
    let records = stmt
        .query_map([], row_to_measurement)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn count_measurements(conn: &Connection) -> Result<u32> {
    let count: u32 = conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
    Ok(count)
}

/// Bornes temporelles de la base, None si vide.
pub fn time_bounds(conn: &Connection) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM measurements",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(match (min, max) {
        (Some(a), Some(b)) => DateTime::<Utc>::from_timestamp(a, 0).zip(DateTime::<Utc>::from_timestamp(b, 0)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, d, h, 0, 0).unwrap()
    }

    fn test_measurement(ts: DateTime<Utc>, tec: f64) -> Measurement {
        Measurement::quiet(ts, tec, 2.3)
    }

    #[test]
    fn test_insert_and_count() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(count_measurements(&conn).unwrap(), 0);

        insert_measurement(&conn, &test_measurement(at(1, 0), 10.0)).unwrap();
        assert_eq!(count_measurements(&conn).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_ignored() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let inserted = insert_measurement(&conn, &test_measurement(at(1, 0), 10.0)).unwrap();
        assert!(inserted);
        let inserted = insert_measurement(&conn, &test_measurement(at(1, 0), 11.0)).unwrap();
        assert!(!inserted);
        assert_eq!(count_measurements(&conn).unwrap(), 1);
    }

    #[test]
    fn test_fetch_range_half_open_and_ordered() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let records = vec![
            test_measurement(at(3, 0), 3.0),
            test_measurement(at(1, 0), 1.0),
            test_measurement(at(2, 0), 2.0),
        ];
        assert_eq!(insert_measurements(&mut conn, &records).unwrap(), 3);

        let got = fetch_range(&conn, at(1, 0), at(3, 0)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].tec_mean, 1.0);
        assert_eq!(got[1].tec_mean, 2.0);
    }

    #[test]
    fn test_roundtrip_optional_fields() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let mut m = test_measurement(at(5, 12), 14.5);
        m.kp_index = None;
        m.storm_probability = Some(42.0);
        insert_measurement(&conn, &m).unwrap();

        let all = fetch_all(&conn).unwrap();
        assert_eq!(all, vec![m]);
    }

    #[test]
    fn test_fetch_latest_chronological() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for d in 1..=5 {
            insert_measurement(&conn, &test_measurement(at(d, 0), d as f64)).unwrap();
        }
        let latest = fetch_latest(&conn, 2).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].tec_mean, 4.0);
        assert_eq!(latest[1].tec_mean, 5.0);

        let bounds = time_bounds(&conn).unwrap().unwrap();
        assert_eq!(bounds, (at(1, 0), at(5, 0)));
    }
}
