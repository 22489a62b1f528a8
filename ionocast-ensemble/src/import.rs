use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use ionocast_db::rusqlite::Connection;
use std::path::Path;

use ionocast_db::db::insert_measurement;
use ionocast_db::models::{validate_measurement, Measurement};

const COLUMNS: [&str; 10] = [
    "timestamp",
    "kp_index",
    "dst_index",
    "solar_wind_speed",
    "solar_wind_density",
    "imf_bz",
    "f107_flux",
    "tec_mean",
    "tec_std",
    "storm_probability",
];

/// Nombre décimal, virgule acceptée. Champ vide = None.
pub fn parse_decimal(s: &str) -> Result<Option<f64>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let normalized = s.replace(',', ".");
    normalized
        .parse::<f64>()
        .map(Some)
        .with_context(|| format!("Impossible de parser le nombre: '{}'", s))
}

/// RFC 3339, "AAAA-MM-JJ HH:MM[:SS]" ou "AAAA-MM-JJ", interprétés en UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    bail!("Format de date invalide: '{}'", raw)
}

fn column_indices(headers: &csv::StringRecord) -> Result<[Option<usize>; 10]> {
    let mut idx = [None; 10];
    for (i, name) in COLUMNS.iter().enumerate() {
        idx[i] = headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    }
    if idx[0].is_none() || idx[7].is_none() {
        bail!("Colonnes 'timestamp' et 'tec_mean' obligatoires (trouvé : {:?})", headers);
    }
    Ok(idx)
}

fn column<'a>(record: &'a csv::StringRecord, idx: &[Option<usize>; 10], i: usize) -> &'a str {
    idx[i].and_then(|c| record.get(c)).unwrap_or("")
}

fn parse_record(record: &csv::StringRecord, idx: &[Option<usize>; 10]) -> Result<Measurement> {
    let field = |i: usize| column(record, idx, i);
    let number = |i: usize, default: f64| -> Result<f64> {
        Ok(parse_decimal(field(i))
            .with_context(|| format!("colonne {}", COLUMNS[i]))?
            .unwrap_or(default))
    };

    let timestamp = parse_timestamp(field(0))?;
    let tec_mean = parse_decimal(field(7))?.with_context(|| format!("tec_mean manquant à {}", timestamp))?;
    Ok(Measurement {
        timestamp,
        kp_index: parse_decimal(field(1))?,
        dst_index: number(2, 0.0)?,
        solar_wind_speed: number(3, 400.0)?,
        solar_wind_density: number(4, 5.0)?,
        imf_bz: number(5, 0.0)?,
        f107_flux: number(6, 100.0)?,
        tec_mean,
        tec_std: number(8, 0.0)?,
        storm_probability: parse_decimal(field(9))?,
    })
}

#[derive(Debug, Default)]
pub struct ImportResult {
    pub total_records: u32,
    pub inserted: u32,
    pub skipped: u32,
    pub errors: u32,
}

pub fn import_csv(conn: &Connection, path: &Path, delimiter: u8) -> Result<ImportResult> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Impossible d'ouvrir {:?}", path))?;
    let idx = column_indices(reader.headers()?)?;

    let tx = conn.unchecked_transaction().context("Impossible de démarrer la transaction")?;
    let mut result = ImportResult::default();

    for record_result in reader.records() {
        result.total_records += 1;
        let parsed = record_result
            .map_err(anyhow::Error::from)
            .and_then(|record| parse_record(&record, &idx))
            .and_then(|m| validate_measurement(&m).map(|_| m));
        match parsed {
            Ok(m) => match insert_measurement(&tx, &m) {
                Ok(true) => result.inserted += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => {
                    log::warn!("Erreur insertion ligne {}: {}", result.total_records, e);
                    result.errors += 1;
                }
            },
            Err(e) => {
                log::warn!("Ligne {} ignorée: {:#}", result.total_records, e);
                result.errors += 1;
            }
        }
    }

    tx.commit().context("Échec du commit")?;
    Ok(result)
}
