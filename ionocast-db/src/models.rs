use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Valeurs >= FILL_VALUE sont des trous de mesure, pas des observations.
pub const FILL_VALUE: f64 = 999.0;

pub const MAX_ACTIVITY_INDEX: f64 = 9.0;
pub const ACTIVITY_BUCKETS: u8 = 10;
pub const DAYS_PER_YEAR: u16 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    /// Kp, 0-9. None quand l'indice n'a pas été publié.
    pub kp_index: Option<f64>,
    pub dst_index: f64,
    pub solar_wind_speed: f64,
    pub solar_wind_density: f64,
    pub imf_bz: f64,
    pub f107_flux: f64,
    pub tec_mean: f64,
    pub tec_std: f64,
    pub storm_probability: Option<f64>,
}

impl Measurement {
    /// Mesure calme minimale, utile pour les tests et les générateurs.
    pub fn quiet(timestamp: DateTime<Utc>, tec_mean: f64, kp_index: f64) -> Self {
        Self {
            timestamp,
            kp_index: Some(kp_index),
            dst_index: 0.0,
            solar_wind_speed: 400.0,
            solar_wind_density: 5.0,
            imf_bz: 0.0,
            f107_flux: 100.0,
            tec_mean,
            tec_std: 1.0,
            storm_probability: None,
        }
    }

    pub fn day_of_year(&self) -> u16 {
        day_of_year(&self.timestamp)
    }

    pub fn activity_bucket(&self) -> Option<u8> {
        self.kp_index.map(activity_bucket)
    }
}

/// Jour de l'année 1..=365 ; le 366e jour des années bissextiles est replié sur 365.
pub fn day_of_year(ts: &DateTime<Utc>) -> u16 {
    (ts.ordinal() as u16).min(DAYS_PER_YEAR)
}

pub fn activity_bucket(kp: f64) -> u8 {
    kp.floor().clamp(0.0, MAX_ACTIVITY_INDEX) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    #[default]
    TecMean,
    TecStd,
    StormProbability,
}

impl TargetField {
    /// Valeur cible, None si absente ou valeur de remplissage.
    pub fn value(&self, m: &Measurement) -> Option<f64> {
        let v = match self {
            TargetField::TecMean => Some(m.tec_mean),
            TargetField::TecStd => Some(m.tec_std),
            TargetField::StormProbability => m.storm_probability,
        }?;
        if v.is_finite() && v < FILL_VALUE {
            Some(v)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetField::TecMean => "tec_mean",
            TargetField::TecStd => "tec_std",
            TargetField::StormProbability => "storm_probability",
        }
    }
}

impl std::fmt::Display for TargetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub fn validate_measurement(m: &Measurement) -> Result<()> {
    if let Some(kp) = m.kp_index {
        if !(0.0..=MAX_ACTIVITY_INDEX).contains(&kp) {
            bail!("Kp {} hors limites (0-9) à {}", kp, m.timestamp);
        }
    }
    if m.tec_mean < 0.0 {
        bail!("TEC moyen négatif ({}) à {}", m.tec_mean, m.timestamp);
    }
    if m.tec_std < 0.0 {
        bail!("Écart-type TEC négatif ({}) à {}", m.tec_std, m.timestamp);
    }
    if let Some(p) = m.storm_probability {
        if !(0.0..=100.0).contains(&p) {
            bail!("Probabilité de tempête {} hors limites (0-100) à {}", p, m.timestamp);
        }
    }
    Ok(())
}

/// Trie par horodatage croissant et retire les doublons (premier gardé).
pub fn sort_and_dedup(records: &mut Vec<Measurement>) {
    records.sort_by_key(|m| m.timestamp);
    records.dedup_by_key(|m| m.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_day_of_year_folds_leap_day() {
        assert_eq!(day_of_year(&at(2024, 12, 31, 0)), 365);
        assert_eq!(day_of_year(&at(2024, 12, 30, 0)), 365);
        assert_eq!(day_of_year(&at(2023, 12, 31, 0)), 365);
        assert_eq!(day_of_year(&at(2023, 1, 1, 0)), 1);
    }

    #[test]
    fn test_activity_bucket_floor_and_clamp() {
        assert_eq!(activity_bucket(0.0), 0);
        assert_eq!(activity_bucket(3.7), 3);
        assert_eq!(activity_bucket(9.0), 9);
        assert_eq!(activity_bucket(12.0), 9);
        assert_eq!(activity_bucket(-1.0), 0);
    }

    #[test]
    fn test_target_value_skips_fill() {
        let mut m = Measurement::quiet(at(2023, 3, 1, 0), 12.0, 2.0);
        assert_eq!(TargetField::TecMean.value(&m), Some(12.0));
        m.tec_mean = 999.0;
        assert_eq!(TargetField::TecMean.value(&m), None);
        assert_eq!(TargetField::StormProbability.value(&m), None);
    }

    #[test]
    fn test_validate_measurement() {
        let mut m = Measurement::quiet(at(2023, 3, 1, 0), 12.0, 2.0);
        assert!(validate_measurement(&m).is_ok());
        m.kp_index = Some(9.5);
        assert!(validate_measurement(&m).is_err());
        m.kp_index = None;
        assert!(validate_measurement(&m).is_ok());
        m.tec_mean = -1.0;
        assert!(validate_measurement(&m).is_err());
    }

    #[test]
    fn test_sort_and_dedup() {
        let mut records = vec![
            Measurement::quiet(at(2023, 1, 2, 0), 2.0, 1.0),
            Measurement::quiet(at(2023, 1, 1, 0), 1.0, 1.0),
            Measurement::quiet(at(2023, 1, 2, 0), 3.0, 1.0),
        ];
        sort_and_dedup(&mut records);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tec_mean, 1.0);
        assert_eq!(records[1].tec_mean, 2.0);
    }
}
