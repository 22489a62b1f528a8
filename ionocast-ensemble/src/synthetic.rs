use std::f64::consts::PI;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use ionocast_db::models::{day_of_year, Measurement, MAX_ACTIVITY_INDEX};

/// Paramètres du générateur de mesures horaires synthétiques.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub base_tec: f64,
    pub seasonal_amplitude: f64,
    pub daily_amplitude: f64,
    /// Demi-largeur du bruit uniforme sur le TEC.
    pub noise: f64,
    pub kp_base: f64,
    pub kp_jitter: f64,
    /// Probabilité horaire de déclencher une tempête.
    pub storm_rate: f64,
    pub storm_hours: u32,
    pub storm_kp: f64,
    /// Gain relatif du TEC pendant une tempête.
    pub storm_tec_gain: f64,
    pub missing_kp_rate: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            base_tec: 20.0,
            seasonal_amplitude: 6.0,
            daily_amplitude: 4.0,
            noise: 1.0,
            kp_base: 2.0,
            kp_jitter: 1.0,
            storm_rate: 0.003,
            storm_hours: 18,
            storm_kp: 7.0,
            storm_tec_gain: 0.3,
            missing_kp_rate: 0.01,
        }
    }
}

/// Composante saisonnière pure, en fonction du jour de l'année.
pub fn seasonal_component(config: &SyntheticConfig, doy: u16) -> f64 {
    config.seasonal_amplitude * (2.0 * PI * (doy as f64 - 1.0) / 365.0).sin()
}

fn jitter(rng: &mut StdRng, width: f64) -> f64 {
    if width > 0.0 {
        rng.random_range(-width..width)
    } else {
        0.0
    }
}

/// `hours` mesures horaires à partir de `start`, reproductibles pour une graine donnée.
pub fn generate(start: DateTime<Utc>, hours: usize, config: &SyntheticConfig, seed: u64) -> Vec<Measurement> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut storm_left = 0u32;
    let mut out = Vec::with_capacity(hours);

    for i in 0..hours {
        let ts = start + Duration::hours(i as i64);
        let doy = day_of_year(&ts);

        if storm_left == 0 && config.storm_rate > 0.0 && rng.random::<f64>() < config.storm_rate {
            storm_left = config.storm_hours;
        }
        let storming = storm_left > 0;
        storm_left = storm_left.saturating_sub(1);

        let kp_center = if storming { config.storm_kp } else { config.kp_base };
        let kp = (kp_center + jitter(&mut rng, config.kp_jitter)).clamp(0.0, MAX_ACTIVITY_INDEX);

        let hour = ts.hour() as f64;
        let mut tec = config.base_tec
            + seasonal_component(config, doy)
            + config.daily_amplitude * (2.0 * PI * hour / 24.0).sin()
            + jitter(&mut rng, config.noise);
        if storming {
            tec *= 1.0 + config.storm_tec_gain;
        }
        let tec = tec.max(0.0);

        let missing = config.missing_kp_rate > 0.0 && rng.random::<f64>() < config.missing_kp_rate;
        out.push(Measurement {
            timestamp: ts,
            kp_index: if missing { None } else { Some(kp) },
            dst_index: -12.0 * kp,
            solar_wind_speed: 350.0 + 60.0 * kp,
            solar_wind_density: 5.0 + kp,
            imf_bz: -0.8 * kp,
            f107_flux: 110.0 + 30.0 * (2.0 * PI * doy as f64 / 365.0).cos(),
            tec_mean: tec,
            tec_std: 2.0 + 0.1 * tec,
            storm_probability: Some(((kp - 4.0) / 5.0).clamp(0.0, 1.0) * 100.0),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climatology::builder::{build, ClimatologyConfig};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_generate_is_reproducible() {
        let a = generate(start(), 500, &SyntheticConfig::default(), 3);
        let b = generate(start(), 500, &SyntheticConfig::default(), 3);
        assert_eq!(a, b);
        let c = generate(start(), 500, &SyntheticConfig::default(), 4);
        assert_ne!(a, c);
        assert!(a.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_generated_records_are_valid() {
        let records = generate(start(), 2000, &SyntheticConfig::default(), 11);
        for m in &records {
            ionocast_db::models::validate_measurement(m).unwrap();
        }
    }

    #[test]
    fn test_two_year_climatology_recovers_seasonal_mean() {
        let config = SyntheticConfig {
            kp_base: 2.5,
            kp_jitter: 0.4,
            storm_rate: 0.0,
            missing_kp_rate: 0.0,
            ..SyntheticConfig::default()
        };
        let hours = 2 * 365 * 24;
        let records = generate(start(), hours, &config, 2024);
        let end = start() + Duration::hours(hours as i64);
        let table = build(
            &records,
            start(),
            end,
            &ClimatologyConfig { regional: false, ..ClimatologyConfig::default() },
            None,
        )
        .unwrap();

        let mut checked = 0;
        for bin in table.bins() {
            if bin.stats.count < 30 {
                continue;
            }
            let expected = config.base_tec + seasonal_component(&config, bin.key.day_of_year);
            assert!(
                (bin.stats.mean - expected).abs() < 0.5,
                "jour {} : {:.3} vs {:.3}",
                bin.key.day_of_year,
                bin.stats.mean,
                expected
            );
            checked += 1;
        }
        assert_eq!(checked, 365);
    }
}
