use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use ionocast_db::models::{Measurement, TargetField};

use super::{BinKey, BinStats, ClimatologyTable, DEFAULT_MAX_RADIUS};
use crate::error::{EngineError, EngineResult};
use crate::regions::RegionalModel;

/// Taille fixe des blocs de la réduction parallèle. Fixe pour que l'ordre
/// des additions, donc le résultat, ne dépende pas du nombre de threads.
const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimatologyConfig {
    pub target: TargetField,
    pub max_radius: u16,
    /// Ajoute un jeu de bacs par région (valeurs ajustées régionalement).
    pub regional: bool,
}

impl Default for ClimatologyConfig {
    fn default() -> Self {
        Self { target: TargetField::TecMean, max_radius: DEFAULT_MAX_RADIUS, regional: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct BinAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl BinAccumulator {
    fn push(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.sum_sq += v * v;
    }

    fn merge(&mut self, other: &BinAccumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    /// Moyenne et écart-type de population.
    fn finish(&self) -> BinStats {
        let n = self.count as f64;
        let mean = self.sum / n;
        let var = (self.sum_sq / n - mean * mean).max(0.0);
        BinStats { mean, count: self.count, std: var.sqrt() }
    }
}

#[derive(Debug, Default)]
struct ChunkAccumulator {
    bins: BTreeMap<BinKey, BinAccumulator>,
    global: BinAccumulator,
    regional: BTreeMap<String, BinAccumulator>,
}

impl ChunkAccumulator {
    fn merge(&mut self, other: ChunkAccumulator) {
        for (key, acc) in other.bins {
            self.bins.entry(key).or_default().merge(&acc);
        }
        self.global.merge(&other.global);
        for (id, acc) in other.regional {
            self.regional.entry(id).or_default().merge(&acc);
        }
    }
}

fn accumulate(
    chunk: &[Measurement],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &ClimatologyConfig,
    regional: Option<&RegionalModel>,
) -> ChunkAccumulator {
    let mut acc = ChunkAccumulator::default();
    for m in chunk {
        if m.timestamp < start || m.timestamp >= end {
            continue;
        }
        let (Some(kp), Some(value)) = (m.kp_index, config.target.value(m)) else {
            continue;
        };
        if !kp.is_finite() {
            continue;
        }
        let day = m.day_of_year();
        let bucket = ionocast_db::models::activity_bucket(kp);

        acc.bins
            .entry(BinKey { day_of_year: day, activity_bucket: bucket, region: None })
            .or_default()
            .push(value);
        acc.global.push(value);

        if let Some(model) = regional {
            for region in model.regions() {
                let adjusted = model.adjust(value, region, kp);
                acc.bins
                    .entry(BinKey { day_of_year: day, activity_bucket: bucket, region: Some(region.id.clone()) })
                    .or_default()
                    .push(adjusted);
                acc.regional.entry(region.id.clone()).or_default().push(adjusted);
            }
        }
    }
    acc
}

/// Construit une table de climatologie sur `[start, end)`.
///
/// Les mesures sans Kp ou sans valeur cible valide sont ignorées. Un
/// intervalle inversé ou sans aucune mesure exploitable est une erreur de
/// configuration.
pub fn build(
    records: &[Measurement],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &ClimatologyConfig,
    regional: Option<&RegionalModel>,
) -> EngineResult<ClimatologyTable> {
    if end <= start {
        return Err(EngineError::config(format!(
            "intervalle d'entraînement inversé ou vide : [{}, {})",
            start, end
        )));
    }
    let regional = if config.regional { regional } else { None };

    let partials: Vec<ChunkAccumulator> = records
        .par_chunks(CHUNK_SIZE)
        .map(|chunk| accumulate(chunk, start, end, config, regional))
        .collect();

    // Fusion séquentielle dans l'ordre des blocs.
    let mut total = ChunkAccumulator::default();
    for partial in partials {
        total.merge(partial);
    }

    if total.global.count == 0 {
        return Err(EngineError::config(format!(
            "aucune mesure exploitable pour {} sur [{}, {})",
            config.target, start, end
        )));
    }

    let bins: BTreeMap<BinKey, BinStats> =
        total.bins.into_iter().map(|(k, acc)| (k, acc.finish())).collect();
    let regional_fallback: BTreeMap<String, BinStats> =
        total.regional.into_iter().map(|(id, acc)| (id, acc.finish())).collect();

    log::info!(
        "Climatologie {} : {} bacs, {} mesures, {} régions",
        config.target,
        bins.len(),
        total.global.count,
        regional_fallback.len()
    );

    Ok(ClimatologyTable {
        version: 1,
        built_at: Utc::now(),
        target: config.target,
        training_start: start,
        training_end: end,
        max_radius: config.max_radius,
        bins,
        global: total.global.finish(),
        regional_fallback,
    })
}
