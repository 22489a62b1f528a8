use serde::{Deserialize, Serialize};

use crate::regions::{RegionDefinition, RegionalModel};

use super::storms::{classify, ClassificationStats, ThresholdSweep};
use super::BacktestSample;

/// Statistiques d'erreur, présentes seulement s'il y a au moins un échantillon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub mae: f64,
    pub rmse: f64,
    pub median_abs_error: f64,
    pub max_abs_error: f64,
    /// Erreur signée moyenne (prédit − observé).
    pub bias: f64,
    /// Part des échantillons où le niveau de risque prédit égale l'observé.
    pub level_agreement: f64,
    /// Absent si toutes les observations sont égales.
    #[serde(default)]
    pub r_squared: Option<f64>,
    /// En %, sur les observations non nulles.
    #[serde(default)]
    pub mape: Option<f64>,
    /// Tempête / calme au seuil configuré.
    #[serde(default)]
    pub classification: Option<ClassificationStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproachMetrics {
    pub approach: String,
    pub region: String,
    pub count: usize,
    pub failed: usize,
    pub stats: Option<ErrorStats>,
    /// 1 − rmse / rmse_référence, si une référence est configurée et mesurable.
    pub skill: Option<f64>,
    #[serde(default)]
    pub sweep: Option<ThresholdSweep>,
}

impl ApproachMetrics {
    pub fn mae(&self) -> Option<f64> {
        self.stats.as_ref().map(|s| s.mae)
    }

    pub fn rmse(&self) -> Option<f64> {
        self.stats.as_ref().map(|s| s.rmse)
    }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

pub fn pairs(samples: &[&BacktestSample]) -> Vec<(f64, f64)> {
    samples.iter().map(|s| (s.predicted, s.actual)).collect()
}

/// 1 − SSres / SStot ; `None` si les observations sont constantes.
fn r_squared(samples: &[&BacktestSample]) -> Option<f64> {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.actual).sum::<f64>() / n;
    let ss_tot: f64 = samples.iter().map(|s| (s.actual - mean).powi(2)).sum();
    let ss_res: f64 = samples.iter().map(|s| s.signed_error * s.signed_error).sum();
    (ss_tot > 0.0).then(|| 1.0 - ss_res / ss_tot)
}

fn mape(samples: &[&BacktestSample]) -> Option<f64> {
    let rel: Vec<f64> = samples
        .iter()
        .filter(|s| s.actual != 0.0)
        .map(|s| (s.signed_error / s.actual).abs())
        .collect();
    (!rel.is_empty()).then(|| rel.iter().sum::<f64>() / rel.len() as f64 * 100.0)
}

/// Agrège les échantillons d'un couple (approche, région), dans l'ordre reçu.
pub fn error_stats(
    samples: &[&BacktestSample],
    region: &RegionDefinition,
    model: &RegionalModel,
    storm_threshold: Option<f64>,
) -> Option<ErrorStats> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mut sum_abs = 0.0;
    let mut sum_sq = 0.0;
    let mut sum_signed = 0.0;
    let mut agree = 0usize;
    let mut abs: Vec<f64> = Vec::with_capacity(samples.len());
    for s in samples {
        sum_abs += s.absolute_error;
        sum_sq += s.signed_error * s.signed_error;
        sum_signed += s.signed_error;
        abs.push(s.absolute_error);
        if model.classify(s.predicted, region) == model.classify(s.actual, region) {
            agree += 1;
        }
    }
    abs.sort_by(f64::total_cmp);
    Some(ErrorStats {
        mae: sum_abs / n,
        rmse: (sum_sq / n).sqrt(),
        median_abs_error: median(&abs),
        max_abs_error: abs[abs.len() - 1],
        bias: sum_signed / n,
        level_agreement: agree as f64 / n,
        r_squared: r_squared(samples),
        mape: mape(samples),
        classification: storm_threshold.and_then(|t| classify(&pairs(samples), t)),
    })
}

pub fn skill_score(rmse: f64, baseline_rmse: f64) -> Option<f64> {
    (baseline_rmse > 0.0 && baseline_rmse.is_finite()).then(|| 1.0 - rmse / baseline_rmse)
}
