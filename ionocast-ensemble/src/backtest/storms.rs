//! Lecture « tempête » du backtest : classification à seuil, recherche du
//! seuil optimal et découpage des observations en épisodes de Kp élevé.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ionocast_db::models::{Measurement, TargetField};

use crate::error::{EngineError, EngineResult};
use crate::regions::g_scale;

use super::BacktestSample;

/// Seuil par défaut sur une probabilité de tempête (0..100).
pub const DEFAULT_PROBABILITY_THRESHOLD: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdCriterion {
    #[default]
    F1,
    /// J de Youden : sensibilité + spécificité − 1.
    Youden,
    /// Coût des fausses alertes et des tempêtes manquées, à minimiser.
    Cost { false_alarm: f64, missed: f64 },
}

impl ThresholdCriterion {
    fn better(&self, score: f64, best: f64) -> bool {
        match self {
            ThresholdCriterion::Cost { .. } => score < best,
            _ => score > best,
        }
    }
}

impl std::fmt::Display for ThresholdCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdCriterion::F1 => write!(f, "F1"),
            ThresholdCriterion::Youden => write!(f, "Youden"),
            ThresholdCriterion::Cost { false_alarm, missed } => {
                write!(f, "coût (fausse alerte {}, manquée {})", false_alarm, missed)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StormSettings {
    /// Seuil tempête / calme, en unités de la cible.
    pub threshold: Option<f64>,
    pub sweep_thresholds: Vec<f64>,
    pub criterion: ThresholdCriterion,
    pub kp_threshold: f64,
    /// Mesures consécutives au-dessus de `kp_threshold` pour former un épisode.
    pub min_duration: usize,
}

impl Default for StormSettings {
    fn default() -> Self {
        Self {
            threshold: None,
            sweep_thresholds: (2..=18).map(|i| i as f64 * 5.0).collect(),
            criterion: ThresholdCriterion::F1,
            kp_threshold: 5.0,
            min_duration: 3,
        }
    }
}

impl StormSettings {
    /// Seuil configuré, sinon 40 pour une probabilité de tempête, sinon aucun.
    pub fn threshold_for(&self, target: TargetField) -> Option<f64> {
        self.threshold.or(match target {
            TargetField::StormProbability => Some(DEFAULT_PROBABILITY_THRESHOLD),
            TargetField::TecMean | TargetField::TecStd => None,
        })
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.threshold.is_some_and(|t| !t.is_finite()) || self.sweep_thresholds.iter().any(|t| !t.is_finite()) {
            return Err(EngineError::config("seuil de tempête non fini"));
        }
        if !(self.kp_threshold > 0.0 && self.kp_threshold <= 9.0) {
            return Err(EngineError::config(format!("seuil Kp {} hors ]0, 9]", self.kp_threshold)));
        }
        if self.min_duration == 0 {
            return Err(EngineError::config("durée minimale d'épisode nulle"));
        }
        if let ThresholdCriterion::Cost { false_alarm, missed } = self.criterion {
            if !(false_alarm >= 0.0 && missed >= 0.0) {
                return Err(EngineError::config(format!("coûts invalides : {} / {}", false_alarm, missed)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ConfusionMatrix {
    pub fn record(&mut self, predicted_storm: bool, actual_storm: bool) {
        match (predicted_storm, actual_storm) {
            (true, true) => self.true_positives += 1,
            (false, false) => self.true_negatives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationStats {
    pub threshold: f64,
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub precision: f64,
    /// Taux de détection (POD).
    pub recall: f64,
    /// fp / (fp + tn).
    pub false_alarm_rate: f64,
    pub f1: f64,
}

impl ClassificationStats {
    pub fn from_confusion(threshold: f64, c: ConfusionMatrix) -> Self {
        let precision = ratio(c.true_positives, c.true_positives + c.false_positives);
        let recall = ratio(c.true_positives, c.true_positives + c.false_negatives);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            threshold,
            confusion: c,
            accuracy: ratio(c.true_positives + c.true_negatives, c.total()),
            precision,
            recall,
            false_alarm_rate: ratio(c.false_positives, c.false_positives + c.true_negatives),
            f1,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        self.recall
    }

    pub fn youden_j(&self) -> f64 {
        self.recall - self.false_alarm_rate
    }

    pub fn cost(&self, false_alarm: f64, missed: f64) -> f64 {
        self.confusion.false_positives as f64 * false_alarm + self.confusion.false_negatives as f64 * missed
    }

    pub fn score(&self, criterion: &ThresholdCriterion) -> f64 {
        match *criterion {
            ThresholdCriterion::F1 => self.f1,
            ThresholdCriterion::Youden => self.youden_j(),
            ThresholdCriterion::Cost { false_alarm, missed } => self.cost(false_alarm, missed),
        }
    }
}

/// Paires (prédit, observé) ; tempête = valeur ≥ seuil des deux côtés.
/// `None` sans paire.
pub fn classify(pairs: &[(f64, f64)], threshold: f64) -> Option<ClassificationStats> {
    if pairs.is_empty() {
        return None;
    }
    let mut c = ConfusionMatrix::default();
    for &(predicted, actual) in pairs {
        c.record(predicted >= threshold, actual >= threshold);
    }
    Some(ClassificationStats::from_confusion(threshold, c))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub stats: ClassificationStats,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSweep {
    pub criterion: ThresholdCriterion,
    pub best_threshold: f64,
    pub best_score: f64,
    pub points: Vec<SweepPoint>,
}

impl ThresholdSweep {
    pub fn best(&self) -> Option<&ClassificationStats> {
        self.points.iter().map(|p| &p.stats).find(|s| s.threshold == self.best_threshold)
    }
}

/// Évalue chaque seuil dans l'ordre donné ; à score égal, le premier reste.
pub fn threshold_sweep(pairs: &[(f64, f64)], thresholds: &[f64], criterion: ThresholdCriterion) -> Option<ThresholdSweep> {
    let mut best: Option<(f64, f64)> = None;
    let mut points = Vec::with_capacity(thresholds.len());
    for &t in thresholds {
        let stats = classify(pairs, t)?;
        let score = stats.score(&criterion);
        if best.map_or(true, |(_, b)| criterion.better(score, b)) {
            best = Some((t, score));
        }
        points.push(SweepPoint { stats, score });
    }
    let (best_threshold, best_score) = best?;
    Some(ThresholdSweep { criterion, best_threshold, best_score, points })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StormEvent {
    /// `storm_AAAAMMJJ_HHMM`, d'après le début.
    pub id: String,
    pub start: DateTime<Utc>,
    /// Dernière mesure de l'épisode, incluse.
    pub end: DateTime<Utc>,
    pub peak_time: DateTime<Utc>,
    pub measurements: usize,
    pub peak_kp: f64,
    pub mean_kp: f64,
    pub max_tec: Option<f64>,
    pub mean_tec: Option<f64>,
    pub g_scale: u8,
}

impl StormEvent {
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.start <= *ts && *ts <= self.end
    }
}

fn summarize(run: &[&Measurement]) -> Option<StormEvent> {
    let first = run.first()?;
    let last = run.last()?;
    let mut peak: Option<(&Measurement, f64)> = None;
    let mut kp_sum = 0.0;
    for &m in run {
        let kp = m.kp_index.unwrap_or(0.0);
        kp_sum += kp;
        if peak.map_or(true, |(_, p)| kp > p) {
            peak = Some((m, kp));
        }
    }
    let (peak_m, peak_kp) = peak?;
    let tec: Vec<f64> = run.iter().filter_map(|m| TargetField::TecMean.value(m)).collect();
    Some(StormEvent {
        id: format!("storm_{}", first.timestamp.format("%Y%m%d_%H%M")),
        start: first.timestamp,
        end: last.timestamp,
        peak_time: peak_m.timestamp,
        measurements: run.len(),
        peak_kp,
        mean_kp: kp_sum / run.len() as f64,
        max_tec: tec.iter().copied().reduce(f64::max),
        mean_tec: (!tec.is_empty()).then(|| tec.iter().sum::<f64>() / tec.len() as f64),
        g_scale: g_scale(peak_kp),
    })
}

/// Épisodes d'au moins `min_duration` mesures consécutives avec Kp ≥ seuil.
/// Un Kp absent interrompt l'épisode. `records` trié par date.
pub fn detect_storm_events(records: &[Measurement], kp_threshold: f64, min_duration: usize) -> Vec<StormEvent> {
    let mut events = Vec::new();
    let mut run: Vec<&Measurement> = Vec::new();
    for m in records {
        if m.kp_index.is_some_and(|kp| kp >= kp_threshold) {
            run.push(m);
            continue;
        }
        if run.len() >= min_duration {
            events.extend(summarize(&run));
        }
        run.clear();
    }
    if run.len() >= min_duration {
        events.extend(summarize(&run));
    }
    log::debug!("{} épisodes de tempête (Kp >= {})", events.len(), kp_threshold);
    events
}

/// Erreurs d'un couple (approche, région) sur les instants visés d'un épisode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventScore {
    pub event: String,
    pub approach: String,
    pub region: String,
    pub count: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub bias: Option<f64>,
    /// Part des prévisions au-dessus du seuil de tempête.
    pub detection_rate: Option<f64>,
    /// Heures entre la première prévision au-dessus du seuil et le début de
    /// l'épisode ; négatif si émise après le début.
    pub detection_lead_hours: Option<f64>,
}

/// Un score par (épisode, région, approche), dans cet ordre.
pub fn score_events(
    events: &[StormEvent],
    samples: &[BacktestSample],
    regions: &[String],
    approaches: &[String],
    threshold: Option<f64>,
) -> Vec<EventScore> {
    let mut scores = Vec::with_capacity(events.len() * regions.len() * approaches.len());
    for event in events {
        for region in regions {
            for approach in approaches {
                let picked: Vec<&BacktestSample> = samples
                    .iter()
                    .filter(|s| &s.region == region && &s.approach == approach && event.contains(&s.target_timestamp))
                    .collect();
                let n = picked.len() as f64;
                let mean = |f: &dyn Fn(&BacktestSample) -> f64| {
                    (!picked.is_empty()).then(|| picked.iter().map(|&s| f(s)).sum::<f64>() / n)
                };
                let detection_rate = threshold
                    .and_then(|t| mean(&|s: &BacktestSample| if s.predicted >= t { 1.0 } else { 0.0 }));
                let detection_lead_hours = threshold.and_then(|t| {
                    picked
                        .iter()
                        .find(|s| s.predicted >= t)
                        .map(|s| (event.start - s.timestamp).num_minutes() as f64 / 60.0)
                });
                scores.push(EventScore {
                    event: event.id.clone(),
                    approach: approach.clone(),
                    region: region.clone(),
                    count: picked.len(),
                    mae: mean(&|s: &BacktestSample| s.absolute_error),
                    rmse: mean(&|s: &BacktestSample| s.signed_error * s.signed_error).map(f64::sqrt),
                    bias: mean(&|s: &BacktestSample| s.signed_error),
                    detection_rate,
                    detection_lead_hours,
                });
            }
        }
    }
    scores
}
