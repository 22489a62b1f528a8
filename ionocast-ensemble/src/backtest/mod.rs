//! Rejeu de l'historique pour comparer plusieurs approches de prévision.
//!
//! CRITIQUE : chaque approche ne voit, pour un instant T, que les mesures
//! strictement antérieures à T (`History::before`). Les observations
//! utilisées pour noter la prévision (T + horizon) ne passent jamais par
//! l'historique fourni aux approches.

pub mod approaches;
pub mod metrics;
pub mod report;
pub mod storms;

use std::borrow::Cow;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use ionocast_db::models::{sort_and_dedup, Measurement, TargetField};
use ionocast_db::store::HistoricalStore;

use crate::error::{EngineError, EngineResult};
use crate::history::History;
use crate::regions::{RegionDefinition, RegionalModel};
use approaches::{Approach, PredictionPoint};
use report::{BacktestReport, ReportMetadata};
use storms::{detect_storm_events, StormSettings};

/// Seuils de l'écart relatif de MAE entre le gagnant et le second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub moderate: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self { high: 0.10, moderate: 0.03 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    /// Inclus.
    pub end: DateTime<Utc>,
    pub interval_minutes: i64,
    pub horizon_minutes: i64,
    pub tolerance_minutes: i64,
    pub target: TargetField,
    /// Régions évaluées ; vide = toutes.
    pub regions: Vec<String>,
    /// Approche de référence pour le score de compétence.
    pub baseline: Option<String>,
    pub max_workers: usize,
    pub confidence: ConfidenceThresholds,
    /// Historique chargé avant `start` quand on lit un store.
    pub lookback_hours: i64,
    pub storm: StormSettings,
}

impl BacktestConfig {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            interval_minutes: 360,
            horizon_minutes: 24 * 60,
            tolerance_minutes: 60,
            target: TargetField::TecMean,
            regions: Vec::new(),
            baseline: Some("persistence".to_string()),
            max_workers: 4,
            confidence: ConfidenceThresholds::default(),
            lookback_hours: 24 * 7,
            storm: StormSettings::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_minutes)
    }

    pub fn horizon(&self) -> Duration {
        Duration::minutes(self.horizon_minutes)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::minutes(self.tolerance_minutes)
    }

    /// Instants de prévision de `start` à `end` inclus.
    pub fn points(&self) -> Vec<DateTime<Utc>> {
        let mut points = Vec::new();
        let mut t = self.start;
        while t <= self.end {
            points.push(t);
            t += self.interval();
        }
        points
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSample {
    pub timestamp: DateTime<Utc>,
    pub target_timestamp: DateTime<Utc>,
    pub region: String,
    pub approach: String,
    pub predicted: f64,
    pub actual: f64,
    pub signed_error: f64,
    pub absolute_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub region: String,
    pub approach: String,
    pub error: String,
}

/// Résultat d'un instant de prévision, toutes régions et approches.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskOutcome {
    pub unmatched: bool,
    pub samples: Vec<BacktestSample>,
    pub failures: Vec<FailureRecord>,
}

/// Annulation coopérative, vérifiée avant chaque tâche.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observation la plus proche de `target` dans ±`tolerance` avec une valeur
/// cible présente ; à égalité, la plus ancienne.
pub fn match_actual<'a>(
    records: &'a [Measurement],
    target: DateTime<Utc>,
    tolerance: Duration,
    field: TargetField,
) -> Option<&'a Measurement> {
    let lo = records.partition_point(|m| m.timestamp < target - tolerance);
    let mut best: Option<(&Measurement, Duration)> = None;
    for m in &records[lo..] {
        if m.timestamp > target + tolerance {
            break;
        }
        if field.value(m).is_none() {
            continue;
        }
        let dist = (m.timestamp - target).abs();
        match best {
            Some((_, d)) if d <= dist => {}
            _ => best = Some((m, dist)),
        }
    }
    best.map(|(m, _)| m)
}

/// Une approche qui panique échoue pour cet échantillon seulement.
fn predict_isolated(
    approach: &dyn Approach,
    point: &PredictionPoint,
    region: &RegionDefinition,
    history: History<'_>,
) -> EngineResult<f64> {
    panic::catch_unwind(AssertUnwindSafe(|| approach.predict(point, region, history))).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "sans message".to_string());
        log::error!("{} a paniqué à {} ({}) : {}", approach.id(), point.issued_at, region.id, msg);
        Err(EngineError::DataUnavailable(format!("panique : {}", msg)))
    })
}

pub struct BacktestEngine {
    config: BacktestConfig,
    regions: RegionalModel,
    approaches: Vec<Arc<dyn Approach>>,
    show_progress: bool,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, regions: RegionalModel, approaches: Vec<Arc<dyn Approach>>) -> EngineResult<Self> {
        if approaches.is_empty() {
            return Err(EngineError::config("aucune approche à évaluer"));
        }
        let mut seen = HashSet::new();
        for a in &approaches {
            if !seen.insert(a.id().to_string()) {
                return Err(EngineError::config(format!("approche en double : '{}'", a.id())));
            }
        }
        if let Some(baseline) = &config.baseline {
            if !seen.contains(baseline) {
                return Err(EngineError::config(format!("référence '{}' absente des approches", baseline)));
            }
        }
        if config.end < config.start {
            return Err(EngineError::config(format!("période inversée : {} > {}", config.start, config.end)));
        }
        if config.interval_minutes <= 0 || config.horizon_minutes <= 0 || config.tolerance_minutes < 0 {
            return Err(EngineError::config("intervalle, horizon ou tolérance invalide"));
        }
        if config.max_workers == 0 {
            return Err(EngineError::config("max_workers doit être >= 1"));
        }
        let c = config.confidence;
        if !(c.moderate >= 0.0 && c.high >= c.moderate) {
            return Err(EngineError::config(format!("seuils de confiance invalides : {:?}", c)));
        }
        for id in &config.regions {
            regions.require(id)?;
        }
        config.storm.validate()?;
        for a in &approaches {
            if let Some(training_end) = a.training_end() {
                if training_end > config.start {
                    return Err(EngineError::config(format!(
                        "'{}' est entraînée jusqu'au {}, après le début du backtest ({}) : reconstruisez la climatologie avec --end <= {}",
                        a.id(),
                        training_end,
                        config.start,
                        config.start.format("%Y-%m-%d")
                    )));
                }
            }
        }
        Ok(Self { config, regions, approaches, show_progress: false })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    fn selected_regions(&self) -> Vec<&RegionDefinition> {
        if self.config.regions.is_empty() {
            self.regions.regions().iter().collect()
        } else {
            self.config.regions.iter().filter_map(|id| self.regions.get(id)).collect()
        }
    }

    /// Charge la période (plus l'historique et l'horizon) depuis un store puis rejoue.
    pub fn run_store(&self, store: &dyn HistoricalStore, cancel: &CancellationToken) -> anyhow::Result<BacktestReport> {
        let from = self.config.start - Duration::hours(self.config.lookback_hours);
        let to = self.config.end + self.config.horizon() + self.config.tolerance() + Duration::seconds(1);
        let records = store.range(from, to)?;
        log::info!("Backtest : {} mesures chargées de {} à {}", records.len(), from, to);
        Ok(self.run(&records, cancel)?)
    }

    pub fn run(&self, records: &[Measurement], cancel: &CancellationToken) -> EngineResult<BacktestReport> {
        let records: Cow<'_, [Measurement]> = if records.windows(2).all(|w| w[0].timestamp < w[1].timestamp) {
            Cow::Borrowed(records)
        } else {
            let mut owned = records.to_vec();
            sort_and_dedup(&mut owned);
            Cow::Owned(owned)
        };
        let records: &[Measurement] = &records;
        let points = self.config.points();
        let regions = self.selected_regions();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .build()
            .map_err(|e| EngineError::config(format!("pool du backtest : {}", e)))?;

        let pb = if self.show_progress {
            let pb = ProgressBar::new(points.len() as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=> "));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let outcomes: Vec<Option<TaskOutcome>> = pool.install(|| {
            points
                .par_iter()
                .map(|&t| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let outcome = self.evaluate_point(records, t, &regions);
                    pb.inc(1);
                    Some(outcome)
                })
                .collect()
        });
        pb.finish_and_clear();

        // Épisodes observés sur les instants visés, utilisés pour noter seulement.
        let from = records.partition_point(|m| m.timestamp < self.config.start);
        let until = self.config.end + self.config.horizon() + self.config.tolerance();
        let to = records.partition_point(|m| m.timestamp <= until).max(from);
        let storm_events =
            detect_storm_events(&records[from..to], self.config.storm.kp_threshold, self.config.storm.min_duration);

        let completed = outcomes.iter().filter(|o| o.is_some()).count();
        if completed < points.len() {
            log::warn!("Backtest annulé : {}/{} instants évalués", completed, points.len());
        }

        let metadata = ReportMetadata {
            generated_at: Utc::now(),
            start: self.config.start,
            end: self.config.end,
            interval_minutes: self.config.interval_minutes,
            horizon_minutes: self.config.horizon_minutes,
            tolerance_minutes: self.config.tolerance_minutes,
            target: self.config.target,
            approaches: self.approaches.iter().map(|a| a.id().to_string()).collect(),
            regions: regions.iter().map(|r| r.id.clone()).collect(),
            baseline: self.config.baseline.clone(),
            confidence: self.config.confidence,
            storm: self.config.storm.clone(),
            storm_threshold: self.config.storm.threshold_for(self.config.target),
        };
        Ok(BacktestReport::aggregate(metadata, points.len(), outcomes, &self.regions, storm_events))
    }

    fn evaluate_point(&self, records: &[Measurement], t: DateTime<Utc>, regions: &[&RegionDefinition]) -> TaskOutcome {
        let target_time = t + self.config.horizon();
        let Some(actual) = match_actual(records, target_time, self.config.tolerance(), self.config.target) else {
            return TaskOutcome { unmatched: true, ..TaskOutcome::default() };
        };
        let Some(raw_actual) = self.config.target.value(actual) else {
            return TaskOutcome { unmatched: true, ..TaskOutcome::default() };
        };
        let actual_activity = actual
            .kp_index
            .or_else(|| History::before(records, actual.timestamp).latest_activity())
            .unwrap_or(0.0);

        let history = History::before(records, t);
        let point = PredictionPoint { issued_at: t, target_time };
        let mut outcome = TaskOutcome::default();

        for region in regions {
            let actual_value = self.regions.adjust(raw_actual, region, actual_activity);
            for approach in &self.approaches {
                let predicted = predict_isolated(approach.as_ref(), &point, region, history).and_then(|v| {
                    if v.is_finite() {
                        Ok(v)
                    } else {
                        Err(EngineError::DataUnavailable(format!("prédiction non finie : {}", v)))
                    }
                });
                match predicted {
                    Ok(predicted) => {
                        let signed = predicted - actual_value;
                        outcome.samples.push(BacktestSample {
                            timestamp: t,
                            target_timestamp: actual.timestamp,
                            region: region.id.clone(),
                            approach: approach.id().to_string(),
                            predicted,
                            actual: actual_value,
                            signed_error: signed,
                            absolute_error: signed.abs(),
                        });
                    }
                    Err(e) => {
                        log::debug!("{} / {} à {} : {}", approach.id(), region.id, t, e);
                        outcome.failures.push(FailureRecord {
                            timestamp: t,
                            region: region.id.clone(),
                            approach: approach.id().to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::approaches::{ClimatologyApproach, EnsembleApproach, PersistenceApproach};
    use super::report::{Confidence, Recommendation, RegionStatus};
    use super::*;
    use crate::climatology::builder::{build, ClimatologyConfig};
    use crate::climatology::snapshot::ClimatologyHandle;
    use crate::ensemble::forecaster::tests::{Mode, Scripted};
    use crate::ensemble::{ClimatologyWeight, EnsembleCombiner, EnsembleConfig};
    use crate::synthetic::{generate, SyntheticConfig};
    use chrono::TimeZone;
    use ionocast_db::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn data() -> Vec<Measurement> {
        generate(t0(), 24 * 120, &SyntheticConfig::default(), 7)
    }

    fn table(records: &[Measurement]) -> Arc<crate::climatology::ClimatologyTable> {
        let model = RegionalModel::default();
        Arc::new(build(records, t0(), t0() + Duration::days(90), &ClimatologyConfig::default(), Some(&model)).unwrap())
    }

    fn config() -> BacktestConfig {
        let mut c = BacktestConfig::new(t0() + Duration::days(90), t0() + Duration::days(110));
        c.interval_minutes = 12 * 60;
        c
    }

    fn standard_approaches(records: &[Measurement]) -> Vec<Arc<dyn Approach>> {
        let model = RegionalModel::default();
        vec![
            Arc::new(ClimatologyApproach::new(table(records), model.clone())),
            Arc::new(PersistenceApproach::new(TargetField::TecMean, model)),
        ]
    }

    fn ensemble(records: &[Measurement], mode: Mode, weight: f64) -> Arc<EnsembleCombiner> {
        let handle = Arc::new(ClimatologyHandle::new((*table(records)).clone()));
        let config = EnsembleConfig {
            weight: ClimatologyWeight::Fixed { weight },
            window: 24,
            ..EnsembleConfig::default()
        };
        Arc::new(EnsembleCombiner::new(config, handle, RegionalModel::default(), Arc::new(Scripted::new(mode))).unwrap())
    }

    /// Vérifie que l'historique fourni ne dépasse jamais l'instant de prévision.
    struct Spy {
        calls: AtomicUsize,
        leaks: AtomicUsize,
    }

    impl Approach for Spy {
        fn id(&self) -> &str {
            "spy"
        }

        fn predict(&self, point: &PredictionPoint, _region: &RegionDefinition, history: History<'_>) -> EngineResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if history.as_of() != point.issued_at || history.records().iter().any(|m| m.timestamp >= point.issued_at) {
                self.leaks.fetch_add(1, Ordering::SeqCst);
            }
            Ok(history.latest().map(|m| m.tec_mean).unwrap_or(0.0))
        }
    }

    /// Échoue une fois sur deux et annule après `cancel_after` appels.
    struct Flaky {
        calls: AtomicUsize,
        cancel: Option<(CancellationToken, usize)>,
    }

    impl Approach for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        fn predict(&self, point: &PredictionPoint, _region: &RegionDefinition, _history: History<'_>) -> EngineResult<f64> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((token, after)) = &self.cancel {
                if n + 1 >= *after {
                    token.cancel();
                }
            }
            if point.issued_at.timestamp() / 3600 % 24 == 12 {
                Err(EngineError::DataUnavailable("panne simulée".to_string()))
            } else {
                Ok(f64::from(point.issued_at.timestamp() as i32 % 7))
            }
        }
    }

    /// Panique sur les instants de midi.
    struct Panicky;

    impl Approach for Panicky {
        fn id(&self) -> &str {
            "panicky"
        }

        fn predict(&self, point: &PredictionPoint, _region: &RegionDefinition, _history: History<'_>) -> EngineResult<f64> {
            if point.issued_at.timestamp() / 3600 % 24 == 12 {
                panic!("état interne corrompu");
            }
            Ok(10.0)
        }
    }

    #[test]
    fn test_match_actual_nearest_within_tolerance() {
        let base = t0();
        let records = vec![
            Measurement::quiet(base - Duration::minutes(40), 1.0, 2.0),
            Measurement::quiet(base + Duration::minutes(40), 2.0, 2.0),
            Measurement::quiet(base + Duration::minutes(50), 3.0, 2.0),
        ];
        // Égalité de distance : la plus ancienne gagne.
        let m = match_actual(&records, base, Duration::minutes(60), TargetField::TecMean).unwrap();
        assert_eq!(m.tec_mean, 1.0);
        let m = match_actual(&records, base + Duration::minutes(45), Duration::minutes(60), TargetField::TecMean).unwrap();
        assert_eq!(m.tec_mean, 2.0);
        assert!(match_actual(&records, base + Duration::hours(3), Duration::minutes(60), TargetField::TecMean).is_none());
    }

    #[test]
    fn test_match_actual_skips_fill_values() {
        let base = t0();
        let records = vec![
            Measurement::quiet(base, 999.0, 2.0),
            Measurement::quiet(base + Duration::minutes(30), 12.0, 2.0),
        ];
        let m = match_actual(&records, base, Duration::minutes(60), TargetField::TecMean).unwrap();
        assert_eq!(m.tec_mean, 12.0);
    }

    #[test]
    fn test_repeated_runs_identical() {
        let records = data();
        let engine = BacktestEngine::new(config(), RegionalModel::default(), standard_approaches(&records)).unwrap();
        let a = engine.run(&records, &CancellationToken::new()).unwrap();
        let b = engine.run(&records, &CancellationToken::new()).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.regions, b.regions);
        assert_eq!(a.overall, b.overall);
        assert!(!a.samples.is_empty());
    }

    #[test]
    fn test_results_independent_of_worker_count() {
        let records = data();
        let mut one = config();
        one.max_workers = 1;
        let mut many = config();
        many.max_workers = 8;
        let a = BacktestEngine::new(one, RegionalModel::default(), standard_approaches(&records))
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        let b = BacktestEngine::new(many, RegionalModel::default(), standard_approaches(&records))
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_no_leakage_spy() {
        let records = data();
        let spy = Arc::new(Spy { calls: AtomicUsize::new(0), leaks: AtomicUsize::new(0) });
        let mut c = config();
        c.baseline = None;
        let approaches: Vec<Arc<dyn Approach>> = vec![spy.clone()];
        let engine = BacktestEngine::new(c, RegionalModel::default(), approaches).unwrap();
        engine.run(&records, &CancellationToken::new()).unwrap();
        assert!(spy.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(spy.leaks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_future_changes_do_not_alter_predictions() {
        let records = data();
        let cutoff = t0() + Duration::days(100);
        let mut altered = records.clone();
        for m in altered.iter_mut().filter(|m| m.timestamp >= cutoff) {
            m.tec_mean *= 3.0;
            m.kp_index = Some(8.5);
        }
        let engine = BacktestEngine::new(config(), RegionalModel::default(), standard_approaches(&records)).unwrap();
        let a = engine.run(&records, &CancellationToken::new()).unwrap();
        let b = engine.run(&altered, &CancellationToken::new()).unwrap();
        let before = |r: &BacktestReport| -> Vec<(DateTime<Utc>, String, String, f64)> {
            r.samples
                .iter()
                .filter(|s| s.timestamp <= cutoff)
                .map(|s| (s.timestamp, s.region.clone(), s.approach.clone(), s.predicted))
                .collect()
        };
        assert!(!before(&a).is_empty());
        assert_eq!(before(&a), before(&b));
    }

    #[test]
    fn test_weight_one_ensemble_matches_climatology() {
        let records = data();
        let model = RegionalModel::default();
        let mut c = config();
        c.baseline = None;
        let approaches: Vec<Arc<dyn Approach>> = vec![
            Arc::new(ClimatologyApproach::new(table(&records), model.clone())),
            Arc::new(EnsembleApproach::new(ensemble(&records, Mode::Constant(500.0), 1.0))),
        ];
        let report = BacktestEngine::new(c, model, approaches).unwrap().run(&records, &CancellationToken::new()).unwrap();
        let clim: Vec<f64> = report.samples.iter().filter(|s| s.approach == "climatology").map(|s| s.predicted).collect();
        let ens: Vec<f64> = report.samples.iter().filter(|s| s.approach == "ensemble").map(|s| s.predicted).collect();
        assert!(!clim.is_empty());
        assert_eq!(clim, ens);
    }

    #[test]
    fn test_failing_forecaster_matches_climatology() {
        let records = data();
        let model = RegionalModel::default();
        let mut c = config();
        c.baseline = None;
        let approaches: Vec<Arc<dyn Approach>> = vec![
            Arc::new(ClimatologyApproach::new(table(&records), model.clone())),
            Arc::new(EnsembleApproach::new(ensemble(&records, Mode::Fail, 0.3))),
        ];
        let report = BacktestEngine::new(c, model, approaches).unwrap().run(&records, &CancellationToken::new()).unwrap();
        let clim = report.metrics.iter().find(|m| m.approach == "climatology" && m.region == "polar").unwrap();
        let ens = report.metrics.iter().find(|m| m.approach == "ensemble" && m.region == "polar").unwrap();
        assert_eq!(clim.stats, ens.stats);
        assert_eq!(ens.failed, 0);
    }

    #[test]
    fn test_region_without_samples_is_insufficient_data() {
        let records = data();
        let mut c = config();
        // Aucune observation après la fin des données : tout est non apparié.
        c.start = t0() + Duration::days(200);
        c.end = t0() + Duration::days(210);
        let report = BacktestEngine::new(c, RegionalModel::default(), standard_approaches(&records))
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        assert!(report.samples.is_empty());
        assert_eq!(report.unmatched_points, report.total_points);
        assert!(report.regions.iter().all(|r| r.status == RegionStatus::InsufficientData));
        assert_eq!(report.overall, Recommendation::InsufficientData);
    }

    #[test]
    fn test_failures_recorded_per_approach() {
        let records = data();
        let flaky = Arc::new(Flaky { calls: AtomicUsize::new(0), cancel: None });
        let mut approaches = standard_approaches(&records);
        approaches.push(flaky);
        let mut c = config();
        c.regions = vec!["mid_latitude".to_string()];
        let report = BacktestEngine::new(c, RegionalModel::default(), approaches)
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        let flaky_m = report.metrics.iter().find(|m| m.approach == "flaky").unwrap();
        let clim_m = report.metrics.iter().find(|m| m.approach == "climatology").unwrap();
        assert!(flaky_m.failed > 0);
        assert_eq!(clim_m.failed, 0);
        assert_eq!(flaky_m.count + flaky_m.failed, clim_m.count);
        assert_eq!(report.failures.len(), flaky_m.failed);
    }

    #[test]
    fn test_panicking_approach_recorded_as_failure() {
        let records = data();
        let mut approaches = standard_approaches(&records);
        approaches.push(Arc::new(Panicky));
        let mut c = config();
        c.regions = vec!["polar".to_string()];
        let report = BacktestEngine::new(c, RegionalModel::default(), approaches)
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        let panicky = report.metrics.iter().find(|m| m.approach == "panicky").unwrap();
        let clim = report.metrics.iter().find(|m| m.approach == "climatology").unwrap();
        assert!(panicky.failed > 0);
        assert!(panicky.count > 0);
        assert_eq!(clim.failed, 0);
        assert_eq!(panicky.count + panicky.failed, clim.count);
        assert!(report.failures.iter().all(|f| f.approach == "panicky" && f.error.contains("panique")));
    }

    #[test]
    fn test_cancellation_returns_consistent_partial_report() {
        let records = data();
        let token = CancellationToken::new();
        let flaky = Arc::new(Flaky { calls: AtomicUsize::new(0), cancel: Some((token.clone(), 5)) });
        let mut c = config();
        c.baseline = None;
        c.max_workers = 1;
        c.regions = vec!["global".to_string()];
        let approaches: Vec<Arc<dyn Approach>> = vec![flaky];
        let report = BacktestEngine::new(c, RegionalModel::default(), approaches).unwrap().run(&records, &token).unwrap();
        assert!(report.cancelled);
        assert!(report.completed_points < report.total_points);
        let m = &report.metrics[0];
        assert_eq!(m.count, report.samples.len());
        assert_eq!(m.failed, report.failures.len());
    }

    #[test]
    fn test_cancelled_before_start() {
        let records = data();
        let token = CancellationToken::new();
        token.cancel();
        let engine = BacktestEngine::new(config(), RegionalModel::default(), standard_approaches(&records)).unwrap();
        let report = engine.run(&records, &token).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.completed_points, 0);
        assert!(report.samples.is_empty());
    }

    #[test]
    fn test_run_store_loads_history() {
        let records = data();
        let store = MemoryStore::new(records.clone());
        let engine = BacktestEngine::new(config(), RegionalModel::default(), standard_approaches(&records)).unwrap();
        let a = engine.run_store(&store, &CancellationToken::new()).unwrap();
        let b = engine.run(&records, &CancellationToken::new()).unwrap();
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let records = data();
        let mut c = config();
        c.baseline = Some("oracle".to_string());
        assert!(BacktestEngine::new(c, RegionalModel::default(), standard_approaches(&records)).is_err());
        let mut c = config();
        c.regions = vec!["atlantis".to_string()];
        assert!(BacktestEngine::new(c, RegionalModel::default(), standard_approaches(&records)).is_err());
        assert!(BacktestEngine::new(config(), RegionalModel::default(), vec![]).is_err());
    }

    #[test]
    fn test_rejects_climatology_trained_on_tested_period() {
        let records = data();
        let model = RegionalModel::default();
        // Table entraînée jusqu'à t0 + 120 j, backtest à partir de t0 + 90 j.
        let late = Arc::new(
            build(&records, t0(), t0() + Duration::days(120), &ClimatologyConfig::default(), Some(&model)).unwrap(),
        );
        let mut c = config();
        c.baseline = None;
        let clim: Vec<Arc<dyn Approach>> = vec![Arc::new(ClimatologyApproach::new(late.clone(), model.clone()))];
        let err = BacktestEngine::new(c.clone(), model.clone(), clim).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)), "erreur inattendue : {}", err);

        let handle = Arc::new(ClimatologyHandle::new((*late).clone()));
        let combiner =
            EnsembleCombiner::new(EnsembleConfig::default(), handle, model.clone(), Arc::new(Scripted::new(Mode::Fail)))
                .unwrap();
        let ens: Vec<Arc<dyn Approach>> = vec![Arc::new(EnsembleApproach::new(Arc::new(combiner)))];
        assert!(BacktestEngine::new(c.clone(), model.clone(), ens).is_err());

        // Fin d'entraînement = début du backtest : accepté.
        assert!(BacktestEngine::new(c, model, standard_approaches(&records)).is_ok());
    }

    #[test]
    fn test_storm_classification_and_events_reported() {
        let mut records = data();
        // Épisode G3 de 6 h, visé par les prévisions émises 24 h plus tôt.
        let storm_start = t0() + Duration::days(100) + Duration::hours(2);
        for m in records.iter_mut() {
            let in_storm = m.timestamp >= storm_start && m.timestamp < storm_start + Duration::hours(6);
            m.kp_index = Some(if in_storm { 7.2 } else { 2.0 });
        }
        let mut c = config();
        c.interval_minutes = 60;
        c.end = t0() + Duration::days(102);
        c.regions = vec!["mid_latitude".to_string(), "polar".to_string()];
        c.storm.threshold = Some(15.0);
        let report = BacktestEngine::new(c, RegionalModel::default(), standard_approaches(&records))
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.metadata.storm_threshold, Some(15.0));
        assert_eq!(report.storm_events.len(), 1);
        let event = &report.storm_events[0];
        assert_eq!(event.start, storm_start);
        assert_eq!(event.measurements, 6);
        assert_eq!(event.g_scale, 3);

        // Un score par (épisode, région, approche).
        assert_eq!(report.event_scores.len(), 2 * 2);
        for score in &report.event_scores {
            assert_eq!(score.event, event.id);
            assert!(score.count > 0);
            assert!(score.mae.is_some());
            assert!(score.detection_rate.is_some());
        }

        for m in &report.metrics {
            let stats = m.stats.as_ref().unwrap();
            let class = stats.classification.unwrap();
            assert_eq!(class.confusion.total(), m.count);
            assert!(stats.r_squared.is_some());
            let sweep = m.sweep.as_ref().unwrap();
            assert_eq!(sweep.points.len(), 17);
            assert!(sweep.best().is_some());
        }
    }

    #[test]
    fn test_rejects_invalid_storm_settings() {
        let records = data();
        let mut c = config();
        c.storm.kp_threshold = 12.0;
        assert!(BacktestEngine::new(c, RegionalModel::default(), standard_approaches(&records)).is_err());
    }

    #[test]
    fn test_winner_confidence_reported() {
        let records = data();
        let report = BacktestEngine::new(config(), RegionalModel::default(), standard_approaches(&records))
            .unwrap()
            .run(&records, &CancellationToken::new())
            .unwrap();
        for r in &report.regions {
            match &r.status {
                RegionStatus::Decided { winner, confidence, .. } => {
                    assert!(winner == "climatology" || winner == "persistence");
                    assert!(matches!(confidence, Confidence::High | Confidence::Moderate | Confidence::Low));
                }
                RegionStatus::InsufficientData => panic!("région {} sans données", r.region),
            }
        }
        let baseline = report.metrics.iter().find(|m| m.approach == "persistence").unwrap();
        assert_eq!(baseline.skill, Some(0.0));
    }
}
