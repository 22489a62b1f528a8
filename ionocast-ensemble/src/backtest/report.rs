use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ionocast_db::models::TargetField;

use super::metrics::{error_stats, pairs, skill_score, ApproachMetrics};
use super::storms::{score_events, threshold_sweep, EventScore, StormEvent, StormSettings};
use super::{BacktestSample, ConfidenceThresholds, FailureRecord, TaskOutcome};
use crate::regions::RegionalModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_minutes: i64,
    pub horizon_minutes: i64,
    pub tolerance_minutes: i64,
    pub target: TargetField,
    pub approaches: Vec<String>,
    pub regions: Vec<String>,
    pub baseline: Option<String>,
    pub confidence: ConfidenceThresholds,
    #[serde(default)]
    pub storm: StormSettings,
    /// Seuil de tempête effectivement appliqué à la cible.
    #[serde(default)]
    pub storm_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Moderate,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "haute"),
            Confidence::Moderate => write!(f, "modérée"),
            Confidence::Low => write!(f, "faible"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegionStatus {
    Decided {
        winner: String,
        confidence: Confidence,
        /// Écart relatif de MAE avec le second, absent s'il n'y a qu'une approche.
        relative_gap: Option<f64>,
    },
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionResult {
    pub region: String,
    pub status: RegionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    Winner { approach: String, regions_won: usize, regions_decided: usize },
    NoClearWinner { tied: Vec<String> },
    InsufficientData,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::Winner { approach, regions_won, regions_decided } => {
                write!(f, "{} ({}/{} régions)", approach, regions_won, regions_decided)
            }
            Recommendation::NoClearWinner { tied } => write!(f, "pas de gagnant net ({})", tied.join(", ")),
            Recommendation::InsufficientData => write!(f, "données insuffisantes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub metadata: ReportMetadata,
    pub total_points: usize,
    pub completed_points: usize,
    pub unmatched_points: usize,
    pub cancelled: bool,
    pub metrics: Vec<ApproachMetrics>,
    pub regions: Vec<RegionResult>,
    pub overall: Recommendation,
    pub samples: Vec<BacktestSample>,
    pub failures: Vec<FailureRecord>,
    /// Épisodes de Kp élevé observés sur la période visée.
    #[serde(default)]
    pub storm_events: Vec<StormEvent>,
    #[serde(default)]
    pub event_scores: Vec<EventScore>,
}

fn confidence_of(gap: f64, thresholds: &ConfidenceThresholds) -> Confidence {
    if gap >= thresholds.high {
        Confidence::High
    } else if gap >= thresholds.moderate {
        Confidence::Moderate
    } else {
        Confidence::Low
    }
}

/// Gagnant d'une région : MAE minimale, puis RMSE, puis identifiant.
fn decide(region: &str, metrics: &[ApproachMetrics], thresholds: &ConfidenceThresholds) -> RegionStatus {
    let mut eligible: Vec<(&str, f64, f64)> = metrics
        .iter()
        .filter(|m| m.region == region)
        .filter_map(|m| m.stats.as_ref().map(|s| (m.approach.as_str(), s.mae, s.rmse)))
        .collect();
    eligible.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.total_cmp(&b.2)).then(a.0.cmp(b.0)));

    match eligible.as_slice() {
        [] => RegionStatus::InsufficientData,
        [(winner, _, _)] => RegionStatus::Decided {
            winner: winner.to_string(),
            confidence: Confidence::Low,
            relative_gap: None,
        },
        [(winner, best, _), (_, second, _), ..] => {
            let gap = if *second > 0.0 { (second - best) / second } else { 0.0 };
            RegionStatus::Decided {
                winner: winner.to_string(),
                confidence: confidence_of(gap, thresholds),
                relative_gap: Some(gap),
            }
        }
    }
}

/// Vote majoritaire sur les régions décidées.
fn vote(regions: &[RegionResult], approaches: &[String]) -> Recommendation {
    let winners: Vec<&str> = regions
        .iter()
        .filter_map(|r| match &r.status {
            RegionStatus::Decided { winner, .. } => Some(winner.as_str()),
            RegionStatus::InsufficientData => None,
        })
        .collect();
    if winners.is_empty() {
        return Recommendation::InsufficientData;
    }
    let counts: Vec<(&String, usize)> = approaches
        .iter()
        .map(|a| (a, winners.iter().filter(|w| **w == a.as_str()).count()))
        .collect();
    let best = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let leaders: Vec<String> = counts.iter().filter(|(_, c)| *c == best).map(|(a, _)| (*a).clone()).collect();
    match leaders.as_slice() {
        [single] => Recommendation::Winner {
            approach: single.clone(),
            regions_won: best,
            regions_decided: winners.len(),
        },
        _ => Recommendation::NoClearWinner { tied: leaders },
    }
}

impl BacktestReport {
    /// Agrégation séquentielle, dans l'ordre des tâches puis des régions et
    /// approches déclarées, pour des métriques identiques d'un run à l'autre.
    pub(crate) fn aggregate(
        metadata: ReportMetadata,
        total_points: usize,
        outcomes: Vec<Option<TaskOutcome>>,
        model: &RegionalModel,
        storm_events: Vec<StormEvent>,
    ) -> Self {
        let completed: Vec<TaskOutcome> = outcomes.into_iter().flatten().collect();
        let completed_points = completed.len();
        let unmatched_points = completed.iter().filter(|o| o.unmatched).count();
        let mut samples = Vec::new();
        let mut failures = Vec::new();
        for outcome in completed {
            samples.extend(outcome.samples);
            failures.extend(outcome.failures);
        }

        let mut metrics = Vec::new();
        for region_id in &metadata.regions {
            let Some(region) = model.get(region_id) else {
                continue;
            };
            let mut region_metrics: Vec<ApproachMetrics> = metadata
                .approaches
                .iter()
                .map(|approach| {
                    let picked: Vec<&BacktestSample> = samples
                        .iter()
                        .filter(|s| &s.region == region_id && &s.approach == approach)
                        .collect();
                    let failed = failures
                        .iter()
                        .filter(|f| &f.region == region_id && &f.approach == approach)
                        .count();
                    let sweep = metadata.storm_threshold.and_then(|_| {
                        threshold_sweep(&pairs(&picked), &metadata.storm.sweep_thresholds, metadata.storm.criterion)
                    });
                    ApproachMetrics {
                        approach: approach.clone(),
                        region: region_id.clone(),
                        count: picked.len(),
                        failed,
                        stats: error_stats(&picked, region, model, metadata.storm_threshold),
                        skill: None,
                        sweep,
                    }
                })
                .collect();

            let baseline_rmse = metadata.baseline.as_ref().and_then(|b| {
                region_metrics.iter().find(|m| &m.approach == b).and_then(|m| m.rmse())
            });
            if let Some(base) = baseline_rmse {
                for m in region_metrics.iter_mut() {
                    m.skill = m.rmse().and_then(|r| skill_score(r, base));
                }
            }
            metrics.extend(region_metrics);
        }

        let regions: Vec<RegionResult> = metadata
            .regions
            .iter()
            .map(|r| RegionResult { region: r.clone(), status: decide(r, &metrics, &metadata.confidence) })
            .collect();
        for r in &regions {
            if r.status == RegionStatus::InsufficientData {
                log::warn!("Région {} : données insuffisantes, exclue du vote", r.region);
            }
        }
        let overall = vote(&regions, &metadata.approaches);
        let event_scores = score_events(
            &storm_events,
            &samples,
            &metadata.regions,
            &metadata.approaches,
            metadata.storm_threshold,
        );

        Self {
            metadata,
            total_points,
            completed_points,
            unmatched_points,
            cancelled: completed_points < total_points,
            metrics,
            regions,
            overall,
            samples,
            failures,
            storm_events,
            event_scores,
        }
    }

    pub fn metrics_for(&self, approach: &str, region: &str) -> Option<&ApproachMetrics> {
        self.metrics.iter().find(|m| m.approach == approach && m.region == region)
    }
}

pub fn save_report(report: &BacktestReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Impossible d'écrire {:?}", path))?;
    Ok(())
}

pub fn load_report(path: &Path) -> Result<BacktestReport> {
    let json = std::fs::read_to_string(path).with_context(|| format!("Impossible de lire {:?}", path))?;
    let report = serde_json::from_str(&json).with_context(|| format!("Rapport JSON invalide dans {:?}", path))?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::metrics::ErrorStats;
    use chrono::TimeZone;

    fn metric(approach: &str, region: &str, mae: Option<f64>, rmse: f64) -> ApproachMetrics {
        ApproachMetrics {
            approach: approach.to_string(),
            region: region.to_string(),
            count: if mae.is_some() { 10 } else { 0 },
            failed: 0,
            stats: mae.map(|mae| ErrorStats {
                mae,
                rmse,
                median_abs_error: mae,
                max_abs_error: rmse * 2.0,
                bias: 0.0,
                level_agreement: 1.0,
                r_squared: None,
                mape: None,
                classification: None,
            }),
            skill: None,
            sweep: None,
        }
    }

    fn thresholds() -> ConfidenceThresholds {
        ConfidenceThresholds::default()
    }

    fn decided(region: &str, winner: &str) -> RegionResult {
        RegionResult {
            region: region.to_string(),
            status: RegionStatus::Decided { winner: winner.to_string(), confidence: Confidence::Low, relative_gap: None },
        }
    }

    #[test]
    fn test_decide_by_mae_with_confidence() {
        let m = vec![metric("a", "r", Some(1.0), 2.0), metric("b", "r", Some(1.5), 1.0)];
        match decide("r", &m, &thresholds()) {
            RegionStatus::Decided { winner, confidence, relative_gap } => {
                assert_eq!(winner, "a");
                assert_eq!(confidence, Confidence::High);
                assert!((relative_gap.unwrap() - 1.0 / 3.0).abs() < 1e-12);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_decide_tie_breaks() {
        let m = vec![metric("b", "r", Some(1.0), 1.0), metric("a", "r", Some(1.0), 1.0), metric("c", "r", Some(1.0), 0.9)];
        let RegionStatus::Decided { winner, confidence, .. } = decide("r", &m, &thresholds()) else {
            panic!("région non décidée");
        };
        assert_eq!(winner, "c");
        assert_eq!(confidence, Confidence::Low);

        let m = vec![metric("b", "r", Some(1.0), 1.0), metric("a", "r", Some(1.0), 1.0)];
        let RegionStatus::Decided { winner, .. } = decide("r", &m, &thresholds()) else {
            panic!("région non décidée");
        };
        assert_eq!(winner, "a");
    }

    #[test]
    fn test_decide_moderate_gap() {
        let m = vec![metric("a", "r", Some(0.95), 1.0), metric("b", "r", Some(1.0), 1.0)];
        let RegionStatus::Decided { confidence, .. } = decide("r", &m, &thresholds()) else {
            panic!("région non décidée");
        };
        assert_eq!(confidence, Confidence::Moderate);
    }

    #[test]
    fn test_single_eligible_approach_low_confidence() {
        let m = vec![metric("a", "r", Some(2.0), 2.0), metric("b", "r", None, 0.0)];
        assert_eq!(
            decide("r", &m, &thresholds()),
            RegionStatus::Decided { winner: "a".to_string(), confidence: Confidence::Low, relative_gap: None }
        );
        let m = vec![metric("a", "r", None, 0.0)];
        assert_eq!(decide("r", &m, &thresholds()), RegionStatus::InsufficientData);
    }

    #[test]
    fn test_vote_majority_and_tie() {
        let approaches = vec!["a".to_string(), "b".to_string()];
        let regions = vec![
            decided("r1", "a"),
            decided("r2", "b"),
            decided("r3", "a"),
            RegionResult { region: "r4".to_string(), status: RegionStatus::InsufficientData },
        ];
        assert_eq!(
            vote(&regions, &approaches),
            Recommendation::Winner { approach: "a".to_string(), regions_won: 2, regions_decided: 3 }
        );
        let tied = vec![decided("r1", "a"), decided("r2", "b")];
        assert_eq!(
            vote(&tied, &approaches),
            Recommendation::NoClearWinner { tied: vec!["a".to_string(), "b".to_string()] }
        );
        assert_eq!(vote(&[], &approaches), Recommendation::InsufficientData);
    }

    #[test]
    fn test_report_json_roundtrip() {
        let t = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let sample = BacktestSample {
            timestamp: t,
            target_timestamp: t,
            region: "polar".to_string(),
            approach: "a".to_string(),
            predicted: 12.5,
            actual: 10.0,
            signed_error: 2.5,
            absolute_error: 2.5,
        };
        let outcome = TaskOutcome {
            unmatched: false,
            samples: vec![sample],
            failures: vec![FailureRecord {
                timestamp: t,
                region: "polar".to_string(),
                approach: "b".to_string(),
                error: "panne".to_string(),
            }],
        };
        let metadata = ReportMetadata {
            generated_at: t,
            start: t,
            end: t,
            interval_minutes: 60,
            horizon_minutes: 60,
            tolerance_minutes: 60,
            target: TargetField::TecMean,
            approaches: vec!["a".to_string(), "b".to_string()],
            regions: vec!["polar".to_string()],
            baseline: None,
            confidence: thresholds(),
            storm: StormSettings::default(),
            storm_threshold: Some(10.0),
        };
        let report =
            BacktestReport::aggregate(metadata, 2, vec![Some(outcome), None], &RegionalModel::default(), Vec::new());
        assert!(report.cancelled);
        assert_eq!(report.metrics_for("b", "polar").unwrap().failed, 1);
        assert_eq!(report.overall, Recommendation::Winner { approach: "a".to_string(), regions_won: 1, regions_decided: 1 });
        let a = report.metrics_for("a", "polar").unwrap();
        assert_eq!(a.stats.as_ref().unwrap().classification.unwrap().confusion.true_positives, 1);
        assert_eq!(a.sweep.as_ref().unwrap().points.len(), 17);
        assert!(report.metrics_for("b", "polar").unwrap().sweep.is_none());

        let tmp = std::env::temp_dir().join("ionocast_test_report.json");
        save_report(&report, &tmp).unwrap();
        let loaded = load_report(&tmp).unwrap();
        assert_eq!(loaded, report);
        let _ = std::fs::remove_file(&tmp);
    }
}
