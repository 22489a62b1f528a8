pub mod forecaster;
pub mod regional;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ionocast_db::models::TargetField;

use crate::climatology::snapshot::ClimatologyHandle;
use crate::climatology::{ClimatologyTable, LookupSource};
use crate::error::{EngineError, EngineResult, ForecasterError};
use crate::history::History;
use crate::regions::{RegionDefinition, RegionalModel};
use crate::risk::StormOutlook;
use forecaster::{FeatureWindow, ForecasterPool, ModelForecast};

fn check_weight(w: f64) -> EngineResult<()> {
    if !w.is_finite() || !(0.0..=1.0).contains(&w) {
        return Err(EngineError::config(format!("poids de climatologie {} hors [0, 1]", w)));
    }
    Ok(())
}

/// `w × c + (1 − w) × m`. Exact aux bornes : w = 1 rend `c`, w = 0 rend `m`.
pub fn combine(climatology: f64, model: f64, w: f64) -> EngineResult<f64> {
    check_weight(w)?;
    Ok(blend(climatology, model, w))
}

fn blend(c: f64, m: f64, w: f64) -> f64 {
    if w == 1.0 {
        c
    } else if w == 0.0 {
        m
    } else {
        w * c + (1.0 - w) * m
    }
}

pub fn combine_series(climatology: &[f64], model: &[f64], w: f64) -> EngineResult<Vec<f64>> {
    check_weight(w)?;
    if climatology.len() != model.len() {
        return Err(EngineError::config(format!(
            "horizons incompatibles : climatologie {} pas, modèle {} pas",
            climatology.len(),
            model.len()
        )));
    }
    Ok(climatology.iter().zip(model).map(|(&c, &m)| blend(c, m, w)).collect())
}

/// Poids de la climatologie dans le mélange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClimatologyWeight {
    Fixed { weight: f64 },
    /// Interpolation linéaire de `quiet` (Kp 0) à `storm` (Kp >= ramp_end).
    ActivityRamp { quiet: f64, storm: f64, ramp_end: f64 },
}

impl Default for ClimatologyWeight {
    fn default() -> Self {
        ClimatologyWeight::ActivityRamp { quiet: 0.7, storm: 0.4, ramp_end: 3.0 }
    }
}

impl ClimatologyWeight {
    pub fn validate(&self) -> EngineResult<()> {
        match *self {
            ClimatologyWeight::Fixed { weight } => check_weight(weight),
            ClimatologyWeight::ActivityRamp { quiet, storm, ramp_end } => {
                check_weight(quiet)?;
                check_weight(storm)?;
                if !ramp_end.is_finite() || ramp_end <= 0.0 {
                    return Err(EngineError::config(format!("fin de rampe {} invalide", ramp_end)));
                }
                Ok(())
            }
        }
    }

    pub fn at(&self, activity: f64) -> f64 {
        match *self {
            ClimatologyWeight::Fixed { weight } => weight,
            ClimatologyWeight::ActivityRamp { quiet, storm, ramp_end } => {
                let x = if activity.is_finite() { (activity / ramp_end).clamp(0.0, 1.0) } else { 0.0 };
                (quiet + (storm - quiet) * x).clamp(0.0, 1.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub weight: ClimatologyWeight,
    /// Nombre de pas d'horizon.
    pub horizon: usize,
    pub step_minutes: i64,
    /// Nombre de mesures passées fournies au modèle.
    pub window: usize,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub fallback_confidence: f64,
    pub target: TargetField,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weight: ClimatologyWeight::default(),
            horizon: 24,
            step_minutes: 60,
            window: 48,
            timeout_ms: 2000,
            max_concurrency: 4,
            fallback_confidence: 0.5,
            target: TargetField::TecMean,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.weight.validate()?;
        if self.horizon == 0 {
            return Err(EngineError::config("horizon nul"));
        }
        if self.step_minutes <= 0 {
            return Err(EngineError::config(format!("pas de {} minutes", self.step_minutes)));
        }
        if self.window == 0 {
            return Err(EngineError::config("fenêtre du modèle nulle"));
        }
        if self.max_concurrency == 0 || self.timeout_ms == 0 {
            return Err(EngineError::config("concurrence ou délai du prévisionniste nul"));
        }
        if !(0.0..=1.0).contains(&self.fallback_confidence) {
            return Err(EngineError::config(format!(
                "confiance de repli {} hors [0, 1]",
                self.fallback_confidence
            )));
        }
        Ok(())
    }

    pub fn step(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.step_minutes)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub issued_at: DateTime<Utc>,
    pub region: Option<String>,
    pub target_times: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
    pub climatology: Vec<f64>,
    pub climatology_sources: Vec<LookupSource>,
    /// Sortie du modèle (ajustée à la région), absente si dégradé.
    pub model: Option<Vec<f64>>,
    pub confidence: f64,
    /// Poids effectif de la climatologie (1.0 si dégradé).
    pub weight: f64,
    pub activity: f64,
    pub degraded: bool,
    pub reason: Option<String>,
    pub storm: Option<StormOutlook>,
    pub climatology_version: u64,
}

/// `issued_at + i × step` pour i = 1..=steps.
fn target_times(issued_at: DateTime<Utc>, step_minutes: i64, steps: usize) -> EngineResult<Vec<DateTime<Utc>>> {
    let at = |i: i64| {
        step_minutes
            .checked_mul(i)
            .and_then(chrono::Duration::try_minutes)
            .and_then(|d| issued_at.checked_add_signed(d))
    };
    let out_of_range = || {
        EngineError::config(format!("{} pas de {} min depuis {} : date hors bornes", steps, step_minutes, issued_at))
    };
    let n = i64::try_from(steps).map_err(|_| out_of_range())?;
    // Croissant : le dernier pas borne tous les autres.
    if n > 0 && at(n).is_none() {
        return Err(out_of_range());
    }
    (1..=n).map(|i| at(i).ok_or_else(out_of_range)).collect()
}

/// Mélange climatologie + modèle de séquence.
///
/// Le combinateur ne fait jamais tourner le modèle lui-même : il passe par le
/// pool borné, et tout échec du modèle donne un résultat climatologique
/// marqué `degraded`.
pub struct EnsembleCombiner {
    config: EnsembleConfig,
    climatology: Arc<ClimatologyHandle>,
    regions: RegionalModel,
    pool: ForecasterPool,
}

impl EnsembleCombiner {
    pub fn new(
        config: EnsembleConfig,
        climatology: Arc<ClimatologyHandle>,
        regions: RegionalModel,
        forecaster: Arc<dyn forecaster::SequenceForecaster>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let pool = ForecasterPool::new(forecaster, config.max_concurrency, config.timeout())?;
        Ok(Self { config, climatology, regions, pool })
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn regions(&self) -> &RegionalModel {
        &self.regions
    }

    pub fn climatology(&self) -> Arc<ClimatologyTable> {
        self.climatology.current()
    }

    pub fn forecaster_name(&self) -> &str {
        self.pool.forecaster_name()
    }

    pub fn forecaster_params(&self) -> HashMap<String, f64> {
        self.pool.forecaster_params()
    }

    pub fn forecast(&self, history: History<'_>, region: Option<&RegionDefinition>) -> EngineResult<ForecastResult> {
        self.forecast_steps(history, region, self.config.horizon)
    }

    /// Prévision sur `steps` pas à partir de l'instant de l'historique.
    ///
    /// Seul un nombre de pas qui sort des dates représentables est une
    /// erreur ; tout échec du modèle donne un résultat dégradé.
    pub fn forecast_steps(
        &self,
        history: History<'_>,
        region: Option<&RegionDefinition>,
        steps: usize,
    ) -> EngineResult<ForecastResult> {
        let table = self.climatology.current();
        let issued_at = history.as_of();
        let activity = history.latest_activity().unwrap_or(0.0);
        let target_times = target_times(issued_at, self.config.step_minutes, steps)?;

        let lookups: Vec<_> = target_times
            .iter()
            .map(|t| match region {
                Some(r) => table.lookup_region(t, activity, r, &self.regions),
                None => table.lookup_at(t, activity, None),
            })
            .collect();
        let climatology: Vec<f64> = lookups.iter().map(|l| l.value).collect();
        let sources: Vec<LookupSource> = lookups.iter().map(|l| l.source).collect();

        let model = FeatureWindow::from_history(&history, self.config.window, self.config.target)
            .and_then(|window| self.pool.call(window, steps));

        let mut result = ForecastResult {
            issued_at,
            region: region.map(|r| r.id.clone()),
            target_times,
            values: climatology.clone(),
            climatology,
            climatology_sources: sources,
            model: None,
            confidence: self.config.fallback_confidence,
            weight: 1.0,
            activity,
            degraded: true,
            reason: None,
            storm: None,
            climatology_version: table.version(),
        };

        match model.and_then(|m| self.blend_into(&mut result, m, region)) {
            Ok(()) => {}
            Err(e) => {
                log::debug!("Repli climatologique à {} : {}", issued_at, e);
                result.reason = Some(e.to_string());
            }
        }
        Ok(result)
    }

    fn blend_into(
        &self,
        result: &mut ForecastResult,
        model: ModelForecast,
        region: Option<&RegionDefinition>,
    ) -> Result<(), ForecasterError> {
        let adjusted: Vec<f64> = match region {
            Some(r) => model.values.iter().map(|&v| self.regions.adjust(v, r, result.activity)).collect(),
            None => model.values,
        };
        let w = self.config.weight.at(result.activity);
        let values = combine_series(&result.climatology, &adjusted, w)
            .map_err(|e| ForecasterError::InvalidOutput(e.to_string()))?;
        result.values = values;
        result.model = Some(adjusted);
        result.weight = w;
        result.confidence = w * self.config.fallback_confidence + (1.0 - w) * model.confidence;
        result.degraded = false;
        result.storm = model.storm;
        Ok(())
    }
}
