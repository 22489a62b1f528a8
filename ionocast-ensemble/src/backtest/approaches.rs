use std::sync::Arc;

use chrono::{DateTime, Utc};

use ionocast_db::models::TargetField;

use crate::climatology::ClimatologyTable;
use crate::ensemble::EnsembleCombiner;
use crate::error::{EngineError, EngineResult};
use crate::history::History;
use crate::regions::{RegionDefinition, RegionalModel};

/// Instant de prévision et instant visé.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionPoint {
    pub issued_at: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
}

/// Stratégie de prévision comparée par le backtest.
///
/// `history` ne contient que des mesures strictement antérieures à
/// `point.issued_at`.
pub trait Approach: Send + Sync {
    fn id(&self) -> &str;
    fn predict(&self, point: &PredictionPoint, region: &RegionDefinition, history: History<'_>) -> EngineResult<f64>;

    /// Fin (exclue) des données d'entraînement, pour les approches préparées
    /// à l'avance. Une prévision émise avant cette date les verrait.
    fn training_end(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Refuse une prévision émise avant la fin de l'entraînement.
pub(crate) fn ensure_trained_before(id: &str, training_end: DateTime<Utc>, issued_at: DateTime<Utc>) -> EngineResult<()> {
    if training_end > issued_at {
        return Err(EngineError::config(format!(
            "{} : climatologie entraînée jusqu'au {}, postérieure à l'instant de prévision {}",
            id, training_end, issued_at
        )));
    }
    Ok(())
}

/// Climatologie seule, à la date visée, activité = dernier Kp connu.
pub struct ClimatologyApproach {
    table: Arc<ClimatologyTable>,
    regions: RegionalModel,
}

impl ClimatologyApproach {
    pub fn new(table: Arc<ClimatologyTable>, regions: RegionalModel) -> Self {
        Self { table, regions }
    }
}

impl Approach for ClimatologyApproach {
    fn id(&self) -> &str {
        "climatology"
    }

    fn predict(&self, point: &PredictionPoint, region: &RegionDefinition, history: History<'_>) -> EngineResult<f64> {
        ensure_trained_before(self.id(), self.table.training_range().1, point.issued_at)?;
        let activity = history.latest_activity().unwrap_or(0.0);
        Ok(self.table.lookup_region(&point.target_time, activity, region, &self.regions).value)
    }

    fn training_end(&self) -> Option<DateTime<Utc>> {
        Some(self.table.training_range().1)
    }
}

/// Climatologie + modèle via le combinateur, dégradé en climatologie en cas d'échec.
pub struct EnsembleApproach {
    combiner: Arc<EnsembleCombiner>,
}

impl EnsembleApproach {
    pub fn new(combiner: Arc<EnsembleCombiner>) -> Self {
        Self { combiner }
    }
}

impl Approach for EnsembleApproach {
    fn id(&self) -> &str {
        "ensemble"
    }

    fn predict(&self, point: &PredictionPoint, region: &RegionDefinition, history: History<'_>) -> EngineResult<f64> {
        ensure_trained_before(self.id(), self.combiner.climatology().training_range().1, point.issued_at)?;
        let step = self.combiner.config().step();
        let lead = point.target_time - point.issued_at;
        if lead <= chrono::Duration::zero() {
            return Err(EngineError::config(format!("échéance négative ou nulle : {}", lead)));
        }
        // Nombre de pas arrondi au supérieur.
        let steps = ((lead.num_seconds() + step.num_seconds() - 1) / step.num_seconds()) as usize;
        let result = self.combiner.forecast_steps(history, Some(region), steps)?;
        result
            .values
            .last()
            .copied()
            .ok_or_else(|| EngineError::DataUnavailable("prévision vide".to_string()))
    }

    fn training_end(&self) -> Option<DateTime<Utc>> {
        Some(self.combiner.climatology().training_range().1)
    }
}

/// Dernière valeur observée, ajustée à la région.
pub struct PersistenceApproach {
    target: TargetField,
    regions: RegionalModel,
}

impl PersistenceApproach {
    pub fn new(target: TargetField, regions: RegionalModel) -> Self {
        Self { target, regions }
    }
}

impl Approach for PersistenceApproach {
    fn id(&self) -> &str {
        "persistence"
    }

    fn predict(&self, _point: &PredictionPoint, region: &RegionDefinition, history: History<'_>) -> EngineResult<f64> {
        let last = history
            .records()
            .iter()
            .rev()
            .find_map(|m| self.target.value(m))
            .ok_or_else(|| EngineError::InsufficientHistory { required: 1, available: 0 })?;
        let activity = history.latest_activity().unwrap_or(0.0);
        Ok(self.regions.adjust(last, region, activity))
    }
}
