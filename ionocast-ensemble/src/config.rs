use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backtest::storms::StormSettings;
use crate::backtest::ConfidenceThresholds;
use crate::climatology::builder::ClimatologyConfig;
use crate::ensemble::EnsembleConfig;
use crate::error::EngineResult;
use crate::regions::{default_regions, AdjustmentParams, RegionDefinition, RegionalModel};
use crate::risk::{RiskClassifier, RiskClassifierConfig};

/// Paramètres du prévisionniste de référence utilisé par la CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecasterSettings {
    pub damping: f64,
    /// 0 ou 1 = pas d'ensemble perturbé.
    pub members: usize,
    pub noise: f64,
    pub seed: u64,
}

impl Default for ForecasterSettings {
    fn default() -> Self {
        Self { damping: 0.9, members: 8, noise: 0.02, seed: 42 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestDefaults {
    pub interval_minutes: i64,
    pub horizon_minutes: i64,
    pub tolerance_minutes: i64,
    pub baseline: Option<String>,
    pub max_workers: usize,
    pub confidence: ConfidenceThresholds,
    pub lookback_hours: i64,
    #[serde(default)]
    pub storm: StormSettings,
}

impl Default for BacktestDefaults {
    fn default() -> Self {
        Self {
            interval_minutes: 360,
            horizon_minutes: 24 * 60,
            tolerance_minutes: 60,
            baseline: Some("persistence".to_string()),
            max_workers: 4,
            confidence: ConfidenceThresholds::default(),
            lookback_hours: 24 * 7,
            storm: StormSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub climatology: ClimatologyConfig,
    pub ensemble: EnsembleConfig,
    pub risk: RiskClassifierConfig,
    pub adjustment: AdjustmentParams,
    pub regions: Vec<RegionDefinition>,
    pub forecaster: ForecasterSettings,
    pub backtest: BacktestDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            climatology: ClimatologyConfig::default(),
            ensemble: EnsembleConfig::default(),
            risk: RiskClassifierConfig::default(),
            adjustment: AdjustmentParams::default(),
            regions: default_regions(),
            forecaster: ForecasterSettings::default(),
            backtest: BacktestDefaults::default(),
        }
    }
}

impl EngineConfig {
    pub fn regional_model(&self) -> EngineResult<RegionalModel> {
        RegionalModel::new(self.regions.clone(), self.adjustment)
    }

    pub fn risk_classifier(&self) -> EngineResult<RiskClassifier> {
        RiskClassifier::new(self.risk.clone())
    }

    /// Valide toutes les sections ; une configuration invalide est fatale.
    pub fn validate(&self) -> EngineResult<()> {
        self.regional_model()?;
        self.risk_classifier()?;
        self.ensemble.validate()?;
        self.backtest.storm.validate()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Impossible de lire la configuration {:?}", path))?;
    let config: EngineConfig = serde_json::from_str(&json)
        .with_context(|| format!("Configuration JSON invalide dans {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Charge `path` s'il existe, sinon la configuration par défaut.
pub fn load_or_default(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => load_config(p),
        None => Ok(EngineConfig::default()),
    }
}

pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json).with_context(|| format!("Impossible d'écrire {:?}", path))?;
    Ok(())
}
