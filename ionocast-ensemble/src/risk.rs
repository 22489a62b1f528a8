use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Severe,
    Extreme,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Low,
        RiskLevel::Moderate,
        RiskLevel::High,
        RiskLevel::Severe,
        RiskLevel::Extreme,
    ];

    /// Sévérité 1..=5.
    pub fn severity(&self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Moderate => 2,
            RiskLevel::High => 3,
            RiskLevel::Severe => 4,
            RiskLevel::Extreme => 5,
        }
    }

    pub fn from_severity(severity: f64) -> RiskLevel {
        if severity < 1.5 {
            RiskLevel::Low
        } else if severity < 2.5 {
            RiskLevel::Moderate
        } else if severity < 3.5 {
            RiskLevel::High
        } else if severity < 4.5 {
            RiskLevel::Severe
        } else {
            RiskLevel::Extreme
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Perturbation ionosphérique minimale. GPS et communications normaux.",
            RiskLevel::Moderate => "Activité modérée. Impacts mineurs possibles sur le GPS et la radio HF.",
            RiskLevel::High => "Perturbation élevée. Erreurs GPS de 3-5 m, radio HF perturbée.",
            RiskLevel::Severe => "Tempête sévère. Dégradation GPS significative, liaisons satellites affectées.",
            RiskLevel::Extreme => "Tempête extrême. Pannes GPS majeures possibles, communications très perturbées.",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Moderate => write!(f, "MODERATE"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Severe => write!(f, "SEVERE"),
            RiskLevel::Extreme => write!(f, "EXTREME"),
        }
    }
}

/// Bornes basses inclusives de chaque niveau ; LOW couvre aussi les valeurs sous `low`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelBounds {
    pub low: f64,
    pub moderate: f64,
    pub high: f64,
    pub severe: f64,
    pub extreme: f64,
}

impl LevelBounds {
    pub fn as_array(&self) -> [f64; 5] {
        [self.low, self.moderate, self.high, self.severe, self.extreme]
    }

    pub fn validate(&self) -> EngineResult<()> {
        let b = self.as_array();
        if b.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::config(format!("seuils non finis : {:?}", b)));
        }
        if b.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EngineError::config(format!(
                "seuils non strictement croissants : {:?}",
                b
            )));
        }
        Ok(())
    }

    /// Borne basse inclusive, borne haute exclusive.
    pub fn level_of(&self, value: f64) -> RiskLevel {
        let b = self.as_array();
        RiskLevel::ALL
            .iter()
            .zip(b.iter())
            .rev()
            .find(|&(_, &bound)| value >= bound)
            .map(|(level, _)| *level)
            .unwrap_or(RiskLevel::Low)
    }
}

/// Poids du score continu de sévérité.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub binary: f64,
    pub max_hourly: f64,
    pub mean_hourly: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self { binary: 0.5, max_hourly: 0.3, mean_hourly: 0.2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskClassifierConfig {
    pub weights: RiskWeights,
    pub bounds: LevelBounds,
}

impl Default for RiskClassifierConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            bounds: LevelBounds { low: 0.0, moderate: 0.15, high: 0.35, severe: 0.55, extreme: 0.75 },
        }
    }
}

/// Perspective de tempête fournie par le modèle : probabilité binaire et
/// probabilités horaires sur l'horizon, toutes dans [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StormOutlook {
    pub binary_probability: f64,
    pub hourly_probabilities: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub label: String,
    pub max_probability: f64,
    pub mean_probability: f64,
}

#[derive(Debug, Clone)]
pub struct RiskClassifier {
    config: RiskClassifierConfig,
}

impl RiskClassifier {
    pub fn new(config: RiskClassifierConfig) -> EngineResult<Self> {
        let w = config.weights;
        let ws = [w.binary, w.max_hourly, w.mean_hourly];
        if ws.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(EngineError::config(format!("poids de risque négatifs : {:?}", ws)));
        }
        let sum: f64 = ws.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(EngineError::config(format!("poids de risque de somme {} != 1", sum)));
        }
        config.bounds.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskClassifierConfig {
        &self.config
    }

    pub fn assess(&self, outlook: &StormOutlook) -> RiskAssessment {
        let clamp = |p: f64| if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let hourly: Vec<f64> = outlook.hourly_probabilities.iter().map(|&p| clamp(p)).collect();
        let (max_p, mean_p) = if hourly.is_empty() {
            (0.0, 0.0)
        } else {
            let max = hourly.iter().cloned().fold(0.0f64, f64::max);
            (max, hourly.iter().sum::<f64>() / hourly.len() as f64)
        };
        let w = self.config.weights;
        let score = w.binary * clamp(outlook.binary_probability) + w.max_hourly * max_p + w.mean_hourly * mean_p;
        let level = self.config.bounds.level_of(score);
        RiskAssessment {
            score,
            level,
            label: format!("{} ({:.0}%)", level, score * 100.0),
            max_probability: max_p,
            mean_probability: mean_p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RiskClassifier {
        RiskClassifier::new(RiskClassifierConfig::default()).unwrap()
    }

    #[test]
    fn test_quiet_outlook_is_low() {
        let a = classifier().assess(&StormOutlook {
            binary_probability: 0.05,
            hourly_probabilities: vec![0.01; 24],
        });
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.score < 0.15);
    }

    #[test]
    fn test_score_weights() {
        let a = classifier().assess(&StormOutlook {
            binary_probability: 1.0,
            hourly_probabilities: vec![0.0, 1.0],
        });
        // 0.5*1 + 0.3*1 + 0.2*0.5
        assert!((a.score - 0.9).abs() < 1e-12);
        assert_eq!(a.level, RiskLevel::Extreme);
        assert_eq!(a.max_probability, 1.0);
    }

    #[test]
    fn test_boundaries_inclusive_lower() {
        let bounds = RiskClassifierConfig::default().bounds;
        assert_eq!(bounds.level_of(0.1499), RiskLevel::Low);
        assert_eq!(bounds.level_of(0.15), RiskLevel::Moderate);
        assert_eq!(bounds.level_of(0.35), RiskLevel::High);
        assert_eq!(bounds.level_of(0.55), RiskLevel::Severe);
        assert_eq!(bounds.level_of(0.75), RiskLevel::Extreme);
        assert_eq!(bounds.level_of(-3.0), RiskLevel::Low);
    }

    #[test]
    fn test_empty_hourly_and_clamping() {
        let a = classifier().assess(&StormOutlook {
            binary_probability: 2.0,
            hourly_probabilities: vec![],
        });
        assert_eq!(a.score, 0.5);
        assert_eq!(a.level, RiskLevel::High);
    }

    #[test]
    fn test_rejects_bad_weights() {
        let mut cfg = RiskClassifierConfig::default();
        cfg.weights.binary = 0.6;
        assert!(RiskClassifier::new(cfg).is_err());
    }

    #[test]
    fn test_rejects_unordered_bounds() {
        let mut cfg = RiskClassifierConfig::default();
        cfg.bounds.high = 0.1;
        assert!(RiskClassifier::new(cfg).is_err());
    }

    #[test]
    fn test_from_severity() {
        assert_eq!(RiskLevel::from_severity(1.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_severity(2.49), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_severity(3.5), RiskLevel::Severe);
        assert_eq!(RiskLevel::from_severity(5.0), RiskLevel::Extreme);
    }
}
