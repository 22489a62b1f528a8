use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::risk::{LevelBounds, RiskLevel};

/// Région géographique (bande de latitude) et ses paramètres statiques.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub id: String,
    pub name: String,
    pub lat_min: f64,
    pub lat_max: f64,
    /// Facteur multiplicatif relatif à la moyenne globale.
    pub baseline_factor: f64,
    /// Amplification de l'excès d'activité.
    pub variability_factor: f64,
    /// Réponse relative aux tempêtes (1.0 = aucune amplification).
    pub storm_response: f64,
    /// Poids dans le risque global.
    pub risk_weight: f64,
    /// Seuils en unités de la grandeur cible (TECU).
    pub thresholds: LevelBounds,
}

/// Constantes de l'ajustement régional. Ce sont des choix de configuration,
/// pas des constantes physiques.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentParams {
    /// Kp au-dessous duquel l'excès d'activité est nul.
    pub quiet_threshold: f64,
    /// Kp auquel l'excès d'activité sature à 1.
    pub max_index: f64,
}

impl Default for AdjustmentParams {
    fn default() -> Self {
        Self { quiet_threshold: 5.0, max_index: 9.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalRisk {
    pub severity: f64,
    pub level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalModel {
    regions: Vec<RegionDefinition>,
    params: AdjustmentParams,
}

fn region(
    id: &str,
    name: &str,
    lat: (f64, f64),
    factors: (f64, f64),
    storm_response: f64,
    risk_weight: f64,
    t: [f64; 4],
) -> RegionDefinition {
    RegionDefinition {
        id: id.to_string(),
        name: name.to_string(),
        lat_min: lat.0,
        lat_max: lat.1,
        baseline_factor: factors.0,
        variability_factor: factors.1,
        storm_response,
        risk_weight,
        thresholds: LevelBounds { low: 0.0, moderate: t[0], high: t[1], severe: t[2], extreme: t[3] },
    }
}

pub fn default_regions() -> Vec<RegionDefinition> {
    vec![
        region("equatorial", "Equatorial", (-20.0, 20.0), (1.4, 1.3), 1.15, 0.25, [18.0, 25.0, 35.0, 45.0]),
        region("mid_latitude", "Mid-Latitude", (20.0, 50.0), (1.0, 1.0), 1.35, 0.40, [12.0, 18.0, 25.0, 35.0]),
        region("auroral", "Auroral", (50.0, 70.0), (0.85, 1.5), 1.65, 0.20, [10.0, 15.0, 22.0, 30.0]),
        region("polar", "Polar", (70.0, 90.0), (0.7, 1.8), 1.45, 0.05, [8.0, 12.0, 18.0, 25.0]),
        region("global", "Global", (-90.0, 90.0), (1.0, 1.0), 1.30, 0.10, [12.0, 18.0, 25.0, 35.0]),
    ]
}

/// Niveau NOAA G0..=G5 pour un Kp.
pub fn g_scale(kp: f64) -> u8 {
    if kp >= 9.0 {
        5
    } else if kp >= 5.0 {
        kp.floor() as u8 - 4
    } else {
        0
    }
}

/// Intensité de tempête selon l'échelle G (Kp 5 = G1 ... Kp 9 = G5).
pub fn storm_intensity(kp: f64) -> f64 {
    if kp < 5.0 {
        0.0
    } else if kp < 6.0 {
        0.20
    } else if kp < 7.0 {
        0.35
    } else if kp < 8.0 {
        0.55
    } else if kp < 9.0 {
        0.75
    } else {
        1.0
    }
}

impl Default for RegionalModel {
    fn default() -> Self {
        Self { regions: default_regions(), params: AdjustmentParams::default() }
    }
}

impl RegionalModel {
    pub fn new(regions: Vec<RegionDefinition>, params: AdjustmentParams) -> EngineResult<Self> {
        let model = Self { regions, params };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.regions.is_empty() {
            return Err(EngineError::config("aucune région définie"));
        }
        let p = self.params;
        if !(p.quiet_threshold.is_finite() && p.max_index.is_finite()) || p.max_index <= p.quiet_threshold {
            return Err(EngineError::config(format!(
                "max_index ({}) doit dépasser quiet_threshold ({})",
                p.max_index, p.quiet_threshold
            )));
        }
        let mut seen = HashSet::new();
        for r in &self.regions {
            if r.id.is_empty() || !seen.insert(r.id.as_str()) {
                return Err(EngineError::config(format!("identifiant de région invalide ou dupliqué : '{}'", r.id)));
            }
            for (name, v) in [
                ("baseline_factor", r.baseline_factor),
                ("variability_factor", r.variability_factor),
                ("storm_response", r.storm_response),
                ("risk_weight", r.risk_weight),
            ] {
                if !v.is_finite() || v < 0.0 {
                    return Err(EngineError::config(format!("{} de '{}' invalide : {}", name, r.id, v)));
                }
            }
            if !(r.lat_min < r.lat_max && r.lat_min >= -90.0 && r.lat_max <= 90.0) {
                return Err(EngineError::config(format!(
                    "bande de latitude invalide pour '{}' : [{}, {}]",
                    r.id, r.lat_min, r.lat_max
                )));
            }
            r.thresholds
                .validate()
                .map_err(|e| EngineError::config(format!("région '{}' : {}", r.id, e)))?;
        }
        Ok(())
    }

    pub fn regions(&self) -> &[RegionDefinition] {
        &self.regions
    }

    pub fn params(&self) -> AdjustmentParams {
        self.params
    }

    pub fn get(&self, id: &str) -> Option<&RegionDefinition> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub fn require(&self, id: &str) -> EngineResult<&RegionDefinition> {
        self.get(id)
            .ok_or_else(|| EngineError::config(format!("région inconnue : '{}'", id)))
    }

    /// clamp((kp - quiet) / (max - quiet), 0, 1)
    pub fn activity_excess(&self, activity_index: f64) -> f64 {
        let p = self.params;
        ((activity_index - p.quiet_threshold) / (p.max_index - p.quiet_threshold)).clamp(0.0, 1.0)
    }

    /// raw × baseline × (1 + variability × excès), plancher à 0.
    pub fn adjust(&self, raw_value: f64, region: &RegionDefinition, activity_index: f64) -> f64 {
        let excess = self.activity_excess(activity_index);
        (raw_value * region.baseline_factor * (1.0 + region.variability_factor * excess)).max(0.0)
    }

    /// Compare aux seuils propres de la région, jamais aux seuils globaux.
    pub fn classify(&self, adjusted_value: f64, region: &RegionDefinition) -> RiskLevel {
        region.thresholds.level_of(adjusted_value)
    }

    /// Renforcement en période de tempête (Kp >= 5), plus un bonus vent solaire
    /// au-delà de 600 km/s (max +20 %).
    pub fn storm_enhancement(&self, value: f64, region: &RegionDefinition, kp: f64, solar_wind_speed: f64) -> f64 {
        let intensity = storm_intensity(kp);
        if intensity == 0.0 {
            return value;
        }
        let mut factor = 1.0 + intensity * (region.storm_response - 1.0);
        if solar_wind_speed > 600.0 {
            factor += ((solar_wind_speed - 600.0) / 400.0).min(0.2);
        }
        log::debug!(
            "Renforcement tempête {} : Kp={:.1}, {:.2} -> {:.2} (+{:.1}%)",
            region.id, kp, value, value * factor, (factor - 1.0) * 100.0
        );
        value * factor
    }

    /// Moyenne des sévérités pondérée par `risk_weight`.
    pub fn global_risk(&self, levels: &[(&str, RiskLevel)]) -> GlobalRisk {
        let (weighted, total) = levels.iter().fold((0.0, 0.0), |(acc, tot), (id, level)| {
            let w = self.get(id).map(|r| r.risk_weight).unwrap_or(0.0);
            (acc + w * level.severity() as f64, tot + w)
        });
        let severity = if total > 0.0 { weighted / total } else { 1.0 };
        GlobalRisk { severity, level: RiskLevel::from_severity(severity) }
    }
}
