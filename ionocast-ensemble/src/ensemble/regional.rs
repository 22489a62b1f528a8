use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EnsembleCombiner, ForecastResult};
use crate::error::EngineResult;
use crate::history::History;
use crate::regions::GlobalRisk;
use crate::risk::{RiskAssessment, RiskClassifier, RiskLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalOutlook {
    pub region: String,
    pub name: String,
    pub forecast: ForecastResult,
    /// Niveau de risque à chaque pas, selon les seuils de la région.
    pub levels: Vec<RiskLevel>,
    pub peak_level: RiskLevel,
    pub peak_value: f64,
    pub storm_enhanced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalReport {
    pub issued_at: DateTime<Utc>,
    pub regions: Vec<RegionalOutlook>,
    pub global: GlobalRisk,
    /// Risque de tempête issu du modèle, absent si aucune région n'en a fourni.
    pub storm_risk: Option<RiskAssessment>,
}

/// Prévision toutes régions.
pub struct RegionalForecaster<'a> {
    combiner: &'a EnsembleCombiner,
    classifier: &'a RiskClassifier,
}

impl<'a> RegionalForecaster<'a> {
    pub fn new(combiner: &'a EnsembleCombiner, classifier: &'a RiskClassifier) -> Self {
        Self { combiner, classifier }
    }

    pub fn forecast(&self, history: History<'_>) -> EngineResult<RegionalReport> {
        let model = self.combiner.regions();
        let latest = history.latest();
        let kp = history.latest_activity().unwrap_or(0.0);
        let wind = latest.map(|m| m.solar_wind_speed).unwrap_or(0.0);

        let mut storm_risk: Option<RiskAssessment> = None;
        let regions: Vec<RegionalOutlook> = model
            .regions()
            .iter()
            .map(|region| {
                let mut forecast = self.combiner.forecast(history, Some(region))?;
                let enhanced: Vec<f64> = forecast
                    .values
                    .iter()
                    .map(|&v| model.storm_enhancement(v, region, kp, wind))
                    .collect();
                let storm_enhanced = enhanced != forecast.values;
                forecast.values = enhanced;

                let levels: Vec<RiskLevel> = forecast.values.iter().map(|&v| model.classify(v, region)).collect();
                let (peak_value, peak_level) = forecast
                    .values
                    .iter()
                    .zip(&levels)
                    .fold((f64::NEG_INFINITY, RiskLevel::Low), |(pv, pl), (&v, &l)| {
                        (pv.max(v), pl.max(l))
                    });

                if storm_risk.is_none() {
                    storm_risk = forecast.storm.as_ref().map(|s| self.classifier.assess(s));
                }

                Ok(RegionalOutlook {
                    region: region.id.clone(),
                    name: region.name.clone(),
                    forecast,
                    levels,
                    peak_level,
                    peak_value: if peak_value.is_finite() { peak_value } else { 0.0 },
                    storm_enhanced,
                })
            })
            .collect::<EngineResult<_>>()?;

        let peaks: Vec<(&str, RiskLevel)> = regions.iter().map(|r| (r.region.as_str(), r.peak_level)).collect();
        let global = model.global_risk(&peaks);
        log::info!(
            "Prévision régionale à {} : risque global {} ({:.2})",
            history.as_of(),
            global.level,
            global.severity
        );

        Ok(RegionalReport { issued_at: history.as_of(), regions, global, storm_risk })
    }
}
