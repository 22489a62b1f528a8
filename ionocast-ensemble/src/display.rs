use std::collections::HashMap;

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use textplots::Plot;

use crate::backtest::report::{BacktestReport, Confidence, RegionStatus};
use crate::climatology::ClimatologyTable;
use crate::ensemble::regional::RegionalReport;
use crate::ensemble::ForecastResult;
use crate::regions::RegionalModel;
use crate::risk::RiskLevel;

fn level_color(level: RiskLevel) -> Color {
    match level {
        RiskLevel::Low => Color::Green,
        RiskLevel::Moderate => Color::Yellow,
        RiskLevel::High => Color::DarkYellow,
        RiskLevel::Severe => Color::Red,
        RiskLevel::Extreme => Color::Magenta,
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn opt(v: Option<f64>, digits: usize) -> String {
    v.map(|x| format!("{:.*}", digits, x)).unwrap_or_else(|| "—".to_string())
}

pub fn display_regions(model: &RegionalModel) {
    println!("\n== Régions ==\n");
    let mut table = new_table();
    table.set_header(vec![
        "Id", "Nom", "Latitude", "Base", "Variab.", "Tempête", "Poids", "LOW", "MOD", "HIGH", "SEV", "EXT",
    ]);
    for r in model.regions() {
        let b = r.thresholds.as_array();
        let mut row = vec![
            r.id.clone(),
            r.name.clone(),
            format!("{:.0}..{:.0}", r.lat_min, r.lat_max),
            format!("{:.2}", r.baseline_factor),
            format!("{:.2}", r.variability_factor),
            format!("{:.2}", r.storm_response),
            format!("{:.2}", r.risk_weight),
        ];
        row.extend(b.iter().map(|v| format!("{:.0}", v)));
        table.add_row(row);
    }
    println!("{table}");
    let p = model.params();
    println!("  Excès d'activité : Kp {:.1} -> {:.1}", p.quiet_threshold, p.max_index);
}

pub fn display_climatology_summary(table: &ClimatologyTable) {
    let (start, end) = table.training_range();
    let g = table.global();
    println!("\n== Climatologie v{} ({}) ==\n", table.version(), table.target());
    println!("  Entraînement : {} -> {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"));
    println!("  Bacs : {}  |  Rayon max : {}", table.bin_count(), table.max_radius());
    println!("  Global : moyenne {:.2}, écart-type {:.2}, {} mesures", g.mean, g.std, g.count);
    let regions: Vec<&str> = table.regions().collect();
    if !regions.is_empty() {
        println!("  Régions : {}", regions.join(", "));
    }
}

/// `nom (clé=valeur, ...)`, clés triées.
pub fn forecaster_label(name: &str, params: &HashMap<String, f64>) -> String {
    if params.is_empty() {
        return name.to_string();
    }
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys.iter().map(|k| format!("{}={}", k, params[*k])).collect();
    format!("{} ({})", name, parts.join(", "))
}

pub fn display_forecaster(name: &str, params: &HashMap<String, f64>) {
    println!("Modèle de séquence : {}", forecaster_label(name, params));
}

pub fn display_forecast(result: &ForecastResult) {
    let label = result.region.as_deref().unwrap_or("global");
    println!(
        "\n== Prévision {} émise à {} (Kp {:.1}) ==\n",
        label,
        result.issued_at.format("%Y-%m-%d %H:%M"),
        result.activity
    );
    if result.degraded {
        println!(
            "  Mode dégradé (climatologie seule) : {}",
            result.reason.as_deref().unwrap_or("raison inconnue")
        );
    }
    println!("  Poids climatologie : {:.2}  |  Confiance : {:.2}", result.weight, result.confidence);

    let mut table = new_table();
    table.set_header(vec!["Échéance", "Prévision", "Climatologie", "Modèle"]);
    for (i, t) in result.target_times.iter().enumerate() {
        let model = result.model.as_ref().and_then(|m| m.get(i).copied());
        table.add_row(vec![
            Cell::new(t.format("%m-%d %H:%M")),
            Cell::new(format!("{:.2}", result.values[i])).fg(Color::Cyan),
            Cell::new(format!("{:.2}", result.climatology[i])),
            Cell::new(opt(model, 2)),
        ]);
    }
    println!("{table}");
}

pub fn display_regional_report(report: &RegionalReport) {
    println!("\n== Risque régional à {} ==\n", report.issued_at.format("%Y-%m-%d %H:%M"));
    let mut table = new_table();
    table.set_header(vec!["Région", "Pic", "Niveau", "Tempête", "Confiance", "Dégradé"]);
    for r in &report.regions {
        table.add_row(vec![
            Cell::new(&r.name),
            Cell::new(format!("{:.1}", r.peak_value)),
            Cell::new(r.peak_level.to_string()).fg(level_color(r.peak_level)),
            Cell::new(if r.storm_enhanced { "oui" } else { "" }),
            Cell::new(format!("{:.2}", r.forecast.confidence)),
            Cell::new(if r.forecast.degraded { "oui" } else { "" }),
        ]);
    }
    println!("{table}");
    println!(
        "  Risque global : {} (sévérité {:.2}). {}",
        report.global.level,
        report.global.severity,
        report.global.level.description()
    );
    if let Some(storm) = &report.storm_risk {
        println!(
            "  Risque de tempête : {} (max horaire {:.0}%, moyenne {:.0}%)",
            storm.label,
            storm.max_probability * 100.0,
            storm.mean_probability * 100.0
        );
    }
}

pub fn display_backtest_report(report: &BacktestReport) {
    let meta = &report.metadata;
    println!(
        "\n== Backtest {} -> {} (horizon {} min, pas {} min) ==\n",
        meta.start.format("%Y-%m-%d"),
        meta.end.format("%Y-%m-%d"),
        meta.horizon_minutes,
        meta.interval_minutes
    );
    println!(
        "  Instants : {} évalués / {} ({} sans observation){}",
        report.completed_points,
        report.total_points,
        report.unmatched_points,
        if report.cancelled { "  [ANNULÉ]" } else { "" }
    );

    let mut table = new_table();
    table.set_header(vec![
        "Région", "Approche", "N", "Échecs", "MAE", "RMSE", "Médiane", "Max", "Biais", "Accord", "Skill",
    ]);
    for m in &report.metrics {
        let s = m.stats.as_ref();
        table.add_row(vec![
            Cell::new(&m.region),
            Cell::new(&m.approach),
            Cell::new(m.count),
            Cell::new(m.failed),
            Cell::new(opt(s.map(|s| s.mae), 3)),
            Cell::new(opt(s.map(|s| s.rmse), 3)),
            Cell::new(opt(s.map(|s| s.median_abs_error), 3)),
            Cell::new(opt(s.map(|s| s.max_abs_error), 3)),
            Cell::new(opt(s.map(|s| s.bias), 3)),
            Cell::new(opt(s.map(|s| s.level_agreement * 100.0), 0)),
            Cell::new(opt(m.skill, 3)),
        ]);
    }
    println!("{table}");

    let mut table = new_table();
    table.set_header(vec!["Région", "Gagnant", "Confiance", "Écart MAE"]);
    for r in &report.regions {
        match &r.status {
            RegionStatus::Decided { winner, confidence, relative_gap } => {
                let color = match confidence {
                    Confidence::High => Color::Green,
                    Confidence::Moderate => Color::Yellow,
                    Confidence::Low => Color::White,
                };
                table.add_row(vec![
                    Cell::new(&r.region),
                    Cell::new(winner),
                    Cell::new(confidence.to_string()).fg(color),
                    Cell::new(opt(relative_gap.map(|g| g * 100.0), 1)),
                ]);
            }
            RegionStatus::InsufficientData => {
                table.add_row(vec![
                    Cell::new(&r.region),
                    Cell::new("données insuffisantes").fg(Color::Red),
                    Cell::new(""),
                    Cell::new(""),
                ]);
            }
        }
    }
    println!("{table}");
    println!("  Recommandation : {}", report.overall);
    if !report.failures.is_empty() {
        println!("  Échecs enregistrés : {}", report.failures.len());
    }
    display_storm_report(report);
}

fn display_storm_report(report: &BacktestReport) {
    if let Some(threshold) = report.metadata.storm_threshold {
        println!(
            "\n== Classification tempête (seuil {}, optimisation {}) ==\n",
            threshold, report.metadata.storm.criterion
        );
        let mut table = new_table();
        table.set_header(vec![
            "Région", "Approche", "POD", "FAR", "Précision", "F1", "VP", "FP", "FN", "VN", "R²", "MAPE", "Seuil opt.",
        ]);
        for m in &report.metrics {
            let Some(stats) = &m.stats else {
                continue;
            };
            let Some(c) = &stats.classification else {
                continue;
            };
            table.add_row(vec![
                Cell::new(&m.region),
                Cell::new(&m.approach),
                Cell::new(format!("{:.0}%", c.hit_rate() * 100.0)),
                Cell::new(format!("{:.0}%", c.false_alarm_rate * 100.0)),
                Cell::new(format!("{:.2}", c.precision)),
                Cell::new(format!("{:.2}", c.f1)).fg(Color::Cyan),
                Cell::new(c.confusion.true_positives),
                Cell::new(c.confusion.false_positives),
                Cell::new(c.confusion.false_negatives),
                Cell::new(c.confusion.true_negatives),
                Cell::new(opt(stats.r_squared, 3)),
                Cell::new(opt(stats.mape, 1)),
                Cell::new(opt(m.sweep.as_ref().map(|s| s.best_threshold), 0)),
            ]);
        }
        println!("{table}");
    }

    if report.storm_events.is_empty() {
        return;
    }
    println!("\n== Épisodes de tempête (Kp >= {}) ==\n", report.metadata.storm.kp_threshold);
    let mut table = new_table();
    table.set_header(vec!["Épisode", "Début", "Heures", "Kp max", "Échelle", "Région", "Approche", "N", "MAE", "RMSE", "Détection"]);
    for event in &report.storm_events {
        for score in report.event_scores.iter().filter(|s| s.event == event.id) {
            table.add_row(vec![
                Cell::new(&event.id),
                Cell::new(event.start.format("%Y-%m-%d %H:%M")),
                Cell::new(event.measurements),
                Cell::new(format!("{:.1}", event.peak_kp)),
                Cell::new(format!("G{}", event.g_scale)).fg(if event.g_scale >= 3 { Color::Red } else { Color::Yellow }),
                Cell::new(&score.region),
                Cell::new(&score.approach),
                Cell::new(score.count),
                Cell::new(opt(score.mae, 3)),
                Cell::new(opt(score.rmse, 3)),
                Cell::new(opt(score.detection_rate.map(|r| r * 100.0), 0)),
            ]);
        }
    }
    println!("{table}");
}

/// Erreur absolue dans le temps, une courbe par approche, pour une région.
pub fn display_error_chart(report: &BacktestReport, region: &str) {
    println!("\n== Erreur absolue ({}) ==\n", region);
    let Some(t0) = report.samples.first().map(|s| s.timestamp) else {
        println!("  (Pas de données à afficher)");
        return;
    };

    let mut y_max = 0.0f32;
    let mut series: Vec<(String, Vec<(f32, f32)>)> = Vec::new();
    for approach in &report.metadata.approaches {
        let points: Vec<(f32, f32)> = report
            .samples
            .iter()
            .filter(|s| s.region == region && &s.approach == approach)
            .map(|s| {
                let days = (s.timestamp - t0).num_minutes() as f32 / 1440.0;
                (days, s.absolute_error as f32)
            })
            .collect();
        y_max = points.iter().map(|p| p.1).fold(y_max, f32::max);
        if !points.is_empty() {
            series.push((approach.clone(), points));
        }
    }
    if series.is_empty() {
        println!("  (Pas de données à afficher)");
        return;
    }
    let x_max = series
        .iter()
        .flat_map(|(_, p)| p.iter().map(|q| q.0))
        .fold(1.0f32, f32::max);

    for (name, points) in &series {
        println!("  {} :", name);
        let shape = textplots::Shape::Lines(points);
        let mut chart = textplots::Chart::new_with_y_range(120, 40, 0.0, x_max, 0.0, y_max + 0.5);
        println!("{}", chart.lineplot(&shape));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::forecaster::{DampedPersistence, PerturbedEnsemble, SequenceForecaster};
    use std::sync::Arc;

    #[test]
    fn test_forecaster_label_lists_sorted_params() {
        let inner: Arc<dyn SequenceForecaster> = Arc::new(DampedPersistence::new(0.8));
        let ens = PerturbedEnsemble::new(inner, 8, 0.05, 42);
        assert_eq!(
            forecaster_label(ens.name(), &ens.params()),
            "perturbed_ensemble (damping=0.8, members=8, noise=0.05)"
        );
        assert_eq!(forecaster_label("nu", &HashMap::new()), "nu");
    }
}
