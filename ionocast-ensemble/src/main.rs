mod import;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};

use ionocast_db::db::{count_measurements, db_path, insert_measurements, migrate, open_db, time_bounds};
use ionocast_db::store::{HistoricalStore, SqliteStore};
use ionocast_ensemble::backtest::approaches::{Approach, ClimatologyApproach, EnsembleApproach, PersistenceApproach};
use ionocast_ensemble::backtest::report::save_report;
use ionocast_ensemble::backtest::{BacktestConfig, BacktestEngine, CancellationToken};
use ionocast_ensemble::climatology::builder::build;
use ionocast_ensemble::climatology::snapshot::ClimatologyHandle;
use ionocast_ensemble::climatology::{load_table, save_table};
use ionocast_ensemble::config::{load_or_default, save_config, EngineConfig, ForecasterSettings};
use ionocast_ensemble::display;
use ionocast_ensemble::ensemble::forecaster::{DampedPersistence, PerturbedEnsemble, SequenceForecaster};
use ionocast_ensemble::ensemble::regional::RegionalForecaster;
use ionocast_ensemble::ensemble::EnsembleCombiner;
use ionocast_ensemble::history::History;
use ionocast_ensemble::synthetic::{generate, SyntheticConfig};

#[derive(Parser)]
#[command(name = "ionocast", about = "Prévision TEC par ensemble climatologie + modèle, et backtest régional")]
struct Cli {
    /// Fichier de configuration JSON (défaut : valeurs intégrées)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base SQLite (défaut : data/ionocast.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remplir la base avec des mesures horaires synthétiques
    Seed {
        #[arg(long, default_value = "2022-01-01")]
        start: String,
        #[arg(short, long, default_value = "730")]
        days: u32,
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Importer des mesures depuis un CSV (en-têtes : timestamp, kp_index, tec_mean, ...)
    Import {
        file: PathBuf,
        #[arg(short, long, default_value = ",")]
        delimiter: char,
    },

    /// Construire la table de climatologie sur [start, end)
    Build {
        #[arg(long)]
        start: Option<String>,
        /// Fin exclue ; pour un backtest, au plus le début de la période testée
        #[arg(long)]
        end: Option<String>,
        #[arg(short, long, default_value = "climatology.json")]
        output: PathBuf,
    },

    /// Prévision à partir des dernières mesures
    Forecast {
        #[arg(short, long, default_value = "climatology.json")]
        climatology: PathBuf,
        /// Instant de prévision (défaut : juste après la dernière mesure)
        #[arg(long)]
        at: Option<String>,
        /// Une seule région ; sinon toutes, avec le risque global
        #[arg(short, long)]
        region: Option<String>,
    },

    /// Rejouer l'historique et comparer les approches
    Backtest {
        #[arg(short, long, default_value = "climatology.json")]
        climatology: PathBuf,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Approches séparées par des virgules
        #[arg(short, long, default_value = "climatology,ensemble,persistence")]
        approaches: String,
        /// Régions séparées par des virgules (défaut : toutes)
        #[arg(long)]
        regions: Option<String>,
        #[arg(short, long)]
        workers: Option<usize>,
        #[arg(short, long, default_value = "backtest.json")]
        output: PathBuf,
        /// Afficher la courbe d'erreur pour cette région
        #[arg(long)]
        chart: Option<String>,
        /// Seuil tempête / calme, en unités de la cible (défaut : 40 pour storm_probability)
        #[arg(long)]
        storm_threshold: Option<f64>,
    },

    /// Afficher les régions et leurs seuils
    Regions,

    /// Afficher (ou écrire) la configuration effective
    ShowConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_or_default(cli.config.as_deref())?;
    let path = cli.db.clone().unwrap_or_else(db_path);

    match cli.command {
        Command::Seed { start, days, seed } => cmd_seed(&path, &start, days, seed),
        Command::Import { file, delimiter } => cmd_import(&path, &file, delimiter),
        Command::Build { start, end, output } => cmd_build(&path, &config, start.as_deref(), end.as_deref(), &output),
        Command::Forecast { climatology, at, region } => {
            cmd_forecast(&path, &config, &climatology, at.as_deref(), region.as_deref())
        }
        Command::Backtest { climatology, start, end, approaches, regions, workers, output, chart, storm_threshold } => {
            cmd_backtest(
                &path,
                &config,
                &climatology,
                BacktestArgs { start, end, approaches, regions, workers, output, chart, storm_threshold },
            )
        }
        Command::Regions => {
            display::display_regions(&config.regional_model()?);
            Ok(())
        }
        Command::ShowConfig { output } => cmd_show_config(&config, output.as_deref()),
    }
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    let conn = open_db(path)?;
    migrate(&conn)?;
    SqliteStore::new(conn)
}

fn make_forecaster(settings: &ForecasterSettings) -> Arc<dyn SequenceForecaster> {
    let base: Arc<dyn SequenceForecaster> = Arc::new(DampedPersistence::new(settings.damping));
    if settings.members > 1 {
        Arc::new(PerturbedEnsemble::new(base, settings.members, settings.noise, settings.seed))
    } else {
        base
    }
}

fn cmd_seed(path: &Path, start: &str, days: u32, seed: u64) -> Result<()> {
    let start = import::parse_timestamp(start)?;
    let records = generate(start, days as usize * 24, &SyntheticConfig::default(), seed);
    let mut conn = open_db(path)?;
    migrate(&conn)?;
    let inserted = insert_measurements(&mut conn, &records)?;
    println!(
        "{} mesures synthétiques générées, {} insérées ({} en base)",
        records.len(),
        inserted,
        count_measurements(&conn)?
    );
    Ok(())
}

fn cmd_import(path: &Path, file: &Path, delimiter: char) -> Result<()> {
    if !delimiter.is_ascii() {
        bail!("Délimiteur non ASCII : '{}'", delimiter);
    }
    let conn = open_db(path)?;
    migrate(&conn)?;
    let result = import::import_csv(&conn, file, delimiter as u8)?;
    println!(
        "Import terminé : {} lignes, {} insérées, {} doublons, {} erreurs",
        result.total_records, result.inserted, result.skipped, result.errors
    );
    Ok(())
}

fn cmd_build(path: &Path, config: &EngineConfig, start: Option<&str>, end: Option<&str>, output: &Path) -> Result<()> {
    let store = open_store(path)?;
    let Some((first, last)) = store.with_connection(|c| time_bounds(c))? else {
        bail!("Base vide. Lancez d'abord : ionocast seed ou ionocast import");
    };
    let start = start.map(import::parse_timestamp).transpose()?.unwrap_or(first);
    let end = end
        .map(import::parse_timestamp)
        .transpose()?
        .unwrap_or(last + Duration::seconds(1));

    let records = store.range(start, end)?;
    let regional = config.regional_model()?;
    let table = build(&records, start, end, &config.climatology, Some(&regional))?;
    display::display_climatology_summary(&table);
    save_table(&table, output)?;
    println!("\nClimatologie sauvegardée dans : {}", output.display());
    Ok(())
}

fn make_combiner(config: &EngineConfig, climatology: &Path) -> Result<EnsembleCombiner> {
    let table = load_table(climatology)
        .context("Impossible de charger la climatologie. Lancez d'abord : ionocast build")?;
    let combiner = EnsembleCombiner::new(
        config.ensemble.clone(),
        Arc::new(ClimatologyHandle::new(table)),
        config.regional_model()?,
        make_forecaster(&config.forecaster),
    )?;
    Ok(combiner)
}

fn cmd_forecast(path: &Path, config: &EngineConfig, climatology: &Path, at: Option<&str>, region: Option<&str>) -> Result<()> {
    let store = open_store(path)?;
    let Some((_, last)) = store.with_connection(|c| time_bounds(c))? else {
        bail!("Base vide. Lancez d'abord : ionocast seed ou ionocast import");
    };
    let as_of: DateTime<Utc> = match at {
        Some(s) => import::parse_timestamp(s)?,
        None => last + Duration::seconds(1),
    };

    let combiner = make_combiner(config, climatology)?;
    display::display_forecaster(combiner.forecaster_name(), &combiner.forecaster_params());
    let records = store.latest_before(as_of, config.ensemble.window * 2)?;
    let history = History::before(&records, as_of);
    log::info!("{} mesures avant {}", history.len(), as_of);

    match region {
        Some(id) => {
            let regional = combiner.regions().require(id)?.clone();
            let result = combiner.forecast(history, Some(&regional))?;
            display::display_forecast(&result);
        }
        None => {
            let classifier = config.risk_classifier()?;
            let report = RegionalForecaster::new(&combiner, &classifier).forecast(history)?;
            display::display_regional_report(&report);
        }
    }
    Ok(())
}

struct BacktestArgs {
    start: String,
    end: String,
    approaches: String,
    regions: Option<String>,
    workers: Option<usize>,
    output: PathBuf,
    chart: Option<String>,
    storm_threshold: Option<f64>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

fn cmd_backtest(path: &Path, config: &EngineConfig, climatology: &Path, args: BacktestArgs) -> Result<()> {
    let store = open_store(path)?;
    let start = import::parse_timestamp(&args.start)?;
    let end = import::parse_timestamp(&args.end)?;
    let regional = config.regional_model()?;
    let combiner = Arc::new(make_combiner(config, climatology)?);
    let table = combiner.climatology();

    let mut approaches: Vec<Arc<dyn Approach>> = Vec::new();
    for id in split_list(&args.approaches) {
        match id.as_str() {
            "climatology" => approaches.push(Arc::new(ClimatologyApproach::new(table.clone(), regional.clone()))),
            "ensemble" => approaches.push(Arc::new(EnsembleApproach::new(combiner.clone()))),
            "persistence" => {
                approaches.push(Arc::new(PersistenceApproach::new(config.ensemble.target, regional.clone())))
            }
            other => bail!("Approche inconnue : '{}' (climatology, ensemble, persistence)", other),
        }
    }

    let defaults = &config.backtest;
    let mut bt = BacktestConfig::new(start, end);
    bt.interval_minutes = defaults.interval_minutes;
    bt.horizon_minutes = defaults.horizon_minutes;
    bt.tolerance_minutes = defaults.tolerance_minutes;
    bt.target = config.ensemble.target;
    bt.confidence = defaults.confidence;
    bt.lookback_hours = defaults.lookback_hours;
    bt.max_workers = args.workers.unwrap_or(defaults.max_workers);
    bt.baseline = defaults
        .baseline
        .clone()
        .filter(|b| approaches.iter().any(|a| a.id() == b.as_str()));
    bt.regions = args.regions.as_deref().map(split_list).unwrap_or_default();
    bt.storm = defaults.storm.clone();
    if args.storm_threshold.is_some() {
        bt.storm.threshold = args.storm_threshold;
    }

    let count = approaches.len();
    // Refuse une climatologie entraînée sur la période testée.
    let engine = BacktestEngine::new(bt, regional, approaches)
        .context("Configuration du backtest refusée")?
        .with_progress(true);
    println!(
        "Backtest de {} approches du {} au {}...",
        count,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    let report = engine.run_store(&store, &CancellationToken::new())?;

    display::display_backtest_report(&report);
    if let Some(region) = &args.chart {
        display::display_error_chart(&report, region);
    }
    save_report(&report, &args.output)?;
    println!("\nRapport sauvegardé dans : {}", args.output.display());
    Ok(())
}

fn cmd_show_config(config: &EngineConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            save_config(config, path)?;
            println!("Configuration écrite dans : {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}
