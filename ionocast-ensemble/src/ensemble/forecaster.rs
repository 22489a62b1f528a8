use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use ndarray::{Array2, ArrayView1};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ionocast_db::models::{Measurement, TargetField};

use crate::error::{EngineError, EngineResult, ForecasterError};
use crate::history::History;
use crate::risk::StormOutlook;

/// tec/100, std/20, kp/9, vent/1000, bz/20, f107/300, sin(heure), cos(jour).
pub const FEATURE_COUNT: usize = 8;

/// Fenêtre d'entrée du modèle de séquence : `steps` lignes × 8 colonnes
/// normalisées, plus la série brute de la grandeur cible.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    features: Array2<f64>,
    targets: Vec<Option<f64>>,
    target: TargetField,
    end: DateTime<Utc>,
}

fn feature_row(m: &Measurement, last_kp: f64) -> [f64; FEATURE_COUNT] {
    let hour = m.timestamp.hour() as f64;
    let doy = m.day_of_year() as f64;
    [
        m.tec_mean / 100.0,
        m.tec_std / 20.0,
        m.kp_index.unwrap_or(last_kp) / 9.0,
        m.solar_wind_speed / 1000.0,
        m.imf_bz / 20.0,
        m.f107_flux / 300.0,
        (2.0 * PI * hour / 24.0).sin(),
        (2.0 * PI * doy / 365.0).cos(),
    ]
}

impl FeatureWindow {
    /// Construit la fenêtre à partir des `steps` dernières mesures visibles.
    pub fn from_history(history: &History<'_>, steps: usize, target: TargetField) -> Result<Self, ForecasterError> {
        if steps == 0 || history.len() < steps {
            return Err(ForecasterError::InsufficientHistory { required: steps.max(1), available: history.len() });
        }
        let tail = history.tail(steps);
        let mut features = Array2::<f64>::zeros((steps, FEATURE_COUNT));
        let mut last_kp = 0.0;
        for (i, m) in tail.iter().enumerate() {
            if let Some(kp) = m.kp_index {
                last_kp = kp;
            }
            let row = feature_row(m, last_kp);
            for (j, v) in row.iter().enumerate() {
                features[[i, j]] = if v.is_finite() { *v } else { 0.0 };
            }
        }
        Ok(Self {
            features,
            targets: tail.iter().map(|m| target.value(m)).collect(),
            target,
            end: history.as_of(),
        })
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn steps(&self) -> usize {
        self.features.nrows()
    }

    pub fn target(&self) -> TargetField {
        self.target
    }

    /// Instant de prévision (borne exclusive de la fenêtre).
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn targets(&self) -> &[Option<f64>] {
        &self.targets
    }

    pub fn last_target(&self) -> Option<f64> {
        self.targets.iter().rev().flatten().next().copied()
    }

    pub fn activity(&self) -> ArrayView1<'_, f64> {
        self.features.column(2)
    }

    /// Copie bruitée : bruit additif uniforme sur les variables, relatif sur la cible.
    fn perturbed(&self, rng: &mut StdRng, noise: f64) -> Self {
        let mut out = self.clone();
        if noise <= 0.0 {
            return out;
        }
        out.features.mapv_inplace(|v| v + rng.random_range(-noise..noise));
        for t in out.targets.iter_mut().flatten() {
            *t *= 1.0 + rng.random_range(-noise..noise);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelForecast {
    pub values: Vec<f64>,
    /// Confiance propre au modèle, dans [0, 1].
    pub confidence: f64,
    pub storm: Option<StormOutlook>,
}

/// Contrat boîte noire du modèle de séquence appris.
pub trait SequenceForecaster: Send + Sync {
    fn name(&self) -> &str;
    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<ModelForecast, ForecasterError>;
    fn params(&self) -> HashMap<String, f64>;
}

/// Vérifie la forme de la sortie d'un modèle.
pub fn check_output(forecast: ModelForecast, horizon: usize) -> Result<ModelForecast, ForecasterError> {
    if forecast.values.len() != horizon {
        return Err(ForecasterError::InvalidOutput(format!(
            "{} valeurs pour un horizon de {}",
            forecast.values.len(),
            horizon
        )));
    }
    if let Some(i) = forecast.values.iter().position(|v| !v.is_finite()) {
        return Err(ForecasterError::InvalidOutput(format!("valeur non finie au pas {}", i)));
    }
    if !forecast.confidence.is_finite() {
        return Err(ForecasterError::InvalidOutput("confiance non finie".to_string()));
    }
    Ok(ModelForecast { confidence: forecast.confidence.clamp(0.0, 1.0), ..forecast })
}

/// Jetons d'admission : au plus `cap` appels admis, en file ou en cours.
struct Admission {
    admitted: Mutex<usize>,
    released: Condvar,
    cap: usize,
}

impl Admission {
    fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self { admitted: Mutex::new(0), released: Condvar::new(), cap })
    }

    /// Attend un jeton jusqu'à `deadline` ; `None` si le pool reste saturé.
    fn acquire(self: &Arc<Self>, deadline: Instant) -> Option<Permit> {
        let mut admitted = self.admitted.lock();
        while *admitted >= self.cap {
            if self.released.wait_until(&mut admitted, deadline).timed_out() {
                break;
            }
        }
        if *admitted >= self.cap {
            return None;
        }
        *admitted += 1;
        Some(Permit(Arc::clone(self)))
    }
}

/// Rendu à la fin du travail, qu'il ait tourné ou non.
struct Permit(Arc<Admission>);

impl Drop for Permit {
    fn drop(&mut self) {
        *self.0.admitted.lock() -= 1;
        self.0.released.notify_one();
    }
}

/// Pool borné d'appels au prévisionniste.
///
/// Au plus `cap` appels sont admis à la fois ; au-delà, l'appelant attend
/// un jeton dans la limite de `timeout`, sans rien mettre en file. Un appel
/// abandonné n'exécute pas le modèle s'il n'a pas encore démarré ; s'il
/// tourne déjà, il garde son thread et son jeton jusqu'à sa fin.
pub struct ForecasterPool {
    pool: rayon::ThreadPool,
    admission: Arc<Admission>,
    forecaster: Arc<dyn SequenceForecaster>,
    timeout: Duration,
}

impl ForecasterPool {
    pub fn new(forecaster: Arc<dyn SequenceForecaster>, cap: usize, timeout: Duration) -> EngineResult<Self> {
        if cap == 0 {
            return Err(EngineError::config("concurrence du prévisionniste nulle"));
        }
        if timeout.is_zero() {
            return Err(EngineError::config("délai du prévisionniste nul"));
        }
        let name = forecaster.name().to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cap)
            .thread_name(move |i| format!("forecaster-{}-{}", name, i))
            .panic_handler(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panique sans message".to_string());
                log::error!("Le prévisionniste a paniqué : {}", msg);
            })
            .build()
            .map_err(|e| EngineError::config(format!("pool du prévisionniste : {}", e)))?;
        Ok(Self { pool, admission: Admission::new(cap), forecaster, timeout })
    }

    pub fn forecaster_name(&self) -> &str {
        self.forecaster.name()
    }

    pub fn forecaster_params(&self) -> HashMap<String, f64> {
        self.forecaster.params()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Le délai couvre l'attente d'un jeton et celle du résultat.
    pub fn call(&self, window: FeatureWindow, horizon: usize) -> Result<ModelForecast, ForecasterError> {
        let deadline = Instant::now() + self.timeout;
        let Some(permit) = self.admission.acquire(deadline) else {
            log::warn!("{} : pool saturé pendant {:?}", self.forecaster.name(), self.timeout);
            return Err(ForecasterError::Timeout(self.timeout));
        };

        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let job_cancelled = Arc::clone(&cancelled);
        let forecaster = Arc::clone(&self.forecaster);
        self.pool.spawn(move || {
            if job_cancelled.load(Ordering::SeqCst) {
                return;
            }
            let result = forecaster.forecast(&window, horizon);
            drop(permit);
            // Le récepteur a pu abandonner après le délai.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => check_output(result?, horizon),
            Err(RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::SeqCst);
                log::warn!("{} : délai de {:?} dépassé", self.forecaster.name(), self.timeout);
                Err(ForecasterError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ForecasterError::Failed(format!("{} s'est arrêté sans réponse", self.forecaster.name())))
            }
        }
    }
}

/// Persistance amortie : la dernière valeur relaxe vers la moyenne de la
/// fenêtre avec un facteur `damping` par pas.
#[derive(Debug, Clone)]
pub struct DampedPersistence {
    pub damping: f64,
}

impl DampedPersistence {
    pub fn new(damping: f64) -> Self {
        Self { damping: damping.clamp(0.0, 1.0) }
    }
}

impl Default for DampedPersistence {
    fn default() -> Self {
        Self::new(0.9)
    }
}

impl SequenceForecaster for DampedPersistence {
    fn name(&self) -> &str {
        "damped_persistence"
    }

    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<ModelForecast, ForecasterError> {
        let observed: Vec<f64> = window.targets().iter().flatten().copied().collect();
        let last = window
            .last_target()
            .ok_or_else(|| ForecasterError::Failed("aucune valeur cible dans la fenêtre".to_string()))?;
        let n = observed.len() as f64;
        let mean = observed.iter().sum::<f64>() / n;
        let std = (observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let mut values = Vec::with_capacity(horizon);
        let mut decay = 1.0;
        for _ in 0..horizon {
            decay *= self.damping;
            values.push(mean + (last - mean) * decay);
        }

        // Plus la fenêtre est dispersée, moins on se fie à la persistance.
        let cv = if mean.abs() > 1e-9 { std / mean.abs() } else { 1.0 };
        let confidence = (1.0 - cv).clamp(0.1, 0.9);

        let activity = window.activity();
        let kp_last = activity.last().copied().unwrap_or(0.0) * 9.0;
        let kp_max = activity.iter().cloned().fold(0.0f64, f64::max) * 9.0;
        let binary = ((kp_max - 4.0) / 5.0).clamp(0.0, 1.0);
        let mut p = ((kp_last - 4.0) / 5.0).clamp(0.0, 1.0);
        let hourly = (0..horizon)
            .map(|_| {
                p *= self.damping;
                p
            })
            .collect();

        Ok(ModelForecast {
            values,
            confidence,
            storm: Some(StormOutlook { binary_probability: binary, hourly_probabilities: hourly }),
        })
    }

    fn params(&self) -> HashMap<String, f64> {
        HashMap::from([("damping".to_string(), self.damping)])
    }
}

/// Ensemble de membres perturbés autour d'un prévisionniste.
///
/// La graine de chaque membre dépend de (graine, fin de fenêtre, membre),
/// deux appels sur la même fenêtre donnent donc le même résultat.
pub struct PerturbedEnsemble {
    inner: Arc<dyn SequenceForecaster>,
    members: usize,
    noise: f64,
    seed: u64,
}

impl PerturbedEnsemble {
    pub fn new(inner: Arc<dyn SequenceForecaster>, members: usize, noise: f64, seed: u64) -> Self {
        Self { inner, members: members.max(1), noise: noise.max(0.0), seed }
    }

    fn member_seed(&self, end: DateTime<Utc>, member: usize) -> u64 {
        self.seed
            ^ (end.timestamp() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (member as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
    }
}

impl SequenceForecaster for PerturbedEnsemble {
    fn name(&self) -> &str {
        "perturbed_ensemble"
    }

    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<ModelForecast, ForecasterError> {
        let mut runs = Vec::with_capacity(self.members);
        for member in 0..self.members {
            let mut rng = StdRng::seed_from_u64(self.member_seed(window.end(), member));
            let noisy = window.perturbed(&mut rng, self.noise);
            runs.push(check_output(self.inner.forecast(&noisy, horizon)?, horizon)?);
        }
        let n = runs.len() as f64;
        let mut values = vec![0.0; horizon];
        for run in &runs {
            for (acc, v) in values.iter_mut().zip(&run.values) {
                *acc += v / n;
            }
        }
        // Dispersion relative des membres en fin d'horizon.
        let spread = match values.last() {
            Some(&mean) if mean.abs() > 1e-9 => {
                let var = runs
                    .iter()
                    .filter_map(|r| r.values.last())
                    .map(|v| (v - mean).powi(2))
                    .sum::<f64>()
                    / n;
                var.sqrt() / mean.abs()
            }
            _ => 0.0,
        };
        let inner_conf = runs.iter().map(|r| r.confidence).sum::<f64>() / n;
        let confidence = (inner_conf * (1.0 - spread)).clamp(0.0, 1.0);

        let storms: Vec<&StormOutlook> = runs.iter().filter_map(|r| r.storm.as_ref()).collect();
        let storm = (!storms.is_empty()).then(|| {
            let k = storms.len() as f64;
            let mut hourly = vec![0.0; horizon];
            for s in &storms {
                for (acc, p) in hourly.iter_mut().zip(&s.hourly_probabilities) {
                    *acc += p / k;
                }
            }
            StormOutlook {
                binary_probability: storms.iter().map(|s| s.binary_probability).sum::<f64>() / k,
                hourly_probabilities: hourly,
            }
        });

        Ok(ModelForecast { values, confidence, storm })
    }

    fn params(&self) -> HashMap<String, f64> {
        let mut params = self.inner.params();
        params.insert("members".to_string(), self.members as f64);
        params.insert("noise".to_string(), self.noise);
        params
    }
}
