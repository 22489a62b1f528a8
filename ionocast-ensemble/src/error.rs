use std::time::Duration;

use thiserror::Error;

/// Échecs du prévisionniste externe. Ne remontent jamais tels quels au
/// consommateur du combinateur : ils déclenchent le repli climatologique.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecasterError {
    #[error("historique insuffisant : {required} pas requis, {available} disponibles")]
    InsufficientHistory { required: usize, available: usize },
    #[error("délai dépassé après {0:?}")]
    Timeout(Duration),
    #[error("échec du prévisionniste : {0}")]
    Failed(String),
    #[error("sortie invalide : {0}")]
    InvalidOutput(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Mauvaise configuration : fatal, jamais transitoire.
    #[error("configuration invalide : {0}")]
    Configuration(String),
    #[error("donnée indisponible : {0}")]
    DataUnavailable(String),
    #[error(transparent)]
    Forecaster(#[from] ForecasterError),
    #[error("historique insuffisant : {required} mesures requises, {available} disponibles")]
    InsufficientHistory { required: usize, available: usize },
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
