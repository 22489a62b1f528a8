use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use ionocast_db::models::Measurement;

use super::builder::{build, ClimatologyConfig};
use super::ClimatologyTable;
use crate::error::EngineResult;
use crate::regions::RegionalModel;

/// Point d'accès partagé à la climatologie courante.
///
/// Les lecteurs clonent l'`Arc` et gardent leur instantané aussi longtemps
/// qu'ils veulent. Une reconstruction ne modifie jamais une table publiée :
/// elle en construit une nouvelle puis échange le pointeur.
#[derive(Debug)]
pub struct ClimatologyHandle {
    current: RwLock<Arc<ClimatologyTable>>,
    writer: Mutex<u64>,
}

impl ClimatologyHandle {
    pub fn new(table: ClimatologyTable) -> Self {
        let version = table.version();
        Self {
            current: RwLock::new(Arc::new(table)),
            writer: Mutex::new(version),
        }
    }

    pub fn current(&self) -> Arc<ClimatologyTable> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Publie une table déjà construite sous la version suivante.
    pub fn publish(&self, table: ClimatologyTable) -> u64 {
        let mut last = self.writer.lock();
        *last += 1;
        let table = table.with_version(*last);
        *self.current.write() = Arc::new(table);
        *last
    }

    /// Reconstruit puis publie. Un seul rédacteur à la fois ; la table
    /// courante reste lisible pendant la construction et reste en place
    /// si la construction échoue.
    pub fn rebuild(
        &self,
        records: &[Measurement],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &ClimatologyConfig,
        regional: Option<&RegionalModel>,
    ) -> EngineResult<u64> {
        let mut last = self.writer.lock();
        let table = build(records, start, end, config, regional)?;
        *last += 1;
        let table = table.with_version(*last);
        *self.current.write() = Arc::new(table);
        log::info!("Climatologie v{} publiée", *last);
        Ok(*last)
    }
}
