use chrono::{DateTime, Utc};

use ionocast_db::models::Measurement;

/// Historique visible à un instant donné.
///
/// CRITIQUE : ne contient que des mesures strictement antérieures à `as_of`.
/// La vue est une tranche d'un vecteur trié, coupée par recherche binaire,
/// donc aucune mesure future ne peut y figurer.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    records: &'a [Measurement],
    as_of: DateTime<Utc>,
}

impl<'a> History<'a> {
    /// `sorted` doit être trié par horodatage croissant.
    pub fn before(sorted: &'a [Measurement], as_of: DateTime<Utc>) -> Self {
        let end = sorted.partition_point(|m| m.timestamp < as_of);
        Self { records: &sorted[..end], as_of }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn records(&self) -> &'a [Measurement] {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&'a Measurement> {
        self.records.last()
    }

    /// Les `n` dernières mesures (moins si l'historique est plus court).
    pub fn tail(&self, n: usize) -> &'a [Measurement] {
        &self.records[self.records.len().saturating_sub(n)..]
    }

    /// Dernier Kp connu.
    pub fn latest_activity(&self) -> Option<f64> {
        self.records.iter().rev().find_map(|m| m.kp_index)
    }
}
