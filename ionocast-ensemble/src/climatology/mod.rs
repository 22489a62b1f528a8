//! Climatologie : table (jour de l'année, tranche d'activité, région) -> moyenne.
//!
//! Construite une fois sur un intervalle d'entraînement puis immuable.
//! Voir `builder` pour la réduction, `snapshot` pour la publication atomique.

pub mod builder;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ionocast_db::models::{TargetField, ACTIVITY_BUCKETS, DAYS_PER_YEAR};

use crate::regions::{RegionDefinition, RegionalModel};

/// Rayon maximal de recherche des voisins avant repli sur la moyenne globale.
pub const DEFAULT_MAX_RADIUS: u16 = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinKey {
    pub day_of_year: u16,
    pub activity_bucket: u8,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinStats {
    pub mean: f64,
    pub count: u64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimatologyBin {
    #[serde(flatten)]
    pub key: BinKey,
    #[serde(flatten)]
    pub stats: BinStats,
}

/// Règle qui a produit une valeur de climatologie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum LookupSource {
    Exact,
    Neighbors { radius: u16, bins: usize },
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub value: f64,
    pub source: LookupSource,
}

/// Table immuable. Les champs sont privés : on ne la modifie jamais en place,
/// une reconstruction produit une nouvelle table publiée par `ClimatologyHandle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TableFile", into = "TableFile")]
pub struct ClimatologyTable {
    version: u64,
    built_at: DateTime<Utc>,
    target: TargetField,
    training_start: DateTime<Utc>,
    training_end: DateTime<Utc>,
    max_radius: u16,
    bins: BTreeMap<BinKey, BinStats>,
    global: BinStats,
    regional_fallback: BTreeMap<String, BinStats>,
}

/// Forme sérialisée : les clés composites ne sont pas des clés JSON valides,
/// les bacs sont donc écrits en liste.
#[derive(Serialize, Deserialize)]
struct TableFile {
    version: u64,
    built_at: DateTime<Utc>,
    target: TargetField,
    training_start: DateTime<Utc>,
    training_end: DateTime<Utc>,
    max_radius: u16,
    global: BinStats,
    regional_fallback: BTreeMap<String, BinStats>,
    bins: Vec<ClimatologyBin>,
}

impl From<TableFile> for ClimatologyTable {
    fn from(f: TableFile) -> Self {
        Self {
            version: f.version,
            built_at: f.built_at,
            target: f.target,
            training_start: f.training_start,
            training_end: f.training_end,
            max_radius: f.max_radius,
            bins: f.bins.into_iter().map(|b| (b.key, b.stats)).collect(),
            global: f.global,
            regional_fallback: f.regional_fallback,
        }
    }
}

impl From<ClimatologyTable> for TableFile {
    fn from(t: ClimatologyTable) -> Self {
        Self {
            version: t.version,
            built_at: t.built_at,
            target: t.target,
            training_start: t.training_start,
            training_end: t.training_end,
            max_radius: t.max_radius,
            global: t.global,
            regional_fallback: t.regional_fallback,
            bins: t.bins.into_iter().map(|(key, stats)| ClimatologyBin { key, stats }).collect(),
        }
    }
}

/// Décalage circulaire sur 1..=365.
fn wrap_day(day: u16, offset: i32) -> u16 {
    let n = DAYS_PER_YEAR as i32;
    ((day as i32 - 1 + offset).rem_euclid(n) + 1) as u16
}

impl ClimatologyTable {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn target(&self) -> TargetField {
        self.target
    }

    pub fn training_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.training_start, self.training_end)
    }

    pub fn max_radius(&self) -> u16 {
        self.max_radius
    }

    pub fn global(&self) -> BinStats {
        self.global
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn bins(&self) -> impl Iterator<Item = ClimatologyBin> + '_ {
        self.bins.iter().map(|(key, stats)| ClimatologyBin { key: key.clone(), stats: *stats })
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regional_fallback.keys().map(|s| s.as_str())
    }

    pub fn bin(&self, day_of_year: u16, activity_bucket: u8, region: Option<&str>) -> Option<&BinStats> {
        self.bins.get(&BinKey {
            day_of_year,
            activity_bucket,
            region: region.map(str::to_string),
        })
    }

    /// Moyenne de repli : celle de la région si elle existe, sinon globale.
    pub fn fallback(&self, region: Option<&str>) -> f64 {
        region
            .and_then(|r| self.regional_fallback.get(r))
            .unwrap_or(&self.global)
            .mean
    }

    /// Recherche d'une valeur de climatologie.
    ///
    /// 1. Bac exact.
    /// 2. Sinon, pour r = 1..=max_radius : tous les bacs non vides à au plus
    ///    ±r jours (circulaire) et ±r tranches (bornées à 0..=9). Si au moins un
    ///    existe, moyenne non pondérée de leurs moyennes.
    /// 3. Sinon la moyenne de repli.
    ///
    /// L'ordre de parcours est fixe, le résultat est donc déterministe.
    pub fn lookup(&self, day_of_year: u16, activity: f64, region: Option<&str>) -> Lookup {
        let day = day_of_year.clamp(1, DAYS_PER_YEAR);
        let bucket = ionocast_db::models::activity_bucket(activity);

        if let Some(stats) = self.bin(day, bucket, region) {
            return Lookup { value: stats.mean, source: LookupSource::Exact };
        }

        let max_bucket = (ACTIVITY_BUCKETS - 1) as i32;
        for radius in 1..=self.max_radius {
            let r = radius as i32;
            let mut sum = 0.0;
            let mut found = 0usize;
            let mut seen: Vec<(u16, u8)> = Vec::new();
            for d in -r..=r {
                let day_n = wrap_day(day, d);
                for k in -r..=r {
                    let b = bucket as i32 + k;
                    if !(0..=max_bucket).contains(&b) {
                        continue;
                    }
                    let key = (day_n, b as u8);
                    if seen.contains(&key) {
                        continue;
                    }
                    seen.push(key);
                    if let Some(stats) = self.bin(key.0, key.1, region) {
                        sum += stats.mean;
                        found += 1;
                    }
                }
            }
            if found > 0 {
                return Lookup {
                    value: sum / found as f64,
                    source: LookupSource::Neighbors { radius, bins: found },
                };
            }
        }

        Lookup { value: self.fallback(region), source: LookupSource::Fallback }
    }

    pub fn lookup_at(&self, ts: &DateTime<Utc>, activity: f64, region: Option<&str>) -> Lookup {
        self.lookup(ionocast_db::models::day_of_year(ts), activity, region)
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regional_fallback.contains_key(region)
    }

    /// Valeur régionale : bacs de la région s'ils existent, sinon valeur
    /// globale passée par l'ajustement régional.
    pub fn lookup_region(
        &self,
        ts: &DateTime<Utc>,
        activity: f64,
        region: &RegionDefinition,
        model: &RegionalModel,
    ) -> Lookup {
        if self.has_region(&region.id) {
            return self.lookup_at(ts, activity, Some(&region.id));
        }
        let global = self.lookup_at(ts, activity, None);
        Lookup { value: model.adjust(global.value, region, activity), source: global.source }
    }
}

pub fn save_table(table: &ClimatologyTable, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(table)?;
    std::fs::write(path, json)
        .with_context(|| format!("Impossible d'écrire {:?}", path))?;
    Ok(())
}

pub fn load_table(path: &Path) -> Result<ClimatologyTable> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Impossible de lire {:?}", path))?;
    let table: ClimatologyTable = serde_json::from_str(&json)
        .with_context(|| format!("JSON de climatologie invalide dans {:?}", path))?;
    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Table minimale construite à la main pour tester la recherche.
    pub(crate) fn table_with(bins: &[((u16, u8, Option<&str>), f64)], global: f64) -> ClimatologyTable {
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        ClimatologyTable {
            version: 1,
            built_at: t0,
            target: TargetField::TecMean,
            training_start: t0,
            training_end: t0,
            max_radius: DEFAULT_MAX_RADIUS,
            bins: bins
                .iter()
                .map(|&((d, k, r), mean)| {
                    (
                        BinKey { day_of_year: d, activity_bucket: k, region: r.map(str::to_string) },
                        BinStats { mean, count: 1, std: 0.0 },
                    )
                })
                .collect(),
            global: BinStats { mean: global, count: 100, std: 1.0 },
            regional_fallback: BTreeMap::new(),
        }
    }

    #[test]
    fn test_wrap_day() {
        assert_eq!(wrap_day(1, -1), 365);
        assert_eq!(wrap_day(365, 1), 1);
        assert_eq!(wrap_day(100, 3), 103);
        assert_eq!(wrap_day(2, -3), 364);
    }

    #[test]
    fn test_lookup_exact() {
        let t = table_with(&[((100, 3, None), 15.0)], 10.0);
        let l = t.lookup(100, 3.9, None);
        assert_eq!(l.value, 15.0);
        assert_eq!(l.source, LookupSource::Exact);
    }

    #[test]
    fn test_lookup_radius_one_averages_all_neighbors() {
        // Trois voisins à distance 1 : (99,3), (101,4), (100,2). Un bac à distance 2 ignoré.
        let t = table_with(
            &[
                ((99, 3, None), 10.0),
                ((101, 4, None), 20.0),
                ((100, 2, None), 30.0),
                ((102, 3, None), 1000.0),
            ],
            0.0,
        );
        let l = t.lookup(100, 3.0, None);
        assert_eq!(l.source, LookupSource::Neighbors { radius: 1, bins: 3 });
        assert!((l.value - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_lookup_radius_grows_one_step_at_a_time() {
        let t = table_with(&[((103, 0, None), 7.0), ((97, 9, None), 99.0)], 0.0);
        let l = t.lookup(100, 1.0, None);
        assert_eq!(l.source, LookupSource::Neighbors { radius: 3, bins: 1 });
        assert_eq!(l.value, 7.0);
    }

    #[test]
    fn test_lookup_wraps_year_boundary() {
        let t = table_with(&[((364, 2, None), 11.0)], 0.0);
        let l = t.lookup(1, 2.0, None);
        assert_eq!(l.source, LookupSource::Neighbors { radius: 2, bins: 1 });
        assert_eq!(l.value, 11.0);
    }

    #[test]
    fn test_lookup_fallback_beyond_max_radius() {
        let t = table_with(&[((104, 3, None), 50.0)], 12.5);
        let l = t.lookup(100, 3.0, None);
        assert_eq!(l.source, LookupSource::Fallback);
        assert_eq!(l.value, 12.5);
    }

    #[test]
    fn test_lookup_buckets_clamped_not_wrapped() {
        // Tranche 9 n'est pas voisine de la tranche 0.
        let t = table_with(&[((100, 9, None), 40.0)], 12.0);
        let l = t.lookup(100, 0.0, None);
        assert_eq!(l.source, LookupSource::Fallback);
    }

    #[test]
    fn test_lookup_region_isolated() {
        let t = table_with(&[((100, 3, Some("polar")), 5.0), ((100, 3, None), 15.0)], 12.0);
        assert_eq!(t.lookup(100, 3.0, Some("polar")).value, 5.0);
        assert_eq!(t.lookup(100, 3.0, None).value, 15.0);
        // Région sans bac propre : repli, sans emprunter les bacs globaux.
        assert_eq!(t.lookup(100, 3.0, Some("auroral")).source, LookupSource::Fallback);
    }

    #[test]
    fn test_lookup_deterministic() {
        let t = table_with(&[((98, 1, None), 3.3), ((102, 5, None), 7.7), ((100, 4, None), 1.1)], 0.0);
        let first = t.lookup(100, 2.0, None);
        for _ in 0..50 {
            assert_eq!(t.lookup(100, 2.0, None), first);
        }
    }

    #[test]
    fn test_lookup_region_without_regional_bins_adjusts_global() {
        let t = table_with(&[((100, 7, None), 10.0)], 12.0);
        let model = RegionalModel::default();
        let polar = model.get("polar").unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 4, 10, 0, 0, 0).unwrap();
        let l = t.lookup_region(&ts, 7.0, polar, &model);
        assert_eq!(l.source, LookupSource::Exact);
        assert_eq!(l.value, model.adjust(10.0, polar, 7.0));
    }

    #[test]
    fn test_table_json_roundtrip() {
        let t = table_with(&[((100, 3, Some("polar")), 5.0), ((1, 0, None), 15.0)], 12.0);
        let tmp = std::env::temp_dir().join("ionocast_test_table.json");
        save_table(&t, &tmp).unwrap();
        let loaded = load_table(&tmp).unwrap();
        assert_eq!(loaded, t);
        let _ = std::fs::remove_file(&tmp);
    }
}
