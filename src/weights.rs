//! Weight sets and the on-disk weight store.
//!
//! A [`WeightSet`] is an immutable snapshot: the serving path loads one per
//! run and passes it by reference. The only writer is the learning cycle,
//! which goes through [`WeightStore::replace`]: validate, write a temp file,
//! fsync, rename. Readers never take the lock and see either the previous or
//! the next file in full.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candidate::Category;
use crate::learning::FilterCounts;

pub const SUM_TOLERANCE: f64 = 1e-9;

/// Names that belong to the bounded context modifier. They may never be
/// used as engine keys: the modifier is added after the weighted sum.
pub const RESERVED_ENGINE_KEYS: [&str; 2] = ["context", "context_modifier"];

pub const REFERENCE_SOURCES: [&str; 4] = ["model", "market", "symbolic", "trigger"];

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("{group} weights are empty")]
    Empty { group: String },
    #[error("{group} weights sum to {sum}, expected 1.0")]
    SumMismatch { group: String, sum: f64 },
    #[error("{group} weight {key}={value} outside [{min}, {max}]")]
    OutOfBounds {
        group: String,
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{group} weight {key} is not finite")]
    NonFinite { group: String, key: String },
    #[error("engine weight key {0:?} is reserved for the context modifier")]
    ReservedKey(String),
    #[error("weight file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("weight file encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightBounds {
    pub engine_min: f64,
    pub engine_max: f64,
    pub pillar_min: f64,
    pub pillar_max: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            engine_min: 0.05,
            engine_max: 0.60,
            pillar_min: 0.02,
            pillar_max: 0.80,
        }
    }
}

impl WeightBounds {
    /// Only the sum check; used on the serving path where a set that was
    /// valid when written is re-checked for integrity.
    pub fn unbounded() -> Self {
        Self {
            engine_min: 0.0,
            engine_max: 1.0,
            pillar_min: 0.0,
            pillar_max: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub version: u64,
    /// Base-formula weight per source id.
    pub engine: BTreeMap<String, f64>,
    /// Context-modifier pillar weights per category.
    #[serde(default)]
    pub pillars: BTreeMap<Category, BTreeMap<String, f64>>,
}

impl Default for WeightSet {
    fn default() -> Self {
        let engine = [("model", 0.25), ("market", 0.35), ("symbolic", 0.20), ("trigger", 0.20)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let mut pillars = BTreeMap::new();
        pillars.insert(
            Category::Game,
            [("defense", 0.40), ("pace", 0.35), ("rest", 0.25)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        pillars.insert(
            Category::Prop,
            [("usage", 0.40), ("matchup", 0.35), ("minutes", 0.25)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        Self {
            version: 0,
            engine,
            pillars,
        }
    }
}

fn validate_group(
    group: &str,
    weights: &BTreeMap<String, f64>,
    min: f64,
    max: f64,
) -> Result<(), WeightError> {
    if weights.is_empty() {
        return Err(WeightError::Empty { group: group.to_string() });
    }
    for (key, value) in weights {
        if !value.is_finite() {
            return Err(WeightError::NonFinite {
                group: group.to_string(),
                key: key.clone(),
            });
        }
        if *value < min || *value > max {
            return Err(WeightError::OutOfBounds {
                group: group.to_string(),
                key: key.clone(),
                value: *value,
                min,
                max,
            });
        }
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return Err(WeightError::SumMismatch {
            group: group.to_string(),
            sum,
        });
    }
    Ok(())
}

impl WeightSet {
    pub fn validate(&self, bounds: &WeightBounds) -> Result<(), WeightError> {
        for key in self.engine.keys() {
            if RESERVED_ENGINE_KEYS.contains(&key.as_str()) {
                return Err(WeightError::ReservedKey(key.clone()));
            }
        }
        validate_group("engine", &self.engine, bounds.engine_min, bounds.engine_max)?;
        for (category, pillars) in &self.pillars {
            let group = format!("pillar:{}", category.as_str());
            validate_group(&group, pillars, bounds.pillar_min, bounds.pillar_max)?;
        }
        Ok(())
    }

    pub fn engine_sum(&self) -> f64 {
        self.engine.values().sum()
    }

    pub fn pillars_for(&self, category: Category) -> Option<&BTreeMap<String, f64>> {
        self.pillars.get(&category)
    }
}

/// Audit trail written next to every learned weight set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSignature {
    pub sample_count: usize,
    pub filter_counts: FilterCounts,
    /// SHA-256 over the sorted feature names the weights were trained on.
    pub schema_hash: String,
    pub window_days: u64,
    pub previous_version: u64,
    pub trained_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightFile {
    pub weights: WeightSet,
    #[serde(default)]
    pub signature: Option<TrainingSignature>,
    #[serde(default)]
    pub written_at: u64,
}

pub struct WeightStore {
    dir: PathBuf,
    path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
}

impl WeightStore {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            path: dir.join("weights.json"),
            tmp_path: dir.join("weights.json.tmp"),
            lock_path: dir.join("weights.lock"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current weight file. A missing file yields the reference defaults at
    /// version 0; a corrupt file is an error, never silently replaced.
    pub fn load(&self) -> Result<WeightFile, WeightError> {
        if !self.path.exists() {
            return Ok(WeightFile {
                weights: WeightSet::default(),
                signature: None,
                written_at: 0,
            });
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Snapshot for one serving run. Re-checks the sum invariant so a bad
    /// file is caught before any score is produced.
    pub fn snapshot(&self) -> Result<Arc<WeightSet>, WeightError> {
        let file = self.load()?;
        file.weights.validate(&WeightBounds::unbounded())?;
        Ok(Arc::new(file.weights))
    }

    /// Validates `next` and atomically installs it as the current set.
    /// Returns the version written. On any error the previous file is
    /// untouched.
    pub fn replace(
        &self,
        mut next: WeightSet,
        signature: TrainingSignature,
        bounds: &WeightBounds,
        now: u64,
    ) -> Result<u64, WeightError> {
        next.validate(bounds)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write()?;

        let previous = self.load()?;
        next.version = previous.weights.version + 1;
        let file = WeightFile {
            weights: next,
            signature: Some(signature),
            written_at: now,
        };
        let body = serde_json::to_vec_pretty(&file)?;

        {
            let mut tmp = File::create(&self.tmp_path)?;
            tmp.write_all(&body)?;
            tmp.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        // Persist the rename itself; not every platform allows syncing a directory.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(file.weights.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> TrainingSignature {
        TrainingSignature {
            sample_count: 40,
            filter_counts: FilterCounts::default(),
            schema_hash: "abc".to_string(),
            window_days: 7,
            previous_version: 0,
            trained_at: 1_000,
        }
    }

    #[test]
    fn test_default_weights_valid() {
        let w = WeightSet::default();
        w.validate(&WeightBounds::default()).unwrap();
        assert!((w.engine_sum() - 1.0).abs() < SUM_TOLERANCE);
    }

    #[test]
    fn test_sum_mismatch_rejected() {
        let mut w = WeightSet::default();
        w.engine.insert("model".to_string(), 0.30);
        assert!(matches!(
            w.validate(&WeightBounds::default()),
            Err(WeightError::SumMismatch { .. })
        ));
    }

    #[test]
    fn test_modifier_cannot_become_fifth_engine() {
        // Rescale so the sum still holds; the key alone must be refused
        let mut w = WeightSet::default();
        for v in w.engine.values_mut() {
            *v *= 0.8;
        }
        w.engine.insert("context_modifier".to_string(), 0.2);
        assert!(matches!(
            w.validate(&WeightBounds::default()),
            Err(WeightError::ReservedKey(_))
        ));
    }

    #[test]
    fn test_pillar_sum_checked() {
        let mut w = WeightSet::default();
        w.pillars
            .get_mut(&Category::Prop)
            .unwrap()
            .insert("usage".to_string(), 0.9);
        assert!(w.validate(&WeightBounds::unbounded()).is_err());
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::open(dir.path()).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.version, 0);
        assert_eq!(*snap, WeightSet::default());
    }

    #[test]
    fn test_replace_bumps_version_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::open(dir.path()).unwrap();

        let v1 = store
            .replace(WeightSet::default(), signature(), &WeightBounds::default(), 10)
            .unwrap();
        let v2 = store
            .replace(WeightSet::default(), signature(), &WeightBounds::default(), 20)
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let file = store.load().unwrap();
        assert_eq!(file.weights.version, 2);
        assert_eq!(file.written_at, 20);
        assert_eq!(file.signature.unwrap().sample_count, 40);
        assert!(!dir.path().join("weights.json.tmp").exists());
    }

    #[test]
    fn test_invalid_set_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::open(dir.path()).unwrap();
        store
            .replace(WeightSet::default(), signature(), &WeightBounds::default(), 10)
            .unwrap();
        let before = fs::read(store.path()).unwrap();

        let mut bad = WeightSet::default();
        bad.engine.insert("market".to_string(), 0.95);
        let err = store.replace(bad, signature(), &WeightBounds::default(), 11);
        assert!(err.is_err());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::open(dir.path()).unwrap();
        fs::write(store.path(), b"{\"weights\": ").unwrap();
        assert!(matches!(store.snapshot(), Err(WeightError::Encoding(_))));
    }
}
