//! Named weight-group persistence.
//!
//! Weights are stored as `.npz` archives of named arrays, one entry per
//! parameter, with `/`-separated group paths (for example
//! `backbone/stage2/block0/conv1/kernel`). Loads support two layouts: a flat
//! one where entries carry the plain group path, and a nested one where every
//! entry is additionally prefixed with `model_weights/`. Partial loads can
//! exclude whole groups by name prefix, which is how transfer learning from a
//! differently-headed checkpoint works.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use ndarray::{Array, ArrayD, ArrayViewMutD, Dimension};
use ndarray_npy::{NpzReader, NpzWriter};

/// Prefix used by the nested weight layout.
const NESTED_PREFIX: &str = "model_weights/";

/// Implemented by every layer and module that carries weights.
///
/// `prefix` is the `/`-separated path of the implementor within the model;
/// implementors append their own parameter names below it.
pub trait Weights {
    fn export(&self, prefix: &str, store: &mut WeightStore);
    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog);
}

/// An in-memory collection of named weight arrays.
#[derive(Default)]
pub struct WeightStore {
    map: BTreeMap<String, ArrayD<f32>>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<D: Dimension>(&mut self, name: impl Into<String>, value: Array<f32, D>) {
        self.map.insert(name.into(), value.into_dyn());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }

    /// Looks a parameter up by its flat name, tolerating the nested layout.
    fn lookup(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.map
            .get(name)
            .or_else(|| self.map.get(&format!("{NESTED_PREFIX}{name}")))
    }

    /// Copies the named parameter into `dst`, recording a missing entry or a
    /// shape mismatch in `log` instead of failing immediately, so that one
    /// load reports every problem at once.
    pub fn take_into(&self, name: &str, mut dst: ArrayViewMutD<'_, f32>, log: &mut ImportLog) {
        match self.lookup(name) {
            None => log.missing.push(name.to_string()),
            Some(src) if src.shape() != dst.shape() => {
                log.mismatched
                    .push(format!("{name}: stored {:?}, model {:?}", src.shape(), dst.shape()));
            }
            Some(src) => dst.assign(src),
        }
    }

    /// Writes the store to an `.npz` archive at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to create checkpoint {}", path.display()))?;
        let mut npz = NpzWriter::new(file);
        for (name, array) in &self.map {
            npz.add_array(name.as_str(), array)
                .with_context(|| format!("failed to write weight group {name}"))?;
        }
        npz.finish()
            .with_context(|| format!("failed to finish checkpoint {}", path.display()))?;
        debug!("saved {} weight groups to {}", self.map.len(), path.display());
        Ok(())
    }

    /// Reads an `.npz` archive from `path`. A missing file is an error, never
    /// a silent fall-back to fresh weights.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("checkpoint {} not found", path.display()))?;
        let mut npz = NpzReader::new(file)
            .with_context(|| format!("{} is not a readable npz archive", path.display()))?;
        let names = npz.names()?;
        let mut map = BTreeMap::new();
        for name in names {
            let array: ArrayD<f32> = npz
                .by_name(&name)
                .with_context(|| format!("failed to read weight group {name}"))?;
            let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();
            map.insert(key, array);
        }
        debug!("loaded {} weight groups from {}", map.len(), path.display());
        Ok(Self { map })
    }
}

/// Collects the problems of one import pass.
#[derive(Default)]
pub struct ImportLog {
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
}

impl ImportLog {
    /// Fails if any parameter was missing or had the wrong shape.
    pub fn finish(self) -> Result<()> {
        if !self.mismatched.is_empty() {
            bail!("weight shape mismatches: {}", self.mismatched.join("; "));
        }
        if !self.missing.is_empty() {
            warn!("{} weight groups missing from checkpoint", self.missing.len());
            bail!("missing weight groups: {}", self.missing.join(", "));
        }
        Ok(())
    }
}

/// Returns whether a weight-group path is covered by any of the excluded
/// prefixes.
pub fn excluded(prefix: &str, exclude: &[&str]) -> bool {
    exclude
        .iter()
        .any(|e| prefix == *e || prefix.starts_with(&format!("{e}/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn take_into_reports_missing_and_mismatch() {
        let mut store = WeightStore::new();
        store.put("a/kernel", arr2(&[[1.0_f32, 2.0]]));

        let mut log = ImportLog::default();
        let mut wrong_shape = arr1(&[0.0_f32; 3]);
        store.take_into("a/kernel", wrong_shape.view_mut().into_dyn(), &mut log);
        let mut absent = arr1(&[0.0_f32; 2]);
        store.take_into("a/bias", absent.view_mut().into_dyn(), &mut log);

        assert_eq!(log.mismatched.len(), 1);
        assert_eq!(log.missing, vec!["a/bias".to_string()]);
        assert!(log.finish().is_err());
    }

    #[test]
    fn nested_layout_is_found() {
        let mut store = WeightStore::new();
        store.put("model_weights/a/bias", arr1(&[3.0_f32]));

        let mut log = ImportLog::default();
        let mut dst = arr1(&[0.0_f32]);
        store.take_into("a/bias", dst.view_mut().into_dyn(), &mut log);
        log.finish().unwrap();
        assert_eq!(dst[0], 3.0);
    }

    #[test]
    fn excluded_matches_whole_groups_only() {
        assert!(excluded("heads/class", &["heads"]));
        assert!(excluded("heads", &["heads"]));
        assert!(!excluded("headstock", &["heads"]));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join("mask_rcnn_ckpt_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.npz");

        let mut store = WeightStore::new();
        store.put("x/kernel", arr2(&[[1.0_f32, 2.0], [3.0, 4.0]]));
        store.put("x/bias", arr1(&[0.5_f32, -0.5]));
        store.save(&path).unwrap();

        let loaded = WeightStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let mut dst = arr1(&[0.0_f32, 0.0]);
        let mut log = ImportLog::default();
        loaded.take_into("x/bias", dst.view_mut().into_dyn(), &mut log);
        log.finish().unwrap();
        assert_eq!(dst, arr1(&[0.5, -0.5]));
    }

    #[test]
    fn loading_missing_file_fails() {
        assert!(WeightStore::load("/nonexistent/path/weights.npz").is_err());
    }
}
