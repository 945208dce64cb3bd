//! Checkpoint persistence and resume
//!
//! A checkpoint is one safetensors file `iter_<N>.safetensors` holding the
//! network parameters (under `network.`) and the optimizer moments (under
//! `optim.`), plus a `manifest.json` pointer naming the latest record. The
//! manifest is the single source of truth for resume; filenames are never
//! parsed. Records are superseded, not deleted.
//!
//! There is no corruption detection: a truncated file fails the subsequent
//! restore fatally rather than falling back to an older record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::optim::AdamW;

const MANIFEST_FILE: &str = "manifest.json";
const NETWORK_PREFIX: &str = "network.";
const OPTIM_PREFIX: &str = "optim.";

/// Pointer to the latest checkpoint record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Iteration index the record was saved at
    pub iteration: usize,
    /// Record filename inside the checkpoint directory
    pub file: String,
    /// Optimizer step count at save time
    pub optimizer_step: usize,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
}

/// Persists and restores (network, optimizer, iteration) snapshots
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Write a record tagged with `iteration` and repoint the manifest at it.
    pub fn save(&self, iteration: usize, varmap: &VarMap, optimizer: &AdamW) -> Result<PathBuf> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();

        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            tensors.insert(format!("{NETWORK_PREFIX}{name}"), var.as_tensor().clone());
        }
        drop(data);

        for (name, tensor) in optimizer.export_state() {
            tensors.insert(format!("{OPTIM_PREFIX}{name}"), tensor);
        }

        let file = format!("iter_{iteration}.safetensors");
        let path = self.dir.join(&file);
        candle_core::safetensors::save(&tensors, &path)?;

        let manifest = CheckpointManifest {
            iteration,
            file,
            optimizer_step: optimizer.step_count(),
            saved_at: Utc::now(),
        };
        std::fs::write(self.manifest_path(), serde_json::to_string_pretty(&manifest)?)?;

        info!(iteration, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Resolve the latest record, or `None` when the store has never saved.
    pub fn find_latest(&self) -> Result<Option<CheckpointManifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest: CheckpointManifest = serde_json::from_str(&text).map_err(|e| {
            Error::checkpoint(format!("manifest {} is unreadable: {}", path.display(), e))
        })?;
        Ok(Some(manifest))
    }

    /// Restore network and optimizer state from the record behind `manifest`.
    ///
    /// A missing tensor or shape mismatch is fatal; there is no fallback to
    /// an earlier record or a cold start.
    pub fn restore(
        &self,
        manifest: &CheckpointManifest,
        varmap: &VarMap,
        optimizer: &mut AdamW,
        device: &Device,
    ) -> Result<()> {
        let path = self.dir.join(&manifest.file);
        let tensors = candle_core::safetensors::load(&path, device).map_err(|e| {
            Error::checkpoint(format!("cannot read checkpoint {}: {}", path.display(), e))
        })?;

        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            let key = format!("{NETWORK_PREFIX}{name}");
            let tensor = tensors.get(&key).ok_or_else(|| {
                Error::checkpoint(format!("checkpoint is missing tensor `{key}`"))
            })?;
            var.set(tensor).map_err(|e| {
                Error::checkpoint(format!("cannot restore parameter `{name}`: {e}"))
            })?;
        }
        drop(data);

        let optim_state: HashMap<String, Tensor> = tensors
            .into_iter()
            .filter_map(|(key, tensor)| {
                key.strip_prefix(OPTIM_PREFIX)
                    .map(|name| (name.to_string(), tensor))
            })
            .collect();
        optimizer.import_state(optim_state, manifest.optimizer_step)?;

        info!(iteration = manifest.iteration, "checkpoint restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::ParamsAdamW;
    use candle_core::Var;
    use tempfile::TempDir;

    fn varmap_with(name: &str, values: &[f32]) -> (VarMap, Var) {
        let varmap = VarMap::new();
        let var = Var::new(values, &Device::Cpu).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .insert(name.to_string(), var.clone());
        (varmap, var)
    }

    fn stepped_optimizer(varmap: &VarMap, var: &Var, steps: usize) -> AdamW {
        let mut optimizer = AdamW::new(varmap, ParamsAdamW::default());
        for _ in 0..steps {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            optimizer.step(&grads).unwrap();
        }
        optimizer
    }

    #[test]
    fn test_find_latest_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path()).unwrap();
        assert!(store.find_latest().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_reproduces_state() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path()).unwrap();

        let (varmap, var) = varmap_with("w", &[1.0, 2.0, 3.0]);
        let optimizer = stepped_optimizer(&varmap, &var, 5);
        let trained_values = var.as_tensor().to_vec1::<f32>().unwrap();

        let path = store.save(40, &varmap, &optimizer).unwrap();
        assert!(path.exists());
        assert!(path.ends_with("iter_40.safetensors"));

        // Fresh network and optimizer with the same parameter layout.
        let (varmap2, var2) = varmap_with("w", &[0.0, 0.0, 0.0]);
        let mut optimizer2 = AdamW::new(&varmap2, ParamsAdamW::default());

        let manifest = store.find_latest().unwrap().unwrap();
        assert_eq!(manifest.iteration, 40);
        assert_eq!(manifest.optimizer_step, 5);

        store
            .restore(&manifest, &varmap2, &mut optimizer2, &Device::Cpu)
            .unwrap();
        assert_eq!(var2.as_tensor().to_vec1::<f32>().unwrap(), trained_values);
        assert_eq!(optimizer2.step_count(), 5);
    }

    #[test]
    fn test_later_save_supersedes_earlier() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path()).unwrap();

        let (varmap, var) = varmap_with("w", &[1.0]);
        let optimizer = stepped_optimizer(&varmap, &var, 1);

        store.save(10, &varmap, &optimizer).unwrap();
        store.save(20, &varmap, &optimizer).unwrap();

        let manifest = store.find_latest().unwrap().unwrap();
        assert_eq!(manifest.iteration, 20);
        // Earlier record is superseded, not deleted.
        assert!(dir.path().join("iter_10.safetensors").exists());
    }

    #[test]
    fn test_restore_missing_tensor_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path()).unwrap();

        let (varmap, var) = varmap_with("w", &[1.0]);
        let optimizer = stepped_optimizer(&varmap, &var, 1);
        store.save(5, &varmap, &optimizer).unwrap();

        // A network with a parameter the record never saw.
        let (varmap2, _var2) = varmap_with("other", &[1.0]);
        let mut optimizer2 = AdamW::new(&varmap2, ParamsAdamW::default());

        let manifest = store.find_latest().unwrap().unwrap();
        let err = store
            .restore(&manifest, &varmap2, &mut optimizer2, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn test_corrupt_manifest_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path()).unwrap();
        std::fs::write(dir.path().join("manifest.json"), "not json").unwrap();
        assert!(matches!(
            store.find_latest().unwrap_err(),
            Error::Checkpoint(_)
        ));
    }
}
