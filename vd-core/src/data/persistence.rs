//! Configuration persistence
//!
//! The engine only needs load/save access to the configuration document. The
//! JSON store keeps the whole document in one file and writes it atomically;
//! the memory store backs tests and embedded use.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};
use vd_error::{Result, VerdantError};

use super::types::VerdantConfig;

/// Read/write access to the persisted configuration
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<VerdantConfig>;

    fn save(&self, config: &VerdantConfig) -> Result<()>;

    /// Persist a controller's activation flag (load, update, save)
    fn set_active(&self, controller_id: &str, active: bool) -> Result<()> {
        let mut config = self.load()?;
        let controller = config
            .controller_mut(controller_id)
            .ok_or_else(|| VerdantError::ControllerNotFound(controller_id.to_string()))?;
        if controller.active == active {
            return Ok(());
        }
        controller.active = active;
        self.save(&config)
    }
}

/// Configuration kept in a single JSON file
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the backing file, if it exists
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<VerdantConfig> {
        if !self.path.exists() {
            debug!("No config file at {:?}, using defaults", self.path);
            return Ok(VerdantConfig::default());
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| VerdantError::FileRead {
            path: self.path.clone(),
            source: e,
        })?;
        let config: VerdantConfig = serde_json::from_str(&contents)?;

        info!(
            "Loaded config from {:?}: {} controllers, {} conditions, {} actions",
            self.path,
            config.controllers.len(),
            config.conditions.len(),
            config.actions.len()
        );
        Ok(config)
    }

    fn save(&self, config: &VerdantConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(config)?;

        // Atomic write - write to temp file then rename
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| VerdantError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.write_all(json.as_bytes()).map_err(|e| VerdantError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| VerdantError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| VerdantError::FileWrite {
            path: self.path.clone(),
            source: e,
        })?;

        debug!("Saved config to {:?}", self.path);
        Ok(())
    }
}

/// Configuration held in memory
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<VerdantConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: VerdantConfig) -> Self {
        Self { config: Mutex::new(config) }
    }

    /// Replace the stored document (simulates an external edit)
    pub fn replace(&self, config: VerdantConfig) {
        *self.config.lock() = config;
    }

    /// Apply an in-place edit to the stored document
    pub fn update(&self, f: impl FnOnce(&mut VerdantConfig)) {
        f(&mut self.config.lock());
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<VerdantConfig> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &VerdantConfig) -> Result<()> {
        *self.config.lock() = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{Controller, ControllerKind};
    use tempfile::TempDir;

    fn function(id: &str) -> Controller {
        Controller {
            id: id.to_string(),
            name: format!("Function {}", id),
            active: false,
            log_level_debug: false,
            period_sec: None,
            kind: ControllerKind::Function,
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = JsonConfigStore::new(dir.path().join("config.json"));
        let config = store.load().unwrap();
        assert!(config.controllers.is_empty());
        assert!(store.modified().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = JsonConfigStore::new(dir.path().join("nested").join("config.json"));
        let mut config = VerdantConfig::default();
        config.controllers.push(function("f1"));
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
        assert!(!dir.path().join("nested").join("config.json.tmp").exists());
    }

    #[test]
    fn test_malformed_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonConfigStore::new(&path);
        assert!(matches!(store.load(), Err(VerdantError::JsonParse(_))));
    }

    #[test]
    fn test_set_active_persists() {
        let mut config = VerdantConfig::default();
        config.controllers.push(function("f1"));
        let store = MemoryConfigStore::new(config);

        store.set_active("f1", true).unwrap();
        assert!(store.load().unwrap().controller("f1").unwrap().active);
        assert!(matches!(
            store.set_active("missing", true),
            Err(VerdantError::ControllerNotFound(_))
        ));
    }
}
