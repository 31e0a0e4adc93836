//! Device registry
//!
//! Holds the validated configuration as an immutable snapshot. Loops take an
//! `Arc<Snapshot>` when they (re)initialize and keep using it until the next
//! refresh, so a reload never changes configuration under a running unit of
//! work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};
use vd_error::Result;

use crate::data::{validate_document, Channel, ConfigStore, VerdantConfig};
use crate::engine::ControllerStatus;
use crate::measurement::ConversionResolver;

/// One validated configuration generation
#[derive(Debug)]
pub struct Snapshot {
    pub config: VerdantConfig,
    pub conversions: ConversionResolver,
    pub loaded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(config: VerdantConfig) -> Result<Self> {
        validate_document(&config)?;
        let conversions = ConversionResolver::new(&config.conversions)?;
        Ok(Self {
            config,
            conversions,
            loaded_at: Utc::now(),
        })
    }

    /// Converted value and unit for a raw channel reading
    pub fn convert_channel(&self, channel: &Channel, raw: f64) -> Result<(f64, String)> {
        match &channel.conversion_id {
            Some(id) => {
                let value = self.conversions.convert(id, raw)?;
                let unit = self.conversions.target_unit(id).unwrap_or(&channel.unit).to_string();
                Ok((value, unit))
            }
            None => Ok((raw, channel.unit.clone())),
        }
    }
}

/// Source of configuration snapshots
pub struct DeviceRegistry {
    store: Arc<dyn ConfigStore>,
    current: RwLock<Arc<Snapshot>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("loaded_at", &self.current.read().loaded_at)
            .finish()
    }
}

impl DeviceRegistry {
    /// Load and validate the initial snapshot
    pub fn load(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let snapshot = Snapshot::new(store.load()?)?;
        info!(
            "REGISTRY: Loaded {} controllers, {} channels",
            snapshot.config.controllers.len(),
            snapshot.config.channels.len()
        );
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Reload from the store; an invalid document leaves the current snapshot in place
    pub fn refresh(&self) -> Result<Arc<Snapshot>> {
        let snapshot = match self.store.load().and_then(Snapshot::new) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("REGISTRY: Reload rejected, keeping previous configuration: {}", e);
                return Err(e);
            }
        };
        *self.current.write() = snapshot.clone();
        Ok(snapshot)
    }

    /// Persist a controller's active flag and reload
    pub fn set_active(&self, controller_id: &str, active: bool) -> Result<Arc<Snapshot>> {
        self.store.set_active(controller_id, active)?;
        self.refresh()
    }
}

/// Activation as persisted in the current snapshot
impl ControllerStatus for DeviceRegistry {
    fn is_active(&self, controller_id: &str) -> Option<bool> {
        self.current.read().config.controller(controller_id).map(|c| c.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Controller, ControllerKind, Conversion, MemoryConfigStore};

    fn config() -> VerdantConfig {
        let mut config = VerdantConfig::default();
        config.controllers.push(Controller {
            id: "f1".into(),
            name: "f1".into(),
            active: false,
            log_level_debug: false,
            period_sec: None,
            kind: ControllerKind::Function,
        });
        config.conversions.push(Conversion {
            id: "mc".into(),
            from_unit: "mC".into(),
            to_unit: "C".into(),
            equation: "x / 1000".into(),
        });
        config
    }

    #[test]
    fn test_refresh_and_set_active() {
        let store = Arc::new(MemoryConfigStore::new(config()));
        let registry = DeviceRegistry::load(store.clone()).unwrap();
        let first = registry.snapshot();
        assert!(!first.config.controller("f1").unwrap().active);

        let second = registry.set_active("f1", true).unwrap();
        assert!(second.config.controller("f1").unwrap().active);
        assert_eq!(registry.is_active("f1"), Some(true));
        assert_eq!(registry.is_active("ghost"), None);
        // The earlier snapshot is untouched
        assert!(!first.config.controller("f1").unwrap().active);
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let store = Arc::new(MemoryConfigStore::new(config()));
        let registry = DeviceRegistry::load(store.clone()).unwrap();
        store.update(|c| c.controllers.push(c.controllers[0].clone()));
        assert!(registry.refresh().is_err());
        assert_eq!(registry.snapshot().config.controllers.len(), 1);
    }

    #[test]
    fn test_convert_channel() {
        let snapshot = Snapshot::new(config()).unwrap();
        let channel = Channel {
            device_id: "in".into(),
            channel: 0,
            measurement: "temperature".into(),
            unit: "mC".into(),
            conversion_id: Some("mc".into()),
            enabled: true,
            name: None,
        };
        assert_eq!(snapshot.convert_channel(&channel, 21500.0).unwrap(), (21.5, "C".to_string()));
    }
}
