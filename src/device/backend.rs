//! Backend seam and the scheme → factory registry.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use super::DeviceId;
use crate::error::{AppResult, SpectroError};
use crate::hardware::mock::MockSpectrometer;
use crate::messages::ControlObject;
use crate::reading::Reading;

/// Hardware, simulation or replay source behind a [`DeviceSession`](super::DeviceSession).
///
/// Implementations own their transport exclusively. A backend whose I/O
/// blocks should push it onto `spawn_blocking` itself.
#[async_trait]
pub trait SpectrometerBackend: Send {
    /// Short name for logs, e.g. `mock`.
    fn name(&self) -> &str;

    /// Open the transport.
    async fn connect(&mut self) -> Result<()>;

    /// Raw EEPROM pages, at least six of them.
    async fn read_eeprom_pages(&mut self) -> Result<Vec<Vec<u8>>>;

    /// One frame. `Ok(None)` means nothing was available this time.
    async fn acquire(&mut self) -> Result<Option<Reading>>;

    /// Push one validated setting to the device. An error means the device
    /// did not take it.
    async fn apply_setting(&mut self, cmd: &ControlObject) -> Result<()>;

    /// Release the transport. The default does nothing.
    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

type BackendFactory = Box<dyn Fn(&DeviceId) -> Result<Box<dyn SpectrometerBackend>> + Send + Sync>;

/// Maps a device identifier scheme to a backend constructor.
///
/// Built once at startup and shared read-only afterwards.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// A registry with no schemes.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in `mock` scheme.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("mock", |id| {
            Ok(Box::new(MockSpectrometer::from_address(&id.address)?) as Box<dyn SpectrometerBackend>)
        });
        registry
    }

    /// Add or replace the factory for `scheme` (case-insensitive).
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&DeviceId) -> Result<Box<dyn SpectrometerBackend>> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_lowercase(), Box::new(factory));
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<_> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Build a backend for `id`. Unknown schemes are `UnsupportedDevice`.
    pub fn create(&self, id: &DeviceId) -> AppResult<Box<dyn SpectrometerBackend>> {
        let factory = self
            .factories
            .get(&id.scheme)
            .ok_or_else(|| SpectroError::UnsupportedDevice(id.to_string()))?;
        Ok(factory(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_mock() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.schemes(), vec!["mock"]);
        let backend = registry.create(&"mock:SN-1".parse().unwrap()).unwrap();
        assert_eq!(backend.name(), "mock");
    }

    #[test]
    fn unknown_scheme_is_unsupported() {
        let registry = BackendRegistry::with_defaults();
        let err = registry
            .create(&"usb:0x24aa:0x1000".parse().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, SpectroError::UnsupportedDevice(id) if id == "usb:0x24aa:0x1000"));
    }
}
