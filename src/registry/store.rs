//! Persisted known-device metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::transport::TransportId;

/// A watch the user has paired with at some point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: TransportId,
    pub name: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub firmware_version: String,
    /// Raw hardware platform id
    #[serde(default)]
    pub platform: u8,
    #[serde(default)]
    pub last_connected_ms: Option<i64>,
    /// Reconnect whenever the watch is reachable
    #[serde(default)]
    pub connect_goal: bool,
}

impl KnownDevice {
    pub fn new(id: TransportId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            serial: String::new(),
            firmware_version: String::new(),
            platform: 0,
            last_connected_ms: None,
            connect_goal: false,
        }
    }
}

#[async_trait]
pub trait KnownDeviceStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<KnownDevice>>;

    async fn upsert(&self, device: KnownDevice) -> Result<()>;

    async fn remove(&self, id: &TransportId) -> Result<()>;
}

/// Store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<BTreeMap<TransportId, KnownDevice>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = KnownDevice>) -> Self {
        let store = Self::new();
        store
            .devices
            .lock()
            .extend(devices.into_iter().map(|d| (d.id.clone(), d)));
        store
    }

    pub fn get(&self, id: &TransportId) -> Option<KnownDevice> {
        self.devices.lock().get(id).cloned()
    }
}

#[async_trait]
impl KnownDeviceStore for MemoryDeviceStore {
    async fn list(&self) -> Result<Vec<KnownDevice>> {
        Ok(self.devices.lock().values().cloned().collect())
    }

    async fn upsert(&self, device: KnownDevice) -> Result<()> {
        self.devices.lock().insert(device.id.clone(), device);
        Ok(())
    }

    async fn remove(&self, id: &TransportId) -> Result<()> {
        self.devices.lock().remove(id);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceFile {
    version: u32,
    devices: Vec<KnownDevice>,
}

/// JSON file store. Every mutation rewrites the whole file via a temp file
/// and rename, so a crash leaves either the old or the new list.
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    // serializes read-modify-write of the file
    lock: tokio::sync::Mutex<()>,
}

impl JsonDeviceStore {
    const FORMAT_VERSION: u32 = 1;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<KnownDevice>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: DeviceFile = serde_json::from_slice(&raw)?;
        if file.version > Self::FORMAT_VERSION {
            return Err(LinkError::Store(format!(
                "{} has format version {}, newer than supported {}",
                self.path.display(),
                file.version,
                Self::FORMAT_VERSION
            )));
        }
        Ok(file.devices)
    }

    async fn save(&self, mut devices: Vec<KnownDevice>) -> Result<()> {
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        let file = DeviceFile {
            version: Self::FORMAT_VERSION,
            devices,
        };
        let json = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_file = self.path.with_extension("tmp");
        tokio::fs::write(&temp_file, &json).await?;
        tokio::fs::rename(&temp_file, &self.path).await?;
        debug!(path = %self.path.display(), count = file.devices.len(), "saved known devices");
        Ok(())
    }
}

#[async_trait]
impl KnownDeviceStore for JsonDeviceStore {
    async fn list(&self) -> Result<Vec<KnownDevice>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn upsert(&self, device: KnownDevice) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut devices = self.load().await?;
        devices.retain(|d| d.id != device.id);
        devices.push(device);
        self.save(devices).await
    }

    async fn remove(&self, id: &TransportId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut devices = self.load().await?;
        let before = devices.len();
        devices.retain(|d| &d.id != id);
        if devices.len() == before {
            return Ok(());
        }
        self.save(devices).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(addr: &str) -> KnownDevice {
        let mut d = KnownDevice::new(TransportId::Ble(addr.into()), "Pebble Time 1A2B");
        d.serial = "Q402445E009M".into();
        d.firmware_version = "v4.4.0".into();
        d.connect_goal = true;
        d
    }

    #[tokio::test]
    async fn test_json_store_roundtrip_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = JsonDeviceStore::new(dir.path().join("nested").join("devices.json"));
        assert!(store.list().await.unwrap().is_empty());

        store.upsert(device("AA")).await.unwrap();
        store.upsert(device("BB")).await.unwrap();
        let mut updated = device("AA");
        updated.firmware_version = "v4.4.1".into();
        store.upsert(updated.clone()).await.unwrap();

        let reopened = JsonDeviceStore::new(store.path().to_path_buf());
        let list = reopened.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], updated);
        assert!(!store.path().with_extension("tmp").exists());

        reopened.remove(&TransportId::Ble("AA".into())).await.unwrap();
        reopened.remove(&TransportId::Ble("missing".into())).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![device("BB")]);
    }

    #[tokio::test]
    async fn test_json_store_rejects_newer_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, r#"{"version": 99, "devices": []}"#).unwrap();
        let store = JsonDeviceStore::new(path);
        assert!(matches!(store.list().await, Err(LinkError::Store(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryDeviceStore::with_devices([device("AA")]);
        store.upsert(device("BB")).await.unwrap();
        store.remove(&TransportId::Ble("AA".into())).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![device("BB")]);
        assert!(store.get(&TransportId::Ble("BB".into())).is_some());
    }
}
