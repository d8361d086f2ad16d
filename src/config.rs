//! Runtime configuration.
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! the defaults below.
//!
//! ```toml
//! [registry]
//! multiple_connected_watches = true
//!
//! [blobdb]
//! response_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::ppog::packet::MAX_WINDOW;
use crate::protocol::putbytes::MAX_CHUNK_LEN;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub registry: RegistryConfig,
    pub connection: ConnectionConfig,
    pub ppog: PpogConfig,
    pub blobdb: BlobDbConfig,
    pub putbytes: PutBytesConfig,
    pub firmware: FirmwareConfig,
}

impl LinkConfig {
    /// `~/.config/watchlink/config.toml` (platform equivalent elsewhere)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("watchlink").join("config.toml"))
    }

    /// Where the JSON known-device store lives by default.
    pub fn default_store_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("watchlink").join("known_devices.json"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| LinkError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ppog.mtu < 20 {
            return Err(LinkError::Config(format!(
                "ppog.mtu must be at least 20, got {}",
                self.ppog.mtu
            )));
        }
        if self.ppog.max_window == 0 || self.ppog.max_window > MAX_WINDOW {
            return Err(LinkError::Config(format!(
                "ppog.max_window must be in 1..={MAX_WINDOW}, got {}",
                self.ppog.max_window
            )));
        }
        if self.ppog.channel_size == 0 {
            return Err(LinkError::Config("ppog.channel_size must be non-zero".into()));
        }
        if self.putbytes.chunk_size == 0 || self.putbytes.chunk_size > MAX_CHUNK_LEN {
            return Err(LinkError::Config(format!(
                "putbytes.chunk_size must be in 1..={MAX_CHUNK_LEN}, got {}",
                self.putbytes.chunk_size
            )));
        }
        if self.blobdb.poll_interval_ms == 0 {
            return Err(LinkError::Config("blobdb.poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Allow more than one watch to hold a session at once
    pub multiple_connected_watches: bool,

    /// Upper bound on session cleanup before it force-completes
    pub disconnect_timeout_ms: u64,

    /// Pause after a session ends before the same watch is retried
    pub reconnect_delay_ms: u64,
}

impl RegistryConfig {
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            multiple_connected_watches: false,
            disconnect_timeout_ms: 3_000,
            reconnect_delay_ms: 0,
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport open budget
    pub connect_timeout_ms: u64,

    /// Handshake budget (stream reset + watch version exchange)
    pub negotiation_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            negotiation_timeout_ms: 15_000,
        }
    }
}

// =============================================================================
// PPoG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpogConfig {
    /// Negotiated ATT MTU; data payload is `mtu - 4`
    pub mtu: usize,

    /// Largest window offered during reset
    pub max_window: u8,

    pub retransmit_timeout_ms: u64,

    /// Consecutive timeouts before the stream gives up
    pub max_retransmits: u32,

    /// Capacity of inbound/outbound/delivered channels
    pub channel_size: usize,
}

impl PpogConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(4).max(1)
    }
}

impl Default for PpogConfig {
    fn default() -> Self {
        Self {
            mtu: 185,
            max_window: MAX_WINDOW,
            retransmit_timeout_ms: 2_000,
            max_retransmits: 5,
            channel_size: 64,
        }
    }
}

// =============================================================================
// BlobDB
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobDbConfig {
    pub response_timeout_ms: u64,

    /// Dirty queries are forcibly re-run this often
    pub query_refresh_period_secs: u64,

    pub poll_interval_ms: u64,

    /// Delay between seeing a change and acting on it
    pub debounce_ms: u64,

    /// Local records older than this are evicted before syncing
    pub stale_horizon_hours: u64,

    /// Budget for watch-authoritative databases to report sync done
    pub initial_sync_timeout_ms: u64,

    /// Log record contents instead of key/hash summaries
    pub log_record_contents: bool,
}

impl BlobDbConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn query_refresh_period(&self) -> Duration {
        Duration::from_secs(self.query_refresh_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stale_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_horizon_hours.saturating_mul(3600))
    }

    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_sync_timeout_ms)
    }
}

impl Default for BlobDbConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            query_refresh_period_secs: 3_600,
            poll_interval_ms: 500,
            debounce_ms: 1_000,
            stale_horizon_hours: 168,
            initial_sync_timeout_ms: 10_000,
            log_record_contents: false,
        }
    }
}

// =============================================================================
// PutBytes / Firmware
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PutBytesConfig {
    pub chunk_size: usize,
    pub response_timeout_ms: u64,
}

impl PutBytesConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for PutBytesConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2_000,
            response_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// How long to wait for the watch to drop the link after install
    pub reboot_timeout_ms: u64,
}

impl FirmwareConfig {
    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_timeout_ms)
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            reboot_timeout_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.blobdb.response_timeout(), Duration::from_secs(10));
        assert_eq!(config.blobdb.query_refresh_period(), Duration::from_secs(3600));
        assert_eq!(config.blobdb.debounce(), Duration::from_secs(1));
        assert_eq!(config.registry.disconnect_timeout(), Duration::from_secs(3));
        assert_eq!(config.putbytes.chunk_size, 2000);
        assert_eq!(config.firmware.reboot_timeout(), Duration::from_secs(60));
        assert!(!config.registry.multiple_connected_watches);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LinkConfig::from_toml_str(
            r#"
            [registry]
            multiple_connected_watches = true

            [blobdb]
            response_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert!(config.registry.multiple_connected_watches);
        assert_eq!(config.registry.disconnect_timeout_ms, 3_000);
        assert_eq!(config.blobdb.response_timeout(), Duration::from_millis(250));
        assert_eq!(config.blobdb.debounce_ms, 1_000);
        assert_eq!(config.ppog, PpogConfig::default());
    }

    #[test]
    fn test_chunk_size_must_fit_one_frame() {
        let largest = format!("[putbytes]\nchunk_size = {MAX_CHUNK_LEN}\n");
        assert!(LinkConfig::from_toml_str(&largest).is_ok());
        let over = format!("[putbytes]\nchunk_size = {}\n", MAX_CHUNK_LEN + 1);
        assert!(matches!(LinkConfig::from_toml_str(&over), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_window() {
        let err = LinkConfig::from_toml_str("[ppog]\nmax_window = 40\n").unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(LinkConfig::from_toml_str("registry = 3").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[putbytes]\nchunk_size = 512").unwrap();
        let config = LinkConfig::load(file.path()).unwrap();
        assert_eq!(config.putbytes.chunk_size, 512);

        let missing = file.path().with_extension("missing");
        assert_eq!(
            LinkConfig::load_or_default(&missing).unwrap(),
            LinkConfig::default()
        );
    }
}
