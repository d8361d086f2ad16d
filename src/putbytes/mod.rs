//! Bulk transfer to the watch and the flows built on it.

pub mod app;
pub mod firmware;
pub mod session;

pub use app::{AppBundle, AppInstaller};
pub use firmware::{FirmwareBundle, FirmwareManifest, FirmwareUpdateStatus, FirmwareUpdater};
pub use session::{PutBytesSession, PutBytesTarget, SessionState};
