//! watchlink - connection and synchronization core for a wearable companion.
//!
//! Layers, leaves first:
//!
//! - [`transport`]: abstract byte channel to one physical watch
//! - [`ppog`]: reliable, ordered stream over MTU-limited characteristic writes
//! - [`protocol`]: endpoint-tagged wire packets and inbound routing
//! - [`services`]: request/response correlation per endpoint
//! - [`connection`]: per-watch session state machine
//! - [`registry`]: candidate set, connect arbitration and persistence
//! - [`blobdb`]: record-source reconciliation against the watch databases
//! - [`putbytes`]: bulk transfer, firmware update and app sideloading
//!
//! The [`simulator`] module speaks the watch side of the same wire protocol and
//! backs the integration tests and the `watchlink-sim` binary.

pub mod blobdb;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod ppog;
pub mod protocol;
pub mod putbytes;
pub mod registry;
pub mod services;
pub mod simulator;
pub mod transport;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::LinkConfig;
pub use error::{ErrorTracker, LinkError, Result, UserFacingError};
pub use transport::TransportId;
