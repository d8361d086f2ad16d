//! One PutBytes transfer at a time per connection.
//!
//! Init returns the watch's cookie; data follows in fixed-size chunks while a
//! CRC32 accumulates; commit carries the CRC for verification on the watch.
//! Any failure after init sends an abort for the cookie.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PutBytesConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{ObjectType, PutBytesCommand};
use crate::services::putbytes::PutBytesService;

/// What the watch should do with the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBytesTarget {
    /// Firmware, resources and plain files
    Object {
        object_type: ObjectType,
        bank: u8,
        filename: String,
    },
    /// Part of an installed app
    App { object_type: ObjectType, app_id: u32 },
}

impl PutBytesTarget {
    fn init(&self, size: u32) -> PutBytesCommand {
        match self {
            Self::Object {
                object_type,
                bank,
                filename,
            } => PutBytesCommand::Init {
                size,
                object_type: *object_type,
                bank: *bank,
                filename: filename.clone(),
            },
            Self::App {
                object_type,
                app_id,
            } => PutBytesCommand::AppInit {
                size,
                object_type: *object_type,
                app_id: *app_id,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open { cookie: u32 },
    Sending { cookie: u32, sent: u64 },
    Finished { cookie: u32 },
}

pub struct PutBytesSession {
    service: Arc<PutBytesService>,
    config: PutBytesConfig,
    active: Mutex<()>,
    current: watch::Sender<Option<u32>>,
}

impl PutBytesSession {
    pub fn new(service: Arc<PutBytesService>, config: PutBytesConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            service,
            config,
            active: Mutex::new(()),
            current,
        }
    }

    /// Cookie of the transfer in progress, if any.
    pub fn current_cookie(&self) -> watch::Receiver<Option<u32>> {
        self.current.subscribe()
    }

    /// Send `data` as one object of declared `size` and commit it.
    ///
    /// `size` may exceed `data.len()` when resuming: the watch already holds
    /// the leading bytes. Fails with `Busy` if another transfer is running,
    /// `Cancelled` on cancellation, and `TransferFailed` carrying the bytes
    /// sent in this session for anything else.
    pub async fn transfer(
        &self,
        target: PutBytesTarget,
        size: u32,
        data: &[u8],
        install: bool,
        cancel: &CancellationToken,
        mut on_state: impl FnMut(SessionState) + Send,
    ) -> Result<u32> {
        let Ok(_active) = self.active.try_lock() else {
            return Err(LinkError::Busy("PutBytes session"));
        };

        let mut cookie = None;
        let mut sent = 0u64;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            r = self.run(&target, size, data, install, &mut cookie, &mut sent, &mut on_state) => r,
        };
        self.current.send_replace(None);

        match result {
            Ok(cookie) => Ok(cookie),
            Err(e) => {
                if let Some(cookie) = cookie {
                    debug!(cookie, "aborting PutBytes session");
                    if let Err(abort) = self.service.send(PutBytesCommand::Abort { cookie }).await {
                        debug!(cookie, "abort not delivered: {abort}");
                    }
                }
                match e {
                    LinkError::Cancelled => Err(LinkError::Cancelled),
                    other => {
                        warn!(sent, "PutBytes transfer failed: {other}");
                        Err(LinkError::TransferFailed {
                            message: other.to_string(),
                            bytes_transferred: sent,
                        })
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        target: &PutBytesTarget,
        size: u32,
        data: &[u8],
        install: bool,
        cookie_out: &mut Option<u32>,
        sent: &mut u64,
        on_state: &mut (impl FnMut(SessionState) + Send),
    ) -> Result<u32> {
        let cookie = self.expect_ack(target.init(size), None).await?;
        *cookie_out = Some(cookie);
        self.current.send_replace(Some(cookie));
        on_state(SessionState::Open { cookie });
        debug!(cookie, size, ?target, "PutBytes session open");

        let mut crc = crc32fast::Hasher::new();
        for chunk in data.chunks(self.config.chunk_size.max(1)) {
            crc.update(chunk);
            let put = PutBytesCommand::Put {
                cookie,
                data: Bytes::copy_from_slice(chunk),
            };
            self.expect_ack(put, Some(cookie)).await?;
            *sent += chunk.len() as u64;
            on_state(SessionState::Sending {
                cookie,
                sent: *sent,
            });
        }

        let crc = crc.finalize();
        self.expect_ack(PutBytesCommand::Commit { cookie, crc }, Some(cookie))
            .await?;
        if install {
            self.install(cookie).await?;
        }
        on_state(SessionState::Finished { cookie });
        info!(cookie, bytes = *sent, crc = %format!("{crc:08x}"), "PutBytes transfer committed");
        Ok(cookie)
    }

    /// Ask the watch to install a committed object.
    pub async fn install(&self, cookie: u32) -> Result<()> {
        // the watch does not always echo the cookie on install
        self.expect_ack(PutBytesCommand::Install { cookie }, None)
            .await
            .map(|_| ())
    }

    async fn expect_ack(&self, command: PutBytesCommand, cookie: Option<u32>) -> Result<u32> {
        let what = command.name();
        let response = self
            .service
            .request(command, self.config.response_timeout())
            .await?;
        if !response.is_ack() {
            return Err(LinkError::Protocol(format!("watch rejected PutBytes {what}")));
        }
        if let Some(expected) = cookie {
            if response.cookie != expected {
                return Err(LinkError::Protocol(format!(
                    "PutBytes {what} answered for cookie {} instead of {expected}",
                    response.cookie
                )));
            }
        }
        Ok(response.cookie)
    }
}
