//! PutBytes request/response. One request in flight at a time; the session
//! layer enforces that.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::await_reply;
use crate::error::Result;
use crate::protocol::{Endpoint, Packet, ProtocolHandler, PutBytesCommand, PutBytesResponse};

pub struct PutBytesService {
    handler: Arc<ProtocolHandler>,
    pending: Mutex<Option<oneshot::Sender<PutBytesResponse>>>,
}

impl PutBytesService {
    pub fn start(handler: Arc<ProtocolHandler>, cancel: CancellationToken) -> Arc<Self> {
        let inbound = handler.subscribe(&[Endpoint::PutBytes]);
        let service = Arc::new(Self {
            handler,
            pending: Mutex::new(None),
        });
        let worker = service.clone();
        tokio::spawn(async move { worker.run(inbound, cancel).await });
        service
    }

    async fn run(&self, mut inbound: mpsc::Receiver<Packet>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = inbound.recv() => match packet {
                    Some(Packet::PutBytesResponse(response)) => {
                        match self.pending.lock().take() {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!(?response, "PutBytes response with nothing pending"),
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }

    pub async fn request(&self, command: PutBytesCommand, timeout: Duration) -> Result<PutBytesResponse> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        let what = command.name();
        self.handler.send(Packet::PutBytesCommand(command)).await?;
        let reply = await_reply(rx, timeout, "PutBytes response").await;
        if reply.is_err() {
            self.pending.lock().take();
            debug!(command = what, "PutBytes request abandoned");
        }
        reply
    }

    /// Fire and forget; used for abort where no answer is awaited.
    pub async fn send(&self, command: PutBytesCommand) -> Result<()> {
        self.handler.send(Packet::PutBytesCommand(command)).await
    }
}
