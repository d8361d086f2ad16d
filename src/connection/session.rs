//! Session state machine for one transport.
//!
//! Every failure path funnels into [`WatchSession::report_fatal`], which keeps
//! the first error and cancels the session token. Teardown runs exactly once:
//! `Disconnecting`, cancel children, close the transport, wait (bounded) for
//! the link to drop, release the context, `Disconnected`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::context::ConnectionContext;
use super::device::{ConnectedWatch, RecoveryWatch};
use super::{ConnectionState, StateKind, WatchInfo};
use crate::blobdb::{BlobDbEngine, RecordSource, SyncFlags};
use crate::clock::SharedClock;
use crate::config::LinkConfig;
use crate::error::{ErrorTracker, LinkError, Result};
use crate::ppog::PpogClient;
use crate::protocol::{Origin, ProtocolCaps, ProtocolHandler};
use crate::services::system::SystemService;
use crate::transport::{LinkState, Transport, TransportId};

/// Capacity of the per-session transition stream.
pub const TRANSITION_CHANNEL_SIZE: usize = 16;

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionEnv {
    pub config: Arc<LinkConfig>,
    pub clock: SharedClock,
    /// Shared across sessions; sources track sync state per watch
    pub sources: Vec<Arc<dyn RecordSource>>,
    pub errors: ErrorTracker,
    /// Announced to the watch in the phone version reply
    pub phone_caps: ProtocolCaps,
}

impl SessionEnv {
    pub fn new(config: Arc<LinkConfig>, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            sources: Vec::new(),
            errors: ErrorTracker::new(),
            phone_caps: ProtocolCaps::APP_RUN_STATE
                | ProtocolCaps::INFINITE_LOG_DUMPING
                | ProtocolCaps::EXTENDED_NOTIFICATION_SERVICE
                | ProtocolCaps::SETTINGS_SYNC,
        }
    }

    pub fn with_sources(mut self, sources: Vec<Arc<dyn RecordSource>>) -> Self {
        self.sources = sources;
        self
    }
}

pub struct WatchSession {
    transport: Arc<dyn Transport>,
    env: SessionEnv,
    previously_connected: bool,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateKind>,
    cancel: CancellationToken,
    fatal: Mutex<Option<String>>,
    cleaned_up: AtomicBool,
    ended: CancellationToken,
    context: Mutex<Option<Arc<ConnectionContext>>>,
}

impl WatchSession {
    pub fn new(transport: Arc<dyn Transport>, env: SessionEnv, previously_connected: bool) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_SIZE);
        Arc::new(Self {
            transport,
            env,
            previously_connected,
            state,
            transitions,
            cancel: CancellationToken::new(),
            fatal: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
            ended: CancellationToken::new(),
            context: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &TransportId {
        self.transport.id()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateKind> {
        self.transitions.subscribe()
    }

    /// First fatal error reported, if teardown was caused by one.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Resolves once teardown has finished.
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }

    /// Drive the session on its own task until it has fully torn down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    async fn run(self: Arc<Self>) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            r = self.connect() => r,
        };
        match outcome {
            Ok(()) => self.cancel.cancelled().await,
            Err(e) => self.report_fatal(e),
        }
        self.cleanup().await;
    }

    /// Request an orderly disconnect.
    pub fn request_disconnect(&self) {
        debug!(watch = %self.id(), "disconnect requested");
        self.cancel.cancel();
    }

    /// Record a fatal error and start teardown. Later errors are dropped.
    pub fn report_fatal(&self, err: LinkError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() || self.cancel.is_cancelled() {
                trace!(watch = %self.id(), "ignoring error after teardown started: {err}");
                return;
            }
            *fatal = Some(err.to_string());
        }
        warn!(watch = %self.id(), "session failed: {err}");
        self.cancel.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        let kind = state.kind();
        let previous = self.state.send_replace(state).kind();
        if previous != kind {
            debug!(watch = %self.id(), from = %previous, to = %kind, "session state");
            let _ = self.transitions.send(kind);
        }
    }

    /// Run a child task; its failure is the session's failure.
    fn supervise<F>(self: &Arc<Self>, what: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let session = self.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(()) => trace!(watch = %session.id(), what, "session task finished"),
                Err(LinkError::Cancelled) => {}
                Err(e) => session.report_fatal(e),
            }
        });
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let config = &self.env.config;
        self.set_state(ConnectionState::Connecting);
        info!(watch = %self.id(), "connecting");

        let connect_timeout = config.connection.connect_timeout();
        timeout(connect_timeout, self.transport.open())
            .await
            .map_err(|_| LinkError::Timeout(connect_timeout, "transport open"))??;

        let mut link = self.transport.link_state();
        self.supervise("link monitor", async move {
            match link.wait_for(|s| *s == LinkState::Down).await.is_ok() {
                true => Err(LinkError::Transport("link lost".into())),
                false => Ok(()),
            }
        });

        self.set_state(ConnectionState::Negotiating);
        let negotiation_timeout = config.connection.negotiation_timeout();
        let (context, inbound) = timeout(negotiation_timeout, self.negotiate())
            .await
            .map_err(|_| LinkError::Timeout(negotiation_timeout, "negotiation"))??;

        *self.context.lock() = Some(context.clone());
        let info = &context.info;
        info!(
            watch = %self.id(),
            firmware = %info.running_firmware,
            serial = %info.serial,
            platform = info.platform,
            recovery = info.in_recovery,
            "connected"
        );

        if info.in_recovery {
            drop(inbound);
            self.set_state(ConnectionState::ConnectedInRecovery(RecoveryWatch::new(context)));
        } else {
            let engine = BlobDbEngine::new(
                self.id().clone(),
                info.clone(),
                context.blobdb.clone(),
                self.env.sources.clone(),
                self.env.clock.clone(),
                config.blobdb.clone(),
            );
            let flags = SyncFlags {
                unfaithful: info.unfaithful,
                previously_connected: self.previously_connected,
            };
            self.supervise("blobdb", engine.run(inbound, flags, self.cancel.clone()));
            self.set_state(ConnectionState::Connected(ConnectedWatch::new(context)));
        }
        Ok(())
    }

    /// PPoG reset, protocol routing, version exchange.
    async fn negotiate(
        self: &Arc<Self>,
    ) -> Result<(Arc<ConnectionContext>, crate::services::blobdb::BlobDbInbound)> {
        let config = &self.env.config;
        let (channels, stream) =
            PpogClient::start(self.transport.clone(), &config.ppog, self.cancel.clone())?;
        self.supervise("ppog", async move {
            stream
                .await
                .map_err(|e| LinkError::Other(anyhow::anyhow!("ppog task panicked: {e}")))?
        });

        let mut ready = channels.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::Disconnected)?;
        trace!(watch = %self.id(), "PPoG stream ready");

        let handler = ProtocolHandler::new(Origin::Phone, channels.outbound);
        let router = handler.clone();
        let delivered = channels.delivered;
        self.supervise("protocol", async move { router.run_inbound(delivered).await });

        let system = SystemService::start(handler.clone(), self.env.phone_caps, self.cancel.clone());
        let version = system
            .request_watch_version(config.connection.negotiation_timeout())
            .await?;
        let info = WatchInfo::from(&version);

        Ok(ConnectionContext::build(
            self.id().clone(),
            info,
            handler,
            system,
            config,
            self.env.errors.clone(),
            self.cancel.clone(),
        ))
    }

    /// Tear the session down. Safe to call from any number of paths; only
    /// the first call does anything.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        self.cancel.cancel();
        self.transport.close().await;

        let disconnect_timeout = self.env.config.registry.disconnect_timeout();
        let mut link = self.transport.link_state();
        let confirmed = timeout(disconnect_timeout, link.wait_for(|s| *s == LinkState::Down))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !confirmed {
            warn!(watch = %self.id(), "link did not confirm disconnect, forcing");
        }

        self.context.lock().take();
        self.set_state(ConnectionState::Disconnected);
        info!(watch = %self.id(), "disconnected");
        self.ended.cancel();
    }
}
