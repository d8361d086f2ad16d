//! In-process transport pair.
//!
//! Every successful [`LoopbackTransport::open`] hands a fresh [`LoopbackPeer`]
//! to whoever holds the peer receiver (normally a simulated watch), so a
//! single transport survives any number of reconnects.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{LinkState, Transport, TransportId};
use crate::error::{LinkError, Result};

/// Watch side of one open link.
#[derive(Debug)]
pub struct LoopbackPeer {
    pub id: TransportId,
    /// Frames written by the phone
    pub from_phone: mpsc::Receiver<Bytes>,
    /// Notifications delivered to the phone
    pub to_phone: mpsc::Sender<Bytes>,
    link: Arc<watch::Sender<LinkState>>,
}

impl LoopbackPeer {
    /// Drop the link from the watch side (reboot, out of range).
    pub fn drop_link(&self) {
        self.link.send_replace(LinkState::Down);
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Link control that outlives moving the channels out of the peer.
    pub fn link(&self) -> PeerLink {
        PeerLink(self.link.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PeerLink(Arc<watch::Sender<LinkState>>);

impl PeerLink {
    pub fn drop_link(&self) {
        self.0.send_replace(LinkState::Down);
    }

    pub fn is_up(&self) -> bool {
        *self.0.borrow() == LinkState::Up
    }
}

struct OpenLink {
    to_peer: mpsc::Sender<Bytes>,
    inbound: Option<mpsc::Receiver<Bytes>>,
}

pub struct LoopbackTransport {
    id: TransportId,
    capacity: usize,
    link: Arc<watch::Sender<LinkState>>,
    current: Mutex<Option<OpenLink>>,
    peers: mpsc::UnboundedSender<LoopbackPeer>,
    refuse_open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Create a transport and the stream of peers it will hand out on each open.
pub fn loopback(
    id: TransportId,
    capacity: usize,
) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<LoopbackPeer>) {
    let (peers, peer_rx) = mpsc::unbounded_channel();
    let (link, _) = watch::channel(LinkState::Down);
    let transport = LoopbackTransport {
        id,
        capacity: capacity.max(1),
        link: Arc::new(link),
        current: Mutex::new(None),
        peers,
        refuse_open: AtomicBool::new(false),
        opens: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
    };
    (Arc::new(transport), peer_rx)
}

impl LoopbackTransport {
    /// Make subsequent opens fail, as if the watch were out of range.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn open(&self) -> Result<()> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(LinkError::Transport(format!("{} unreachable", self.id)));
        }

        let (to_peer, from_phone) = mpsc::channel(self.capacity);
        let (to_phone, inbound) = mpsc::channel(self.capacity);
        let peer = LoopbackPeer {
            id: self.id.clone(),
            from_phone,
            to_phone,
            link: self.link.clone(),
        };
        if self.peers.send(peer).is_err() {
            return Err(LinkError::Transport(format!("nothing listening at {}", self.id)));
        }

        *self.current.lock() = Some(OpenLink {
            to_peer,
            inbound: Some(inbound),
        });
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.link.send_replace(LinkState::Up);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.current.lock().take();
        self.link.send_replace(LinkState::Down);
    }

    async fn write(&self, frame: Bytes) -> bool {
        if *self.link.borrow() == LinkState::Down {
            return false;
        }
        let tx = self.current.lock().as_ref().map(|l| l.to_peer.clone());
        match tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<Bytes>> {
        self.current
            .lock()
            .as_mut()
            .and_then(|l| l.inbound.take())
            .ok_or_else(|| LinkError::Transport(format!("{} not open or already subscribed", self.id)))
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}
