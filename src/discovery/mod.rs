//! Peer discovery and reconciliation
//!
//! Turns raw found/lost/resolved advertisement events into a deduplicated,
//! stable peer list. Resolution requests are serialized — at most one
//! outstanding resolve at a time — and the published set is replaced
//! wholesale on every change so readers never observe a half-updated list.

pub mod browser;
pub mod mdns;

pub use browser::{BrowseEvent, ResolvedService, ServiceBrowser, ServiceHandle};
pub use mdns::{MdnsAdvertiser, MdnsBrowser};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{DiscoveryError, Result};

/// A reachable streaming host, keyed by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub display_name: String,
    pub host_addr: IpAddr,
    pub port: u16,
}

/// Snapshot of the current peer set.
pub type PeerList = Arc<Vec<DiscoveredPeer>>;

pub struct PeerDiscovery {
    browser: Arc<dyn ServiceBrowser>,
    service_type: String,
    peers_tx: Arc<watch::Sender<PeerList>>,
    peers_rx: watch::Receiver<PeerList>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDiscovery {
    pub fn new(browser: Arc<dyn ServiceBrowser>, service_type: impl Into<String>) -> Self {
        let (peers_tx, peers_rx) = watch::channel(PeerList::default());
        Self {
            browser,
            service_type: service_type.into(),
            peers_tx: Arc::new(peers_tx),
            peers_rx,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Begin browsing. Clears the current result set. No-op when already
    /// running.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.peers_tx.send(PeerList::default());

        let events = match self.browser.browse().await {
            Ok(events) => events,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let browser = self.browser.clone();
        let service_type = self.service_type.clone();
        let peers_tx = self.peers_tx.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            reconcile(browser, service_type, events, peers_tx, running).await;
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Cancel browsing and drop the pending-resolve queue. Already-discovered
    /// results stay published until [`clear`](Self::clear).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.browser.stop();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Empty the published peer set.
    pub fn clear(&self) {
        let _ = self.peers_tx.send(PeerList::default());
    }

    /// Current snapshot of discovered peers.
    pub fn peers(&self) -> PeerList {
        self.peers_rx.borrow().clone()
    }

    /// Watch channel for UI consumers.
    pub fn peers_rx(&self) -> watch::Receiver<PeerList> {
        self.peers_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for PeerDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The browse/resolve loop. Found advertisements queue up and resolve one at
/// a time; a completed or failed resolve triggers the next queued item. One
/// bad entry never aborts discovery of the others.
async fn reconcile(
    browser: Arc<dyn ServiceBrowser>,
    service_type: String,
    mut events: mpsc::Receiver<BrowseEvent>,
    peers_tx: Arc<watch::Sender<PeerList>>,
    running: Arc<AtomicBool>,
) {
    let mut peers: Vec<DiscoveredPeer> = Vec::new();
    let mut queue: VecDeque<ServiceHandle> = VecDeque::new();

    while running.load(Ordering::Relaxed) {
        match events.recv().await {
            Some(BrowseEvent::Found(handle)) => {
                if handle.service_type == service_type {
                    queue.push_back(handle);
                } else {
                    tracing::trace!(name = %handle.name, "ignoring foreign advertisement");
                }
            }
            Some(BrowseEvent::Lost(handle)) => {
                let lost = browser::instance_name(&handle.name, &service_type);
                queue.retain(|h| h.name != handle.name);
                let before = peers.len();
                peers.retain(|p| p.display_name != lost);
                if peers.len() != before {
                    tracing::debug!(name = %lost, "peer lost");
                    let _ = peers_tx.send(Arc::new(peers.clone()));
                }
            }
            None => break,
        }

        // Serialized resolution: drain the queue one entry at a time before
        // taking the next event.
        while let Some(handle) = queue.pop_front() {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            match browser.resolve(&handle).await {
                Ok(svc) => {
                    if peers.iter().any(|p| p.host_addr == svc.host_addr) {
                        tracing::debug!(addr = %svc.host_addr, "duplicate advertisement dropped");
                        continue;
                    }
                    tracing::info!(name = %svc.display_name, addr = %svc.host_addr, port = svc.port, "peer discovered");
                    peers.push(DiscoveredPeer {
                        display_name: svc.display_name,
                        host_addr: svc.host_addr,
                        port: svc.port,
                    });
                    let _ = peers_tx.send(Arc::new(peers.clone()));
                }
                Err(DiscoveryError::ResolveTimeout(name)) => {
                    tracing::debug!(name = %name, "resolve timed out");
                }
                Err(e) => {
                    tracing::debug!("resolve failed: {}", e);
                }
            }
        }
    }
}
