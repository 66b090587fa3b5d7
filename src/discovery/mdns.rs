//! mDNS-backed browsing and advertising
//!
//! [`MdnsBrowser`] adapts the `mdns-sd` daemon to the [`ServiceBrowser`]
//! trait. The daemon resolves services on its own as part of browsing; the
//! `resolve` call waits for the matching resolution event to land.
//! [`MdnsAdvertiser`] is the receiving host's half: it registers the
//! well-known service so senders can find it.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::config::ProtocolConfig;
use crate::discovery::browser::{
    instance_name, BrowseEvent, ResolvedService, ServiceBrowser, ServiceHandle,
};
use crate::error::DiscoveryError;

/// How long `resolve` waits for the daemon before giving up on one entry.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    service_type: String,
    /// Resolutions the daemon has delivered, keyed by full advertisement name.
    resolved: Arc<Mutex<HashMap<String, ResolvedService>>>,
    resolved_notify: Arc<Notify>,
}

impl MdnsBrowser {
    pub fn new(cfg: &ProtocolConfig) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        Ok(Self {
            daemon,
            service_type: cfg.service_type.clone(),
            resolved: Arc::new(Mutex::new(HashMap::new())),
            resolved_notify: Arc::new(Notify::new()),
        })
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        let daemon_rx = self
            .daemon
            .browse(&self.service_type)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let resolved = self.resolved.clone();
        let notify = self.resolved_notify.clone();
        let service_type = self.service_type.clone();

        tokio::spawn(async move {
            while let Ok(event) = daemon_rx.recv_async().await {
                match event {
                    ServiceEvent::ServiceFound(ty, fullname) => {
                        let handle = ServiceHandle {
                            name: fullname,
                            service_type: ty,
                        };
                        if tx.send(BrowseEvent::Found(handle)).await.is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        // Prefer an IPv4 address on the LAN
                        let addr = info
                            .get_addresses()
                            .iter()
                            .find(|a| a.is_ipv4())
                            .or_else(|| info.get_addresses().iter().next())
                            .copied();
                        if let Some(host_addr) = addr {
                            let fullname = info.get_fullname().to_string();
                            let svc = ResolvedService {
                                display_name: instance_name(&fullname, &service_type),
                                host_addr,
                                port: info.get_port(),
                            };
                            resolved.lock().insert(fullname, svc);
                            notify.notify_waiters();
                        }
                    }
                    ServiceEvent::ServiceRemoved(ty, fullname) => {
                        resolved.lock().remove(&fullname);
                        let handle = ServiceHandle {
                            name: fullname,
                            service_type: ty,
                        };
                        if tx.send(BrowseEvent::Lost(handle)).await.is_err() {
                            break;
                        }
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
        });

        Ok(rx)
    }

    async fn resolve(&self, handle: &ServiceHandle) -> Result<ResolvedService, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + RESOLVE_TIMEOUT;
        loop {
            if let Some(svc) = self.resolved.lock().get(&handle.name).cloned() {
                return Ok(svc);
            }
            let notified = self.resolved_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DiscoveryError::ResolveTimeout(handle.name.clone()));
            }
        }
    }

    fn stop(&self) {
        let _ = self.daemon.stop_browse(&self.service_type);
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

/// Registers the streaming service on the local network (receiving host side).
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsAdvertiser {
    /// Register `instance` under the configured service type. Addresses are
    /// filled in automatically from the host's interfaces.
    pub fn start(cfg: &ProtocolConfig, instance: &str) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        let host = format!("{}.local.", sanitize_label(instance));
        let props = [("version", "1")];
        let info = ServiceInfo::new(&cfg.service_type, instance, &host, "", cfg.port, &props[..])
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?
            .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        tracing::info!(service = %fullname, port = cfg.port, "service registered");
        Ok(Self { daemon, fullname })
    }

    pub fn stop(&self) {
        let _ = self.daemon.unregister(&self.fullname);
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop();
        let _ = self.daemon.shutdown();
    }
}

/// mDNS host labels cannot carry spaces or dots.
fn sanitize_label(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_awkward_chars() {
        assert_eq!(sanitize_label("My Desk (PC)"), "My-Desk--PC-");
        assert_eq!(sanitize_label("plain-host"), "plain-host");
    }
}
