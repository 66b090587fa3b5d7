//! Service-browser collaborator interface
//!
//! Discovery reconciliation is written against this trait so the engine can
//! be driven by a real mDNS daemon in production and a scripted browser in
//! tests.

use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::mpsc;

use crate::error::DiscoveryError;

/// An advertisement as seen by the browse side, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Full advertisement name, unique per service instance.
    pub name: String,
    /// Service type the advertisement was found under.
    pub service_type: String,
}

/// Raw browse notifications.
#[derive(Debug, Clone)]
pub enum BrowseEvent {
    Found(ServiceHandle),
    Lost(ServiceHandle),
}

/// The outcome of resolving one advertisement.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Human-readable instance name (advertisement name without the
    /// service-type suffix).
    pub display_name: String,
    pub host_addr: IpAddr,
    pub port: u16,
}

/// Local-network advertise/browse/resolve facility.
///
/// Callers serialize `resolve` invocations; implementations do not need to
/// tolerate concurrent resolves.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Begin browsing. Events arrive on the returned channel until `stop`.
    async fn browse(&self) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError>;

    /// Resolve one advertisement to a concrete address and port.
    async fn resolve(&self, handle: &ServiceHandle) -> Result<ResolvedService, DiscoveryError>;

    /// Cancel browsing. The event channel closes shortly after.
    fn stop(&self);
}

/// Strip the service-type suffix off a full advertisement name.
pub(crate) fn instance_name(fullname: &str, service_type: &str) -> String {
    let trimmed = fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname);
    trimmed.to_string()
}
