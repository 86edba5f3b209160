pub mod registry;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use registry::VisitorRegistry;

/// The (IP address, optional browser fingerprint) pair used to correlate
/// and gate requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VisitorIdentity {
    pub ip: IpAddr,
    pub fingerprint: Option<String>,
}

impl VisitorIdentity {
    pub fn new(ip: IpAddr, fingerprint: Option<String>) -> Self {
        let fingerprint = fingerprint
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        Self { ip, fingerprint }
    }

    /// Stable key for persistence lookups.
    pub fn key(&self) -> String {
        match &self.fingerprint {
            Some(fingerprint) => format!("{}|{}", self.ip, fingerprint),
            None => self.ip.to_string(),
        }
    }
}

/// Answers whether a visitor may use the proxy.
///
/// Implementations own visitor bookkeeping (create on first sight, touch
/// last-seen). The decision must be re-evaluated on every call.
#[async_trait]
pub trait VisitorGate: Send + Sync {
    async fn is_blocked(&self, identity: &VisitorIdentity) -> Result<bool>;
}
