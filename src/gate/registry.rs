use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{parse_network, VisitorsConfig};
use crate::error::Result as ProxyResult;
use super::{VisitorGate, VisitorIdentity};

/// Stored state for one visitor identity.
#[derive(Debug, Clone, Serialize)]
pub struct VisitorRecord {
    pub identity: VisitorIdentity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub request_count: u64,
    pub blocked: bool,
}

/// In-process visitor store. Blocks either by explicit per-visitor flag or
/// by statically configured networks.
pub struct VisitorRegistry {
    visitors: DashMap<String, VisitorRecord>,
    blocked_networks: Vec<IpNet>,
    idle_timeout: Duration,
    lookups: AtomicU64,
    denials: AtomicU64,
}

impl VisitorRegistry {
    pub fn new(config: &VisitorsConfig) -> Result<Self> {
        let blocked_networks = config
            .blocked_ips
            .iter()
            .map(|entry| parse_network(entry))
            .collect::<Result<Vec<_>>>()?;

        if !blocked_networks.is_empty() {
            info!("Loaded {} blocked networks", blocked_networks.len());
        }

        Ok(Self {
            visitors: DashMap::new(),
            blocked_networks,
            idle_timeout: config.idle_timeout,
            lookups: AtomicU64::new(0),
            denials: AtomicU64::new(0),
        })
    }

    /// Mark a visitor as blocked, creating the record if needed.
    pub fn block(&self, identity: &VisitorIdentity) {
        self.set_blocked(identity, true);
    }

    pub fn unblock(&self, identity: &VisitorIdentity) {
        self.set_blocked(identity, false);
    }

    fn set_blocked(&self, identity: &VisitorIdentity, blocked: bool) {
        let now = Utc::now();
        self.visitors
            .entry(identity.key())
            .and_modify(|record| record.blocked = blocked)
            .or_insert_with(|| VisitorRecord {
                identity: identity.clone(),
                first_seen: now,
                last_seen: now,
                request_count: 0,
                blocked,
            });
        info!("Visitor {} blocked={}", identity.key(), blocked);
    }

    pub fn get(&self, identity: &VisitorIdentity) -> Option<VisitorRecord> {
        self.visitors.get(&identity.key()).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    fn in_blocked_network(&self, identity: &VisitorIdentity) -> bool {
        self.blocked_networks.iter().any(|net| net.contains(&identity.ip))
    }

    /// Forget unblocked visitors idle longer than the configured timeout
    /// (should be called periodically). Returns the number removed.
    pub fn cleanup_idle_visitors(&self) -> usize {
        // A timeout too large for chrono means nothing is ever idle.
        let Ok(idle) = chrono::Duration::from_std(self.idle_timeout) else {
            return 0;
        };
        let threshold = Utc::now() - idle;

        let before = self.visitors.len();
        self.visitors
            .retain(|_, record| record.blocked || record.last_seen > threshold);
        let after = self.visitors.len();

        let removed = before.saturating_sub(after);
        debug!("Cleaned up idle visitors: {} -> {}", before, after);
        removed
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "visitors": self.visitors.len(),
            "blocked_networks": self.blocked_networks.len(),
            "lookups": self.lookups.load(Ordering::Relaxed),
            "denials": self.denials.load(Ordering::Relaxed),
        })
    }
}

#[async_trait]
impl VisitorGate for VisitorRegistry {
    async fn is_blocked(&self, identity: &VisitorIdentity) -> ProxyResult<bool> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        // Upsert and read the flag under the same entry lock.
        let flagged = {
            let mut record = self
                .visitors
                .entry(identity.key())
                .or_insert_with(|| {
                    debug!("First visit from {}", identity.key());
                    VisitorRecord {
                        identity: identity.clone(),
                        first_seen: now,
                        last_seen: now,
                        request_count: 0,
                        blocked: false,
                    }
                });
            record.last_seen = now;
            record.request_count += 1;
            record.blocked
        };

        let blocked = flagged || self.in_blocked_network(identity);
        if blocked {
            self.denials.fetch_add(1, Ordering::Relaxed);
        }
        Ok(blocked)
    }
}
