//! Connection bookkeeping.

use std::time::Instant;

use crate::types::ConnectionVersion;

/// Counters for a [`Namespace`](super::Namespace).
#[derive(Debug, Clone, Default)]
pub struct NamespaceStats {
    /// Connections created, including the first.
    pub connections_created: u64,
    /// Failed attempts to create a connection.
    pub connection_failures: u64,
    /// Recoveries that replaced the connection.
    pub recoveries: u64,
    /// Recoveries skipped because the caller's version was stale.
    pub recoveries_skipped: u64,
    /// Claims accepted by the broker.
    pub claims_negotiated: u64,
    /// Claim attempts that failed.
    pub claim_failures: u64,
    /// Version of the current connection.
    pub version: ConnectionVersion,
    /// Time of the last successful connection.
    pub last_connected: Option<Instant>,
    /// Time of the last connection recovery.
    pub last_recovered: Option<Instant>,
}

impl NamespaceStats {
    /// Record a new connection.
    pub fn record_connect(&mut self, version: ConnectionVersion) {
        self.connections_created += 1;
        self.version = version;
        self.last_connected = Some(Instant::now());
    }

    /// Record a failed connection attempt.
    pub fn record_connect_failure(&mut self) {
        self.connection_failures += 1;
    }

    /// Record a recovery that replaced the connection.
    pub fn record_recovery(&mut self) {
        self.recoveries += 1;
        self.last_recovered = Some(Instant::now());
    }

    /// Record a recovery skipped as stale.
    pub fn record_recovery_skipped(&mut self) {
        self.recoveries_skipped += 1;
    }

    /// Record a claim outcome.
    pub fn record_claim(&mut self, accepted: bool) {
        if accepted {
            self.claims_negotiated += 1;
        } else {
            self.claim_failures += 1;
        }
    }

    /// Time since the current connection was created.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.last_connected.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_stats() {
        let mut stats = NamespaceStats::default();
        assert!(stats.uptime().is_none());

        stats.record_connect(ConnectionVersion(1));
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.version, ConnectionVersion(1));
        assert!(stats.last_connected.is_some());

        stats.record_recovery();
        stats.record_recovery_skipped();
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.recoveries_skipped, 1);
        assert!(stats.last_recovered.is_some());

        stats.record_claim(true);
        stats.record_claim(false);
        assert_eq!(stats.claims_negotiated, 1);
        assert_eq!(stats.claim_failures, 1);
    }
}
