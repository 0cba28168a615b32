//! Bootstrap node registry.
//!
//! Cold start dials a hard-coded seed; once the DHT is reachable, the
//! registry key yields the live node set. Every bootstrap node
//! republishes its own record on a short period, so liveness is just
//! an age check.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dna_crypto::hash::sha3_512;
use dna_crypto::sign::{SignPublicKey, SignSecretKey};

use crate::dht::{Dht, DhtWriter};
use crate::error::TransportError;
use crate::keys::bootstrap_registry_key;

/// Hard-coded cold-start seed node.
pub const SEED_NODE: &str = "bootstrap.dna-messenger.net:4222";

/// Records older than this are considered dead.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Each node republishes its record on this period.
pub const REPUBLISH_PERIOD: Duration = Duration::from_secs(5 * 60);

pub const REGISTRY_TTL: Duration = Duration::from_secs(7 * 86_400);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRecord {
    pub ip: String,
    pub port: u16,
    /// Hex node id (stable across restarts).
    pub node_id: String,
    pub version: String,
    /// Unix seconds of the node's latest republish.
    pub last_seen: u64,
    /// Seconds since the node started.
    pub uptime: u64,
}

impl BootstrapRecord {
    pub fn is_live(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) <= LIVENESS_WINDOW.as_secs()
    }
}

/// Read the registry and keep only live records.
pub async fn read_registry(
    dht: &dyn Dht,
    now: u64,
) -> Result<Vec<BootstrapRecord>, TransportError> {
    let records = dht.get_all(&bootstrap_registry_key()).await?;
    let mut live = Vec::new();
    for record in records {
        match serde_json::from_slice::<BootstrapRecord>(&record.value) {
            Ok(parsed) if parsed.is_live(now) => live.push(parsed),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "ignoring malformed bootstrap record"),
        }
    }
    Ok(live)
}

/// Publish our own record (bootstrap nodes only). The value-id derives
/// from the node id, so republishes replace.
pub async fn publish_record(
    dht: &dyn Dht,
    record: &BootstrapRecord,
    secret: &SignSecretKey,
    public: &SignPublicKey,
) -> Result<(), TransportError> {
    let value =
        serde_json::to_vec(record).map_err(|e| TransportError::Serialize(e.to_string()))?;
    let value_id =
        u64::from_be_bytes(sha3_512(record.node_id.as_bytes())[..8].try_into().unwrap());
    dht.put_signed(
        &bootstrap_registry_key(),
        value,
        value_id,
        REGISTRY_TTL,
        DhtWriter { secret, public },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;
    use dna_crypto::sign::sign_keypair;

    fn record(node_id: &str, last_seen: u64) -> BootstrapRecord {
        BootstrapRecord {
            ip: "198.51.100.7".into(),
            port: 4222,
            node_id: node_id.into(),
            version: "0.8.0".into(),
            last_seen,
            uptime: 3600,
        }
    }

    #[test]
    fn liveness_window() {
        let now = 1_000_000;
        assert!(record("n1", now).is_live(now));
        assert!(record("n1", now - 15 * 60).is_live(now));
        assert!(!record("n1", now - 15 * 60 - 1).is_live(now));
    }

    #[tokio::test]
    async fn registry_filters_dead_nodes() {
        let dht = MemoryDht::new();
        let (pk, sk) = sign_keypair(&[1u8; 32]).unwrap();
        let now = 1_000_000;

        publish_record(&*dht, &record("alive", now - 60), &sk, &pk).await.unwrap();
        publish_record(&*dht, &record("dead", now - 3600), &sk, &pk).await.unwrap();

        let live = read_registry(&*dht, now).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, "alive");
    }

    #[tokio::test]
    async fn republish_replaces_own_record() {
        let dht = MemoryDht::new();
        let (pk, sk) = sign_keypair(&[1u8; 32]).unwrap();
        let now = 1_000_000;

        publish_record(&*dht, &record("n1", now - 600), &sk, &pk).await.unwrap();
        publish_record(&*dht, &record("n1", now - 10), &sk, &pk).await.unwrap();

        let live = read_registry(&*dht, now).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].last_seen, now - 10);
    }
}
