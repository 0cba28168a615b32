//! Per-contact delivery acknowledgements.
//!
//! After a successful foreground sync against sender `s`, the
//! recipient publishes the sync timestamp under the ACK key. Senders
//! read it back and flip everything older from SENT to RECEIVED.
//! Background fetches must NOT publish (a message is not "received"
//! before the user could have seen it).

use std::time::Duration;

use dna_crypto::sign::{SignPublicKey, SignSecretKey};
use dna_proto::Fingerprint;

use crate::dht::{Dht, DhtWriter};
use crate::error::TransportError;
use crate::keys::{ack_key, writer_value_id};

pub const ACK_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Publish our latest successful sync against `sender`.
pub async fn publish_ack(
    dht: &dyn Dht,
    me: &Fingerprint,
    sender: &Fingerprint,
    synced_at: u64,
    secret: &SignSecretKey,
    public: &SignPublicKey,
) -> Result<(), TransportError> {
    let key = ack_key(me, sender);
    dht.put_signed(
        &key,
        synced_at.to_be_bytes().to_vec(),
        writer_value_id(me),
        ACK_TTL,
        DhtWriter { secret, public },
    )
    .await
}

/// The recipient's most recent ACK toward us: max timestamp across
/// writers (a recipient with several devices may write several).
pub async fn read_ack(
    dht: &dyn Dht,
    recipient: &Fingerprint,
    me: &Fingerprint,
) -> Result<Option<u64>, TransportError> {
    let key = ack_key(recipient, me);
    let records = dht.get_all(&key).await?;
    Ok(records
        .iter()
        .filter_map(|r| {
            let bytes: [u8; 8] = r.value.as_slice().try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        })
        .max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;
    use dna_crypto::sign::sign_keypair;

    fn fp_and_keys(seed: u8) -> (Fingerprint, SignPublicKey, SignSecretKey) {
        let (pk, sk) = sign_keypair(&[seed; 32]).unwrap();
        (Fingerprint::from_sign_public(&pk), pk, sk)
    }

    #[tokio::test]
    async fn ack_round_trip_takes_max() {
        let dht = MemoryDht::new();
        let (bob, bob_pk, bob_sk) = fp_and_keys(1);
        let (alice, _, _) = fp_and_keys(2);

        assert_eq!(read_ack(&*dht, &bob, &alice).await.unwrap(), None);

        publish_ack(&*dht, &bob, &alice, 1_000, &bob_sk, &bob_pk).await.unwrap();
        publish_ack(&*dht, &bob, &alice, 2_000, &bob_sk, &bob_pk).await.unwrap();

        assert_eq!(read_ack(&*dht, &bob, &alice).await.unwrap(), Some(2_000));
    }

    #[tokio::test]
    async fn ack_is_directional() {
        let dht = MemoryDht::new();
        let (bob, bob_pk, bob_sk) = fp_and_keys(1);
        let (alice, _, _) = fp_and_keys(2);

        publish_ack(&*dht, &bob, &alice, 1_000, &bob_sk, &bob_pk).await.unwrap();
        // Alice's ACK toward Bob is a different key entirely.
        assert_eq!(read_ack(&*dht, &alice, &bob).await.unwrap(), None);
    }
}
