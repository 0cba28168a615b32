//! Initial Key Packets — signed GEK distribution containers.
//!
//! ```text
//! HEADER (45 B)
//!  0  4  magic "GEK "
//!  4 36  group UUID (ASCII)
//! 40  4  version u32 BE (unix seconds at rotation)
//! 44  1  member_count (1..=16)
//!
//! ENTRIES  member_count × 1672 B
//!  0   64  member fingerprint
//! 64 1568  kem ciphertext (encapsulated to the member)
//! 1632 40  RFC 3394-wrapped GEK
//!
//! SIGNATURE BLOCK: algo 1 B (1 = ML-DSA-87) ‖ len u16 BE ‖ sig
//!     over header ‖ entries, by the group owner
//! ```

use zeroize::Zeroizing;

use dna_crypto::kem::{kem_decap, kem_encap, KemPublicKey, KemSecretKey, KEM_CIPHERTEXT_LEN};
use dna_crypto::keywrap::{key_unwrap, key_wrap, WRAPPED_KEY_LEN};
use dna_crypto::sign::{self, SignPublicKey, SignSecretKey};

use crate::envelope::SIG_ALGO_ML_DSA_87;
use crate::error::ProtoError;
use crate::identity::{Fingerprint, FINGERPRINT_LEN};

pub const MAGIC: &[u8; 4] = b"GEK ";
pub const HEADER_LEN: usize = 45;
pub const UUID_LEN: usize = 36;
pub const ENTRY_LEN: usize = FINGERPRINT_LEN + KEM_CIPHERTEXT_LEN + WRAPPED_KEY_LEN; // 1672
pub const MAX_MEMBERS: usize = 16;

/// One group member as seen by the IKP builder.
pub struct IkpMember {
    pub fingerprint: Fingerprint,
    pub kem_public: KemPublicKey,
}

/// Build a signed IKP for one GEK version.
///
/// Preconditions (all enforced): 1..=16 members, no duplicate
/// fingerprints, owner among the members.
pub fn build(
    owner_sign_secret: &SignSecretKey,
    owner: &Fingerprint,
    group_uuid: &str,
    version: u32,
    gek: &[u8; 32],
    members: &[IkpMember],
) -> Result<Vec<u8>, ProtoError> {
    if group_uuid.len() != UUID_LEN || !group_uuid.is_ascii() {
        return Err(ProtoError::Malformed("group uuid must be 36 ascii chars"));
    }
    if members.is_empty() {
        return Err(ProtoError::Malformed("group has no members"));
    }
    if members.len() > MAX_MEMBERS {
        return Err(ProtoError::Malformed("member count exceeds protocol maximum"));
    }
    for (i, m) in members.iter().enumerate() {
        if members[..i].iter().any(|p| p.fingerprint == m.fingerprint) {
            return Err(ProtoError::Malformed("duplicate member fingerprint"));
        }
    }
    if !members.iter().any(|m| &m.fingerprint == owner) {
        return Err(ProtoError::Malformed("owner missing from member list"));
    }

    let mut body = Vec::with_capacity(HEADER_LEN + members.len() * ENTRY_LEN);
    body.extend_from_slice(MAGIC);
    body.extend_from_slice(group_uuid.as_bytes());
    body.extend_from_slice(&version.to_be_bytes());
    body.push(members.len() as u8);

    for member in members {
        let (kem_ct, ss) = kem_encap(&member.kem_public)?;
        let wrapped = key_wrap(ss.as_bytes(), gek)?;
        body.extend_from_slice(member.fingerprint.as_bytes());
        body.extend_from_slice(&kem_ct);
        body.extend_from_slice(&wrapped);
        // ss drops (and wipes) here
    }

    let sig = sign::sign(owner_sign_secret, &body)?;
    let len: u16 = sig.len().try_into().map_err(|_| ProtoError::Malformed("signature too long"))?;
    body.push(SIG_ALGO_ML_DSA_87);
    body.extend_from_slice(&len.to_be_bytes());
    body.extend_from_slice(&sig);
    Ok(body)
}

/// A structurally validated IKP, signature not yet checked.
pub struct Ikp<'a> {
    bytes: &'a [u8],
    pub group_uuid: String,
    pub version: u32,
    pub member_count: u8,
    signed_len: usize,
    signature: &'a [u8],
}

impl<'a> Ikp<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtoError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtoError::Malformed("ikp shorter than header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ProtoError::Malformed("bad ikp magic"));
        }
        let group_uuid = std::str::from_utf8(&bytes[4..4 + UUID_LEN])
            .map_err(|_| ProtoError::Malformed("ikp uuid not utf-8"))?
            .to_string();
        let version = u32::from_be_bytes(bytes[40..44].try_into().unwrap());
        let member_count = bytes[44];
        if member_count == 0 {
            return Err(ProtoError::Malformed("ikp has no members"));
        }
        if member_count as usize > MAX_MEMBERS {
            return Err(ProtoError::Malformed("member count exceeds protocol maximum"));
        }

        let signed_len = HEADER_LEN + member_count as usize * ENTRY_LEN;
        let sig_block = bytes
            .get(signed_len..)
            .ok_or(ProtoError::Malformed("truncated ikp entries"))?;
        if sig_block.len() < 3 {
            return Err(ProtoError::Malformed("truncated ikp signature block"));
        }
        if sig_block[0] != SIG_ALGO_ML_DSA_87 {
            return Err(ProtoError::Malformed("unknown ikp signature algorithm"));
        }
        let sig_len = u16::from_be_bytes(sig_block[1..3].try_into().unwrap()) as usize;
        if sig_block.len() != 3 + sig_len {
            return Err(ProtoError::Malformed("ikp length mismatch"));
        }

        Ok(Self {
            bytes,
            group_uuid,
            version,
            member_count,
            signed_len,
            signature: &sig_block[3..],
        })
    }

    /// Verify the owner's signature over header ‖ entries.
    pub fn verify(&self, owner_sign_public: &SignPublicKey) -> Result<(), ProtoError> {
        if sign::verify(owner_sign_public, &self.bytes[..self.signed_len], self.signature) {
            Ok(())
        } else {
            Err(ProtoError::SignatureInvalid)
        }
    }

    /// Member fingerprints in entry order.
    pub fn members(&self) -> Vec<Fingerprint> {
        (0..self.member_count as usize)
            .map(|i| {
                let at = HEADER_LEN + i * ENTRY_LEN;
                Fingerprint::from_bytes(&self.bytes[at..at + FINGERPRINT_LEN])
                    .expect("entry bounds checked at parse")
            })
            .collect()
    }

    /// Recover the GEK from our own member entry.
    pub fn extract(
        &self,
        own: &Fingerprint,
        kem_secret: &KemSecretKey,
    ) -> Result<Zeroizing<[u8; 32]>, ProtoError> {
        for i in 0..self.member_count as usize {
            let entry = &self.bytes[HEADER_LEN + i * ENTRY_LEN..][..ENTRY_LEN];
            if &entry[..FINGERPRINT_LEN] != own.as_bytes() {
                continue;
            }
            let kem_ct = &entry[FINGERPRINT_LEN..FINGERPRINT_LEN + KEM_CIPHERTEXT_LEN];
            let wrapped: &[u8; WRAPPED_KEY_LEN] =
                entry[FINGERPRINT_LEN + KEM_CIPHERTEXT_LEN..].try_into().unwrap();
            let ss = kem_decap(kem_secret, kem_ct)?;
            let gek = key_unwrap(ss.as_bytes(), wrapped)?;
            return Ok(Zeroizing::new(*gek));
        }
        Err(ProtoError::NoMatchingRecipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dna_crypto::kem::kem_keypair;
    use dna_crypto::sign::sign_keypair;

    struct Member {
        fp: Fingerprint,
        kem_pk: KemPublicKey,
        kem_sk: KemSecretKey,
    }

    fn member(seed: u8) -> Member {
        let (sign_pk, _) = sign_keypair(&[seed; 32]).unwrap();
        let (kem_pk, kem_sk) = kem_keypair(&[seed.wrapping_add(50); 32]).unwrap();
        Member { fp: Fingerprint::from_sign_public(&sign_pk), kem_pk, kem_sk }
    }

    const UUID: &str = "01234567-89ab-cdef-0123-456789abcdef";

    #[test]
    fn build_verify_extract_round_trip() {
        let (owner_pk, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let invitee = member(2);
        let gek = [0x77u8; 32];

        let packet = build(
            &owner_sk,
            &owner.fp,
            UUID,
            1_700_000_000,
            &gek,
            &[
                IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() },
                IkpMember { fingerprint: invitee.fp, kem_public: invitee.kem_pk.clone() },
            ],
        )
        .unwrap();

        let ikp = Ikp::parse(&packet).unwrap();
        assert_eq!(ikp.group_uuid, UUID);
        assert_eq!(ikp.version, 1_700_000_000);
        assert_eq!(ikp.member_count, 2);
        assert_eq!(ikp.members(), vec![owner.fp, invitee.fp]);
        ikp.verify(&owner_pk).unwrap();

        let recovered = ikp.extract(&invitee.fp, &invitee.kem_sk).unwrap();
        assert_eq!(*recovered, gek);
        let recovered_owner = ikp.extract(&owner.fp, &owner.kem_sk).unwrap();
        assert_eq!(*recovered_owner, gek);
    }

    #[test]
    fn non_member_cannot_extract() {
        let (_, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let outsider = member(9);
        let packet = build(
            &owner_sk,
            &owner.fp,
            UUID,
            1,
            &[0u8; 32],
            &[IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() }],
        )
        .unwrap();
        let ikp = Ikp::parse(&packet).unwrap();
        assert!(matches!(
            ikp.extract(&outsider.fp, &outsider.kem_sk),
            Err(ProtoError::NoMatchingRecipient)
        ));
    }

    #[test]
    fn member_cap_boundary() {
        let (_, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let mut members: Vec<IkpMember> = vec![IkpMember {
            fingerprint: owner.fp,
            kem_public: owner.kem_pk.clone(),
        }];
        for seed in 2..=16u8 {
            let m = member(seed);
            members.push(IkpMember { fingerprint: m.fp, kem_public: m.kem_pk });
        }
        assert_eq!(members.len(), 16);
        assert!(build(&owner_sk, &owner.fp, UUID, 1, &[0u8; 32], &members).is_ok());

        let extra = member(17);
        members.push(IkpMember { fingerprint: extra.fp, kem_public: extra.kem_pk });
        assert!(build(&owner_sk, &owner.fp, UUID, 1, &[0u8; 32], &members).is_err());
    }

    #[test]
    fn duplicate_member_rejected() {
        let (_, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let members = [
            IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() },
            IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() },
        ];
        assert!(build(&owner_sk, &owner.fp, UUID, 1, &[0u8; 32], &members).is_err());
    }

    #[test]
    fn owner_must_be_member() {
        let (_, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let other = member(2);
        let members =
            [IkpMember { fingerprint: other.fp, kem_public: other.kem_pk.clone() }];
        assert!(build(&owner_sk, &owner.fp, UUID, 1, &[0u8; 32], &members).is_err());
    }

    #[test]
    fn tampered_entry_fails_signature() {
        let (owner_pk, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let mut packet = build(
            &owner_sk,
            &owner.fp,
            UUID,
            1,
            &[0u8; 32],
            &[IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() }],
        )
        .unwrap();
        packet[HEADER_LEN + 10] ^= 0x01;
        let ikp = Ikp::parse(&packet).unwrap();
        assert!(matches!(ikp.verify(&owner_pk), Err(ProtoError::SignatureInvalid)));
    }

    #[test]
    fn forged_member_count_rejected() {
        let (_, owner_sk) = sign_keypair(&[1u8; 32]).unwrap();
        let owner = member(1);
        let mut packet = build(
            &owner_sk,
            &owner.fp,
            UUID,
            1,
            &[0u8; 32],
            &[IkpMember { fingerprint: owner.fp, kem_public: owner.kem_pk.clone() }],
        )
        .unwrap();
        packet[44] = 17;
        assert!(Ikp::parse(&packet).is_err());
    }
}
