//! Server-key derivation.
//!
//! Clients address a proxy identity by its key id: the SHA-256 of the
//! TL-serialized `pub.ed25519 key:int256 = PublicKey` constructor. Each
//! configured tenant seed expands to one such identity.

use ed25519_dalek::SigningKey;
use everscale_types::cell::HashBytes;
use liteproxy_core::config::ClientConfig;
use liteproxy_core::proto;
use sha2::{Digest, Sha256};

pub struct ServerKey {
    pub name: String,
    pub public: [u8; 32],
    pub key_id: HashBytes,
}

pub fn derive(config: &ClientConfig) -> anyhow::Result<ServerKey> {
    let seed = config.private_key_bytes()?;
    let public = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
    Ok(ServerKey { name: config.name.clone(), public, key_id: key_id_for_public(&public) })
}

pub fn key_id_for_public(public: &[u8; 32]) -> HashBytes {
    let mut hasher = Sha256::new();
    hasher.update(proto::ids::PUB_ED25519.to_le_bytes());
    hasher.update(public);
    HashBytes(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_stable_per_seed() {
        let config = ClientConfig {
            name: "t1".to_string(),
            private_key: hex::encode([9u8; 32]),
            capacity_per_key: 0,
            capacity_per_ip: 0,
            cooling_per_sec: 0,
        };
        let a = derive(&config).unwrap();
        let b = derive(&config).unwrap();
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.public, b.public);
        // the id is a hash of the public key, not the key itself
        assert_ne!(a.key_id.0, a.public);
    }
}
