//! Small sha256 helper used to key the SSH connection pool on auth material
//! (spec §4.A: "Key = (host, port, username, authSignature) where
//! authSignature is the sha256 of the presented private key or, if absent,
//! of the password").

use sha2::{Digest, Sha256};

pub fn sha256_hex(material: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material);
    hex::encode(hasher.finalize())
}
