use sha2::{Digest, Sha256};
use std::fmt;

const CHECKSUM_SIZE: usize = 4;

/// SHA-256 applied twice.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(Sha256::digest(data));

    let mut buffer = [0u8; 32];
    buffer.copy_from_slice(&hash);
    buffer
}

/// Frame checksum: the first 4 bytes of `double_sha256(payload)`.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = double_sha256(payload);

    let mut buffer = [0u8; CHECKSUM_SIZE];
    buffer.copy_from_slice(&hash[..CHECKSUM_SIZE]);
    buffer
}

/// A 32 byte hash kept in wire (internal) byte order.
///
/// Displayed reversed, which is how block explorers and the reference
/// client print transaction and block ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn of(data: &[u8]) -> Self {
        Self(double_sha256(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}
