//! Request fingerprinting
//!
//! An OCSP request identifies the certificate it asks about through three
//! values: a hash of the issuer's subject, a hash of the issuer's public
//! key, and the serial number. The cache folds those into a single 32-byte
//! fingerprint:
//!
//! ```text
//! SHA-256(issuerNameHash || issuerKeyHash || SHA-256(serialBytes))
//! ```
//!
//! where `issuerNameHash` and `issuerKeyHash` are produced with whatever
//! hash algorithm the request itself declares. An entry is indexed under
//! the fingerprint for every supported algorithm; an inbound request is
//! hashed exactly once, with its own algorithm, using the name and key
//! hashes it already carries.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::CacheError;

/// Hash algorithms accepted inside inbound OCSP requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Every algorithm an entry is indexed under
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// Digest `data` with this algorithm
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Strip DER INTEGER padding so serials hash the same no matter where they
/// came from: minimal big-endian bytes, empty for zero.
pub(crate) fn normalize_serial(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// Fingerprint from the hashes an inbound request already carries
pub fn request_digest(name_hash: &[u8], key_hash: &[u8], serial: &[u8]) -> [u8; 32] {
    let serial_hash = Sha256::digest(serial);
    let mut hasher = Sha256::new();
    hasher.update(name_hash);
    hasher.update(key_hash);
    hasher.update(serial_hash);
    hasher.finalize().into()
}

/// Fingerprint of `(issuer, serial)` under one algorithm
pub fn entry_digest(
    algorithm: HashAlgorithm,
    issuer_subject_der: &[u8],
    issuer_key_bits: &[u8],
    serial: &[u8],
) -> [u8; 32] {
    let name_hash = algorithm.digest(issuer_subject_der);
    let key_hash = algorithm.digest(issuer_key_bits);
    request_digest(&name_hash, &key_hash, serial)
}

/// Fingerprints of `(issuer, serial)` under every supported algorithm
///
/// The serial must be non-empty; an empty serial cannot be distinguished
/// from a missing one and would collide across entries.
pub fn entry_digests(
    issuer_subject_der: &[u8],
    issuer_key_bits: &[u8],
    serial: &[u8],
) -> Result<Vec<[u8; 32]>, CacheError> {
    if serial.is_empty() {
        return Err(CacheError::Hash("empty serial number".to_string()));
    }
    Ok(HashAlgorithm::ALL
        .iter()
        .map(|alg| entry_digest(*alg, issuer_subject_der, issuer_key_bits, serial))
        .collect())
}
