//! Concat KDF (NIST SP 800-56A, RFC 7518 Section 4.6)
//!
//! Derives key encryption keys from ECDH shared secrets for use with
//! AES Key Wrap. The algorithm id is a parameter so the same routine
//! serves both anoncrypt (`ECDH-ES+A256KW`) and authcrypt
//! (`ECDH-1PU+A256KW`) key agreement.

use crate::error::CryptoError;
use sha2::{Digest, Sha256};

/// Algorithm id for authenticated (sender-bound) key agreement.
pub const ECDH_1PU_A256KW: &str = "ECDH-1PU+A256KW";

/// Derive `key_data_len` bits of key material from `shared_secret`.
///
/// OtherInfo is laid out per RFC 7518 Section 4.6.2:
/// - AlgorithmID: length (4 bytes) || algorithm
/// - PartyUInfo: length (4 bytes) || apu
/// - PartyVInfo: length (4 bytes) || apv
/// - SuppPubInfo: keydatalen in bits (4 bytes, big-endian)
///
/// DerivedKey = Hash(counter || Z || OtherInfo) for each round
pub fn derive_key(
    algorithm: &str,
    shared_secret: &[u8],
    apu: &[u8],
    apv: &[u8],
    key_data_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    if key_data_len == 0 || key_data_len % 8 != 0 {
        return Err(CryptoError::KeyDerivation(
            "key_data_len must be a positive multiple of 8".to_string(),
        ));
    }

    let algorithm_id = algorithm.as_bytes();
    let mut other_info = Vec::with_capacity(16 + algorithm_id.len() + apu.len() + apv.len());
    other_info.extend_from_slice(&(algorithm_id.len() as u32).to_be_bytes());
    other_info.extend_from_slice(algorithm_id);
    other_info.extend_from_slice(&(apu.len() as u32).to_be_bytes());
    other_info.extend_from_slice(apu);
    other_info.extend_from_slice(&(apv.len() as u32).to_be_bytes());
    other_info.extend_from_slice(apv);
    other_info.extend_from_slice(&(key_data_len as u32).to_be_bytes());

    let key_data_len_bytes = key_data_len / 8;
    let hash_len = 32; // SHA-256 output size
    let reps = (key_data_len_bytes + hash_len - 1) / hash_len;

    let mut derived = Vec::with_capacity(reps * hash_len);
    for counter in 1..=reps {
        let mut hasher = Sha256::new();
        hasher.update((counter as u32).to_be_bytes());
        hasher.update(shared_secret);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
    }

    derived.truncate(key_data_len_bytes);
    Ok(derived)
}

/// Derive a 256-bit key encryption key.
pub fn derive_kek(
    algorithm: &str,
    shared_secret: &[u8],
    apu: &[u8],
    apv: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let derived = derive_key(algorithm, shared_secret, apu, apv, 256)?;
    let mut kek = [0u8; 32];
    kek.copy_from_slice(&derived);
    Ok(kek)
}
