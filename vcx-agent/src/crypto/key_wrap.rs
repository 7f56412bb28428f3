//! AES Key Wrap (RFC 3394) of content encryption keys.

use crate::error::CryptoError;
use aes::Aes256;
use aes_kw::Kek;

/// Wrap `plaintext_key` under a 256-bit KEK. The output is 8 bytes longer
/// than the input.
pub fn wrap_key_aes_kw(kek: &[u8; 32], plaintext_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plaintext_key.len() < 16 || plaintext_key.len() % 8 != 0 {
        return Err(CryptoError::KeyWrap(format!(
            "key to wrap must be at least 16 bytes and a multiple of 8, got {}",
            plaintext_key.len()
        )));
    }

    let kek = Kek::<Aes256>::from(*kek);
    let mut output = vec![0u8; plaintext_key.len() + 8];
    kek.wrap(plaintext_key, &mut output)
        .map_err(|e| CryptoError::KeyWrap(format!("{:?}", e)))?;

    Ok(output)
}

/// Unwrap a key wrapped by [`wrap_key_aes_kw`].
///
/// Fails with [`CryptoError::Authentication`] when the integrity check
/// value does not verify: wrong KEK or tampered input.
pub fn unwrap_key_aes_kw(kek: &[u8; 32], wrapped_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wrapped_key.len() < 24 || wrapped_key.len() % 8 != 0 {
        return Err(CryptoError::KeyWrap(format!(
            "wrapped key must be at least 24 bytes and a multiple of 8, got {}",
            wrapped_key.len()
        )));
    }

    let kek = Kek::<Aes256>::from(*kek);
    let mut output = vec![0u8; wrapped_key.len() - 8];
    kek.unwrap(wrapped_key, &mut output)
        .map_err(|e| CryptoError::Authentication(format!("key unwrap failed: {:?}", e)))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_wrap_unwrap() {
        let kek = [0x11u8; 32];
        let cek = [0x22u8; 32];
        let wrapped = wrap_key_aes_kw(&kek, &cek).unwrap();
        assert_eq!(wrapped.len(), 40);
        assert_eq!(unwrap_key_aes_kw(&kek, &wrapped).unwrap(), cek);
    }

    #[test]
    fn test_unwrap_with_wrong_kek() {
        let wrapped = wrap_key_aes_kw(&[0x11u8; 32], &[0x22u8; 32]).unwrap();
        assert_matches!(
            unwrap_key_aes_kw(&[0x12u8; 32], &wrapped),
            Err(CryptoError::Authentication(_))
        );
    }

    #[test]
    fn test_tampered_wrapped_key() {
        let kek = [0x11u8; 32];
        let mut wrapped = wrap_key_aes_kw(&kek, &[0x22u8; 32]).unwrap();
        wrapped[5] ^= 0x01;
        assert!(unwrap_key_aes_kw(&kek, &wrapped).is_err());
    }

    #[test]
    fn test_size_checks() {
        let kek = [0x11u8; 32];
        assert!(wrap_key_aes_kw(&kek, &[0u8; 8]).is_err());
        assert!(wrap_key_aes_kw(&kek, &[0u8; 17]).is_err());
        assert!(unwrap_key_aes_kw(&kek, &[0u8; 16]).is_err());
    }
}
