//! Authenticated encryption of envelopes (ECDH-1PU+A256KW / A256GCM).
//!
//! For every recipient the key encryption key is derived from
//! `ECDH(epk, recipient) || ECDH(sender, recipient)`, so only the holder of
//! the sender's static key could have produced a wrapped key that unwraps.
//! The content is encrypted once under a random CEK with the base64url
//! protected header as AAD.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::trace;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::envelope::{
    b64_decode, b64_encode, EphemeralPublicKey, Envelope, EnvelopeRecipient, ProtectedHeader,
    RecipientHeader, DIDCOMM_ENCRYPTED, ENC_A256GCM,
};
use crate::crypto::kdf::{derive_kek, ECDH_1PU_A256KW};
use crate::crypto::key_wrap::{unwrap_key_aes_kw, wrap_key_aes_kw};
use crate::crypto::keys::KeyBinding;
use crate::error::CryptoError;

/// Encrypt `plaintext` from `sender` to every recipient.
pub fn pack(
    plaintext: &[u8],
    sender_secret: &StaticSecret,
    sender_kid: &str,
    recipients: &[KeyBinding],
) -> Result<Envelope, CryptoError> {
    if recipients.is_empty() {
        return Err(CryptoError::Encryption(
            "no recipients specified for envelope".to_string(),
        ));
    }

    let mut cek = [0u8; 32];
    OsRng.fill_bytes(&mut cek);
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let apu = sender_kid.as_bytes().to_vec();
    let apv = recipients_digest(recipients.iter().map(|r| r.kid.as_str()));

    let header = ProtectedHeader {
        typ: DIDCOMM_ENCRYPTED.to_string(),
        alg: ECDH_1PU_A256KW.to_string(),
        enc: ENC_A256GCM.to_string(),
        skid: sender_kid.to_string(),
        epk: EphemeralPublicKey {
            kty: "OKP".to_string(),
            crv: "X25519".to_string(),
            x: b64_encode(ephemeral_public.as_bytes()),
        },
        apu: b64_encode(&apu),
        apv: b64_encode(&apv),
    };
    let protected = b64_encode(serde_json::to_vec(&header)?);

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| CryptoError::Encryption(format!("failed to create AES-GCM cipher: {}", e)))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), protected.as_bytes(), &mut buffer)
        .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

    let mut envelope_recipients = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let recipient_public = PublicKey::from(recipient.key.x25519_bytes()?);
        let shared = shared_secret(
            ephemeral.diffie_hellman(&recipient_public).as_bytes(),
            sender_secret.diffie_hellman(&recipient_public).as_bytes(),
        );
        let kek = derive_kek(ECDH_1PU_A256KW, &shared, &apu, &apv)?;
        let wrapped = wrap_key_aes_kw(&kek, &cek)?;

        trace!("Wrapped content key for {}", recipient.kid);
        envelope_recipients.push(EnvelopeRecipient {
            encrypted_key: b64_encode(wrapped),
            header: RecipientHeader {
                kid: recipient.kid.clone(),
            },
        });
    }

    Ok(Envelope {
        protected,
        recipients: envelope_recipients,
        iv: b64_encode(iv),
        ciphertext: b64_encode(buffer),
        tag: b64_encode(tag),
    })
}

/// Decrypt an envelope addressed to `recipient_kid`, authenticating the
/// sender against `sender_public`.
pub fn unpack(
    envelope: &Envelope,
    recipient_secret: &StaticSecret,
    recipient_kid: &str,
    sender_public: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let header = envelope.protected_header()?;
    if header.alg != ECDH_1PU_A256KW {
        return Err(CryptoError::UnsupportedAlgorithm(header.alg));
    }
    if header.enc != ENC_A256GCM {
        return Err(CryptoError::UnsupportedAlgorithm(header.enc));
    }

    let apu = decode_field("apu", &header.apu)?;
    if apu != header.skid.as_bytes() {
        return Err(CryptoError::MalformedEnvelope(
            "apu does not match skid".to_string(),
        ));
    }
    let apv = decode_field("apv", &header.apv)?;
    if apv != recipients_digest(envelope.recipient_kids().into_iter()) {
        return Err(CryptoError::MalformedEnvelope(
            "apv does not match recipient list".to_string(),
        ));
    }

    let recipient = envelope
        .recipients
        .iter()
        .find(|r| r.header.kid == recipient_kid)
        .ok_or(CryptoError::NoMatchingRecipient)?;

    if header.epk.kty != "OKP" || header.epk.crv != "X25519" {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "{}/{}",
            header.epk.kty, header.epk.crv
        )));
    }
    let epk = PublicKey::from(to_key_bytes("epk", &decode_field("epk.x", &header.epk.x)?)?);
    let sender = PublicKey::from(*sender_public);

    let shared = shared_secret(
        recipient_secret.diffie_hellman(&epk).as_bytes(),
        recipient_secret.diffie_hellman(&sender).as_bytes(),
    );
    let kek = derive_kek(ECDH_1PU_A256KW, &shared, &apu, &apv)?;
    let cek = unwrap_key_aes_kw(&kek, &decode_field("encrypted_key", &recipient.encrypted_key)?)?;

    let iv = decode_field("iv", &envelope.iv)?;
    let tag = decode_field("tag", &envelope.tag)?;
    if iv.len() != 12 || tag.len() != 16 {
        return Err(CryptoError::MalformedEnvelope(format!(
            "unexpected iv/tag length {}/{}",
            iv.len(),
            tag.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| CryptoError::Authentication(format!("invalid content key: {}", e)))?;
    let mut buffer = decode_field("ciphertext", &envelope.ciphertext)?;
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            envelope.protected.as_bytes(),
            &mut buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|e| CryptoError::Authentication(format!("AES-GCM decryption failed: {}", e)))?;

    Ok(buffer)
}

fn shared_secret(ephemeral: &[u8; 32], static_: &[u8; 32]) -> [u8; 64] {
    let mut z = [0u8; 64];
    z[..32].copy_from_slice(ephemeral);
    z[32..].copy_from_slice(static_);
    z
}

fn recipients_digest<'a>(kids: impl Iterator<Item = &'a str>) -> Vec<u8> {
    let mut kids: Vec<&str> = kids.collect();
    kids.sort_unstable();
    Sha256::digest(kids.join(".").as_bytes()).to_vec()
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    b64_decode(value).map_err(|e| CryptoError::MalformedEnvelope(format!("{}: {}", name, e)))
}

fn to_key_bytes(name: &str, bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be 32 bytes", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyRef;
    use assert_matches::assert_matches;

    struct Party {
        secret: StaticSecret,
        binding: KeyBinding,
    }

    fn party(name: &str) -> Party {
        let secret = StaticSecret::random_from_rng(OsRng);
        let key = KeyRef::from_x25519(PublicKey::from(&secret).as_bytes());
        Party {
            secret,
            binding: KeyBinding::new(format!("did:example:{}#key-1", name), key),
        }
    }

    fn public_of(p: &Party) -> [u8; 32] {
        *PublicKey::from(&p.secret).as_bytes()
    }

    #[test]
    fn test_pack_unpack() {
        let alice = party("alice");
        let bob = party("bob");

        let envelope = pack(b"hello bob", &alice.secret, &alice.binding.kid, &[bob.binding.clone()])
            .unwrap();
        assert_eq!(envelope.sender_kid().unwrap(), "did:example:alice#key-1");

        let plaintext = unpack(&envelope, &bob.secret, &bob.binding.kid, &public_of(&alice)).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_multiple_recipients() {
        let alice = party("alice");
        let bob = party("bob");
        let carol = party("carol");

        let envelope = pack(
            b"hi all",
            &alice.secret,
            &alice.binding.kid,
            &[bob.binding.clone(), carol.binding.clone()],
        )
        .unwrap();

        for p in [&bob, &carol] {
            let plaintext = unpack(&envelope, &p.secret, &p.binding.kid, &public_of(&alice)).unwrap();
            assert_eq!(plaintext, b"hi all");
        }
    }

    #[test]
    fn test_wrong_sender_key_fails() {
        let alice = party("alice");
        let bob = party("bob");
        let mallory = party("mallory");

        let envelope =
            pack(b"secret", &alice.secret, &alice.binding.kid, &[bob.binding.clone()]).unwrap();
        assert_matches!(
            unpack(&envelope, &bob.secret, &bob.binding.kid, &public_of(&mallory)),
            Err(CryptoError::Authentication(_))
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = party("alice");
        let bob = party("bob");

        let mut envelope =
            pack(b"secret", &alice.secret, &alice.binding.kid, &[bob.binding.clone()]).unwrap();
        let mut ciphertext = b64_decode(&envelope.ciphertext).unwrap();
        ciphertext[0] ^= 0xff;
        envelope.ciphertext = b64_encode(ciphertext);

        assert_matches!(
            unpack(&envelope, &bob.secret, &bob.binding.kid, &public_of(&alice)),
            Err(CryptoError::Authentication(_))
        );
    }

    #[test]
    fn test_not_a_recipient() {
        let alice = party("alice");
        let bob = party("bob");
        let carol = party("carol");

        let envelope =
            pack(b"secret", &alice.secret, &alice.binding.kid, &[bob.binding.clone()]).unwrap();
        assert_matches!(
            unpack(&envelope, &carol.secret, &carol.binding.kid, &public_of(&alice)),
            Err(CryptoError::NoMatchingRecipient)
        );
    }

    #[test]
    fn test_no_recipients() {
        let alice = party("alice");
        assert!(pack(b"x", &alice.secret, &alice.binding.kid, &[]).is_err());
    }
}
