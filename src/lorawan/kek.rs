//! Key envelope: transport protection for derived session keys.
//!
//! A session key handed to another operator is either carried in the clear
//! (empty KEK label) or wrapped under a named key-encryption-key with the
//! AES key wrap algorithm of RFC 3394 (a 128-bit key wraps to 24 bytes).
//! Wrap failures are never swallowed: they gate delivery of live key
//! material.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keys::Aes128Key;

/// RFC 3394 initial value.
const IV: [u8; 8] = [0xA6; 8];

/// Key wrap/unwrap failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KekError {
    #[error("KEK must be 16, 24, or 32 bytes, got {0}")]
    KekLength(usize),

    #[error("key to wrap must be a multiple of 8 and at least 16 bytes, got {0}")]
    PlaintextLength(usize),

    #[error("wrapped key must be a multiple of 8 and at least 24 bytes, got {0}")]
    CiphertextLength(usize),

    #[error("unwrap integrity check failed")]
    IntegrityCheck,
}

/// A session key as delivered to another operator. With an empty
/// `KEKLabel` the bytes are the plaintext key; otherwise they are the
/// RFC 3394 ciphertext under the named KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    #[serde(rename = "KEKLabel")]
    pub kek_label: String,

    #[serde(rename = "AESKey", with = "hex_key")]
    pub aes_key: Vec<u8>,
}

impl KeyEnvelope {
    /// Wrap `key` for transport. An empty label or an absent/empty KEK is
    /// the "no transport protection requested" case: the plaintext key with
    /// an empty label, not an error.
    pub fn new(label: &str, kek: Option<&[u8]>, key: &Aes128Key) -> Result<Self, KekError> {
        match kek {
            Some(kek) if !label.is_empty() && !kek.is_empty() => Ok(KeyEnvelope {
                kek_label: label.to_string(),
                aes_key: wrap(kek, &key.0)?,
            }),
            _ => Ok(KeyEnvelope {
                kek_label: String::new(),
                aes_key: key.0.to_vec(),
            }),
        }
    }

    /// Recover the carried key; exact inverse of [`KeyEnvelope::new`].
    pub fn unwrap_key(&self, kek: &[u8]) -> Result<Vec<u8>, KekError> {
        if self.kek_label.is_empty() {
            return Ok(self.aes_key.clone());
        }
        unwrap(kek, &self.aes_key)
    }
}

enum Kek {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Kek {
    fn new(kek: &[u8]) -> Result<Self, KekError> {
        match kek.len() {
            16 => Ok(Kek::Aes128(Aes128::new(GenericArray::from_slice(kek)))),
            24 => Ok(Kek::Aes192(Aes192::new(GenericArray::from_slice(kek)))),
            32 => Ok(Kek::Aes256(Aes256::new(GenericArray::from_slice(kek)))),
            other => Err(KekError::KekLength(other)),
        }
    }

    fn encrypt(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Kek::Aes128(c) => c.encrypt_block(block),
            Kek::Aes192(c) => c.encrypt_block(block),
            Kek::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Kek::Aes128(c) => c.decrypt_block(block),
            Kek::Aes192(c) => c.decrypt_block(block),
            Kek::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// RFC 3394 key wrap. Output is `plaintext.len() + 8` bytes.
pub fn wrap(kek: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, KekError> {
    if plaintext.len() % 8 != 0 || plaintext.len() < 16 {
        return Err(KekError::PlaintextLength(plaintext.len()));
    }
    let cipher = Kek::new(kek)?;
    let n = plaintext.len() / 8;

    let mut a = IV;
    let mut r = plaintext.to_vec();
    let mut block = [0u8; 16];
    for j in 0..6u64 {
        for i in 0..n {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i * 8..i * 8 + 8]);
            cipher.encrypt(&mut block);

            let t = n as u64 * j + i as u64 + 1;
            a.copy_from_slice(&block[..8]);
            a = (u64::from_be_bytes(a) ^ t).to_be_bytes();
            r[i * 8..i * 8 + 8].copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(8 + r.len());
    out.extend_from_slice(&a);
    out.extend_from_slice(&r);
    Ok(out)
}

/// RFC 3394 key unwrap; exactly inverts [`wrap`], failing on a malformed
/// length or an integrity-check mismatch.
pub fn unwrap(kek: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, KekError> {
    if ciphertext.len() % 8 != 0 || ciphertext.len() < 24 {
        return Err(KekError::CiphertextLength(ciphertext.len()));
    }
    let cipher = Kek::new(kek)?;
    let n = ciphertext.len() / 8 - 1;

    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut r = ciphertext[8..].to_vec();
    let mut block = [0u8; 16];
    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = n as u64 * j + i as u64 + 1;
            block[..8].copy_from_slice(&(u64::from_be_bytes(a) ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i * 8..i * 8 + 8]);
            cipher.decrypt(&mut block);

            a.copy_from_slice(&block[..8]);
            r[i * 8..i * 8 + 8].copy_from_slice(&block[8..]);
        }
    }

    if a != IV {
        return Err(KekError::IntegrityCheck);
    }
    Ok(r)
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kek16() -> Vec<u8> {
        (0..16).collect()
    }

    #[test]
    fn test_wrap_vector() {
        let key: Aes128Key = "df53c35f3034ccced0ff354c70de04df".parse().unwrap();
        let wrapped = wrap(&kek16(), &key.0).unwrap();
        assert_eq!(
            hex::encode(&wrapped),
            "9a1803d2aef2d561db23a93f0514a8c01461d2c3db1b7fff"
        );
    }

    #[test]
    fn test_rfc3394_vector_4_1() {
        // Wrap of 128 bits of key data with a 128-bit KEK.
        let key = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let wrapped = wrap(&kek16(), &key).unwrap();
        assert_eq!(
            hex::encode(&wrapped),
            "1fa68b0a8112b447aef34bd8fb5a7b829d3e862371d2cfe5"
        );
    }

    #[test]
    fn test_unwrap_inverts_wrap() {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        for kek_len in [16usize, 24, 32] {
            let kek: Vec<u8> = (0..kek_len as u8).collect();
            let wrapped = wrap(&kek, &key.0).unwrap();
            assert_eq!(wrapped.len(), 24);
            assert_eq!(unwrap(&kek, &wrapped).unwrap(), key.0.to_vec());
        }
    }

    #[test]
    fn test_envelope_without_kek_is_plaintext() {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();

        for envelope in [
            KeyEnvelope::new("", Some(&kek16()), &key).unwrap(),
            KeyEnvelope::new("ns-kek", None, &key).unwrap(),
            KeyEnvelope::new("ns-kek", Some(&[]), &key).unwrap(),
        ] {
            assert_eq!(envelope.kek_label, "");
            assert_eq!(envelope.aes_key, key.0.to_vec());
            assert_eq!(envelope.unwrap_key(&[]).unwrap(), key.0.to_vec());
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let key: Aes128Key = "df53c35f3034ccced0ff354c70de04df".parse().unwrap();
        let envelope = KeyEnvelope::new("010203", Some(&kek16()), &key).unwrap();

        assert_eq!(envelope.kek_label, "010203");
        assert_eq!(envelope.aes_key.len(), 24);
        assert_eq!(envelope.unwrap_key(&kek16()).unwrap(), key.0.to_vec());
    }

    #[test]
    fn test_bad_kek_length() {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(
            KeyEnvelope::new("lbl", Some(&[0u8; 15]), &key),
            Err(KekError::KekLength(15))
        );
    }

    #[test]
    fn test_malformed_ciphertext() {
        assert_eq!(
            unwrap(&kek16(), &[0u8; 17]),
            Err(KekError::CiphertextLength(17))
        );
        assert_eq!(
            unwrap(&kek16(), &[0u8; 16]),
            Err(KekError::CiphertextLength(16))
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        let mut wrapped = wrap(&kek16(), &key.0).unwrap();
        wrapped[3] ^= 0x01;
        assert_eq!(unwrap(&kek16(), &wrapped), Err(KekError::IntegrityCheck));
    }

    #[test]
    fn test_json_form() {
        let key: Aes128Key = "df53c35f3034ccced0ff354c70de04df".parse().unwrap();
        let envelope = KeyEnvelope::new("010203", Some(&kek16()), &key).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "KEKLabel": "010203",
                "AESKey": "9a1803d2aef2d561db23a93f0514a8c01461d2c3db1b7fff",
            })
        );

        let back: KeyEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
