//! Key material, identifier newtypes, and session key derivation.
//!
//! Identifiers and keys travel as MSB hex strings in JSON and config, and
//! little-endian on the LoRaWAN wire. Every session key is produced by one
//! AES-128 block encryption of a typed, zero-padded 16-byte block (the
//! cipher is a keyed permutation here, not a mode of operation).

use std::fmt;
use std::str::FromStr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

/// JoinNonce is a 24-bit counter; anything larger must be rejected,
/// never truncated.
pub const MAX_JOIN_NONCE: u32 = (1 << 24) - 1;

macro_rules! fixed_hex {
    (
        $(#[$outer:meta])*
        pub struct $name:ident([u8; $len:expr]);
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok($name(bytes))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

macro_rules! wire_order {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Bytes in LoRaWAN wire order (least significant byte first).
            pub fn to_le_bytes(&self) -> [u8; $len] {
                let mut out = self.0;
                out.reverse();
                out
            }

            /// Construct from wire-order bytes.
            pub fn from_le_bytes(mut bytes: [u8; $len]) -> Self {
                bytes.reverse();
                $name(bytes)
            }
        }
    };
}

fixed_hex!(
    /// A 128-bit AES key (root or session). Hex strings are MSB,
    /// e.g. `"00112233445566778899aabbccddeeff"`.
    pub struct Aes128Key([u8; 16]);
);

fixed_hex!(
    /// EUI-64 identifier (DevEUI or JoinEUI). MSB as a string,
    /// little-endian on the wire.
    pub struct Eui64([u8; 8]);
);

fixed_hex!(
    /// 24-bit network identifier.
    pub struct NetId([u8; 3]);
);

fixed_hex!(
    /// 32-bit device address assigned by the network server.
    pub struct DevAddr([u8; 4]);
);

wire_order!(Eui64, 8);
wire_order!(NetId, 3);
wire_order!(DevAddr, 4);

/// Session key derivation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The join-nonce counter does not fit its 3-byte slot.
    #[error("join-nonce {0} does not fit in 24 bits")]
    JoinNonceOverflow(u32),
}

/// Encode a join-nonce into its 3-byte little-endian slot, rejecting
/// out-of-range values.
pub fn join_nonce_bytes(join_nonce: u32) -> Result<[u8; 3], KeyError> {
    if join_nonce > MAX_JOIN_NONCE {
        return Err(KeyError::JoinNonceOverflow(join_nonce));
    }
    let le = join_nonce.to_le_bytes();
    Ok([le[0], le[1], le[2]])
}

/// Context octets shared by the four session key derivations.
///
/// With `opt_neg` set (LoRaWAN 1.1) the block carries the JoinEUI; the
/// legacy layout carries the serving NetID instead. `dev_nonce` is the
/// uplink DevNonce for a join, or the RJCount for a rejoin.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub opt_neg: bool,
    pub join_nonce: u32,
    pub net_id: NetId,
    pub join_eui: Eui64,
    pub dev_nonce: u16,
}

fn encrypt_block(root: &Aes128Key, block: [u8; 16]) -> Aes128Key {
    let cipher = Aes128::new(GenericArray::from_slice(&root.0));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    Aes128Key(block.into())
}

fn derive_skey(typ: u8, root: &Aes128Key, ctx: &SessionContext) -> Result<Aes128Key, KeyError> {
    let join_nonce = join_nonce_bytes(ctx.join_nonce)?;
    let mut b = [0u8; 16];
    b[0] = typ;
    b[1..4].copy_from_slice(&join_nonce);
    if ctx.opt_neg {
        b[4..12].copy_from_slice(&ctx.join_eui.to_le_bytes());
        b[12..14].copy_from_slice(&ctx.dev_nonce.to_le_bytes());
    } else {
        b[4..7].copy_from_slice(&ctx.net_id.to_le_bytes());
        b[7..9].copy_from_slice(&ctx.dev_nonce.to_le_bytes());
    }
    Ok(encrypt_block(root, b))
}

/// FNwkSIntKey (1.1), also the single NwkSKey of the collapsed 1.0.x
/// hierarchy. Root is always NwkKey.
pub fn derive_f_nwk_s_int_key(
    nwk_key: &Aes128Key,
    ctx: &SessionContext,
) -> Result<Aes128Key, KeyError> {
    derive_skey(0x01, nwk_key, ctx)
}

/// AppSKey. The root is AppKey when `ctx.opt_neg`, NwkKey otherwise;
/// the caller picks per the device's hierarchy.
pub fn derive_app_s_key(root: &Aes128Key, ctx: &SessionContext) -> Result<Aes128Key, KeyError> {
    derive_skey(0x02, root, ctx)
}

/// SNwkSIntKey (1.1 only).
pub fn derive_s_nwk_s_int_key(
    nwk_key: &Aes128Key,
    ctx: &SessionContext,
) -> Result<Aes128Key, KeyError> {
    derive_skey(0x03, nwk_key, ctx)
}

/// NwkSEncKey (1.1 only).
pub fn derive_nwk_s_enc_key(
    nwk_key: &Aes128Key,
    ctx: &SessionContext,
) -> Result<Aes128Key, KeyError> {
    derive_skey(0x04, nwk_key, ctx)
}

/// JSEncKey, which encrypts join-accepts for 1.1 devices. Fixed DevEUI
/// layout regardless of protocol version.
pub fn derive_js_enc_key(nwk_key: &Aes128Key, dev_eui: &Eui64) -> Aes128Key {
    derive_js_key(0x05, nwk_key, dev_eui)
}

/// JSIntKey, which signs join-accepts for 1.1 devices.
pub fn derive_js_int_key(nwk_key: &Aes128Key, dev_eui: &Eui64) -> Aes128Key {
    derive_js_key(0x06, nwk_key, dev_eui)
}

fn derive_js_key(typ: u8, nwk_key: &Aes128Key, dev_eui: &Eui64) -> Aes128Key {
    let mut b = [0u8; 16];
    b[0] = typ;
    b[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    encrypt_block(nwk_key, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nwk_key() -> Aes128Key {
        Aes128Key([1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8])
    }

    fn legacy_ctx() -> SessionContext {
        SessionContext {
            opt_neg: false,
            join_nonce: 65536,
            net_id: NetId([1, 2, 3]),
            join_eui: Eui64([8, 7, 6, 5, 4, 3, 2, 1]),
            dev_nonce: 258,
        }
    }

    fn opt_neg_ctx() -> SessionContext {
        SessionContext {
            opt_neg: true,
            ..legacy_ctx()
        }
    }

    #[test]
    fn test_legacy_nwk_s_key_vector() {
        // B = 01 | JoinNonce(00 00 01) | NetID(03 02 01) | DevNonce(02 01) | pad
        let key = derive_f_nwk_s_int_key(&nwk_key(), &legacy_ctx()).unwrap();
        assert_eq!(key.to_string(), "df53c35f3034ccced0ff354c70de04df");
    }

    #[test]
    fn test_legacy_app_s_key_roots_from_nwk_key() {
        let key = derive_app_s_key(&nwk_key(), &legacy_ctx()).unwrap();
        assert_eq!(key.to_string(), "927b9c911183cffe4cb2ff4b75545f6d");
    }

    #[test]
    fn test_opt_neg_session_keys() {
        let app_key: Aes128Key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let ctx = opt_neg_ctx();

        let f_nwk = derive_f_nwk_s_int_key(&nwk_key(), &ctx).unwrap();
        let app_s = derive_app_s_key(&app_key, &ctx).unwrap();
        let s_nwk = derive_s_nwk_s_int_key(&nwk_key(), &ctx).unwrap();
        let nwk_enc = derive_nwk_s_enc_key(&nwk_key(), &ctx).unwrap();

        assert_eq!(f_nwk.to_string(), "537f8aae896c79e015d102d06286354e");
        assert_eq!(app_s.to_string(), "7fa284d63723497193b1df41b85d2027");
        assert_eq!(s_nwk.to_string(), "589498993092cfdb5fd2e02ac7510bf1");
        assert_eq!(nwk_enc.to_string(), "9898283c4f66eb6c6fd5165882046c40");
    }

    #[test]
    fn test_app_s_key_differs_by_root() {
        // Same request data, different hierarchy root: the derived AppSKey
        // must diverge.
        let app_key: Aes128Key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let from_app = derive_app_s_key(&app_key, &opt_neg_ctx()).unwrap();
        let from_nwk = derive_app_s_key(&nwk_key(), &legacy_ctx()).unwrap();
        assert_ne!(from_app, from_nwk);
    }

    #[test]
    fn test_js_keys() {
        let dev_eui = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);
        let enc = derive_js_enc_key(&nwk_key(), &dev_eui);
        let int = derive_js_int_key(&nwk_key(), &dev_eui);
        assert_eq!(enc.to_string(), "d4bd9461adaa3b4e601953ebd08bffc6");
        assert_eq!(int.to_string(), "b8ae379696825f22c8abbec24c31a84b");
    }

    #[test]
    fn test_join_nonce_overflow_rejected() {
        let mut ctx = legacy_ctx();
        ctx.join_nonce = 1 << 24;
        assert_eq!(
            derive_f_nwk_s_int_key(&nwk_key(), &ctx),
            Err(KeyError::JoinNonceOverflow(1 << 24))
        );

        ctx.join_nonce = MAX_JOIN_NONCE;
        assert!(derive_f_nwk_s_int_key(&nwk_key(), &ctx).is_ok());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_f_nwk_s_int_key(&nwk_key(), &legacy_ctx()).unwrap();
        let b = derive_f_nwk_s_int_key(&nwk_key(), &legacy_ctx()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui, Eui64([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(eui.to_string(), "0102030405060708");
        assert_eq!(eui.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(Eui64::from_le_bytes([8, 7, 6, 5, 4, 3, 2, 1]), eui);

        assert!("01020304050607".parse::<Eui64>().is_err());
        assert!("010203040506070z".parse::<Eui64>().is_err());
    }

    #[test]
    fn test_serde_hex_strings() {
        let net_id = NetId([1, 2, 3]);
        assert_eq!(serde_json::to_string(&net_id).unwrap(), r#""010203""#);
        let back: NetId = serde_json::from_str(r#""010203""#).unwrap();
        assert_eq!(back, net_id);
    }
}
