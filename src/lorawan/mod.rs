//! LoRaWAN PHY codec for the join procedures.
//!
//! Parses the raw uplink messages a join server handles (Join-Request and
//! Rejoin-Request types 0/1/2) and computes/validates their AES-CMAC MICs.
//! Multi-byte wire fields are little-endian; EUIs and NetIDs are therefore
//! reversed relative to their MSB hex-string form.

pub mod accept;
pub mod kek;
pub mod keys;

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::KeyInit;
use aes::Aes128;
use bytes::Buf;
use cmac::{Cmac, Mac};
use thiserror::Error;

use keys::{Aes128Key, Eui64, KeyError, NetId};

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            0b111 => MType::Proprietary,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// PHY-layer decode/encode failure.
#[derive(Debug, Error)]
pub enum PhyError {
    #[error("empty PHY payload")]
    Empty,

    #[error("join-request must be 23 bytes, got {0}")]
    JoinRequestLength(usize),

    #[error("rejoin-request type {rejoin_type} must be {expected} bytes, got {got}")]
    RejoinRequestLength {
        rejoin_type: u8,
        expected: usize,
        got: usize,
    },

    #[error("unknown rejoin-type {0}")]
    UnknownRejoinType(u8),

    #[error("{0} is not join traffic")]
    UnsupportedFrame(MType),

    #[error("CFList must be 16 bytes, got {0}")]
    CfListLength(usize),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Rejoin-request variant. Types 0 and 2 share a wire layout and the
/// `RJCount0` counter; type 1 carries the JoinEUI and `RJCount1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinType {
    Zero,
    One,
    Two,
}

impl RejoinType {
    pub fn to_u8(self) -> u8 {
        match self {
            RejoinType::Zero => 0x00,
            RejoinType::One => 0x01,
            RejoinType::Two => 0x02,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, PhyError> {
        match value {
            0x00 => Ok(RejoinType::Zero),
            0x01 => Ok(RejoinType::One),
            0x02 => Ok(RejoinType::Two),
            other => Err(PhyError::UnknownRejoinType(other)),
        }
    }
}

/// Decoded join-procedure PHY message.
#[derive(Debug, Clone)]
pub enum PhyFrame {
    JoinRequest(JoinRequestPayload),
    RejoinRequest(RejoinRequestPayload),
    /// Downlink accept; body is opaque without the root keys.
    JoinAccept { encrypted_payload: Vec<u8> },
}

impl fmt::Display for PhyFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhyFrame::JoinRequest(jr) => write!(
                f,
                "JoinRequest JoinEUI={} DevEUI={} DevNonce={}",
                jr.join_eui, jr.dev_eui, jr.dev_nonce
            ),
            PhyFrame::RejoinRequest(rj) => write!(
                f,
                "RejoinRequest type={} DevEUI={} count={}",
                rj.rejoin_type().to_u8(),
                rj.dev_eui(),
                rj.rejoin_count()
            ),
            PhyFrame::JoinAccept { encrypted_payload } => {
                write!(f, "JoinAccept (encrypted, {} bytes)", encrypted_payload.len())
            }
        }
    }
}

/// Join-Request: MHDR(1) | JoinEUI(8) | DevEUI(8) | DevNonce(2) | MIC(4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: u16,
    pub mic: [u8; 4],
}

impl JoinRequestPayload {
    pub fn parse(data: &[u8]) -> Result<Self, PhyError> {
        if data.len() != 23 {
            return Err(PhyError::JoinRequestLength(data.len()));
        }

        let mut buf = &data[1..];
        let mut join_eui = [0u8; 8];
        buf.copy_to_slice(&mut join_eui);
        let mut dev_eui = [0u8; 8];
        buf.copy_to_slice(&mut dev_eui);
        let dev_nonce = buf.get_u16_le();
        let mut mic = [0u8; 4];
        buf.copy_to_slice(&mut mic);

        Ok(JoinRequestPayload {
            join_eui: Eui64::from_le_bytes(join_eui),
            dev_eui: Eui64::from_le_bytes(dev_eui),
            dev_nonce,
            mic,
        })
    }

    pub fn to_bytes(&self) -> [u8; 23] {
        let mut out = [0u8; 23];
        out[0] = 0x00; // MHDR: join-request, LoRaWAN R1
        out[1..9].copy_from_slice(&self.join_eui.to_le_bytes());
        out[9..17].copy_from_slice(&self.dev_eui.to_le_bytes());
        out[17..19].copy_from_slice(&self.dev_nonce.to_le_bytes());
        out[19..23].copy_from_slice(&self.mic);
        out
    }

    /// Expected uplink MIC: CMAC(NwkKey, MHDR | JoinEUI | DevEUI | DevNonce).
    pub fn compute_mic(&self, nwk_key: &Aes128Key) -> [u8; 4] {
        mic4(nwk_key, &self.to_bytes()[..19])
    }

    pub fn validate_mic(&self, nwk_key: &Aes128Key) -> bool {
        self.compute_mic(nwk_key) == self.mic
    }
}

/// Decoded Rejoin-Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinRequestPayload {
    /// Types 0/2: MHDR(1) | RejoinType(1) | NetID(3) | DevEUI(8) | RJCount0(2) | MIC(4)
    Type02 {
        rejoin_type: RejoinType,
        net_id: NetId,
        dev_eui: Eui64,
        rj_count0: u16,
        mic: [u8; 4],
    },
    /// Type 1: MHDR(1) | RejoinType(1) | JoinEUI(8) | DevEUI(8) | RJCount1(2) | MIC(4)
    Type1 {
        join_eui: Eui64,
        dev_eui: Eui64,
        rj_count1: u16,
        mic: [u8; 4],
    },
}

impl RejoinRequestPayload {
    pub fn parse(data: &[u8]) -> Result<Self, PhyError> {
        if data.len() < 2 {
            return Err(PhyError::RejoinRequestLength {
                rejoin_type: 0,
                expected: 19,
                got: data.len(),
            });
        }
        let rejoin_type = RejoinType::from_u8(data[1])?;

        let expected = match rejoin_type {
            RejoinType::Zero | RejoinType::Two => 19,
            RejoinType::One => 24,
        };
        if data.len() != expected {
            return Err(PhyError::RejoinRequestLength {
                rejoin_type: rejoin_type.to_u8(),
                expected,
                got: data.len(),
            });
        }

        let mut buf = &data[2..];
        match rejoin_type {
            RejoinType::Zero | RejoinType::Two => {
                let mut net_id = [0u8; 3];
                buf.copy_to_slice(&mut net_id);
                let mut dev_eui = [0u8; 8];
                buf.copy_to_slice(&mut dev_eui);
                let rj_count0 = buf.get_u16_le();
                let mut mic = [0u8; 4];
                buf.copy_to_slice(&mut mic);

                Ok(RejoinRequestPayload::Type02 {
                    rejoin_type,
                    net_id: NetId::from_le_bytes(net_id),
                    dev_eui: Eui64::from_le_bytes(dev_eui),
                    rj_count0,
                    mic,
                })
            }
            RejoinType::One => {
                let mut join_eui = [0u8; 8];
                buf.copy_to_slice(&mut join_eui);
                let mut dev_eui = [0u8; 8];
                buf.copy_to_slice(&mut dev_eui);
                let rj_count1 = buf.get_u16_le();
                let mut mic = [0u8; 4];
                buf.copy_to_slice(&mut mic);

                Ok(RejoinRequestPayload::Type1 {
                    join_eui: Eui64::from_le_bytes(join_eui),
                    dev_eui: Eui64::from_le_bytes(dev_eui),
                    rj_count1,
                    mic,
                })
            }
        }
    }

    pub fn rejoin_type(&self) -> RejoinType {
        match self {
            RejoinRequestPayload::Type02 { rejoin_type, .. } => *rejoin_type,
            RejoinRequestPayload::Type1 { .. } => RejoinType::One,
        }
    }

    pub fn dev_eui(&self) -> Eui64 {
        match self {
            RejoinRequestPayload::Type02 { dev_eui, .. } => *dev_eui,
            RejoinRequestPayload::Type1 { dev_eui, .. } => *dev_eui,
        }
    }

    /// The counter acting as the DevNonce-equivalent for this rejoin:
    /// RJCount0 for types 0/2, RJCount1 for type 1.
    pub fn rejoin_count(&self) -> u16 {
        match self {
            RejoinRequestPayload::Type02 { rj_count0, .. } => *rj_count0,
            RejoinRequestPayload::Type1 { rj_count1, .. } => *rj_count1,
        }
    }
}

/// Decode a raw PHY payload into a join-procedure frame.
pub fn parse_phy_payload(data: &[u8]) -> Result<PhyFrame, PhyError> {
    if data.is_empty() {
        return Err(PhyError::Empty);
    }

    match MType::from(data[0]) {
        MType::JoinRequest => Ok(PhyFrame::JoinRequest(JoinRequestPayload::parse(data)?)),
        MType::RejoinRequest => Ok(PhyFrame::RejoinRequest(RejoinRequestPayload::parse(data)?)),
        MType::JoinAccept => Ok(PhyFrame::JoinAccept {
            encrypted_payload: data[1..].to_vec(),
        }),
        other => Err(PhyError::UnsupportedFrame(other)),
    }
}

/// AES-CMAC truncated to the 4-byte MIC.
pub(crate) fn mic4(key: &Aes128Key, data: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&key.0));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&tag[..4]);
    mic
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOIN_REQUEST_HEX: &str = "00010203040506070808070605040302010201cde6acb8";

    fn nwk_key() -> Aes128Key {
        Aes128Key([1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn test_decode_join_request() {
        // MHDR | JoinEUI(LE) | DevEUI(LE) | DevNonce(LE) | MIC
        let data = hex::decode(JOIN_REQUEST_HEX).unwrap();

        let frame = parse_phy_payload(&data).unwrap();
        match frame {
            PhyFrame::JoinRequest(jr) => {
                assert_eq!(jr.join_eui.to_string(), "0807060504030201");
                assert_eq!(jr.dev_eui.to_string(), "0102030405060708");
                assert_eq!(jr.dev_nonce, 258);
                assert_eq!(jr.mic, [0xcd, 0xe6, 0xac, 0xb8]);
                assert_eq!(jr.to_bytes().to_vec(), data);
            }
            _ => panic!("Expected JoinRequest frame"),
        }
    }

    #[test]
    fn test_join_request_mic() {
        let data = hex::decode(JOIN_REQUEST_HEX).unwrap();
        let jr = JoinRequestPayload::parse(&data).unwrap();

        assert_eq!(jr.compute_mic(&nwk_key()), [0xcd, 0xe6, 0xac, 0xb8]);
        assert!(jr.validate_mic(&nwk_key()));
    }

    #[test]
    fn test_join_request_mic_bit_flip_fails() {
        for bit in 0..32 {
            let mut data = hex::decode(JOIN_REQUEST_HEX).unwrap();
            data[19 + bit / 8] ^= 1 << (bit % 8);

            let jr = JoinRequestPayload::parse(&data).unwrap();
            assert!(!jr.validate_mic(&nwk_key()), "flipped MIC bit {} accepted", bit);
        }
    }

    #[test]
    fn test_join_request_wrong_length() {
        let result = JoinRequestPayload::parse(&[0x00; 22]);
        assert!(matches!(result, Err(PhyError::JoinRequestLength(22))));
    }

    #[test]
    fn test_decode_rejoin_type0() {
        // MHDR=0xC0 | type=0 | NetID(LE) | DevEUI(LE) | RJCount0(LE) | MIC
        let data = hex::decode("c00003020108070605040302010a00deadbeef").unwrap();

        match parse_phy_payload(&data).unwrap() {
            PhyFrame::RejoinRequest(rj) => {
                assert_eq!(rj.rejoin_type(), RejoinType::Zero);
                assert_eq!(rj.dev_eui().to_string(), "0102030405060708");
                assert_eq!(rj.rejoin_count(), 10);
                match rj {
                    RejoinRequestPayload::Type02 { net_id, .. } => {
                        assert_eq!(net_id.to_string(), "010203");
                    }
                    _ => panic!("Expected Type02"),
                }
            }
            _ => panic!("Expected RejoinRequest frame"),
        }
    }

    #[test]
    fn test_decode_rejoin_type1() {
        // MHDR=0xC0 | type=1 | JoinEUI(LE) | DevEUI(LE) | RJCount1(LE) | MIC
        let data = hex::decode("c001010203040506070808070605040302010500deadbeef").unwrap();

        match parse_phy_payload(&data).unwrap() {
            PhyFrame::RejoinRequest(rj) => {
                assert_eq!(rj.rejoin_type(), RejoinType::One);
                assert_eq!(rj.dev_eui().to_string(), "0102030405060708");
                assert_eq!(rj.rejoin_count(), 5);
                match rj {
                    RejoinRequestPayload::Type1 { join_eui, .. } => {
                        assert_eq!(join_eui.to_string(), "0807060504030201");
                    }
                    _ => panic!("Expected Type1"),
                }
            }
            _ => panic!("Expected RejoinRequest frame"),
        }
    }

    #[test]
    fn test_rejoin_unknown_type() {
        let mut data = vec![0xC0, 0x05];
        data.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            RejoinRequestPayload::parse(&data),
            Err(PhyError::UnknownRejoinType(5))
        ));
    }

    #[test]
    fn test_rejoin_wrong_length() {
        // Type 1 declared but type-0 sized body
        let mut data = vec![0xC0, 0x01];
        data.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            RejoinRequestPayload::parse(&data),
            Err(PhyError::RejoinRequestLength {
                rejoin_type: 1,
                expected: 24,
                got: 19,
            })
        ));
    }

    #[test]
    fn test_data_frame_rejected() {
        let data = vec![0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00];
        assert!(matches!(
            parse_phy_payload(&data),
            Err(PhyError::UnsupportedFrame(MType::UnconfirmedDataUp))
        ));
    }

    #[test]
    fn test_empty_payload_fails() {
        assert!(matches!(parse_phy_payload(&[]), Err(PhyError::Empty)));
    }
}
