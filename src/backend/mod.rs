//! Backend Interfaces JSON schema.
//!
//! One JSON document per request and per answer. Field spellings follow
//! the LoRaWAN Backend Interfaces convention (`SenderID`, `PHYPayload`,
//! `MICFailed`, ...); byte-valued fields travel as hex strings. The
//! message-type set is closed: dispatch is a match over the enum, not a
//! runtime-populated registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lorawan::kek::KeyEnvelope;
use crate::lorawan::keys::{DevAddr, Eui64, NetId};

/// Backend Interfaces protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Arbitrary-length bytes as a hex string in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Vec<u8>);

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        HexBytes(bytes)
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(HexBytes)
            .map_err(serde::de::Error::custom)
    }
}

/// Raw DLSettings octet, hex in JSON. Bit 7 is OptNeg: set means the
/// device negotiates LoRaWAN 1.1 and the four-key hierarchy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings(pub u8);

impl DlSettings {
    pub fn opt_neg(&self) -> bool {
        self.0 & 0x80 != 0
    }
}

impl Serialize for DlSettings {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode([self.0]))
    }
}

impl<'de> Deserialize<'de> for DlSettings {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut byte = [0u8; 1];
        hex::decode_to_slice(&s, &mut byte).map_err(serde::de::Error::custom)?;
        Ok(DlSettings(byte[0]))
    }
}

/// Message types this server consumes and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageType {
    JoinReq,
    JoinAns,
    RejoinReq,
    RejoinAns,
    HomeNSReq,
    HomeNSAns,
    /// Any declared type this server does not handle.
    Unknown,
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "JoinReq" => MessageType::JoinReq,
            "JoinAns" => MessageType::JoinAns,
            "RejoinReq" => MessageType::RejoinReq,
            "RejoinAns" => MessageType::RejoinAns,
            "HomeNSReq" => MessageType::HomeNSReq,
            "HomeNSAns" => MessageType::HomeNSAns,
            _ => MessageType::Unknown,
        })
    }
}

/// Domain result codes produced by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    #[serde(rename = "MICFailed")]
    MicFailed,
    #[serde(rename = "UnknownDevEUI")]
    UnknownDevEui,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "ResultCode")]
    pub result_code: ResultCode,

    #[serde(rename = "Description", default)]
    pub description: String,
}

impl ResultPayload {
    pub fn success() -> Self {
        ResultPayload {
            result_code: ResultCode::Success,
            description: String::new(),
        }
    }
}

/// Common envelope shared by every request and answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePayload {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: String,

    #[serde(rename = "SenderID")]
    pub sender_id: String,

    #[serde(rename = "ReceiverID")]
    pub receiver_id: String,

    #[serde(rename = "TransactionID")]
    pub transaction_id: u32,

    #[serde(rename = "MessageType")]
    pub message_type: MessageType,

    #[serde(rename = "Result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
}

impl BasePayload {
    /// Envelope for the answer to this request: sender and receiver
    /// swapped, transaction id echoed, `*Ans` type and result attached.
    /// Set unconditionally, success or failure.
    pub fn answer(&self, message_type: MessageType, result: ResultPayload) -> BasePayload {
        BasePayload {
            protocol_version: self.protocol_version.clone(),
            sender_id: self.receiver_id.clone(),
            receiver_id: self.sender_id.clone(),
            transaction_id: self.transaction_id,
            message_type,
            result: Some(result),
        }
    }
}

/// JoinReq from the serving network server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReqPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "MACVersion")]
    pub mac_version: String,

    #[serde(rename = "PHYPayload")]
    pub phy_payload: HexBytes,

    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,

    #[serde(rename = "DevAddr")]
    pub dev_addr: DevAddr,

    #[serde(rename = "DLSettings")]
    pub dl_settings: DlSettings,

    #[serde(rename = "RxDelay")]
    pub rx_delay: u8,

    /// Copied verbatim into the accept when present.
    #[serde(rename = "CFList", default, skip_serializing_if = "Option::is_none")]
    pub cf_list: Option<HexBytes>,
}

/// JoinAns back to the serving network server. Key envelopes are only
/// present on success, and only those the negotiated hierarchy defines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAnsPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "PHYPayload", default, skip_serializing_if = "Option::is_none")]
    pub phy_payload: Option<HexBytes>,

    #[serde(rename = "NwkSKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_key: Option<KeyEnvelope>,

    #[serde(rename = "FNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,

    #[serde(rename = "SNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,

    #[serde(rename = "NwkSEncKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelope>,

    #[serde(rename = "AppSKey", default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
}

/// RejoinReq from the serving network server. Structurally a JoinReq;
/// the PHYPayload carries a rejoin-request instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinReqPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "MACVersion")]
    pub mac_version: String,

    #[serde(rename = "PHYPayload")]
    pub phy_payload: HexBytes,

    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,

    #[serde(rename = "DevAddr")]
    pub dev_addr: DevAddr,

    #[serde(rename = "DLSettings")]
    pub dl_settings: DlSettings,

    #[serde(rename = "RxDelay")]
    pub rx_delay: u8,

    #[serde(rename = "CFList", default, skip_serializing_if = "Option::is_none")]
    pub cf_list: Option<HexBytes>,
}

/// RejoinAns: always the four-key 1.1 envelope set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinAnsPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "PHYPayload", default, skip_serializing_if = "Option::is_none")]
    pub phy_payload: Option<HexBytes>,

    #[serde(rename = "FNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,

    #[serde(rename = "SNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,

    #[serde(rename = "NwkSEncKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelope>,

    #[serde(rename = "AppSKey", default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
}

/// Device-to-home-network lookup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeNsReqPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeNsAnsPayload {
    #[serde(flatten)]
    pub base: BasePayload,

    #[serde(rename = "HNetID", default, skip_serializing_if = "Option::is_none")]
    pub h_net_id: Option<NetId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_req() {
        let doc = serde_json::json!({
            "ProtocolVersion": "1.0",
            "SenderID": "010203",
            "ReceiverID": "0807060504030201",
            "TransactionID": 278273610,
            "MessageType": "JoinReq",
            "MACVersion": "1.0.3",
            "PHYPayload": "00010203040506070808070605040302010201cde6acb8",
            "DevEUI": "0102030405060708",
            "DevAddr": "01020304",
            "DLSettings": "00",
            "RxDelay": 1,
        });

        let pl: JoinReqPayload = serde_json::from_value(doc).unwrap();
        assert_eq!(pl.base.message_type, MessageType::JoinReq);
        assert_eq!(pl.base.sender_id, "010203");
        assert_eq!(pl.base.transaction_id, 278273610);
        assert_eq!(pl.dev_eui.to_string(), "0102030405060708");
        assert_eq!(pl.phy_payload.0.len(), 23);
        assert!(!pl.dl_settings.opt_neg());
        assert!(pl.cf_list.is_none());
        assert!(pl.base.result.is_none());
    }

    #[test]
    fn test_opt_neg_bit() {
        let dl: DlSettings = serde_json::from_value(serde_json::json!("80")).unwrap();
        assert!(dl.opt_neg());
        assert_eq!(serde_json::to_value(dl).unwrap(), serde_json::json!("80"));
    }

    #[test]
    fn test_unknown_message_type() {
        let mt: MessageType = serde_json::from_value(serde_json::json!("PRStartReq")).unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn test_result_code_spellings() {
        assert_eq!(
            serde_json::to_value(ResultCode::MicFailed).unwrap(),
            serde_json::json!("MICFailed")
        );
        assert_eq!(
            serde_json::to_value(ResultCode::UnknownDevEui).unwrap(),
            serde_json::json!("UnknownDevEUI")
        );
        assert_eq!(
            serde_json::to_value(ResultCode::Success).unwrap(),
            serde_json::json!("Success")
        );
    }

    #[test]
    fn test_answer_swaps_envelope() {
        let base = BasePayload {
            protocol_version: PROTOCOL_VERSION.to_string(),
            sender_id: "010203".to_string(),
            receiver_id: "0807060504030201".to_string(),
            transaction_id: 42,
            message_type: MessageType::JoinReq,
            result: None,
        };

        let ans = base.answer(MessageType::JoinAns, ResultPayload::success());
        assert_eq!(ans.sender_id, "0807060504030201");
        assert_eq!(ans.receiver_id, "010203");
        assert_eq!(ans.transaction_id, 42);
        assert_eq!(ans.message_type, MessageType::JoinAns);
        assert_eq!(ans.result.unwrap().result_code, ResultCode::Success);
    }

    #[test]
    fn test_hex_bytes_rejects_bad_hex() {
        assert!(serde_json::from_value::<HexBytes>(serde_json::json!("zz")).is_err());
    }
}
