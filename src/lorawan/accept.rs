//! Join-Accept frame builder.
//!
//! Frame structure:
//!   MHDR(1) | JoinNonce(3,LE) | HomeNetID(3,LE) | DevAddr(4,LE) |
//!   DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4,LE)
//!
//! The MIC is computed over the plaintext, then everything after the MHDR
//! (MIC included) is encrypted with the AES *decrypt* primitive, so the
//! device recovers it with a plain encrypt.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;

use super::keys::{join_nonce_bytes, Aes128Key, DevAddr, Eui64, NetId};
use super::{mic4, PhyError, RejoinType};

/// MHDR: join-accept, LoRaWAN R1
const MHDR_JOIN_ACCEPT: u8 = 0x20;

/// Which uplink the accept answers. Selects the JoinReqType byte that
/// prefixes the 1.1 downlink MIC input.
#[derive(Debug, Clone, Copy)]
pub enum AnsweredUplink {
    JoinRequest,
    RejoinRequest(RejoinType),
}

impl AnsweredUplink {
    fn join_req_type(self) -> u8 {
        match self {
            AnsweredUplink::JoinRequest => 0xFF,
            AnsweredUplink::RejoinRequest(t) => t.to_u8(),
        }
    }
}

/// Parameters for building a Join-Accept downlink.
#[derive(Debug, Clone)]
pub struct JoinAcceptBuilder {
    pub join_nonce: u32,
    pub home_net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: u8,
    pub rx_delay: u8,
    /// Channel-frequency list, copied verbatim from the request when present.
    pub cf_list: Option<Vec<u8>>,
}

impl JoinAcceptBuilder {
    /// Serialize, sign, and encrypt the accept.
    ///
    /// Legacy (1.0.x): MIC over MHDR..CFList; `join_eui`/`dev_nonce` play no
    /// part. 1.1 (`opt_neg`): MIC over JoinReqType | JoinEUI | DevNonce |
    /// MHDR..CFList. The caller supplies the matching `mic_key`/`enc_key`
    /// (NwkKey for legacy, JSIntKey/JSEncKey for 1.1).
    pub fn build(
        &self,
        opt_neg: bool,
        answered: AnsweredUplink,
        join_eui: &Eui64,
        dev_nonce: u16,
        mic_key: &Aes128Key,
        enc_key: &Aes128Key,
    ) -> Result<Vec<u8>, PhyError> {
        let fields = self.plaintext_fields()?;

        let mut mic_input = Vec::with_capacity(11 + 1 + fields.len());
        if opt_neg {
            mic_input.push(answered.join_req_type());
            mic_input.extend_from_slice(&join_eui.to_le_bytes());
            mic_input.extend_from_slice(&dev_nonce.to_le_bytes());
        }
        mic_input.push(MHDR_JOIN_ACCEPT);
        mic_input.extend_from_slice(&fields);
        let mic = mic4(mic_key, &mic_input);

        let mut body = fields;
        body.extend_from_slice(&mic);

        let cipher = Aes128::new(GenericArray::from_slice(&enc_key.0));
        for chunk in body.chunks_exact_mut(16) {
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }

        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(MHDR_JOIN_ACCEPT);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// JoinNonce..CFList, without MHDR and MIC. 12 or 28 bytes, so the
    /// encrypted body (MIC appended) always falls on a block boundary.
    fn plaintext_fields(&self) -> Result<Vec<u8>, PhyError> {
        let mut fields = Vec::with_capacity(28);
        fields.extend_from_slice(&join_nonce_bytes(self.join_nonce)?);
        fields.extend_from_slice(&self.home_net_id.to_le_bytes());
        fields.extend_from_slice(&self.dev_addr.to_le_bytes());
        fields.push(self.dl_settings);
        fields.push(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            if cf_list.len() != 16 {
                return Err(PhyError::CfListLength(cf_list.len()));
            }
            fields.extend_from_slice(cf_list);
        }
        Ok(fields)
    }
}
