//! The join server core: collaborator interface, error taxonomy, and the
//! request dispatcher.
//!
//! The core is stateless across requests. All durable state (device root
//! keys, KEK material) lives behind the [`DeviceStore`] trait; a request
//! context exists only for the lifetime of one request.

mod flow;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{
    BasePayload, HomeNsAnsPayload, HomeNsReqPayload, JoinAnsPayload, JoinReqPayload, MessageType,
    RejoinAnsPayload, RejoinReqPayload, ResultCode, ResultPayload,
};
use crate::lorawan::kek::KekError;
use crate::lorawan::keys::{Aes128Key, Eui64, KeyError, NetId};
use crate::lorawan::PhyError;

use self::flow::Flow;

/// Per-device root credentials as supplied by the collaborator.
///
/// `join_nonce` is whatever counter value the store hands out for this
/// activation; supplying it monotonically is the store's job, the core only
/// validates the 24-bit range.
#[derive(Debug, Clone)]
pub struct DeviceKeys {
    pub dev_eui: Eui64,
    pub nwk_key: Aes128Key,
    pub app_key: Aes128Key,
    pub join_nonce: u32,
}

/// Collaborator failure outside the "not found" case, which every lookup
/// expresses as `Ok(None)` rather than a sentinel error.
#[derive(Debug, Error)]
#[error("store: {0}")]
pub struct StoreError(pub String);

/// Caller-supplied lookups backing the join procedures.
pub trait DeviceStore: Send + Sync {
    /// Root material and the current join-nonce for a device.
    fn device_keys(&self, dev_eui: &Eui64) -> Result<Option<DeviceKeys>, StoreError>;

    /// KEK bytes for a label. `Ok(None)` means no transport protection
    /// for keys wrapped under that label.
    fn kek(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// KEK label protecting the AppSKey toward the application server.
    fn app_s_kek_label(&self, dev_eui: &Eui64) -> Result<Option<String>, StoreError>;

    /// Home NetID for HomeNSReq resolution.
    fn home_net_id(&self, dev_eui: &Eui64) -> Result<Option<NetId>, StoreError>;
}

/// A pipeline failure. Classification into a [`ResultCode`] is by variant
/// identity, never by message text.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Uplink MIC mismatch; always distinct from every other failure.
    #[error("invalid MIC")]
    MicFailed,

    #[error("unknown DevEUI {0}")]
    UnknownDevEui(Eui64),

    #[error("SenderID is not a NetID: {0:?}")]
    InvalidSenderId(String),

    #[error("ReceiverID is not a JoinEUI: {0:?}")]
    InvalidReceiverId(String),

    #[error("PHYPayload is not a {expected}")]
    UnexpectedFrame { expected: &'static str },

    #[error("pipeline state missing: {0}")]
    MissingState(&'static str),

    #[error(transparent)]
    Phy(#[from] PhyError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Kek(#[from] KekError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JoinError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            JoinError::MicFailed => ResultCode::MicFailed,
            JoinError::UnknownDevEui(_) => ResultCode::UnknownDevEui,
            _ => ResultCode::Other,
        }
    }

    pub fn to_result(&self) -> ResultPayload {
        ResultPayload {
            result_code: self.result_code(),
            description: self.to_string(),
        }
    }
}

/// Transport-level failure: the body never made it to a pipeline.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed JSON body: {0}")]
    MalformedBody(serde_json::Error),

    #[error("failed to encode answer: {0}")]
    EncodeAnswer(serde_json::Error),
}

/// The request dispatcher and pipeline host.
pub struct JoinServer<S> {
    store: S,
}

impl<S: DeviceStore> JoinServer<S> {
    pub fn new(store: S) -> Self {
        JoinServer { store }
    }

    /// Handle one Backend Interfaces JSON document.
    ///
    /// Protocol-level failures (bad MIC, unknown device, crypto errors) are
    /// encoded in the answer's `Result`; only an unreadable body escalates
    /// as [`RequestError`].
    pub fn handle_request(&self, body: &[u8]) -> Result<serde_json::Value, RequestError> {
        let base: BasePayload =
            serde_json::from_slice(body).map_err(RequestError::MalformedBody)?;
        debug!(
            "{:?} from {} (transaction {})",
            base.message_type, base.sender_id, base.transaction_id
        );

        let answer = match base.message_type {
            MessageType::JoinReq => {
                let pl: JoinReqPayload =
                    serde_json::from_slice(body).map_err(RequestError::MalformedBody)?;
                serde_json::to_value(self.handle_join_req(pl))
            }
            MessageType::RejoinReq => {
                let pl: RejoinReqPayload =
                    serde_json::from_slice(body).map_err(RequestError::MalformedBody)?;
                serde_json::to_value(self.handle_rejoin_req(pl))
            }
            MessageType::HomeNSReq => {
                let pl: HomeNsReqPayload =
                    serde_json::from_slice(body).map_err(RequestError::MalformedBody)?;
                serde_json::to_value(self.handle_home_ns_req(pl))
            }
            other => {
                warn!("unhandled message-type {:?} from {}", other, base.sender_id);
                let result = ResultPayload {
                    result_code: ResultCode::Other,
                    description: format!("unhandled MessageType {:?}", other),
                };
                serde_json::to_value(base.answer(other, result))
            }
        };
        answer.map_err(RequestError::EncodeAnswer)
    }

    /// Run the join pipeline and render the JoinAns. The envelope is
    /// correct whatever the outcome; key material only appears on success.
    pub fn handle_join_req(&self, pl: JoinReqPayload) -> JoinAnsPayload {
        let mut flow = Flow::join(&self.store, &pl);
        let outcome = flow.run_join();

        match &outcome {
            Ok(()) => debug!("join-request for {} accepted", pl.dev_eui),
            Err(e) => warn!("join-request for {} failed: {}", pl.dev_eui, e),
        }

        match outcome {
            Ok(()) => JoinAnsPayload {
                base: pl.base.answer(MessageType::JoinAns, ResultPayload::success()),
                phy_payload: flow.accept_phy.take().map(Into::into),
                nwk_s_key: flow.nwk_s_key.take(),
                f_nwk_s_int_key: flow.f_nwk_s_int_key.take(),
                s_nwk_s_int_key: flow.s_nwk_s_int_key.take(),
                nwk_s_enc_key: flow.nwk_s_enc_key.take(),
                app_s_key: flow.app_s_key.take(),
            },
            Err(e) => JoinAnsPayload {
                base: pl.base.answer(MessageType::JoinAns, e.to_result()),
                phy_payload: None,
                nwk_s_key: None,
                f_nwk_s_int_key: None,
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: None,
            },
        }
    }

    /// Run the rejoin pipeline (always the 1.1 hierarchy) and render the
    /// RejoinAns.
    pub fn handle_rejoin_req(&self, pl: RejoinReqPayload) -> RejoinAnsPayload {
        let mut flow = Flow::rejoin(&self.store, &pl);
        let outcome = flow.run_rejoin();

        match &outcome {
            Ok(()) => debug!("rejoin-request for {} accepted", pl.dev_eui),
            Err(e) => warn!("rejoin-request for {} failed: {}", pl.dev_eui, e),
        }

        match outcome {
            Ok(()) => RejoinAnsPayload {
                base: pl
                    .base
                    .answer(MessageType::RejoinAns, ResultPayload::success()),
                phy_payload: flow.accept_phy.take().map(Into::into),
                f_nwk_s_int_key: flow.f_nwk_s_int_key.take(),
                s_nwk_s_int_key: flow.s_nwk_s_int_key.take(),
                nwk_s_enc_key: flow.nwk_s_enc_key.take(),
                app_s_key: flow.app_s_key.take(),
            },
            Err(e) => RejoinAnsPayload {
                base: pl.base.answer(MessageType::RejoinAns, e.to_result()),
                phy_payload: None,
                f_nwk_s_int_key: None,
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: None,
            },
        }
    }

    /// Resolve a device's home NetID for a roaming partner.
    pub fn handle_home_ns_req(&self, pl: HomeNsReqPayload) -> HomeNsAnsPayload {
        let outcome = self
            .store
            .home_net_id(&pl.dev_eui)
            .map_err(JoinError::from)
            .and_then(|net_id| net_id.ok_or(JoinError::UnknownDevEui(pl.dev_eui)));

        match outcome {
            Ok(h_net_id) => HomeNsAnsPayload {
                base: pl
                    .base
                    .answer(MessageType::HomeNSAns, ResultPayload::success()),
                h_net_id: Some(h_net_id),
            },
            Err(e) => {
                warn!("home-ns lookup for {} failed: {}", pl.dev_eui, e);
                HomeNsAnsPayload {
                    base: pl.base.answer(MessageType::HomeNSAns, e.to_result()),
                    h_net_id: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_result_code_by_identity() {
        assert_eq!(JoinError::MicFailed.result_code(), ResultCode::MicFailed);
        assert_eq!(
            JoinError::UnknownDevEui(Eui64::default()).result_code(),
            ResultCode::UnknownDevEui
        );
        assert_eq!(
            JoinError::Store(StoreError("backend down".into())).result_code(),
            ResultCode::Other
        );
        assert_eq!(
            JoinError::Key(KeyError::JoinNonceOverflow(1 << 24)).result_code(),
            ResultCode::Other
        );
    }

    #[test]
    fn test_result_carries_description() {
        let result = JoinError::MicFailed.to_result();
        assert_eq!(result.result_code, ResultCode::MicFailed);
        assert_eq!(result.description, "invalid MIC");
    }
}
