//! Ordered join/rejoin pipelines.
//!
//! Each pipeline is a fixed list of steps run against one per-request
//! context; the first failing step aborts the rest and the caller maps the
//! error to a result code. For a join, MIC validation comes before any key
//! derivation; nothing observable changes until the uplink authenticates.

use tracing::debug;

use crate::backend::{BasePayload, DlSettings, JoinReqPayload, RejoinReqPayload};
use crate::lorawan::accept::{AnsweredUplink, JoinAcceptBuilder};
use crate::lorawan::kek::KeyEnvelope;
use crate::lorawan::keys::{
    derive_app_s_key, derive_f_nwk_s_int_key, derive_js_enc_key, derive_js_int_key,
    derive_nwk_s_enc_key, derive_s_nwk_s_int_key, Aes128Key, DevAddr, Eui64, KeyError, NetId,
    SessionContext, MAX_JOIN_NONCE,
};
use crate::lorawan::{parse_phy_payload, JoinRequestPayload, PhyFrame, RejoinRequestPayload};

use super::{DeviceKeys, DeviceStore, JoinError};

/// The uplink being answered.
enum Uplink {
    Join(JoinRequestPayload),
    Rejoin(RejoinRequestPayload),
}

impl Uplink {
    fn dev_eui(&self) -> Eui64 {
        match self {
            Uplink::Join(jr) => jr.dev_eui,
            Uplink::Rejoin(rj) => rj.dev_eui(),
        }
    }

    /// DevNonce for a join; the matching RJCount for a rejoin.
    fn dev_nonce(&self) -> u16 {
        match self {
            Uplink::Join(jr) => jr.dev_nonce,
            Uplink::Rejoin(rj) => rj.rejoin_count(),
        }
    }

    fn answered(&self) -> AnsweredUplink {
        match self {
            Uplink::Join(_) => AnsweredUplink::JoinRequest,
            Uplink::Rejoin(rj) => AnsweredUplink::RejoinRequest(rj.rejoin_type()),
        }
    }

    /// Rejoins always negotiate the 1.1 four-key hierarchy; joins follow
    /// the OptNeg bit of the request's DLSettings.
    fn opt_neg(&self, dl_settings: DlSettings) -> bool {
        match self {
            Uplink::Join(_) => dl_settings.opt_neg(),
            Uplink::Rejoin(_) => true,
        }
    }
}

/// Per-request pipeline context. Created fresh per inbound message and
/// discarded once the answer is rendered; nothing survives it.
pub(super) struct Flow<'a, S> {
    store: &'a S,
    base: &'a BasePayload,
    phy_payload: &'a [u8],
    dev_addr: DevAddr,
    dl_settings: DlSettings,
    rx_delay: u8,
    cf_list: Option<&'a [u8]>,

    net_id: NetId,
    join_eui: Eui64,
    uplink: Option<Uplink>,
    device_keys: Option<DeviceKeys>,
    join_nonce: u32,

    f_nwk_s_int: Option<Aes128Key>,
    s_nwk_s_int: Option<Aes128Key>,
    nwk_s_enc: Option<Aes128Key>,
    app_s: Option<Aes128Key>,

    pub(super) accept_phy: Option<Vec<u8>>,
    pub(super) nwk_s_key: Option<KeyEnvelope>,
    pub(super) f_nwk_s_int_key: Option<KeyEnvelope>,
    pub(super) s_nwk_s_int_key: Option<KeyEnvelope>,
    pub(super) nwk_s_enc_key: Option<KeyEnvelope>,
    pub(super) app_s_key: Option<KeyEnvelope>,
}

type Step<'a, S> = fn(&mut Flow<'a, S>) -> Result<(), JoinError>;

impl<'a, S: DeviceStore> Flow<'a, S> {
    pub(super) fn join(store: &'a S, req: &'a JoinReqPayload) -> Self {
        Self::new(
            store,
            &req.base,
            &req.phy_payload.0,
            req.dev_addr,
            req.dl_settings,
            req.rx_delay,
            req.cf_list.as_ref().map(|c| c.0.as_slice()),
        )
    }

    pub(super) fn rejoin(store: &'a S, req: &'a RejoinReqPayload) -> Self {
        Self::new(
            store,
            &req.base,
            &req.phy_payload.0,
            req.dev_addr,
            req.dl_settings,
            req.rx_delay,
            req.cf_list.as_ref().map(|c| c.0.as_slice()),
        )
    }

    fn new(
        store: &'a S,
        base: &'a BasePayload,
        phy_payload: &'a [u8],
        dev_addr: DevAddr,
        dl_settings: DlSettings,
        rx_delay: u8,
        cf_list: Option<&'a [u8]>,
    ) -> Self {
        Flow {
            store,
            base,
            phy_payload,
            dev_addr,
            dl_settings,
            rx_delay,
            cf_list,
            net_id: NetId::default(),
            join_eui: Eui64::default(),
            uplink: None,
            device_keys: None,
            join_nonce: 0,
            f_nwk_s_int: None,
            s_nwk_s_int: None,
            nwk_s_enc: None,
            app_s: None,
            accept_phy: None,
            nwk_s_key: None,
            f_nwk_s_int_key: None,
            s_nwk_s_int_key: None,
            nwk_s_enc_key: None,
            app_s_key: None,
        }
    }

    pub(super) fn run_join(&mut self) -> Result<(), JoinError> {
        let steps: &[Step<'a, S>] = &[
            Self::decode_join_request,
            Self::lookup_device_keys,
            Self::validate_mic,
            Self::resolve_join_nonce,
            Self::derive_session_keys,
            Self::build_accept,
            Self::wrap_session_keys,
        ];
        self.run(steps)
    }

    /// No uplink MIC step here: the serving network server forwarded this
    /// rejoin and uplink verification is its responsibility.
    pub(super) fn run_rejoin(&mut self) -> Result<(), JoinError> {
        let steps: &[Step<'a, S>] = &[
            Self::decode_rejoin_request,
            Self::lookup_device_keys,
            Self::resolve_join_nonce,
            Self::derive_session_keys,
            Self::build_accept,
            Self::wrap_session_keys,
        ];
        self.run(steps)
    }

    fn run(&mut self, steps: &[Step<'a, S>]) -> Result<(), JoinError> {
        for step in steps {
            step(self)?;
        }
        Ok(())
    }

    fn uplink(&self) -> Result<&Uplink, JoinError> {
        self.uplink
            .as_ref()
            .ok_or(JoinError::MissingState("uplink not decoded"))
    }

    fn device_keys(&self) -> Result<&DeviceKeys, JoinError> {
        self.device_keys
            .as_ref()
            .ok_or(JoinError::MissingState("device keys not loaded"))
    }

    fn opt_neg(&self) -> Result<bool, JoinError> {
        Ok(self.uplink()?.opt_neg(self.dl_settings))
    }

    /// SenderID is the serving NetID, ReceiverID our JoinEUI.
    fn decode_envelope(&mut self) -> Result<(), JoinError> {
        self.net_id = self
            .base
            .sender_id
            .parse()
            .map_err(|_| JoinError::InvalidSenderId(self.base.sender_id.clone()))?;
        self.join_eui = self
            .base
            .receiver_id
            .parse()
            .map_err(|_| JoinError::InvalidReceiverId(self.base.receiver_id.clone()))?;
        Ok(())
    }

    fn decode_join_request(&mut self) -> Result<(), JoinError> {
        self.decode_envelope()?;
        let frame = parse_phy_payload(self.phy_payload)?;
        debug!("decoded {}", frame);
        match frame {
            PhyFrame::JoinRequest(jr) => {
                self.uplink = Some(Uplink::Join(jr));
                Ok(())
            }
            _ => Err(JoinError::UnexpectedFrame {
                expected: "join-request",
            }),
        }
    }

    fn decode_rejoin_request(&mut self) -> Result<(), JoinError> {
        self.decode_envelope()?;
        let frame = parse_phy_payload(self.phy_payload)?;
        debug!("decoded {}", frame);
        match frame {
            PhyFrame::RejoinRequest(rj) => {
                self.uplink = Some(Uplink::Rejoin(rj));
                Ok(())
            }
            _ => Err(JoinError::UnexpectedFrame {
                expected: "rejoin-request",
            }),
        }
    }

    fn lookup_device_keys(&mut self) -> Result<(), JoinError> {
        let dev_eui = self.uplink()?.dev_eui();
        let keys = self
            .store
            .device_keys(&dev_eui)?
            .ok_or(JoinError::UnknownDevEui(dev_eui))?;
        self.device_keys = Some(keys);
        Ok(())
    }

    /// Authentication gates key material release: nothing is derived for a
    /// join until the uplink MIC checks out against the device's NwkKey.
    fn validate_mic(&mut self) -> Result<(), JoinError> {
        let nwk_key = self.device_keys()?.nwk_key;
        match self.uplink()? {
            Uplink::Join(jr) if jr.validate_mic(&nwk_key) => Ok(()),
            Uplink::Join(_) => Err(JoinError::MicFailed),
            Uplink::Rejoin(_) => Err(JoinError::MissingState("mic validation on a rejoin")),
        }
    }

    fn resolve_join_nonce(&mut self) -> Result<(), JoinError> {
        let join_nonce = self.device_keys()?.join_nonce;
        if join_nonce > MAX_JOIN_NONCE {
            return Err(KeyError::JoinNonceOverflow(join_nonce).into());
        }
        self.join_nonce = join_nonce;
        Ok(())
    }

    fn derive_session_keys(&mut self) -> Result<(), JoinError> {
        let keys = self.device_keys()?.clone();
        let opt_neg = self.opt_neg()?;
        let ctx = SessionContext {
            opt_neg,
            join_nonce: self.join_nonce,
            net_id: self.net_id,
            join_eui: self.join_eui,
            dev_nonce: self.uplink()?.dev_nonce(),
        };

        self.f_nwk_s_int = Some(derive_f_nwk_s_int_key(&keys.nwk_key, &ctx)?);
        let app_root = if opt_neg { &keys.app_key } else { &keys.nwk_key };
        self.app_s = Some(derive_app_s_key(app_root, &ctx)?);
        if opt_neg {
            self.s_nwk_s_int = Some(derive_s_nwk_s_int_key(&keys.nwk_key, &ctx)?);
            self.nwk_s_enc = Some(derive_nwk_s_enc_key(&keys.nwk_key, &ctx)?);
        }

        debug!(
            "derived session keys for {} (opt_neg={})",
            keys.dev_eui, opt_neg
        );
        Ok(())
    }

    /// 1.1 accepts are signed with JSIntKey and encrypted with JSEncKey,
    /// both derived fresh from NwkKey and the DevEUI; legacy accepts use
    /// NwkKey for both.
    fn build_accept(&mut self) -> Result<(), JoinError> {
        let keys = self.device_keys()?.clone();
        let opt_neg = self.opt_neg()?;
        let uplink = self.uplink()?;
        let (answered, dev_eui, dev_nonce) = (uplink.answered(), uplink.dev_eui(), uplink.dev_nonce());

        let builder = JoinAcceptBuilder {
            join_nonce: self.join_nonce,
            home_net_id: self.net_id,
            dev_addr: self.dev_addr,
            dl_settings: self.dl_settings.0,
            rx_delay: self.rx_delay,
            cf_list: self.cf_list.map(|c| c.to_vec()),
        };

        let (mic_key, enc_key) = if opt_neg {
            (
                derive_js_int_key(&keys.nwk_key, &dev_eui),
                derive_js_enc_key(&keys.nwk_key, &dev_eui),
            )
        } else {
            (keys.nwk_key, keys.nwk_key)
        };

        self.accept_phy = Some(builder.build(
            opt_neg,
            answered,
            &self.join_eui,
            dev_nonce,
            &mic_key,
            &enc_key,
        )?);
        Ok(())
    }

    /// Wrap the serving network server's keys under its KEK (label =
    /// requester's SenderID) and the AppSKey under the application
    /// server's own KEK.
    fn wrap_session_keys(&mut self) -> Result<(), JoinError> {
        let opt_neg = self.opt_neg()?;
        let dev_eui = self.uplink()?.dev_eui();

        let ns_label = self.base.sender_id.clone();
        let ns_kek = self.store.kek(&ns_label)?;
        let ns_kek = ns_kek.as_deref();

        let missing = || JoinError::MissingState("session keys not derived");
        let f_nwk = self.f_nwk_s_int.ok_or_else(missing)?;
        if opt_neg {
            let s_nwk = self.s_nwk_s_int.ok_or_else(missing)?;
            let nwk_enc = self.nwk_s_enc.ok_or_else(missing)?;
            self.f_nwk_s_int_key = Some(KeyEnvelope::new(&ns_label, ns_kek, &f_nwk)?);
            self.s_nwk_s_int_key = Some(KeyEnvelope::new(&ns_label, ns_kek, &s_nwk)?);
            self.nwk_s_enc_key = Some(KeyEnvelope::new(&ns_label, ns_kek, &nwk_enc)?);
        } else {
            // Collapsed 1.0.x hierarchy: one NwkSKey.
            self.nwk_s_key = Some(KeyEnvelope::new(&ns_label, ns_kek, &f_nwk)?);
        }

        let app_s = self.app_s.ok_or_else(missing)?;
        self.app_s_key = Some(match self.store.app_s_kek_label(&dev_eui)? {
            Some(label) => {
                let as_kek = self.store.kek(&label)?;
                KeyEnvelope::new(&label, as_kek.as_deref(), &app_s)?
            }
            None => KeyEnvelope::new("", None, &app_s)?,
        });
        Ok(())
    }
}
