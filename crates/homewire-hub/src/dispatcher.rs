//! [`RoutingDispatcher`] – the hub's per-envelope state machine.
//!
//! | State | Envelope | Effect | Next |
//! |---|---|---|---|
//! | any open | `auth` | reply `{token}` | `Authenticated` (from `Unauthenticated`) |
//! | `Authenticated` / `Bound` | `connect` | bind, reply `{message:"connected"}`, liveness fan-out | `Bound` |
//! | `Bound` | `rest` | forward to the device bound as `sn` | – |
//! | `Bound` | `router` / `tv` / `cond` | forward to the controller bound as `from` | – |
//! | `Bound` | `notification` | copy verbatim to every `rest` peer | – |
//! | any | connection closed | compare-and-delete unbind, "offline" fan-out | `Closed` |
//!
//! Envelopes arriving in any other state are dropped, as are unknown
//! `type`s.  A routing miss is silent.
//!
//! # Liveness ordering
//!
//! Every binding change runs under one async lock together with the
//! liveness frames it causes.  A controller therefore sees a device's
//! online/offline frames in the order the registry applied them, and its
//! catch-up list is taken in the same write as its own bind.

use std::sync::Arc;
use std::time::Duration;

use homewire_types::{
    AuthReply, ConnectReply, ConnectRequest, DEFAULT_AUTH_TOKEN, DeviceClass, Envelope, HubError,
    Liveness, LivenessNotification, NotificationRequest, RestForward, RestRequest, RouteForward,
    RouteKind, RouteRequest, encode,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::{DeviceRegistry, PeerRef};
use crate::session::{ConnectionSession, SessionState};

/// Longest a liveness frame may wait on one peer while bindings are held.
const LIVENESS_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes decoded envelopes between bound peers.
pub struct RoutingDispatcher {
    registry: Arc<DeviceRegistry>,
    auth_token: String,
    liveness: Mutex<()>,
}

impl RoutingDispatcher {
    /// Create a dispatcher over `registry`, issuing [`DEFAULT_AUTH_TOKEN`].
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            liveness: Mutex::new(()),
        }
    }

    /// Override the token returned to `auth` (builder-style).
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Handle one inbound text frame from `session`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Decode`] for malformed input; the caller must end
    /// the session.  Unknown types and routing misses are `Ok(())`.
    pub async fn dispatch(&self, session: &mut ConnectionSession, text: &str) -> Result<(), HubError> {
        let Some(envelope) = Envelope::decode(text)? else {
            debug!("hub: dropping envelope with unknown type");
            return Ok(());
        };

        match envelope {
            Envelope::Auth(req) => {
                debug!(mac = %req.mac, sn = %req.sn, "hub: auth");
                self.reply(session, &AuthReply { token: &self.auth_token }).await?;
                if session.state == SessionState::Unauthenticated {
                    session.state = SessionState::Authenticated;
                }
            }
            Envelope::Connect(req) => self.on_connect(session, req).await?,
            envelope => {
                let Some(serial) = session.bound_serial().map(str::to_owned) else {
                    debug!(kind = envelope.kind(), "hub: dropping envelope from unbound session");
                    return Ok(());
                };
                match envelope {
                    Envelope::Rest(req) => self.on_rest(&serial, req).await?,
                    Envelope::Route(kind, req) => self.on_route(kind, req).await?,
                    Envelope::Notification(req) => self.on_notification(req, text).await,
                    Envelope::Auth(_) | Envelope::Connect(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Tear down the hub side of a closed connection.
    ///
    /// Unbinds the session's serial only if it still points at this session's
    /// endpoint, and tells every controller a device went offline.
    pub async fn disconnect(&self, session: &mut ConnectionSession) {
        let previous = std::mem::replace(&mut session.state, SessionState::Closed);
        let SessionState::Bound { serial, .. } = previous else {
            return;
        };
        let _order = self.liveness.lock().await;
        self.release(&serial, session.endpoint()).await;
    }

    /// Compare-and-delete `serial`; announce it offline if a device binding
    /// was actually removed.  Caller holds the liveness lock.
    async fn release(&self, serial: &str, endpoint: &PeerRef) {
        match self.registry.unbind(serial, endpoint) {
            Some(class) if !class.is_rest() => {
                info!(serial, c_type = %class, "hub: device offline");
                self.broadcast_liveness(serial, &class, Liveness::Offline).await;
            }
            Some(class) => info!(serial, c_type = %class, "hub: controller unbound"),
            None => debug!(serial, "hub: binding already superseded"),
        }
    }

    async fn on_connect(&self, session: &mut ConnectionSession, req: ConnectRequest) -> Result<(), HubError> {
        if matches!(session.state, SessionState::Unauthenticated | SessionState::Closed) {
            debug!(sn = %req.sn, "hub: dropping connect before auth");
            return Ok(());
        }
        let ConnectRequest { sn, c_type, .. } = req;
        let _order = self.liveness.lock().await;

        if let Some(previous) = session.bound_serial().filter(|prev| *prev != sn).map(str::to_owned) {
            self.release(&previous, session.endpoint()).await;
        }

        let endpoint = Arc::clone(session.endpoint());
        let devices = if c_type.is_rest() {
            self.registry.bind_and_list_devices(&sn, endpoint, c_type.clone())
        } else {
            self.registry.bind(&sn, endpoint, c_type.clone());
            Vec::new()
        };
        session.state = SessionState::Bound {
            serial: sn.clone(),
            class: c_type.clone(),
        };
        info!(serial = %sn, c_type = %c_type, "hub: bound");
        self.reply(session, &ConnectReply::default()).await?;

        if c_type.is_rest() {
            self.catch_up(session.endpoint(), devices).await?;
        } else {
            self.broadcast_liveness(&sn, &c_type, Liveness::Online).await;
        }
        Ok(())
    }

    async fn on_rest(&self, from: &str, req: RestRequest) -> Result<(), HubError> {
        let Some(target) = self.registry.lookup(&req.sn) else {
            debug!(sn = %req.sn, "hub: rest target not bound");
            return Ok(());
        };
        let frame = encode(&RestForward::new(&req.wsid, from, &req.data))?;
        forward(&target, &req.sn, &frame).await;
        Ok(())
    }

    async fn on_route(&self, kind: RouteKind, req: RouteRequest) -> Result<(), HubError> {
        let Some(target) = self.registry.lookup(&req.from) else {
            debug!(kind = kind.as_str(), from = %req.from, "hub: route target not bound");
            return Ok(());
        };
        let frame = encode(&RouteForward::new(&req.wsid, &req.data))?;
        forward(&target, &req.from, &frame).await;
        Ok(())
    }

    async fn on_notification(&self, req: NotificationRequest, raw: &str) {
        debug!(from = %req.from, "hub: notification");
        for (serial, peer) in self.registry.rest_peers() {
            forward(&peer, &serial, raw).await;
        }
    }

    /// Tell a freshly bound controller about every device already online.
    async fn catch_up(&self, controller: &PeerRef, devices: Vec<(String, DeviceClass)>) -> Result<(), HubError> {
        for (serial, class) in devices {
            let frame = encode(&LivenessNotification::new(&serial, &class, Liveness::Online))?;
            if !deliver_liveness(controller, &serial, &frame).await {
                break;
            }
        }
        Ok(())
    }

    async fn broadcast_liveness(&self, serial: &str, class: &DeviceClass, state: Liveness) {
        let frame = match encode(&LivenessNotification::new(serial, class, state)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "hub: cannot encode liveness notification");
                return;
            }
        };
        for (peer_serial, peer) in self.registry.rest_peers() {
            deliver_liveness(&peer, &peer_serial, &frame).await;
        }
    }

    async fn reply<T: serde::Serialize>(&self, session: &ConnectionSession, frame: &T) -> Result<(), HubError> {
        let text = encode(frame)?;
        if !session.endpoint().send(&text).await {
            debug!(conn_id = session.id(), "hub: reply not delivered");
        }
        Ok(())
    }
}

async fn forward(peer: &PeerRef, serial: &str, frame: &str) {
    if peer.send(frame).await {
        debug!(serial, frame, "hub: forwarded");
    } else {
        debug!(serial, "hub: peer rejected forward");
    }
}

/// Send one liveness frame, giving up after [`LIVENESS_SEND_TIMEOUT`].
async fn deliver_liveness(peer: &PeerRef, serial: &str, frame: &str) -> bool {
    match tokio::time::timeout(LIVENESS_SEND_TIMEOUT, peer.send(frame)).await {
        Ok(true) => {
            debug!(serial, frame, "hub: liveness delivered");
            true
        }
        Ok(false) => {
            debug!(serial, "hub: peer rejected liveness");
            false
        }
        Err(_) => {
            warn!(serial, "hub: liveness send timed out");
            false
        }
    }
}
