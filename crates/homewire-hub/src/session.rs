//! Per-connection state and the hub read loop.

use std::sync::Arc;

use homewire_types::DeviceClass;
use tracing::{debug, info, warn};

use crate::dispatcher::RoutingDispatcher;
use crate::registry::PeerRef;

/// Where a connection stands in the hub protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Bound { serial: String, class: DeviceClass },
    Closed,
}

/// State the hub keeps for one websocket connection.
pub struct ConnectionSession {
    id: String,
    pub(crate) state: SessionState,
    endpoint: PeerRef,
}

impl ConnectionSession {
    pub fn new(id: impl Into<String>, endpoint: PeerRef) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Unauthenticated,
            endpoint,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn endpoint(&self) -> &PeerRef {
        &self.endpoint
    }

    /// Serial this connection last bound, while bound.
    pub fn bound_serial(&self) -> Option<&str> {
        match &self.state {
            SessionState::Bound { serial, .. } => Some(serial),
            _ => None,
        }
    }

    pub fn device_class(&self) -> Option<&DeviceClass> {
        match &self.state {
            SessionState::Bound { class, .. } => Some(class),
            _ => None,
        }
    }
}

/// Run the hub protocol on one connection until it closes.
///
/// Every inbound message goes through the dispatcher.  A decode error ends
/// the session; so does the peer going away.  Either way the connection is
/// unbound (if still current) and its endpoint terminated.
pub async fn serve_session(dispatcher: &RoutingDispatcher, mut session: ConnectionSession) {
    let endpoint = Arc::clone(session.endpoint());
    endpoint.start_reading();
    info!(conn_id = session.id(), "CONNECT");

    while let Some(message) = endpoint.recv().await {
        debug!(message = %message, "hub: received");
        if let Err(e) = dispatcher.dispatch(&mut session, &message).await {
            warn!(error = %e, "hub: closing session");
            break;
        }
    }

    dispatcher.disconnect(&mut session).await;
    endpoint.terminate().await;
    info!(conn_id = session.id(), "DISCONNECT");
}
