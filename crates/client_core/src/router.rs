use std::sync::Arc;

use shared::{
    domain::UserId,
    protocol::{ChatMessage, InboundFrame, SignalPayload},
};
use tracing::{debug, warn};

use crate::{presentation::Presentation, session::SessionContext, signaling::SignalingMachine};

/// Dispatches inbound frames by type. Nothing it receives is allowed to
/// fail the connection: bad input is logged and dropped.
pub struct MessageRouter {
    session: Arc<SessionContext>,
    signaling: Arc<SignalingMachine>,
    presentation: Arc<dyn Presentation>,
}

impl MessageRouter {
    pub fn new(
        session: Arc<SessionContext>,
        signaling: Arc<SignalingMachine>,
        presentation: Arc<dyn Presentation>,
    ) -> Self {
        Self {
            session,
            signaling,
            presentation,
        }
    }

    pub async fn route_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.route(frame).await,
            Err(err) => warn!(%err, len = text.len(), "router: dropping malformed frame"),
        }
    }

    pub async fn route(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Chat(message) => self.route_chat(message).await,
            InboundFrame::Status {
                user_id, status, ..
            } => {
                debug!(user = user_id.0, ?status, "router: status update");
                self.presentation.render_user_status(user_id, status);
            }
            InboundFrame::Error { message, details } => {
                warn!(%message, details = details.as_deref().unwrap_or(""), "router: relay error");
                self.presentation.show_error(&message);
            }
            InboundFrame::Signal { from_user, signal } => {
                self.route_signal(from_user, signal).await;
            }
            InboundFrame::Unknown => debug!("router: ignoring frame of unknown type"),
        }
    }

    async fn route_chat(&self, message: ChatMessage) {
        if self.session.is_in_view(&message).await {
            self.presentation.render_message(&message);
            return;
        }
        debug!(
            from = message.from_user.0,
            to = message.to_user.0,
            "router: chat outside the open conversation"
        );
        self.session.note_unread(&message).await;
    }

    async fn route_signal(&self, from: UserId, signal: SignalPayload) {
        let counterpart = self
            .session
            .active_call()
            .await
            .filter(|call| !call.phase.is_terminal())
            .map(|call| call.peer);
        // Offers from third parties still reach the machine so it can answer busy.
        let is_offer = matches!(signal, SignalPayload::SessionOffer(_));
        if let Some(peer) = counterpart {
            if peer != from && !is_offer {
                warn!(
                    from = from.0,
                    peer = peer.0,
                    kind = signal.label(),
                    "router: signal from a user outside the current call dropped"
                );
                return;
            }
        }
        self.signaling.handle_signal(from, signal).await;
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
