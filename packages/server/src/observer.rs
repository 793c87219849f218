//! `GET /ws/observe` observer channel.
//!
//! Each connection registers a channel-backed observer with the hub and
//! forwards whatever lands in its queue to the socket. Inbound text frames
//! are chat messages, keepalives, or an analysis context for the
//! assistant.

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, web};
use actix_ws::{Message, MessageStream, Session};
use policy_proof_broadcast::ChannelObserver;
use policy_proof_server_models::{AnalysisContext, ClientFrame, ServerFrame};
use tokio::sync::mpsc;

use crate::AppState;
use crate::assistant::ChatResponder;

/// Frames queued per observer before it is considered saturated. A full
/// run is under fifty frames, so several overlapping runs fit.
const OBSERVER_QUEUE_CAPACITY: usize = 256;

const CONNECTED_MESSAGE: &str = "Connected to Policy Proof.";
const INVALID_PAYLOAD_MESSAGE: &str = "Invalid message payload.";
const CONTEXT_UPDATED_MESSAGE: &str = "Analysis context updated.";

/// `GET /ws/observe`
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
pub async fn observe(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, messages) = actix_ws::handle(&req, body)?;
    actix_rt::spawn(run(session, messages, state.into_inner()));
    Ok(response)
}

async fn send(session: &mut Session, frame: &ServerFrame) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(frame) {
        Ok(text) => session.text(text).await,
        Err(e) => {
            log::error!("Failed to serialize observer frame: {e}");
            Ok(())
        }
    }
}

/// Reply to one inbound text frame, if it warrants one.
fn respond(
    responder: &dyn ChatResponder,
    context: &mut Option<AnalysisContext>,
    raw: &str,
) -> Option<ServerFrame> {
    match ClientFrame::parse(raw) {
        ClientFrame::KeepAlive => None,
        ClientFrame::Context(update) => {
            *context = Some(update);
            Some(ServerFrame::info(CONTEXT_UPDATED_MESSAGE))
        }
        ClientFrame::Chat(text) => Some(ServerFrame::message(
            responder.reply(&text, context.as_ref()),
        )),
        ClientFrame::Invalid => Some(ServerFrame::error(INVALID_PAYLOAD_MESSAGE)),
    }
}

async fn run(mut session: Session, mut messages: MessageStream, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
    let id = state.hub.register(Arc::new(ChannelObserver::new(tx)));
    log::info!("Observer {id} connected");

    let mut context = None;
    let mut open = send(&mut session, &ServerFrame::info(CONNECTED_MESSAGE))
        .await
        .is_ok();

    while open {
        tokio::select! {
            frame = rx.recv() => {
                // `None` means the hub pruned us.
                open = match frame {
                    Some(frame) => send(&mut session, &frame).await.is_ok(),
                    None => false,
                };
            }
            message = messages.recv() => {
                open = match message {
                    Some(Ok(Message::Text(text))) => {
                        match respond(state.responder.as_ref(), &mut context, &text) {
                            Some(reply) => send(&mut session, &reply).await.is_ok(),
                            None => true,
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => session.pong(&bytes).await.is_ok(),
                    Some(Ok(Message::Close(reason))) => {
                        log::debug!("Observer {id} closed: {reason:?}");
                        false
                    }
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        log::debug!("Observer {id} protocol error: {e}");
                        false
                    }
                    None => false,
                };
            }
        }
    }

    state.hub.unregister(id);
    let _ = session.close(None).await;
    log::info!("Observer {id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::RuleBasedResponder;
    use policy_proof_broadcast::ObserverHub;
    use policy_proof_srd::bands::generate_edges;
    use policy_proof_srd::config::SrdConfig;
    use serde_json::json;

    #[test]
    fn idle_observer_survives_overlapping_runs() {
        let config = SrdConfig::embedded().unwrap();
        let synthetic = &config.synthetic;
        let points = generate_edges(synthetic.start_km, synthetic.end_km, synthetic.step_km)
            .unwrap()
            .len();
        // started, bins, impact and completion around the points
        let frames_per_run = points + 4;

        let hub = ObserverHub::new();
        let (tx, _rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
        hub.register(Arc::new(ChannelObserver::new(tx)));

        for i in 0..4 * frames_per_run {
            let report = hub.broadcast(&ServerFrame::info(format!("status {i}")));
            assert_eq!(report.pruned, 0, "pruned after {i} frames");
        }
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn plain_text_is_chat() {
        let mut context = None;
        let reply = respond(&RuleBasedResponder, &mut context, "tell me about the boundary");
        assert!(matches!(reply, Some(ServerFrame::Message { .. })));
    }

    #[test]
    fn keepalive_gets_no_reply() {
        let mut context = None;
        assert!(respond(&RuleBasedResponder, &mut context, r#"{"type":"ping"}"#).is_none());
    }

    #[test]
    fn invalid_payload_gets_an_error_frame() {
        let mut context = None;
        assert_eq!(
            respond(&RuleBasedResponder, &mut context, r#"{"message":["not","text"]}"#),
            Some(ServerFrame::error(INVALID_PAYLOAD_MESSAGE))
        );
    }

    #[test]
    fn context_is_stored_and_used() {
        let mut context = None;
        let frame = json!({
            "type": "context",
            "context": { "impact_score": -4.0, "points": (0..500).collect::<Vec<_>>() }
        })
        .to_string();

        assert_eq!(
            respond(&RuleBasedResponder, &mut context, &frame),
            Some(ServerFrame::info(CONTEXT_UPDATED_MESSAGE))
        );
        assert_eq!(context.as_ref().and_then(AnalysisContext::point_count), Some(200));

        let Some(ServerFrame::Message { message }) =
            respond(&RuleBasedResponder, &mut context, "what was the impact?")
        else {
            panic!("expected a chat reply");
        };
        assert!(message.contains("-4.00"));
    }
}
