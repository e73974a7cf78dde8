//! Real-time fan-out (C9, §4.9): forwards `application_update` broadcasts to
//! subscribed WebSocket sessions.
//!
//! Generalizes the heartbeat/bus broadcast pattern (a `tokio::sync::
//! broadcast` channel fed by producers, one receiver per consumer task) to a
//! bidirectional session loop instead of a one-way SSE stream, since clients
//! here also send `subscribe`/`unsubscribe`/`ping` frames.

use axum::extract::ws::{Message, WebSocket};
use cf_schemas::ApplicationUpdateEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Idle sessions with no inbound traffic for this long are closed (§4.9).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { application_id: Uuid },
    Unsubscribe { application_id: Uuid },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ServerMessage {
    Welcome,
    Pong,
    Subscribed { application_id: Uuid },
    Error { message: String },
    ApplicationUpdate(ApplicationUpdateEvent),
}

/// Drive one WebSocket connection until the client disconnects, sends a
/// close frame, goes idle past `IDLE_TIMEOUT`, or a send fails (best-effort
/// delivery, §4.9: "if a send fails, the session is removed").
pub async fn run_session(mut socket: WebSocket, mut updates: broadcast::Receiver<ApplicationUpdateEvent>) {
    if send(&mut socket, &ServerMessage::Welcome).await.is_err() {
        return;
    }

    let mut subscriptions: HashSet<Uuid> = HashSet::new();
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = last_activity + IDLE_TIMEOUT;

        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if handle_client_message(&mut socket, &mut subscriptions, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    None => break,
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(event) => {
                        if subscriptions.is_empty() || subscriptions.contains(&event.id) {
                            if send(&mut socket, &ServerMessage::ApplicationUpdate(event)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime session lagged behind the update broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                debug!("closing idle websocket session");
                break;
            }
        }
    }
}

async fn handle_client_message(
    socket: &mut WebSocket,
    subscriptions: &mut HashSet<Uuid>,
    text: &str,
) -> Result<(), ()> {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Subscribe { application_id }) => {
            subscriptions.insert(application_id);
            send(socket, &ServerMessage::Subscribed { application_id }).await
        }
        Ok(ClientMessage::Unsubscribe { application_id }) => {
            subscriptions.remove(&application_id);
            Ok(())
        }
        Ok(ClientMessage::Ping) => send(socket, &ServerMessage::Pong).await,
        Err(e) => {
            send(
                socket,
                &ServerMessage::Error {
                    message: format!("malformed message: {e}"),
                },
            )
            .await
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_message_has_no_data_field() {
        let json = serde_json::to_string(&ServerMessage::Welcome).unwrap();
        assert_eq!(json, r#"{"type":"welcome"}"#);
    }

    #[test]
    fn application_update_wraps_under_data() {
        let event = ApplicationUpdateEvent {
            id: Uuid::nil(),
            status: cf_schemas::ApplicationStatus::Approved,
            risk_score: None,
            updated_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        };
        let json = serde_json::to_value(ServerMessage::ApplicationUpdate(event)).unwrap();
        assert_eq!(json["type"], "application_update");
        assert_eq!(json["data"]["status"], "APPROVED");
    }

    #[test]
    fn client_subscribe_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"action":"subscribe","application_id":"00000000-0000-0000-0000-000000000000"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { .. }));
    }

    #[test]
    fn client_ping_message_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }
}
