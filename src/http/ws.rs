use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::drivers::LocationUpdate;
use super::AppState;
use crate::hub::{Connection, Envelope, Outbound};
use crate::models::{Actor, Role};

const PING: &str = "ping";
const PONG: &str = "pong";
const LOCATION_UPDATE: &str = "location_update";
const ERROR: &str = "error";

/// GET /ws
pub async fn upgrade(
    State(state): State<AppState>,
    actor: Actor,
    ws: WebSocketUpgrade,
) -> Response {
    info!(user_id = %actor.id(), role = %actor.role(), "WebSocket connection authenticated");
    ws.on_upgrade(move |socket| run_connection(socket, state, actor))
}

/// Reader loop on this task, writer on a spawned one; both share the
/// connection's outbound queue through the hub.
async fn run_connection(socket: WebSocket, state: AppState, actor: Actor) {
    let (sink, mut stream) = socket.split();
    let (connection, rx) = connect(&state, actor).await;
    let writer = tokio::spawn(writer_task(sink, rx, state.ping_interval));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, &connection, actor, &text).await,
            Ok(Message::Close(_)) => break,
            // Pings are answered by axum; pongs and binary frames carry nothing for us.
            Ok(_) => {}
            Err(e) => {
                debug!(user_id = %actor.id(), "WebSocket read error: {}", e);
                break;
            }
        }
    }

    teardown(&state, &connection, &writer).await;
    info!(user_id = %actor.id(), connection_id = %connection.id, "WebSocket connection closed");
}

async fn connect(state: &AppState, actor: Actor) -> (Connection, mpsc::Receiver<Outbound>) {
    let _session = state.hub.session(actor.id()).await;
    state.hub.register(actor.id(), actor.role())
}

/// Stops the writer and unregisters. A driver whose last connection this was
/// goes offline before any reconnect of theirs can register.
async fn teardown(state: &AppState, connection: &Connection, writer: &JoinHandle<()>) {
    writer.abort();
    let _session = state.hub.session(connection.user_id).await;
    let remaining = state.hub.unregister(connection);
    if connection.role == Role::Driver && remaining == 0 {
        state.dispatcher.driver_disconnected(connection.user_id).await;
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    ping_every: Duration,
) {
    let mut ping = interval(ping_every);
    // First tick fires immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn handle_text(state: &AppState, connection: &Connection, actor: Actor, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user_id = %actor.id(), "Malformed WebSocket frame: {}", e);
            reply_error(state, connection, "malformed message");
            return;
        }
    };

    match envelope.kind.as_str() {
        PING => {
            state
                .hub
                .send_to_connection(connection, &Envelope::new(PONG, json!({})));
        }
        LOCATION_UPDATE => {
            let update: LocationUpdate = match serde_json::from_value(envelope.data) {
                Ok(update) => update,
                Err(e) => {
                    warn!(user_id = %actor.id(), "Malformed location update: {}", e);
                    reply_error(state, connection, "malformed location update");
                    return;
                }
            };
            if let Err(e) = state
                .dispatcher
                .update_location(actor, update.point(), update.heading)
                .await
            {
                reply_error(state, connection, &e.to_string());
            }
        }
        other => debug!(user_id = %actor.id(), "Ignoring {} frame", other),
    }
}

fn reply_error(state: &AppState, connection: &Connection, message: &str) {
    state.hub.send_to_connection(
        connection,
        &Envelope::new(ERROR, json!({ "message": message })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::dispatcher_with;
    use crate::dispatch::NewRide;
    use crate::models::{DriverStatus, GeoPoint, Place};
    use crate::notifier::push::LogPush;
    use crate::notifier::DRIVER_LOCATION_UPDATE;
    use std::future::pending;
    use std::sync::Arc;
    use uuid::Uuid;

    fn state() -> AppState {
        let (dispatcher, hub) = dispatcher_with(Arc::new(LogPush));
        AppState {
            dispatcher,
            hub,
            ping_interval: Duration::from_secs(30),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(serde_json::from_str(&message).unwrap());
        }
        out
    }

    async fn online_driver(state: &AppState) -> Actor {
        let driver = Actor::Driver(Uuid::new_v4());
        state
            .dispatcher
            .update_location(driver, GeoPoint { lat: 0.0, lng: 0.01 }, 0.0)
            .await
            .unwrap();
        state.dispatcher.set_availability(driver, true).await.unwrap();
        driver
    }

    fn idle_writer() -> JoinHandle<()> {
        tokio::spawn(pending::<()>())
    }

    #[tokio::test]
    async fn test_ping_is_answered_on_the_same_connection() {
        let state = state();
        let user = Actor::Client(Uuid::new_v4());
        let (phone, mut phone_rx) = connect(&state, user).await;
        let (_laptop, mut laptop_rx) = connect(&state, user).await;

        handle_text(&state, &phone, user, r#"{"type":"ping"}"#).await;

        let replies = drain(&mut phone_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, PONG);
        assert!(drain(&mut laptop_rx).is_empty());
    }

    #[tokio::test]
    async fn test_location_frame_reaches_client_of_active_ride() {
        let state = state();
        let driver = online_driver(&state).await;
        let client = Actor::Client(Uuid::new_v4());
        let (_client_conn, mut client_rx) = connect(&state, client).await;
        let (driver_conn, mut driver_rx) = connect(&state, driver).await;

        let ride = state
            .dispatcher
            .request_ride(
                client,
                NewRide {
                    pickup: Place { lat: 0.0, lng: 0.0, address: "A".to_string() },
                    destination: Place { lat: 0.0, lng: 0.5, address: "B".to_string() },
                },
            )
            .await
            .unwrap()
            .ride;
        state.dispatcher.accept(driver, ride.id).await.unwrap();
        drain(&mut client_rx);
        drain(&mut driver_rx);

        handle_text(
            &state,
            &driver_conn,
            driver,
            r#"{"type":"location_update","data":{"lat":0.0,"lng":0.004,"heading":180}}"#,
        )
        .await;

        let updates = drain(&mut client_rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kind, DRIVER_LOCATION_UPDATE);
        assert_eq!(updates[0].data["rideId"], json!(ride.id));
        assert_eq!(updates[0].data["lng"], 0.004);
        assert!(drain(&mut driver_rx).is_empty());

        let presence = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(presence.heading, 180.0);
    }

    #[tokio::test]
    async fn test_bad_frames_get_an_error_reply() {
        let state = state();
        let driver = online_driver(&state).await;
        let (conn, mut rx) = connect(&state, driver).await;

        for frame in [
            "not json",
            r#"{"type":"location_update","data":{"lat":"north"}}"#,
            r#"{"type":"location_update","data":{"lat":0.0,"lng":0.0,"heading":400}}"#,
        ] {
            handle_text(&state, &conn, driver, frame).await;
            let replies = drain(&mut rx);
            assert_eq!(replies.len(), 1, "{frame}");
            assert_eq!(replies[0].kind, ERROR);
            assert!(replies[0].data["message"].is_string());
        }

        let client = Actor::Client(Uuid::new_v4());
        let (client_conn, mut client_rx) = connect(&state, client).await;
        handle_text(
            &state,
            &client_conn,
            client,
            r#"{"type":"location_update","data":{"lat":0.0,"lng":0.0}}"#,
        )
        .await;
        assert_eq!(drain(&mut client_rx)[0].kind, ERROR);

        handle_text(&state, &conn, driver, r#"{"type":"typing"}"#).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_driver_goes_offline_with_last_connection() {
        let state = state();
        let driver = online_driver(&state).await;
        let (first, _rx1) = connect(&state, driver).await;
        let (second, _rx2) = connect(&state, driver).await;

        let writer = idle_writer();
        teardown(&state, &first, &writer).await;
        assert!(writer.await.unwrap_err().is_cancelled());
        let status = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(status.status(), DriverStatus::Available);

        teardown(&state, &second, &idle_writer()).await;
        let status = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(status.status(), DriverStatus::Offline);
        assert_eq!(
            state.hub.send_to_user(&driver.id(), &Envelope::new(PING, json!({}))),
            0
        );
    }

    #[tokio::test]
    async fn test_client_teardown_leaves_presence_alone() {
        let state = state();
        let driver = online_driver(&state).await;
        let client = Actor::Client(driver.id());
        let (conn, _rx) = connect(&state, client).await;

        teardown(&state, &conn, &idle_writer()).await;
        let status = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(status.status(), DriverStatus::Available);
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_last_teardown() {
        let state = state();
        let driver = online_driver(&state).await;
        let (only, _rx) = connect(&state, driver).await;

        // Queue the teardown, then a reconnect, behind a held gate.
        let gate = state.hub.session(driver.id()).await;
        let closing = {
            let state = state.clone();
            tokio::spawn(async move { teardown(&state, &only, &idle_writer()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reopening = {
            let state = state.clone();
            tokio::spawn(async move { connect(&state, driver).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished() && !reopening.is_finished());

        drop(gate);
        closing.await.unwrap();
        let (_fresh, _fresh_rx) = reopening.await.unwrap();

        let status = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(status.status(), DriverStatus::Offline);
        assert_eq!(
            state.hub.send_to_user(&driver.id(), &Envelope::new(PING, json!({}))),
            1
        );
    }

    #[tokio::test]
    async fn test_reconnect_ahead_of_teardown_keeps_driver_online() {
        let state = state();
        let driver = online_driver(&state).await;
        let (old, _rx) = connect(&state, driver).await;

        let gate = state.hub.session(driver.id()).await;
        let reopening = {
            let state = state.clone();
            tokio::spawn(async move { connect(&state, driver).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let closing = {
            let state = state.clone();
            tokio::spawn(async move { teardown(&state, &old, &idle_writer()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(gate);
        let (_fresh, _fresh_rx) = reopening.await.unwrap();
        closing.await.unwrap();

        let status = state.dispatcher.driver_status(driver).await.unwrap();
        assert_eq!(status.status(), DriverStatus::Available);
    }
}
