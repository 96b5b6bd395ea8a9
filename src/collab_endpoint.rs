use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    collab::{ClientMessage, Participant, ServerMessage, SessionManager},
    response::{error_response, success_response, ApiResponse},
    state::AppState,
};

pub fn route_collab_to(app: Router<AppState>) -> Router<AppState> {
    app.route("/ws", get(upgrade))
        .route("/api/sessions/:resource_id", get(get_session))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state.sessions))
}

/// Applies one text frame from `connection_id`. Malformed frames are
/// logged and dropped.
pub fn handle_frame(sessions: &SessionManager, connection_id: &str, text: &str) -> bool {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => {
            sessions.handle(connection_id, message);
            true
        }
        Err(err) => {
            warn!(connection_id, "ignoring malformed frame: {}", err);
            false
        }
    }
}

async fn run_connection(socket: WebSocket, sessions: Arc<SessionManager>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (outbox, mut rx) = sessions.new_outbox();
    outbox.push(ServerMessage::Welcome {
        connection_id: connection_id.clone(),
    });
    // Only the registry keeps a sender, so stopping the manager ends the writer.
    if !sessions.register(&connection_id, outbox) {
        return;
    }
    info!(connection_id = %connection_id, "editor connected");

    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %connection_id, "cannot encode frame: {}", err);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        _ = sink.close().await;
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    handle_frame(&sessions, &connection_id, &text);
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
        _ = sessions.stopped() => {},
    }

    let left = sessions.disconnect(&connection_id);
    info!(connection_id = %connection_id, rooms_left = left, "editor disconnected");
}

#[derive(Serialize)]
struct SessionResBody {
    resource_id: String,
    participants: Vec<Participant>,
}

async fn get_session(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
) -> ApiResponse<SessionResBody> {
    match state.sessions.roster(&resource_id) {
        Some(participants) => success_response(
            StatusCode::OK,
            SessionResBody {
                resource_id,
                participants,
            },
        ),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("session \"{}\" is not active", resource_id),
        ),
    }
}
