use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::Hub;

#[derive(Debug, Deserialize)]
struct VariantRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DeployPayload {
    #[serde(
        default,
        rename = "agentId",
        alias = "galaxyId",
        alias = "galaxy_id",
        alias = "agent_id"
    )]
    agent_id: String,
    #[serde(default, rename = "planetId", alias = "planet_id")]
    planet_id: String,
    #[serde(default, rename = "variantId", alias = "variant_id")]
    variant_id: Option<String>,
    #[serde(default)]
    variant: Option<VariantRef>,
}

/// Messages an observer may send over the live channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum InboundMessage {
    DeployVariant(DeployPayload),
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = hub.connect().await;
    let subscriber = subscription.id;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(envelope) = event else { break };
                let text = match serde_json::to_string(envelope.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(subscriber, error = %e, "Failed to serialize state envelope");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!(subscriber, "Observer send failed");
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(message) = handle_inbound(&hub, &text).await {
                        warn!(subscriber, error = %message, "Inbound message rejected");
                        let reply = json!({ "type": "error", "message": message }).to_string();
                        if sender.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber, error = %e, "WebSocket receive failed");
                    break;
                }
            }
        }
    }

    hub.disconnect(subscriber);
    info!(subscriber, "WebSocket connection closed");
}

/// Applies one inbound message. Errors are returned as the text sent back
/// to the originating socket.
async fn handle_inbound(hub: &Hub, text: &str) -> Result<(), String> {
    let message: InboundMessage =
        serde_json::from_str(text).map_err(|e| format!("invalid message: {}", e))?;

    match message {
        InboundMessage::DeployVariant(payload) => {
            let variant_id = payload
                .variant_id
                .or(payload.variant.map(|v| v.id))
                .unwrap_or_default();
            if payload.agent_id.is_empty() || payload.planet_id.is_empty() {
                return Err("deploy_variant requires agentId and planetId".to_string());
            }
            hub.deploy_variant(&payload.agent_id, &payload.planet_id, &variant_id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
    }
}
