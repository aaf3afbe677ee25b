//! Ping handler for health checks

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use super::DispatchEngine;

#[derive(Debug, Serialize, Deserialize)]
struct PingRequest {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PongResponse {
    message: String,
    timestamp: String,
    running_sweeps: Vec<Uuid>,
}

/// Handle ping messages
pub async fn handle_ping(client: Client, mut subscriber: Subscriber, engine: DispatchEngine) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let Some(reply) = msg.reply.clone() else {
            error!("Ping message without reply subject");
            continue;
        };

        // An empty body is a plain ping
        let request: PingRequest = if msg.payload.is_empty() {
            PingRequest { message: None }
        } else {
            match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    error!("Failed to parse ping request: {}", e);
                    let error_response = serde_json::json!({
                        "error": {
                            "code": "INVALID_REQUEST",
                            "message": format!("Failed to parse request: {}", e)
                        }
                    });
                    let _ = client.publish(reply, error_response.to_string().into()).await;
                    continue;
                }
            }
        };

        let response = PongResponse {
            message: request.message.map(|m| format!("Pong: {}", m)).unwrap_or_else(|| "Pong".to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            running_sweeps: engine.sweeps.running(),
        };
        client.publish(reply, serde_json::to_vec(&response)?.into()).await?;
        debug!("Sent pong response");
    }

    Ok(())
}
