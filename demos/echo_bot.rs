//! Echo bot demo.
//!
//! Starts a tiny RTVI bot on a local WebSocket, then drives a full session
//! against it:
//! - connect and wait for `bot-ready`
//! - answer a bot function call with a registered handler
//! - round-trip a client request
//!
//! Run with: cargo run --example echo_bot [-- --debug]

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rtvi_client::transport::WebSocketTransport;
use rtvi_client::{Callbacks, ConnectParams, EventName, RtviClient, RtviEvent, RtviMessage};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Bot
// ============================================================================

/// Serves one session: ready on `client-ready`, one function call,
/// echo on `client-message`.
async fn run_bot(listener: TcpListener) -> anyhow::Result<()> {
    let (stream, _) = listener.accept().await?;
    let mut ws = accept_async(stream).await?;

    while let Some(frame) = ws.next().await {
        let Ok(Message::Text(text)) = frame else {
            continue;
        };
        let message: Value = serde_json::from_str(&text)?;
        let id = message["id"].clone();

        let replies = match message["type"].as_str() {
            Some("client-ready") => vec![
                json!({ "id": "ready-1", "label": "rtvi-ai", "type": "bot-ready",
                        "data": { "version": "1.0.0", "about": { "name": "echo-bot" } } }),
                json!({ "id": "call-1", "label": "rtvi-ai", "type": "llm-function-call-in-progress",
                        "data": { "function_name": "get_weather", "tool_call_id": "tool-1",
                                  "arguments": { "city": "Lisbon" } } }),
            ],
            Some("llm-function-call-result") => vec![
                json!({ "id": "out-1", "label": "rtvi-ai", "type": "bot-output",
                        "data": { "text": format!("Weather: {}", message["data"]["result"]),
                                  "spoken": true, "aggregated_by": "sentence" } }),
            ],
            Some("client-message") => vec![
                json!({ "id": id, "label": "rtvi-ai", "type": "server-response",
                        "data": { "t": message["data"]["t"], "d": message["data"]["d"] } }),
            ],
            _ => Vec::new(),
        };

        for reply in replies {
            ws.send(Message::text(reply.to_string())).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug = std::env::args().any(|a| a == "--debug");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(if debug {
            "rtvi_client=debug"
        } else {
            "rtvi_client=info"
        }))
        .with_target(false)
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let ws_url = format!("ws://{}", listener.local_addr()?);
    let bot = tokio::spawn(run_bot(listener));

    let client = RtviClient::builder()
        .transport(WebSocketTransport::new())
        .ready_timeout(Duration::from_secs(5))
        .callbacks(
            Callbacks::new()
                .on_bot_ready(|ready| println!("[Bot] ready, protocol {}", ready.version))
                .on_error(|err: &RtviMessage| println!("[Error] {}", err.get_string("message"))),
        )
        .build()?;

    client.on(EventName::BotOutput, |event| {
        if let RtviEvent::BotOutput(output) = event {
            println!("[Bot] {}", output.text);
        }
    });

    client.register_function_call_handler("get_weather", |call| async move {
        println!("[Call] get_weather({})", call.arguments);
        Some(json!({ "city": call.arguments["city"], "forecast": "sunny" }))
    });

    client
        .connect(Some(ConnectParams::params(json!({ "ws_url": ws_url }))))
        .await?;

    let echoed = client
        .send_client_request("echo", json!({ "hello": "bot" }), None)
        .await?;
    println!("[Echo] {echoed}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.disconnect().await?;
    bot.await??;

    Ok(())
}
