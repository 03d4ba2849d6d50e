//! WebSocket mock of the live conversation backend
//!
//! Accepts one connection, expects the setup message, acknowledges it and then
//! plays a scripted sequence of server messages. Every client frame is recorded.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// One step of a scripted backend conversation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send a JSON message to the client.
    Send(Value),
    /// Wait for the next JSON text frame from the client.
    AwaitClient,
    Sleep(Duration),
    /// Close the connection with a normal close frame.
    Close,
    /// Drop the TCP connection without a close handshake.
    Drop,
}

/// Behaviour right after the WebSocket handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Reply `setupComplete` to the setup message.
    Acknowledge,
    /// Never answer the setup message.
    Silent,
}

/// Running mock server.
pub struct MockBackend {
    pub url: String,
    /// Client frames in arrival order, the setup message first.
    pub received: Arc<Mutex<Vec<Value>>>,
    /// `x-goog-api-key` header of the upgrade request.
    pub api_key_header: Arc<Mutex<Option<String>>>,
    pub handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(script: Vec<Step>) -> Self {
        Self::start_with(Handshake::Acknowledge, script).await
    }

    pub async fn start_with(handshake: Handshake, script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let api_key_header = Arc::new(Mutex::new(None));

        let handle = tokio::spawn({
            let received = Arc::clone(&received);
            let api_key_header = Arc::clone(&api_key_header);
            async move {
                if let Ok((stream, _)) = listener.accept().await {
                    let _ = serve(stream, handshake, script, received, api_key_header).await;
                }
            }
        });

        Self {
            url: format!("ws://{}", addr),
            received,
            api_key_header,
            handle,
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Wait until at least `count` client frames were recorded.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let frames = self.received();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received()
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    handshake: Handshake,
    script: Vec<Step>,
    received: Arc<Mutex<Vec<Value>>>,
    api_key_header: Arc<Mutex<Option<String>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let header_slot = Arc::clone(&api_key_header);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *header_slot.lock() = request
            .headers()
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();

    // Setup message
    if let Some(setup) = next_json(&mut read).await {
        received.lock().push(setup);
    }
    if handshake == Handshake::Silent {
        while next_json(&mut read).await.is_some() {}
        return Ok(());
    }
    write
        .send(Message::Text(json!({ "setupComplete": {} }).to_string().into()))
        .await?;

    for step in script {
        match step {
            Step::Send(value) => {
                write.send(Message::Text(value.to_string().into())).await?;
            }
            Step::AwaitClient => match next_json(&mut read).await {
                Some(value) => received.lock().push(value),
                None => return Ok(()),
            },
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::Close => {
                write.send(Message::Close(None)).await?;
                return Ok(());
            }
            Step::Drop => return Ok(()),
        }
    }

    while let Some(value) = next_json(&mut read).await {
        received.lock().push(value);
    }
    Ok(())
}

async fn next_json<S>(read: &mut S) -> Option<Value>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    return Some(value);
                }
            }
            Ok(Message::Binary(data)) => {
                if let Ok(value) = serde_json::from_slice::<Value>(&data) {
                    return Some(value);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

// =============================================================================
// Server Message Builders
// =============================================================================

pub fn transcript(text: &str) -> Value {
    json!({ "serverContent": { "outputTranscription": { "text": text } } })
}

pub fn input_transcript(text: &str) -> Value {
    json!({ "serverContent": { "inputTranscription": { "text": text } } })
}

/// PCM16LE audio chunk at 24 kHz holding `samples` copies of `value`.
pub fn audio(samples: usize, value: i16) -> Value {
    let bytes: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), samples)
        .flatten()
        .collect();
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": BASE64_STANDARD.encode(bytes)
                    }
                }]
            }
        }
    })
}

pub fn turn_complete() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

pub fn interrupted() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}

pub fn tool_call(id: &str, name: &str, args: Value) -> Value {
    json!({ "toolCall": { "functionCalls": [{ "id": id, "name": name, "args": args }] } })
}
