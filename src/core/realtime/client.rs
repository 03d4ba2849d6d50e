//! Live duplex protocol client.
//!
//! This module provides the WebSocket client for the live backend. A client
//! instance covers one connection: it performs the `setup` handshake, sends
//! captured audio, text and tool results, and decodes inbound frames into
//! [`ProtocolEvent`]s on a bounded queue that the owner drains with
//! [`ProtocolClient::drain_events`].
//!
//! # Receive loop
//!
//! The backend frames its output per turn. The receive task runs a per-turn
//! routine that returns at every turn boundary, wrapped in an outer loop that
//! restarts it unconditionally. Without the outer loop the client would go
//! quiet after the first reply. The loop only ends on cancellation or when the
//! transport goes away.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use waav_duplex::core::realtime::{ProtocolClient, ProtocolClientConfig};
//!
//! let mut client = ProtocolClient::new(config)?;
//! client.connect(Duration::from_secs(10)).await?;
//! client.send_text("Hello!", true)?;
//! for event in client.drain_events(64) {
//!     println!("{:?}", event);
//! }
//! client.disconnect().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::base::{ProtocolEvent, RealtimeError, RealtimeResult, SessionState};
use super::config::{API_KEY_HEADER, ProtocolClientConfig, ResponseModality};
use super::messages::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// =============================================================================
// Protocol Client
// =============================================================================

/// WebSocket client for one live session connection.
///
/// Dropping the client zeroizes its copy of the API key.
pub struct ProtocolClient {
    config: ProtocolClientConfig,
    state: Arc<RwLock<SessionState>>,
    outbound: Option<mpsc::Sender<Message>>,
    events_tx: mpsc::Sender<ProtocolEvent>,
    events_rx: mpsc::Receiver<ProtocolEvent>,
    cancel: CancellationToken,
    writer_handle: Option<JoinHandle<()>>,
    receive_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl ProtocolClient {
    /// Create a disconnected client. The configuration is validated up front.
    pub fn new(config: ProtocolClientConfig) -> RealtimeResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            outbound: None,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            writer_handle: None,
            receive_handle: None,
        })
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Open the socket, send `setup` and wait for `setupComplete`, all within `deadline`.
    ///
    /// On failure the client is left in `Error` and an `Error` event is queued.
    pub async fn connect(&mut self, deadline: Duration) -> RealtimeResult<()> {
        match self.state() {
            SessionState::Connected => return Ok(()),
            SessionState::Disconnected => {}
            other => {
                return Err(RealtimeError::InvalidState(format!(
                    "Cannot connect while {}",
                    other
                )));
            }
        }

        self.set_state(SessionState::Connecting);
        self.cancel = CancellationToken::new();

        let result = match tokio::time::timeout(deadline, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::Timeout(format!(
                "Setup not completed within {:?}",
                deadline
            ))),
        };

        match result {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.push_event(ProtocolEvent::Connected);
                tracing::info!(model = %self.config.model, "Connected to live backend");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to connect to live backend: {}", e);
                self.cancel.cancel();
                self.outbound = None;
                self.set_state(SessionState::Error);
                self.push_event(ProtocolEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> RealtimeResult<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        let mut key = http::HeaderValue::from_str(&self.config.api_key).map_err(|_| {
            RealtimeError::InvalidConfiguration("API key is not a valid header value".to_string())
        })?;
        key.set_sensitive(true);
        request.headers_mut().insert(API_KEY_HEADER, key);

        let (mut ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        tracing::debug!("WebSocket open, sending setup");

        let setup = serde_json::to_string(&ClientMessage::setup(&self.config))
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        ws.send(Message::Text(setup.into()))
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;

        wait_for_setup_complete(&mut ws).await?;

        let (sink, source) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(self.config.outbound_queue_capacity);

        self.writer_handle = Some(tokio::spawn(write_loop(sink, out_rx)));

        let ctx = ReceiveContext {
            events: self.events_tx.clone(),
            outbound: out_tx.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            modality: self.config.response_modality,
        };
        self.receive_handle = Some(tokio::spawn(receive_loop(source, ctx)));
        self.outbound = Some(out_tx);
        Ok(())
    }

    // =========================================================================
    // Send Path
    // =========================================================================

    /// Queue captured audio as a PCM16 media chunk.
    pub fn send_audio(&self, samples: &[f32], sample_rate: u32) -> RealtimeResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.send_message(&ClientMessage::audio(samples, sample_rate))
    }

    /// Queue a user text turn.
    pub fn send_text(&self, text: &str, turn_complete: bool) -> RealtimeResult<()> {
        self.send_message(&ClientMessage::text(text, turn_complete))
    }

    /// Queue the result of a function call.
    pub fn send_tool_response(&self, call_id: &str, name: &str, response: Value) -> RealtimeResult<()> {
        self.send_message(&ClientMessage::tool_response(call_id, name, response))
    }

    /// Tell the backend that capture stopped.
    pub fn send_audio_stream_end(&self) -> RealtimeResult<()> {
        self.send_message(&ClientMessage::audio_stream_end())
    }

    fn send_message(&self, message: &ClientMessage) -> RealtimeResult<()> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let Some(sender) = self.outbound.as_ref() else {
            return Err(RealtimeError::NotConnected);
        };

        let json = serde_json::to_string(message)
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        sender
            .try_send(Message::Text(json.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RealtimeError::QueueFull(format!("Outbound queue full, dropped {}", message.kind()))
                }
                mpsc::error::TrySendError::Closed(_) => RealtimeError::NotConnected,
            })
    }

    // =========================================================================
    // Receive Path
    // =========================================================================

    /// Pop up to `max` queued events without blocking.
    pub fn drain_events(&mut self, max: usize) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.events_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }

    /// Stop the receive loop at its next await point.
    pub fn cancel_receive(&self) {
        self.cancel.cancel();
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Close the connection and release transport resources.
    ///
    /// The receive loop is cancelled before the close frame is sent. The close
    /// handshake is bounded by the configured close timeout; tasks still
    /// running after that are aborted.
    pub async fn disconnect(&mut self) -> RealtimeResult<()> {
        let state = self.state();
        if state == SessionState::Disconnected
            && self.writer_handle.is_none()
            && self.receive_handle.is_none()
        {
            return Ok(());
        }
        if state != SessionState::Error {
            self.set_state(SessionState::Disconnecting);
        }

        self.cancel.cancel();

        if let Some(sender) = self.outbound.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            }));
            if let Err(e) = sender.try_send(close) {
                tracing::debug!("Could not queue close frame: {}", e);
            }
        }

        let close_timeout = self.config.close_timeout;
        if let Some(handle) = self.writer_handle.take() {
            join_or_abort(handle, close_timeout, "writer").await;
        }
        if let Some(handle) = self.receive_handle.take() {
            join_or_abort(handle, close_timeout, "receive").await;
        }

        self.set_state(SessionState::Disconnected);
        tracing::info!("Disconnected from live backend");
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "Protocol state changed");
            *state = next;
        }
    }

    fn push_event(&self, event: ProtocolEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!("Event queue full, dropping {} event", kind_of(&e));
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.writer_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.receive_handle.take() {
            handle.abort();
        }
    }
}

fn kind_of(e: &mpsc::error::TrySendError<ProtocolEvent>) -> &'static str {
    match e {
        mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => {
            event.kind()
        }
    }
}

async fn join_or_abort(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(timeout, handle).await.is_err() {
        tracing::warn!("{} task did not stop within {:?}, aborting", name, timeout);
        abort.abort();
    }
}

// =============================================================================
// Connection Tasks
// =============================================================================

/// Read frames until `setupComplete`, answering pings on the way.
async fn wait_for_setup_complete(ws: &mut WsStream) -> RealtimeResult<()> {
    loop {
        let payload = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data))
                    .await
                    .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(RealtimeError::ConnectionFailed(format!(
                    "Connection closed during setup: {}",
                    frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default()
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RealtimeError::WebSocketError(e.to_string())),
            None => {
                return Err(RealtimeError::ConnectionFailed(
                    "Connection closed during setup".to_string(),
                ));
            }
        };

        match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(message) if message.is_setup_complete() => return Ok(()),
            Ok(_) => tracing::trace!("Ignoring frame received before setup completed"),
            Err(e) => tracing::warn!(
                "Failed to parse server event: {} - {}",
                e,
                String::from_utf8_lossy(&payload)
            ),
        }
    }
}

/// Forward queued messages to the socket. Ends after a close frame or when
/// every sender is gone.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::error!("Failed to send WebSocket message: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::trace!("WebSocket sink close: {}", e);
    }
    tracing::debug!("Writer task ended");
}

struct ReceiveContext {
    events: mpsc::Sender<ProtocolEvent>,
    outbound: mpsc::Sender<Message>,
    state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    modality: ResponseModality,
}

impl ReceiveContext {
    /// Queue an event, giving up if cancelled while the queue is full.
    async fn emit(&self, event: ProtocolEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.events.send(event) => result.is_ok(),
        }
    }
}

/// How one pass of the per-turn receive routine ended.
#[derive(Debug)]
enum TurnOutcome {
    /// A turn boundary was delivered; receive the next turn.
    Completed,
    /// Teardown requested.
    Cancelled,
    /// The remote side closed the socket.
    Closed(String),
    /// The transport failed.
    Failed(String),
}

async fn receive_loop(mut source: WsSource, ctx: ReceiveContext) {
    let mut turns = 0u64;
    loop {
        match receive_turn(&mut source, &ctx).await {
            TurnOutcome::Completed => {
                turns += 1;
                tracing::debug!(turns, "Turn boundary received, restarting receive");
            }
            TurnOutcome::Cancelled => {
                tracing::debug!("Receive loop cancelled");
                break;
            }
            TurnOutcome::Closed(reason) => {
                handle_remote_loss(&ctx, format!("Connection closed by server: {}", reason)).await;
                break;
            }
            TurnOutcome::Failed(error) => {
                handle_remote_loss(&ctx, format!("WebSocket error: {}", error)).await;
                break;
            }
        }
    }
    tracing::debug!("Receive task ended");
}

/// Receive frames until the end of the current turn.
async fn receive_turn(source: &mut WsSource, ctx: &ReceiveContext) -> TurnOutcome {
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TurnOutcome::Cancelled,
            frame = source.next() => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = ctx.outbound.try_send(Message::Pong(data)) {
                    tracing::error!("Failed to send pong: {}", e);
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".to_string());
                return TurnOutcome::Closed(reason);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return TurnOutcome::Failed(e.to_string()),
            None => return TurnOutcome::Closed("stream ended".to_string()),
        };

        let message = match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse server event: {} - {}",
                    e,
                    String::from_utf8_lossy(&payload)
                );
                continue;
            }
        };

        let mut turn_complete = false;
        for event in message.into_events(ctx.modality) {
            if matches!(event, ProtocolEvent::TurnComplete) {
                turn_complete = true;
            }
            tracing::trace!(kind = event.kind(), "Protocol event");
            if !ctx.emit(event).await {
                return TurnOutcome::Cancelled;
            }
        }
        if turn_complete {
            return TurnOutcome::Completed;
        }
    }
}

async fn handle_remote_loss(ctx: &ReceiveContext, message: String) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    tracing::warn!("{}", message);
    *ctx.state.write() = SessionState::Error;
    ctx.emit(ProtocolEvent::Error { message }).await;
    ctx.emit(ProtocolEvent::Disconnected).await;
}
