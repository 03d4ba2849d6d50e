//! Session orchestrator: the top-level duplex state machine.
//!
//! The orchestrator owns the protocol client, the packet assembler, the
//! release ordering buffer and the playback engine's control handle. It is
//! driven from a single consuming context: protocol events and gate releases
//! are queued by other tasks and only applied inside [`SessionOrchestrator::tick`],
//! so no session field is ever touched from another thread.
//!
//! # Speaking state
//!
//! - Assistant speaking starts with the first content event of a turn.
//! - It stops once the backend closed the turn *and* playback drained, or
//!   immediately on barge-in, server interruption or teardown.
//! - User speaking follows [`start_capture`](SessionOrchestrator::start_capture)
//!   and [`stop_capture`](SessionOrchestrator::stop_capture).
//!
//! # Barge-in
//!
//! Starting capture while the assistant is mid-turn clears the playback buffer,
//! cancels the turn in the assembler, the release order and the gate, and
//! suppresses the backend's late content for that turn until its turn
//! boundary arrives.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use super::events::SessionEvent;
use crate::core::audio::{PlaybackConfig, PlaybackEngine, PlaybackRenderer};
use crate::core::packets::{
    AssemblerConfig, FunctionCallInfo, PacketAssembler, PacketKind, PacketRelease, ReleaseGate,
    ReleaseOrder, SyncPacket,
};
use crate::core::realtime::{
    ProtocolClient, ProtocolClientConfig, ProtocolEvent, RealtimeError, RealtimeResult,
    SessionState,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_EVENTS_PER_TICK: usize = 256;
pub const DEFAULT_RELEASE_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Everything a [`SessionOrchestrator`] needs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub protocol: ProtocolClientConfig,
    pub playback: PlaybackConfig,
    pub assembler: AssemblerConfig,
    pub connect_timeout: Duration,
    pub max_events_per_tick: usize,
    pub release_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolClientConfig::default(),
            playback: PlaybackConfig::default(),
            assembler: AssemblerConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_events_per_tick: DEFAULT_MAX_EVENTS_PER_TICK,
            release_queue_capacity: DEFAULT_RELEASE_QUEUE_CAPACITY,
        }
    }
}

// =============================================================================
// Function Call Handler
// =============================================================================

/// Error type returned by function call handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of released function call packets.
///
/// `Ok(Some(value))` is sent back to the backend as the call's response,
/// `Ok(None)` means fire-and-forget. Errors and panics are caught and surfaced
/// as [`SessionEvent::Error`].
pub trait FunctionCallHandler: Send {
    fn handle(&mut self, call: &FunctionCallInfo) -> Result<Option<Value>, HandlerError>;
}

impl<F> FunctionCallHandler for F
where
    F: FnMut(&FunctionCallInfo) -> Result<Option<Value>, HandlerError> + Send,
{
    fn handle(&mut self, call: &FunctionCallInfo) -> Result<Option<Value>, HandlerError> {
        self(call)
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Default)]
struct AssistantTurn {
    /// Turn currently reported as speaking.
    speaking: Option<u64>,
    /// Turn the backend closed whose audio is still playing.
    awaiting_drain: Option<u64>,
    /// Drop assistant content until the backend's next turn boundary.
    suppress_until_boundary: bool,
}

/// Top-level duplex session state machine.
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    session_id: String,
    state: SessionState,
    client: Option<ProtocolClient>,
    playback: PlaybackEngine,
    assembler: PacketAssembler,
    order: ReleaseOrder,
    gate: Option<Box<dyn ReleaseGate>>,
    release_tx: mpsc::Sender<SyncPacket>,
    release_rx: mpsc::Receiver<SyncPacket>,
    function_handler: Option<Box<dyn FunctionCallHandler>>,
    assistant: AssistantTurn,
    capturing: bool,
    pending_events: Vec<SessionEvent>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("capturing", &self.capturing)
            .field("gate", &self.gate.is_some())
            .finish()
    }
}

impl SessionOrchestrator {
    /// Create a disconnected session and the renderer for the output device.
    pub fn new(config: OrchestratorConfig) -> RealtimeResult<(Self, PlaybackRenderer)> {
        config.protocol.validate()?;
        if config.max_events_per_tick == 0 || config.release_queue_capacity == 0 {
            return Err(RealtimeError::InvalidConfiguration(
                "Event and release limits must be positive".to_string(),
            ));
        }

        let (playback, renderer) = PlaybackEngine::new(config.playback.clone());
        let (release_tx, release_rx) = mpsc::channel(config.release_queue_capacity);
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, "Session created");

        let orchestrator = Self {
            assembler: PacketAssembler::new(config.assembler.clone()),
            config,
            session_id,
            state: SessionState::Disconnected,
            client: None,
            playback,
            order: ReleaseOrder::new(),
            gate: None,
            release_tx,
            release_rx,
            function_handler: None,
            assistant: AssistantTurn::default(),
            capturing: false,
            pending_events: Vec::new(),
        };
        Ok((orchestrator, renderer))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.assistant.speaking.is_some()
    }

    /// Id of the current (or most recent) assistant turn.
    pub fn current_turn_id(&self) -> u64 {
        self.assembler.current_turn_id()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect using the configured timeout.
    pub async fn connect(&mut self) -> RealtimeResult<()> {
        self.connect_with_deadline(self.config.connect_timeout).await
    }

    /// Connect to the backend; never waits longer than `deadline`.
    ///
    /// Only valid from `Disconnected`. On failure the session moves to `Error`
    /// and an error event is queued; call [`disconnect`](Self::disconnect) to
    /// return to `Disconnected`.
    pub async fn connect_with_deadline(&mut self, deadline: Duration) -> RealtimeResult<()> {
        match self.state {
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

        let result = match ProtocolClient::new(self.config.protocol.clone()) {
            Ok(mut client) => client.connect(deadline).await.map(|()| client),
            Err(e) => Err(e),
        };

        match result {
            Ok(client) => {
                self.client = Some(client);
                self.playback.start();
                self.set_state(SessionState::Connected);
                tracing::info!(session_id = %self.session_id, "Session connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                self.pending_events.push(SessionEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent from any state.
    ///
    /// Order: cancel the receive loop, stop capture, stop playback, close the
    /// transport (bounded), release the credential, then `Disconnected`.
    pub async fn disconnect(&mut self) -> RealtimeResult<()> {
        if self.state == SessionState::Disconnected && self.client.is_none() {
            return Ok(());
        }
        if self.state != SessionState::Error {
            self.set_state(SessionState::Disconnecting);
        }

        if let Some(client) = &self.client {
            client.cancel_receive();
        }

        if self.capturing {
            self.capturing = false;
            self.pending_events.push(SessionEvent::UserSpeakingStopped);
        }

        self.playback.stop();

        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                tracing::warn!("Protocol client did not close cleanly: {}", e);
            }
        }

        if let Some(turn_id) = self.assembler.cancel_turn() {
            if let Some(gate) = self.gate.as_mut() {
                gate.on_turn_cancelled(turn_id);
            }
        }
        if let Some(turn_id) = self.assistant.speaking.take() {
            self.pending_events.push(SessionEvent::AssistantSpeakingStopped {
                turn_id,
                interrupted: true,
            });
        }
        self.assistant = AssistantTurn::default();
        self.assembler.reset();
        self.order.reset();
        while self.release_rx.try_recv().is_ok() {}

        self.set_state(SessionState::Disconnected);
        tracing::info!(session_id = %self.session_id, "Session disconnected");
        Ok(())
    }

    // =========================================================================
    // Capture And Input
    // =========================================================================

    /// The user started speaking. Barges in on an assistant turn in progress.
    pub fn start_capture(&mut self) -> RealtimeResult<()> {
        if !self.state.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        if self.capturing {
            return Ok(());
        }
        self.capturing = true;
        self.pending_events.push(SessionEvent::UserSpeakingStarted);

        if self.assistant.speaking.is_some() || self.assembler.is_active() {
            let mid_turn = self.assembler.is_active();
            tracing::info!(
                turn_id = self.assembler.current_turn_id(),
                "Barge-in, cancelling assistant turn"
            );
            let mut events = Vec::new();
            self.cancel_assistant_turn(&mut events);
            self.pending_events.extend(events);
            if mid_turn {
                self.assistant.suppress_until_boundary = true;
            }
        }
        Ok(())
    }

    /// The user stopped speaking; tells the backend the audio stream paused.
    pub fn stop_capture(&mut self) -> RealtimeResult<()> {
        if !self.capturing {
            return Ok(());
        }
        self.capturing = false;
        self.pending_events.push(SessionEvent::UserSpeakingStopped);
        self.client()?.send_audio_stream_end()
    }

    /// Forward a captured audio chunk at the configured capture rate.
    pub fn push_capture_audio(&self, samples: &[f32]) -> RealtimeResult<()> {
        self.client()?
            .send_audio(samples, self.config.protocol.capture_sample_rate)
    }

    /// Send a complete user text turn.
    pub fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.client()?.send_text(text, true)
    }

    fn client(&self) -> RealtimeResult<&ProtocolClient> {
        match &self.client {
            Some(client) if self.state.is_connected() => Ok(client),
            _ => Err(RealtimeError::NotConnected),
        }
    }

    // =========================================================================
    // Gate And Handler Registration
    // =========================================================================

    /// Route packets through `gate`. A previously registered gate is replaced.
    pub fn register_gate<G: ReleaseGate + 'static>(&mut self, gate: G) {
        let mut gate: Box<dyn ReleaseGate> = Box::new(gate);
        if self.gate.is_some() {
            tracing::warn!("Replacing the registered release gate, only one gate is supported");
            self.unregister_gate();
        }
        gate.on_registered(PacketRelease::new(self.release_tx.clone()));
        self.gate = Some(gate);
    }

    /// Remove the registered gate; packets release immediately afterwards.
    pub fn unregister_gate(&mut self) {
        if let Some(mut gate) = self.gate.take() {
            gate.on_unregistered();
            let held = self.order.resync();
            self.pending_events
                .extend(held.into_iter().map(SessionEvent::Packet));
        }
    }

    /// Latency the registered gate adds, zero without a gate.
    pub fn pacing_latency(&self) -> Duration {
        self.gate
            .as_ref()
            .map_or(Duration::ZERO, |gate| gate.estimated_latency())
    }

    pub fn set_function_handler<H: FunctionCallHandler + 'static>(&mut self, handler: H) {
        self.function_handler = Some(Box::new(handler));
    }

    pub fn clear_function_handler(&mut self) {
        self.function_handler = None;
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Apply queued protocol events and gate releases on the calling context.
    pub fn tick(&mut self) -> Vec<SessionEvent> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.pending_events);

        let incoming = match self.client.as_mut() {
            Some(client) => client.drain_events(self.config.max_events_per_tick),
            None => Vec::new(),
        };
        for event in incoming {
            self.handle_protocol_event(event, now, &mut events);
        }

        if let Some(packet) = self.assembler.poll_fallback(now) {
            self.submit_packet(packet, &mut events);
        }

        while let Ok(packet) = self.release_rx.try_recv() {
            for ready in self.order.push(packet) {
                self.deliver(ready, &mut events);
            }
        }

        self.check_playback_drained(&mut events);
        events
    }

    fn handle_protocol_event(
        &mut self,
        event: ProtocolEvent,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        if event.is_assistant_content() && self.assistant.suppress_until_boundary {
            tracing::trace!(kind = event.kind(), "Suppressing late content of interrupted turn");
            return;
        }

        match event {
            ProtocolEvent::AudioChunk {
                samples,
                sample_rate,
            } => {
                self.ensure_turn(events);
                if sample_rate != self.config.playback.source_sample_rate {
                    tracing::warn!(
                        received = sample_rate,
                        expected = self.config.playback.source_sample_rate,
                        "Audio chunk sample rate differs from playback source rate"
                    );
                }
                self.playback.mark_end_of_stream(false);
                self.playback.push_samples(&samples);
                self.assembler.push_audio(samples);
            }
            ProtocolEvent::OutputTranscriptDelta { text } => {
                self.ensure_turn(events);
                if let Some(packet) = self.assembler.push_text_at(&text, now) {
                    self.submit_packet(packet, events);
                }
            }
            ProtocolEvent::FunctionCall {
                call_id,
                name,
                args,
            } => {
                self.ensure_turn(events);
                if let Some(packet) = self.assembler.push_function_call(name, args, call_id) {
                    self.submit_packet(packet, events);
                }
            }
            ProtocolEvent::InputTranscriptDelta { text } => {
                events.push(SessionEvent::InputTranscript { text });
            }
            ProtocolEvent::TurnComplete => {
                if self.assistant.suppress_until_boundary {
                    tracing::debug!("Turn boundary reached, resuming assistant content");
                    self.assistant.suppress_until_boundary = false;
                    return;
                }
                if let Some(packet) = self.assembler.finish_turn() {
                    let turn_id = packet.turn_id;
                    self.submit_packet(packet, events);
                    self.playback.mark_end_of_stream(true);
                    self.assistant.awaiting_drain = Some(turn_id);
                }
            }
            ProtocolEvent::Interrupted => {
                if self.assistant.suppress_until_boundary {
                    self.assistant.suppress_until_boundary = false;
                    return;
                }
                if self.assistant.speaking.is_some() || self.assembler.is_active() {
                    tracing::info!(
                        turn_id = self.assembler.current_turn_id(),
                        "Backend interrupted the assistant turn"
                    );
                    self.cancel_assistant_turn(events);
                }
            }
            ProtocolEvent::FunctionCallCancellation { ids } => {
                events.push(SessionEvent::FunctionCallCancelled { ids });
            }
            ProtocolEvent::Connected => {
                tracing::trace!("Protocol client reported connected");
            }
            ProtocolEvent::Error { message } => {
                events.push(SessionEvent::Error { message });
                self.handle_transport_loss(events);
            }
            ProtocolEvent::Disconnected => {
                self.handle_transport_loss(events);
            }
        }
    }

    /// Start a turn on the first content event, closing a drained-pending one.
    fn ensure_turn(&mut self, events: &mut Vec<SessionEvent>) {
        if self.assembler.is_active() {
            return;
        }
        if let Some(previous) = self.assistant.awaiting_drain.take() {
            self.assistant.speaking = None;
            events.push(SessionEvent::AssistantSpeakingStopped {
                turn_id: previous,
                interrupted: false,
            });
        }
        let turn_id = self.assembler.start_turn();
        self.assistant.speaking = Some(turn_id);
        events.push(SessionEvent::AssistantSpeakingStarted { turn_id });
    }

    /// Cancel whatever assistant output is in flight.
    fn cancel_assistant_turn(&mut self, events: &mut Vec<SessionEvent>) {
        self.playback.clear_buffer();

        let cancelled = self
            .assembler
            .cancel_turn()
            .into_iter()
            .chain(self.assistant.awaiting_drain.take());
        for turn_id in cancelled {
            self.order.cancel_turn(turn_id);
            if let Some(gate) = self.gate.as_mut() {
                gate.on_turn_cancelled(turn_id);
            }
        }

        if let Some(turn_id) = self.assistant.speaking.take() {
            events.push(SessionEvent::AssistantSpeakingStopped {
                turn_id,
                interrupted: true,
            });
        }
    }

    fn handle_transport_loss(&mut self, events: &mut Vec<SessionEvent>) {
        if self.state != SessionState::Connected {
            return;
        }
        tracing::warn!(session_id = %self.session_id, "Transport lost");
        self.cancel_assistant_turn(events);
        self.assistant.suppress_until_boundary = false;
        self.playback.stop();
        self.set_state_into(SessionState::Error, events);
    }

    fn submit_packet(&mut self, packet: SyncPacket, events: &mut Vec<SessionEvent>) {
        match self.gate.as_mut() {
            Some(gate) => gate.submit(packet),
            None => {
                for ready in self.order.push(packet) {
                    self.deliver(ready, events);
                }
            }
        }
    }

    fn deliver(&mut self, packet: SyncPacket, events: &mut Vec<SessionEvent>) {
        if packet.kind == PacketKind::FunctionCall {
            if let Some(call) = packet.function_call.clone() {
                self.dispatch_function_call(&call, events);
            }
        }
        events.push(SessionEvent::Packet(packet));
    }

    fn dispatch_function_call(&mut self, call: &FunctionCallInfo, events: &mut Vec<SessionEvent>) {
        let Some(handler) = self.function_handler.as_mut() else {
            return;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(call))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(RealtimeError::HandlerFailed(format!("{}: {}", call.name, e))),
            Err(_) => Err(RealtimeError::HandlerFailed(format!(
                "{}: handler panicked",
                call.name
            ))),
        };

        let result = match outcome {
            Ok(Some(response)) => self
                .client()
                .and_then(|client| client.send_tool_response(&call.call_id, &call.name, response)),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::error!(call_id = %call.call_id, "Function call failed: {}", e);
            events.push(SessionEvent::Error {
                message: e.to_string(),
            });
        }
    }

    fn check_playback_drained(&mut self, events: &mut Vec<SessionEvent>) {
        let Some(turn_id) = self.assistant.awaiting_drain else {
            return;
        };
        if !self.playback.is_drained() {
            return;
        }
        self.assistant.awaiting_drain = None;
        if self.assistant.speaking == Some(turn_id) {
            self.assistant.speaking = None;
        }
        tracing::debug!(turn_id, "Assistant turn played out");
        events.push(SessionEvent::AssistantSpeakingStopped {
            turn_id,
            interrupted: false,
        });
    }

    fn set_state(&mut self, next: SessionState) {
        let mut events = Vec::new();
        self.set_state_into(next, &mut events);
        self.pending_events.extend(events);
    }

    fn set_state_into(&mut self, next: SessionState, events: &mut Vec<SessionEvent>) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            tracing::warn!(from = %from, to = %next, "Unexpected session state transition");
        }
        tracing::debug!(from = %from, to = %next, "Session state changed");
        self.state = next;
        events.push(SessionEvent::StateChanged { from, to: next });
    }
}
