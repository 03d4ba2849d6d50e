//! Release gating for assembled packets.
//!
//! A [`ReleaseGate`] sits between the assembler and packet consumers and
//! decides *when* each packet is handed over, for example to hold subtitles
//! back until the matching audio is audible. Gates receive a [`PacketRelease`]
//! handle on registration and may call it from any thread; released packets
//! are queued and picked up by the session on its next tick.
//!
//! Only one gate can be registered per session. Registering another replaces
//! the first.
//!
//! Whatever the gate does, packets reach consumers through [`ReleaseOrder`],
//! which restores strict `(turn_id, sequence)` order and drops packets of
//! cancelled turns.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::SyncPacket;

// =============================================================================
// Release Handle
// =============================================================================

/// Errors returned by [`PacketRelease::release`].
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The session's release queue is full; the packet is handed back for retry.
    #[error("Release queue full (turn {}, sequence {})", .0.turn_id, .0.sequence)]
    QueueFull(Box<SyncPacket>),

    /// The session is gone or the gate was unregistered.
    #[error("Release queue closed")]
    Closed,
}

/// Thread-safe handle a gate uses to hand packets back to the session.
#[derive(Debug, Clone)]
pub struct PacketRelease {
    tx: mpsc::Sender<SyncPacket>,
}

impl PacketRelease {
    pub fn new(tx: mpsc::Sender<SyncPacket>) -> Self {
        Self { tx }
    }

    /// Queue a packet for delivery without blocking.
    pub fn release(&self, packet: SyncPacket) -> Result<(), ReleaseError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(packet) => ReleaseError::QueueFull(Box::new(packet)),
            mpsc::error::TrySendError::Closed(_) => ReleaseError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Gate Trait
// =============================================================================

/// Controls when assembled packets are released to consumers.
pub trait ReleaseGate: Send {
    /// Called once when the gate is registered with a session.
    fn on_registered(&mut self, release: PacketRelease);

    /// Take ownership of a packet. The gate must eventually release it (or
    /// drop it if its turn was cancelled).
    fn submit(&mut self, packet: SyncPacket);

    /// How far behind real time released packets typically run.
    fn estimated_latency(&self) -> Duration {
        Duration::ZERO
    }

    /// Called when the gate is replaced or the session shuts down.
    fn on_unregistered(&mut self) {}

    /// Called on barge-in or server interruption. Held packets of `turn_id`
    /// are stale and may be discarded.
    fn on_turn_cancelled(&mut self, _turn_id: u64) {}
}

/// Gate that holds every packet for a fixed delay before releasing it.
///
/// Useful when downstream rendering trails the audio output by a known amount.
/// Outside a tokio runtime packets are released immediately.
#[derive(Debug)]
pub struct FixedDelayGate {
    delay: Duration,
    release: Option<PacketRelease>,
    in_flight: Vec<(u64, JoinHandle<()>)>,
}

/// Backoff between retries when the release queue is full.
const RELEASE_RETRY_INTERVAL: Duration = Duration::from_millis(5);

impl FixedDelayGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            release: None,
            in_flight: Vec::new(),
        }
    }

    fn prune(&mut self) {
        self.in_flight.retain(|(_, handle)| !handle.is_finished());
    }
}

impl ReleaseGate for FixedDelayGate {
    fn on_registered(&mut self, release: PacketRelease) {
        self.release = Some(release);
    }

    fn submit(&mut self, packet: SyncPacket) {
        let Some(release) = self.release.clone() else {
            tracing::warn!("Packet submitted to an unregistered gate, dropping it");
            return;
        };
        self.prune();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = release.release(packet) {
                tracing::warn!("Failed to release packet: {}", e);
            }
            return;
        };

        let turn_id = packet.turn_id;
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut packet = packet;
            loop {
                match release.release(packet) {
                    Ok(()) => break,
                    Err(ReleaseError::QueueFull(returned)) => {
                        packet = *returned;
                        tokio::time::sleep(RELEASE_RETRY_INTERVAL).await;
                    }
                    Err(ReleaseError::Closed) => break,
                }
            }
        });
        self.in_flight.push((turn_id, handle));
    }

    fn estimated_latency(&self) -> Duration {
        self.delay
    }

    fn on_unregistered(&mut self) {
        for (_, handle) in self.in_flight.drain(..) {
            handle.abort();
        }
        self.release = None;
    }

    fn on_turn_cancelled(&mut self, turn_id: u64) {
        self.in_flight.retain(|(turn, handle)| {
            if *turn == turn_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

// =============================================================================
// Release Ordering
// =============================================================================

/// Restores strict `(turn_id, sequence)` delivery order for released packets.
///
/// A packet is delivered when it is the next sequence of the current turn, or
/// sequence 0 of a later turn once the current turn has ended. Packets that
/// arrive early are held; stale or cancelled packets are dropped.
#[derive(Debug, Default)]
pub struct ReleaseOrder {
    pending: BTreeMap<(u64, u32), SyncPacket>,
    last: Option<(u64, u32)>,
    last_closed: bool,
    cancelled: BTreeSet<u64>,
    /// Accept the next packet whatever its key, after a gate change.
    resync: bool,
}

impl ReleaseOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets held back waiting for a predecessor.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Accept a released packet and return every packet now deliverable, in order.
    pub fn push(&mut self, packet: SyncPacket) -> Vec<SyncPacket> {
        let key = packet.order_key();

        if self.cancelled.contains(&packet.turn_id) {
            tracing::debug!(
                turn_id = packet.turn_id,
                sequence = packet.sequence,
                "Dropping packet of cancelled turn"
            );
            return Vec::new();
        }
        if self.last.is_some_and(|last| key <= last) {
            tracing::warn!(
                turn_id = packet.turn_id,
                sequence = packet.sequence,
                "Dropping stale or duplicate packet"
            );
            return Vec::new();
        }

        self.pending.insert(key, packet);
        self.drain_ready()
    }

    /// Discard held packets of `turn_id` and drop any that arrive later.
    pub fn cancel_turn(&mut self, turn_id: u64) {
        self.pending.retain(|(turn, _), _| *turn != turn_id);
        self.cancelled.insert(turn_id);
        if self.last.is_some_and(|(turn, _)| turn == turn_id) {
            self.last_closed = true;
        }
    }

    /// Deliver everything held, in order, and take the next packet as the new
    /// baseline. Used when a gate is replaced and packets it held are lost.
    pub fn resync(&mut self) -> Vec<SyncPacket> {
        let held: Vec<SyncPacket> = std::mem::take(&mut self.pending).into_values().collect();
        if let Some(last) = held.last() {
            self.last = Some(last.order_key());
            self.last_closed = last.is_turn_end;
        }
        self.resync = true;
        held
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.last = None;
        self.last_closed = false;
        self.cancelled.clear();
        self.resync = false;
    }

    fn drain_ready(&mut self) -> Vec<SyncPacket> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            let (turn, sequence) = *entry.key();
            let deliverable = match self.last {
                _ if self.resync => true,
                None => sequence == 0,
                Some((last_turn, last_sequence)) if turn == last_turn => {
                    sequence == last_sequence + 1
                }
                Some((last_turn, _)) => {
                    turn > last_turn && sequence == 0 && self.last_closed
                }
            };
            if !deliverable {
                break;
            }

            let packet = entry.remove();
            self.resync = false;
            self.last = Some((turn, sequence));
            self.last_closed = packet.is_turn_end;
            ready.push(packet);
        }

        if let Some((last_turn, _)) = self.last {
            self.cancelled = self.cancelled.split_off(&last_turn);
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packets::types::PacketKind;

    fn packet(turn_id: u64, sequence: u32, is_turn_end: bool) -> SyncPacket {
        SyncPacket {
            kind: PacketKind::TextAudio,
            turn_id,
            sequence,
            text: format!("{}-{}", turn_id, sequence),
            audio: None,
            function_call: None,
            is_turn_end,
        }
    }

    fn keys(packets: &[SyncPacket]) -> Vec<(u64, u32)> {
        packets.iter().map(SyncPacket::order_key).collect()
    }

    #[test]
    fn test_in_order_packets_pass_through() {
        let mut order = ReleaseOrder::new();
        assert_eq!(keys(&order.push(packet(1, 0, false))), vec![(1, 0)]);
        assert_eq!(keys(&order.push(packet(1, 1, true))), vec![(1, 1)]);
        assert_eq!(keys(&order.push(packet(2, 0, true))), vec![(2, 0)]);
    }

    #[test]
    fn test_out_of_order_packets_are_held() {
        let mut order = ReleaseOrder::new();
        assert!(order.push(packet(1, 1, false)).is_empty());
        assert!(order.push(packet(1, 2, true)).is_empty());
        assert_eq!(order.pending_len(), 2);

        let ready = order.push(packet(1, 0, false));
        assert_eq!(keys(&ready), vec![(1, 0), (1, 1), (1, 2)]);
        assert_eq!(order.pending_len(), 0);
    }

    #[test]
    fn test_next_turn_waits_for_turn_end() {
        let mut order = ReleaseOrder::new();
        order.push(packet(1, 0, false));
        assert!(order.push(packet(2, 0, false)).is_empty());

        let ready = order.push(packet(1, 1, true));
        assert_eq!(keys(&ready), vec![(1, 1), (2, 0)]);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut order = ReleaseOrder::new();
        order.push(packet(1, 0, false));
        assert!(order.push(packet(1, 0, false)).is_empty());
        assert_eq!(order.pending_len(), 0);
    }

    #[test]
    fn test_cancelled_turn_is_dropped_and_unblocks_next() {
        let mut order = ReleaseOrder::new();
        order.push(packet(1, 0, false));
        assert!(order.push(packet(1, 2, false)).is_empty());

        order.cancel_turn(1);
        assert_eq!(order.pending_len(), 0);
        assert!(order.push(packet(1, 1, false)).is_empty());

        assert_eq!(keys(&order.push(packet(2, 0, false))), vec![(2, 0)]);
    }

    #[test]
    fn test_cancel_before_any_delivery() {
        let mut order = ReleaseOrder::new();
        order.push(packet(1, 0, true));
        order.cancel_turn(2);
        assert!(order.push(packet(2, 0, false)).is_empty());
        assert_eq!(keys(&order.push(packet(3, 0, false))), vec![(3, 0)]);
    }

    #[test]
    fn test_reset_accepts_restarted_ids() {
        let mut order = ReleaseOrder::new();
        order.push(packet(4, 0, true));
        order.reset();
        assert_eq!(keys(&order.push(packet(1, 0, false))), vec![(1, 0)]);
    }

    #[test]
    fn test_resync_flushes_held_and_accepts_gap() {
        let mut order = ReleaseOrder::new();
        order.push(packet(1, 0, false));
        assert!(order.push(packet(1, 3, false)).is_empty());

        assert_eq!(keys(&order.resync()), vec![(1, 3)]);
        // (1, 4) lost with the old gate
        assert_eq!(keys(&order.push(packet(1, 5, true))), vec![(1, 5)]);
        assert!(order.push(packet(1, 4, false)).is_empty());
        assert_eq!(keys(&order.push(packet(2, 0, false))), vec![(2, 0)]);
    }

    #[test]
    fn test_release_reports_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let release = PacketRelease::new(tx);
        release.release(packet(1, 0, false)).unwrap();

        match release.release(packet(1, 1, false)) {
            Err(ReleaseError::QueueFull(returned)) => assert_eq!(returned.sequence, 1),
            other => panic!("Expected QueueFull, got {:?}", other),
        }

        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        drop(rx);
        assert!(matches!(
            release.release(packet(1, 1, false)),
            Err(ReleaseError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_fixed_delay_gate_releases_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut gate = FixedDelayGate::new(Duration::from_millis(20));
        gate.on_registered(PacketRelease::new(tx));
        assert_eq!(gate.estimated_latency(), Duration::from_millis(20));

        gate.submit(packet(1, 0, false));
        assert!(rx.try_recv().is_err());

        let released = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.order_key(), (1, 0));
    }

    #[tokio::test]
    async fn test_fixed_delay_gate_drops_cancelled_turn() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut gate = FixedDelayGate::new(Duration::from_millis(50));
        gate.on_registered(PacketRelease::new(tx));

        gate.submit(packet(1, 0, false));
        gate.submit(packet(2, 0, false));
        gate.on_turn_cancelled(1);

        let released = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.turn_id, 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }
}
