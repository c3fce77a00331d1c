//! In-process PLC stand-ins.
//!
//! - [`ScriptedPlc`] replays a fixed list of reads (bytes or failures). Used by tests.
//! - [`SimulatedPlc`] cycles through a byte sequence on a wall-clock schedule. Used by
//!   the CLI when no fieldbus client is wired in.
//!
//! Both use async-safe waits (`tokio::time::sleep`), never `std::thread::sleep`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{ByteSource, TransportError};

/// Simulated network round trip of one read.
const READ_LATENCY: Duration = Duration::from_millis(1);

// =============================================================================
// ScriptedPlc - Deterministic Read Script
// =============================================================================

/// One scripted read outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Return this byte.
    Byte(u8),
    /// Fail the read.
    Fail,
    /// Never answer (exercises read timeouts).
    Hang,
}

/// Replays scripted reads in order, then repeats the last successfully read byte.
pub struct ScriptedPlc {
    script: VecDeque<ScriptedRead>,
    last_byte: Option<u8>,
    connected: bool,
    fail_connect: bool,
    reads: Arc<AtomicUsize>,
}

impl ScriptedPlc {
    /// Script of reads.
    pub fn new(script: impl IntoIterator<Item = ScriptedRead>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last_byte: None,
            connected: false,
            fail_connect: false,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Script consisting only of successful reads.
    pub fn from_bytes(bytes: impl IntoIterator<Item = u8>) -> Self {
        Self::new(bytes.into_iter().map(ScriptedRead::Byte))
    }

    /// Make `connect` fail.
    pub fn refusing_connections(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Shared counter of reads performed.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    /// Whether all scripted entries have been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.script.is_empty()
    }
}

#[async_trait]
impl ByteSource for ScriptedPlc {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.fail_connect {
            return Err(TransportError::Connect {
                endpoint: "scripted".into(),
                reason: "connection refused".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn read_byte(&mut self, db_number: u16, offset: u16) -> Result<u8, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        match self.script.pop_front() {
            Some(ScriptedRead::Byte(byte)) => {
                self.last_byte = Some(byte);
                Ok(byte)
            }
            Some(ScriptedRead::Fail) => Err(TransportError::Read {
                db_number,
                offset,
                reason: "scripted failure".into(),
            }),
            Some(ScriptedRead::Hang) => {
                std::future::pending::<()>().await;
                Err(TransportError::Timeout(0))
            }
            None => self.last_byte.ok_or(TransportError::Read {
                db_number,
                offset,
                reason: "script exhausted before any byte".into(),
            }),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }
}

// =============================================================================
// SimulatedPlc - Time-Driven Byte Sequence
// =============================================================================

/// Cycles through `(byte, dwell)` pairs in real time, with a small read latency.
pub struct SimulatedPlc {
    sequence: Vec<(u8, Duration)>,
    started: Option<Instant>,
}

impl SimulatedPlc {
    /// Simulator for an explicit sequence.
    pub fn new(sequence: Vec<(u8, Duration)>) -> Self {
        Self {
            sequence,
            started: None,
        }
    }

    /// Walk every value of a `width`-bit frame in Gray-code order, holding each for
    /// `dwell`, so consecutive states differ by a single bit like a real actuator cycle.
    pub fn gray_counter(width: u8, dwell: Duration) -> Self {
        let width = width.clamp(1, 8);
        let states = 1u16 << width;
        let sequence = (0..states)
            .map(|n| (((n ^ (n >> 1)) & 0xFF) as u8, dwell))
            .collect();
        Self::new(sequence)
    }

    fn byte_at(&self, elapsed: Duration) -> u8 {
        let cycle: Duration = self.sequence.iter().map(|(_, dwell)| *dwell).sum();
        if cycle.is_zero() {
            return self.sequence.first().map_or(0, |(byte, _)| *byte);
        }
        let mut offset = Duration::from_nanos((elapsed.as_nanos() % cycle.as_nanos()) as u64);
        for (byte, dwell) in &self.sequence {
            if offset < *dwell {
                return *byte;
            }
            offset -= *dwell;
        }
        self.sequence.last().map_or(0, |(byte, _)| *byte)
    }
}

#[async_trait]
impl ByteSource for SimulatedPlc {
    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(states = self.sequence.len(), "SimulatedPlc: connected");
        self.started = Some(Instant::now());
        Ok(())
    }

    async fn read_byte(&mut self, _db_number: u16, _offset: u16) -> Result<u8, TransportError> {
        let started = self.started.ok_or(TransportError::NotConnected)?;
        sleep(READ_LATENCY).await;
        Ok(self.byte_at(started.elapsed()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.started = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_reads_replay_in_order() {
        let mut plc = ScriptedPlc::new([ScriptedRead::Byte(1), ScriptedRead::Fail, ScriptedRead::Byte(3)]);
        assert_eq!(plc.read_byte(1, 0).await, Err(TransportError::NotConnected));

        plc.connect().await.unwrap();
        assert_eq!(plc.read_byte(1, 0).await, Ok(1));
        assert!(matches!(plc.read_byte(1, 0).await, Err(TransportError::Read { .. })));
        assert_eq!(plc.read_byte(1, 0).await, Ok(3));
        assert!(plc.is_exhausted());
        assert_eq!(plc.read_byte(1, 0).await, Ok(3));
        assert_eq!(plc.read_counter().load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn refused_connection() {
        let mut plc = ScriptedPlc::from_bytes([0]).refusing_connections();
        assert!(matches!(plc.connect().await, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn gray_counter_changes_one_bit_at_a_time() {
        let plc = SimulatedPlc::gray_counter(3, Duration::from_millis(10));
        let bytes: Vec<u8> = plc.sequence.iter().map(|(b, _)| *b).collect();
        assert_eq!(bytes.len(), 8);
        for pair in bytes.windows(2) {
            assert_eq!((pair[0] ^ pair[1]).count_ones(), 1);
        }
    }

    #[test]
    fn simulated_schedule_wraps() {
        let plc = SimulatedPlc::new(vec![(1, Duration::from_millis(10)), (2, Duration::from_millis(20))]);
        assert_eq!(plc.byte_at(Duration::from_millis(5)), 1);
        assert_eq!(plc.byte_at(Duration::from_millis(15)), 2);
        assert_eq!(plc.byte_at(Duration::from_millis(35)), 1);
    }
}
