//! PLC transport capability.
//!
//! The fieldbus client is an external collaborator. The engine only needs a
//! connect/disconnect lifecycle and a single-byte read from a data block, expressed by
//! the [`ByteSource`] trait. Reads take `&mut self`: one handle serves one acquisition
//! stream, and two reads against the same handle can never be in flight at once.
//!
//! [`mock`] provides in-process implementations for tests and for running the CLI
//! without hardware.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;

pub use mock::{ScriptedPlc, ScriptedRead, SimulatedPlc};

/// Byte-read failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Address that was dialled.
        endpoint: String,
        /// Failure reported by the transport.
        reason: String,
    },

    /// A read was rejected or failed on the wire.
    #[error("read of DB{db_number}.{offset} failed: {reason}")]
    Read {
        /// Data block number.
        db_number: u16,
        /// Byte offset inside the block.
        offset: u16,
        /// Failure reported by the transport.
        reason: String,
    },

    /// A read did not complete within its deadline.
    #[error("read timed out after {0} ms")]
    Timeout(u64),

    /// Operation attempted without an open connection.
    #[error("transport is not connected")]
    NotConnected,
}

/// Where the monitored byte lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlcAddress {
    /// Controller host or IP.
    pub host: String,
    /// Rack number.
    pub rack: u16,
    /// Slot number.
    pub slot: u16,
    /// Data block number.
    pub db_number: u16,
}

impl std::fmt::Display for PlcAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (rack={}, slot={}, DB{})",
            self.host, self.rack, self.slot, self.db_number
        )
    }
}

/// Capability: single-byte reads from PLC memory.
#[async_trait]
pub trait ByteSource: Send {
    /// Open the connection.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read one byte at `offset` of data block `db_number`.
    async fn read_byte(&mut self, db_number: u16, offset: u16) -> Result<u8, TransportError>;

    /// Close the connection. Closing an already closed handle is not an error.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
