//! Addressable controller link.
//!
//! [`AddressableLink`] is the capability set the orchestrator consumes: byte-level
//! reads of a data block, single-bit writes, and connection management. Typed reads
//! (bit, 16-bit integer, text, bitmap, four floats) are provided on top of
//! [`AddressableLink::read_bytes`] using [`codec`].
//!
//! Implementations are not required to be safe for concurrent use: every access
//! goes through [`crate::guardian::LinkGuardian`], which holds the only instance.
//!
//! # Available Links
//!
//! - [`s7::S7Link`] - ISO-on-TCP client for S7-family controllers
//! - [`mock::MockPlc`] - in-memory controller with fault injection for tests and simulation

pub mod codec;
pub mod mock;
pub mod s7;

pub use mock::MockPlc;
pub use s7::{S7Link, S7LinkConfig};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a controller link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// An operation was attempted while disconnected.
    #[error("link not connected")]
    NotConnected,

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Transport-level failure on an established connection.
    #[error("I/O error: {0}")]
    Io(String),

    /// The controller answered with something we could not interpret, or refused the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested address is outside the controller's memory.
    #[error("address out of range: DB{region}.DBB{offset} (+{len})")]
    OutOfRange {
        /// Data block number.
        region: u16,
        /// Byte offset.
        offset: u32,
        /// Number of bytes requested.
        len: u32,
    },

    /// The controller did not answer in time.
    #[error("operation timed out")]
    Timeout,
}

impl LinkError {
    /// Whether the link must be considered disconnected after this error.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            LinkError::NotConnected | LinkError::Io(_) | LinkError::Timeout
        )
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

/// Capability: Addressable controller memory
///
/// Devices that expose numbered memory regions addressed by `(region, byte offset)`.
///
/// # Contract
/// - `connect` is a single attempt; retry cadence belongs to the caller
/// - reads and writes on a disconnected link fail with [`LinkError::NotConnected`]
/// - `write_bit` touches exactly one bit and is idempotent
#[async_trait]
pub trait AddressableLink: Send {
    /// Attempt to establish the connection.
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// Tear the connection down. Safe to call when already disconnected.
    async fn disconnect(&mut self);

    /// Current connection state.
    fn is_connected(&self) -> bool;

    /// Read `len` raw bytes from `region` starting at `offset`.
    async fn read_bytes(&mut self, region: u16, offset: u32, len: u32)
        -> Result<Vec<u8>, LinkError>;

    /// Write a single bit.
    async fn write_bit(
        &mut self,
        region: u16,
        offset: u32,
        bit: u8,
        value: bool,
    ) -> Result<(), LinkError>;

    /// Read a single bit.
    async fn read_bit(&mut self, region: u16, offset: u32, bit: u8) -> Result<bool, LinkError> {
        let data = self.read_bytes(region, offset, 1).await?;
        let byte = data
            .first()
            .copied()
            .ok_or_else(|| LinkError::Protocol("empty bit read".into()))?;
        Ok(codec::get_bool(byte, bit))
    }

    /// Read a signed 16-bit integer.
    async fn read_word16(&mut self, region: u16, offset: u32) -> Result<i16, LinkError> {
        let data = self.read_bytes(region, offset, 2).await?;
        codec::get_int(&data)
    }

    /// Read a fixed-length, NUL-padded text field.
    async fn read_text(&mut self, region: u16, offset: u32, len: u32) -> Result<String, LinkError> {
        let data = self.read_bytes(region, offset, len).await?;
        Ok(codec::get_text(&data))
    }

    /// Read `byte_len` bytes as an ordered bit sequence.
    async fn read_bitmap(
        &mut self,
        region: u16,
        offset: u32,
        byte_len: u32,
    ) -> Result<Vec<bool>, LinkError> {
        let data = self.read_bytes(region, offset, byte_len).await?;
        Ok(codec::unpack_bits(&data))
    }

    /// Read four consecutive floats.
    async fn read_floats4(&mut self, region: u16, offset: u32) -> Result<[f32; 4], LinkError> {
        let data = self.read_bytes(region, offset, 16).await?;
        codec::get_reals4(&data)
    }
}
