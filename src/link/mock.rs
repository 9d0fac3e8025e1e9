//! Mock controller link.
//!
//! Simulated controller memory for tests and the `--simulate` mode.
//! All waits use `tokio::time::sleep`, so paused-clock tests stay deterministic.
//!
//! `MockPlc` is a cheap `Clone` handle: the clone handed to the
//! [`crate::guardian::LinkGuardian`] and the clone kept by a test share the
//! same memory, so the test can raise trigger bits and inject faults while the
//! orchestrator runs.
//!
//! # Fault injection
//!
//! - [`MockPlc::refuse_connect`] - subsequent connect attempts fail
//! - [`MockPlc::drop_connection`] - simulate link loss
//! - [`MockPlc::fail_next_reads_at`] - transient read failures at one address
//!
//! The mock also detects overlapping operations: if two link calls are ever in
//! flight at once, [`MockPlc::overlap_violations`] becomes non-zero.

use super::{codec, AddressableLink, LinkError};
use crate::address::BitAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default size of a simulated data block.
pub const DEFAULT_REGION_SIZE: usize = 1024;

/// Number of most recent bit writes kept for inspection.
pub const BIT_WRITE_HISTORY: usize = 4096;

/// A bit write observed by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitWrite {
    /// Data block number.
    pub region: u16,
    /// Bit address inside the block.
    pub address: BitAddress,
    /// Value written.
    pub value: bool,
}

#[derive(Debug, Default)]
struct PlcState {
    regions: HashMap<u16, Vec<u8>>,
    connected: bool,
    refuse_connect: bool,
    read_faults: HashMap<(u16, u32), u32>,
    bit_writes: VecDeque<BitWrite>,
    reads: usize,
    reads_by_offset: HashMap<(u16, u32), usize>,
    connect_attempts: u32,
}

/// In-memory controller implementing [`AddressableLink`].
#[derive(Clone, Debug)]
pub struct MockPlc {
    state: Arc<Mutex<PlcState>>,
    latency: Duration,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicU64>,
}

impl Default for MockPlc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlc {
    /// Create a disconnected mock with no regions.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlcState::default())),
            latency: Duration::ZERO,
            in_flight: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a mock with one zeroed region of [`DEFAULT_REGION_SIZE`] bytes.
    pub fn with_region(region: u16) -> Self {
        let plc = Self::new();
        plc.add_region(region, DEFAULT_REGION_SIZE);
        plc
    }

    /// Simulate per-operation communication latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add (or replace) a zeroed region.
    pub fn add_region(&self, region: u16, size: usize) {
        self.state.lock().regions.insert(region, vec![0; size]);
    }

    // =========================================================================
    // Memory helpers (test/simulator side, bypass connection state)
    // =========================================================================

    /// Set or clear a bit directly in memory.
    pub fn set_bit(&self, region: u16, address: BitAddress, value: bool) {
        let mut state = self.state.lock();
        if let Some(byte) = state
            .regions
            .get_mut(&region)
            .and_then(|mem| mem.get_mut(address.byte as usize))
        {
            *byte = codec::set_bool(*byte, address.bit, value);
        }
    }

    /// Read a bit directly from memory.
    pub fn bit(&self, region: u16, address: BitAddress) -> bool {
        let state = self.state.lock();
        state
            .regions
            .get(&region)
            .and_then(|mem| mem.get(address.byte as usize))
            .is_some_and(|byte| codec::get_bool(*byte, address.bit))
    }

    /// Store raw bytes directly in memory. Out-of-range writes are ignored.
    pub fn write_bytes(&self, region: u16, offset: u32, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(mem) = state.regions.get_mut(&region) {
            let start = offset as usize;
            if let Some(dst) = mem.get_mut(start..start + data.len()) {
                dst.copy_from_slice(data);
            }
        }
    }

    /// Store a big-endian 16-bit integer.
    pub fn set_word16(&self, region: u16, offset: u32, value: i16) {
        self.write_bytes(region, offset, &value.to_be_bytes());
    }

    /// Store a NUL-padded text field of exactly `len` bytes.
    pub fn set_text(&self, region: u16, offset: u32, len: u32, text: &str) {
        let mut raw = text.as_bytes().to_vec();
        raw.resize(len as usize, 0);
        self.write_bytes(region, offset, &raw);
    }

    /// Store four big-endian floats.
    pub fn set_floats4(&self, region: u16, offset: u32, values: [f32; 4]) {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.write_bytes(region, offset, &raw);
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make subsequent connect attempts fail (or succeed again).
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Simulate link loss. Operations fail until the next successful connect.
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    /// Fail the next `count` reads that start at `(region, offset)`.
    pub fn fail_next_reads_at(&self, region: u16, offset: u32, count: u32) {
        self.state.lock().read_faults.insert((region, offset), count);
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// The last [`BIT_WRITE_HISTORY`] bit writes issued through the link, in order.
    pub fn bit_writes(&self) -> Vec<BitWrite> {
        self.state.lock().bit_writes.iter().copied().collect()
    }

    /// Bit writes issued to one address, in order.
    pub fn bit_writes_at(&self, region: u16, address: BitAddress) -> Vec<bool> {
        self.state
            .lock()
            .bit_writes
            .iter()
            .filter(|w| w.region == region && w.address == address)
            .map(|w| w.value)
            .collect()
    }

    /// Number of reads that reached the link (successful or not).
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Number of reads that started at `(region, offset)`.
    pub fn reads_at(&self, region: u16, offset: u32) -> usize {
        self.state
            .lock()
            .reads_by_offset
            .get(&(region, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Number of connect attempts seen.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Number of times two operations were in flight at the same time.
    pub fn overlap_violations(&self) -> u64 {
        self.overlaps.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> OpGuard<'_> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let guard = OpGuard(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }
}

struct OpGuard<'a>(&'a AtomicBool);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AddressableLink for MockPlc {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let _op = self.enter().await;
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connect {
            return Err(LinkError::ConnectFailed("connection refused (mock)".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_bytes(
        &mut self,
        region: u16,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, LinkError> {
        let _op = self.enter().await;
        let mut state = self.state.lock();
        state.reads += 1;
        *state.reads_by_offset.entry((region, offset)).or_default() += 1;
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if let Some(remaining) = state.read_faults.get_mut(&(region, offset)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinkError::Protocol("injected read fault (mock)".into()));
            }
        }
        let start = offset as usize;
        state
            .regions
            .get(&region)
            .and_then(|mem| mem.get(start..start + len as usize))
            .map(<[u8]>::to_vec)
            .ok_or(LinkError::OutOfRange {
                region,
                offset,
                len,
            })
    }

    async fn write_bit(
        &mut self,
        region: u16,
        offset: u32,
        bit: u8,
        value: bool,
    ) -> Result<(), LinkError> {
        let _op = self.enter().await;
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        let byte = state
            .regions
            .get_mut(&region)
            .and_then(|mem| mem.get_mut(offset as usize))
            .ok_or(LinkError::OutOfRange {
                region,
                offset,
                len: 1,
            })?;
        *byte = codec::set_bool(*byte, bit, value);
        if state.bit_writes.len() == BIT_WRITE_HISTORY {
            state.bit_writes.pop_front();
        }
        state.bit_writes.push_back(BitWrite {
            region,
            address: BitAddress::new(offset, bit),
            value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_connection() {
        let mut plc = MockPlc::with_region(1);
        assert!(matches!(
            plc.read_bytes(1, 0, 1).await,
            Err(LinkError::NotConnected)
        ));
        plc.connect().await.unwrap();
        assert!(plc.read_bytes(1, 0, 1).await.is_ok());
        plc.drop_connection();
        assert!(!plc.is_connected());
        assert!(plc.write_bit(1, 0, 0, true).await.is_err());
    }

    #[tokio::test]
    async fn typed_reads_decode_memory() {
        let mut plc = MockPlc::with_region(7);
        plc.set_word16(7, 10, 42);
        plc.set_text(7, 12, 16, "BOX-001");
        plc.set_floats4(7, 40, [1.0, 2.0, 3.0, 4.0]);
        plc.set_bit(7, BitAddress::new(0, 3), true);
        plc.connect().await.unwrap();

        assert_eq!(plc.read_word16(7, 10).await.unwrap(), 42);
        assert_eq!(plc.read_text(7, 12, 16).await.unwrap(), "BOX-001");
        assert_eq!(plc.read_floats4(7, 40).await.unwrap(), [1.0, 2.0, 3.0, 4.0]);
        assert!(plc.read_bit(7, 0, 3).await.unwrap());
        let bitmap = plc.read_bitmap(7, 0, 1).await.unwrap();
        assert_eq!(bitmap.iter().filter(|b| **b).count(), 1);
        assert!(bitmap[3]);
    }

    #[tokio::test]
    async fn injected_faults_are_transient() {
        let mut plc = MockPlc::with_region(1);
        plc.connect().await.unwrap();
        plc.fail_next_reads_at(1, 0, 2);
        assert!(plc.read_bytes(1, 0, 4).await.is_err());
        assert!(plc.read_bytes(1, 0, 4).await.is_err());
        assert!(plc.read_bytes(1, 0, 4).await.is_ok());
        assert_eq!(plc.reads_at(1, 0), 3);
    }

    #[tokio::test]
    async fn refused_connect_is_reported() {
        let mut plc = MockPlc::with_region(1);
        plc.refuse_connect(true);
        assert!(matches!(
            plc.connect().await,
            Err(LinkError::ConnectFailed(_))
        ));
        plc.refuse_connect(false);
        assert!(plc.connect().await.is_ok());
        assert_eq!(plc.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn bit_writes_are_logged_and_applied() {
        let mut plc = MockPlc::with_region(1);
        plc.set_bit(1, BitAddress::new(2, 1), true);
        plc.connect().await.unwrap();
        plc.write_bit(1, 2, 1, false).await.unwrap();
        plc.write_bit(1, 2, 1, false).await.unwrap();
        assert!(!plc.bit(1, BitAddress::new(2, 1)));
        assert_eq!(plc.bit_writes_at(1, BitAddress::new(2, 1)), vec![false, false]);
    }

    #[tokio::test]
    async fn long_runs_keep_bounded_history() {
        let mut plc = MockPlc::with_region(1);
        plc.connect().await.unwrap();
        for i in 0..BIT_WRITE_HISTORY + 10 {
            plc.write_bit(1, 0, 0, i % 2 == 0).await.unwrap();
            plc.read_bytes(1, (i % 4) as u32, 1).await.unwrap();
        }

        let writes = plc.bit_writes();
        assert_eq!(writes.len(), BIT_WRITE_HISTORY);
        // Oldest entries were dropped: the first kept write is number 10.
        assert!(writes[0].value);
        assert!(!writes[BIT_WRITE_HISTORY - 1].value);
        assert_eq!(plc.read_count(), BIT_WRITE_HISTORY + 10);
        assert_eq!(
            (0..4).map(|o| plc.reads_at(1, o)).sum::<usize>(),
            BIT_WRITE_HISTORY + 10
        );
        assert_eq!(plc.state.lock().reads_by_offset.len(), 4);
    }

    #[tokio::test]
    async fn out_of_range_reads_fail() {
        let mut plc = MockPlc::new();
        plc.add_region(1, 8);
        plc.connect().await.unwrap();
        assert!(matches!(
            plc.read_bytes(1, 4, 16).await,
            Err(LinkError::OutOfRange { .. })
        ));
        assert!(matches!(
            plc.read_bytes(2, 0, 1).await,
            Err(LinkError::OutOfRange { .. })
        ));
    }
}
