//! Address model shared by the poller, the lifecycle manager and sampling tasks.
//!
//! Every controller address used by the orchestrator is derived here from the
//! process-wide [`AddressLayout`]. Slot addresses are pure functions of the slot
//! index, so there is no per-slot mutable configuration anywhere in the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of one slot's measurement block (four `REAL` values).
pub const SAMPLE_BLOCK_BYTES: u32 = 16;

/// Bytes addressable in one data block (S7 `ANY` pointers carry 24-bit bit addresses).
pub const ADDRESSABLE_BYTES: u32 = 1 << 21;

/// One physical unit position, numbered `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(u16);

impl Slot {
    /// Create a slot from its 1-based number. Returns `None` for 0.
    pub fn new(number: u16) -> Option<Self> {
        (number > 0).then_some(Self(number))
    }

    /// 1-based slot number as stored in records.
    pub fn number(self) -> u16 {
        self.0
    }

    /// 0-based index used for address derivation and bitmap lookups.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single bit in the controller's memory: `(byte offset, bit 0..=7)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitAddress {
    /// Byte offset inside the region.
    pub byte: u32,
    /// Bit index inside the byte (0 = least significant).
    pub bit: u8,
}

impl BitAddress {
    /// Create a bit address.
    pub fn new(byte: u32, bit: u8) -> Self {
        Self { byte, bit }
    }
}

/// Where everything lives in the controller's data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressLayout {
    /// Data block number holding all fields.
    pub region: u16,
    /// One-shot identification trigger bit.
    pub identification_trigger: BitAddress,
    /// Byte offset of the 16-bit identifier code.
    pub identifier_offset: u32,
    /// Byte offset of the fixed-length text label.
    pub label_offset: u32,
    /// Length of the text label in bytes.
    pub label_length: u32,
    /// Byte offset of the sampling-trigger bitmap.
    pub sampling_bitmap_offset: u32,
    /// Length of the sampling-trigger bitmap in bytes.
    pub sampling_bitmap_length: u32,
    /// Byte offset of slot 1's measurement block.
    pub data_base: u32,
    /// Distance in bytes between consecutive slots' measurement blocks.
    pub data_stride: u32,
    /// Number of addressable slots (N).
    pub slot_count: u16,
}

impl Default for AddressLayout {
    /// Layout used on the line: bitmap at DB offset 0 (4 bytes), measurement
    /// blocks right behind it, identification fields after the last block.
    fn default() -> Self {
        Self {
            region: 1,
            identification_trigger: BitAddress::new(520, 0),
            identifier_offset: 522,
            label_offset: 524,
            label_length: 16,
            sampling_bitmap_offset: 0,
            sampling_bitmap_length: 4,
            data_base: 4,
            data_stride: SAMPLE_BLOCK_BYTES,
            slot_count: 32,
        }
    }
}

impl AddressLayout {
    /// All configured slots in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> {
        (1..=self.slot_count).map(Slot)
    }

    /// Slot named by a controller-supplied number, if it is configured.
    pub fn slot_from_number(&self, number: i64) -> Option<Slot> {
        let number = u16::try_from(number).ok()?;
        self.contains(number).then_some(Slot(number))
    }

    fn contains(&self, number: u16) -> bool {
        (1..=self.slot_count).contains(&number)
    }

    /// Byte offset of the slot's four-float measurement block.
    ///
    /// Cannot overflow for a layout whose [`AddressLayout::occupied_ranges`] succeeded.
    pub fn data_offset(&self, slot: Slot) -> u32 {
        self.data_base + slot.index() as u32 * self.data_stride
    }

    /// The slot's bit inside the sampling-trigger bitmap.
    pub fn sampling_trigger(&self, slot: Slot) -> BitAddress {
        let index = slot.index() as u32;
        BitAddress::new(self.sampling_bitmap_offset + index / 8, (index % 8) as u8)
    }

    /// Byte ranges `(name, start, end)` occupied by each field, used to reject
    /// overlapping layouts at startup.
    ///
    /// Fails if a field does not fit into the data block's address space.
    pub fn occupied_ranges(&self) -> Result<Vec<(&'static str, u32, u32)>, String> {
        let span = |name: &'static str, start: u32, len: Option<u32>| {
            len.and_then(|len| start.checked_add(len))
                .filter(|end| *end <= ADDRESSABLE_BYTES)
                .map(|end| (name, start, end))
                .ok_or_else(|| {
                    format!(
                        "layout field '{name}' at byte {start} extends past the {ADDRESSABLE_BYTES}-byte address space"
                    )
                })
        };
        Ok(vec![
            span("identification_trigger", self.identification_trigger.byte, Some(1))?,
            span("identifier", self.identifier_offset, Some(2))?,
            span("label", self.label_offset, Some(self.label_length))?,
            span(
                "sampling_bitmap",
                self.sampling_bitmap_offset,
                Some(self.sampling_bitmap_length),
            )?,
            span(
                "data",
                self.data_base,
                u32::from(self.slot_count).checked_mul(self.data_stride),
            )?,
        ])
    }

    /// Number of bits the sampling-trigger bitmap can hold.
    pub fn bitmap_capacity(&self) -> u32 {
        self.sampling_bitmap_length.saturating_mul(8)
    }
}

/// Per-slot sampling-trigger bits as read during one poll cycle.
///
/// Always exactly `slot_count` bits long. Never cached across cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerState {
    bits: Vec<bool>,
}

impl TriggerState {
    /// Build from a raw bitmap, truncating or padding to `slot_count` bits.
    pub fn from_bitmap(mut bits: Vec<bool>, slot_count: u16) -> Self {
        bits.resize(usize::from(slot_count), false);
        Self { bits }
    }

    /// Whether the slot's sampling trigger is set. Unknown slots read as clear.
    pub fn is_set(&self, slot: Slot) -> bool {
        self.bits.get(slot.index()).copied().unwrap_or(false)
    }

    /// Iterate `(slot, bit)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, bool)> + '_ {
        self.bits
            .iter()
            .enumerate()
            .map(|(i, bit)| (Slot(i as u16 + 1), *bit))
    }
}
