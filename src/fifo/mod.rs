//! On-wire record model for TX messages
//!
//! This module defines the data layout shared by the TX engine and the bus
//! layer. Key components include:
//!
//! - Layout constants: FIFO size, descriptor limits, alignment units
//! - `MsgHdr`, an offset-based little-endian view of a message header
//!   living inside the ring
//! - `PldDesc`, the packed 4-byte payload descriptor
//! - `PayloadType`, including the two reset types that must ship alone
//! - `TxError`, the error surface of the engine
//!
//! A TX message on the wire is MSG-HDR, PLD1..PLDN, PL1..PLN, PADDING. The
//! header plus descriptors must be a multiple of 16 bytes, each payload is
//! padded up to 16 bytes, and the whole message is padded to the bus block
//! size. Headers are modeled as raw bytes with explicit field offsets
//! rather than typed overlays: during a message's build phase two copies of
//! the header can be live in the ring at once (the FIFO-walk copy and the
//! relocated transmit copy), and only byte-level views keep that sound.

pub mod engine;
mod ring;

use std::ptr;

use thiserror::Error;

/// TX FIFO size.
///
/// The device caps one transaction at 16 KiB; one transaction en route
/// plus one being queued needs 32 KiB.
pub const TX_BUF_SIZE: usize = 32768;

/// Maximum number of payload descriptors in one TX message.
///
/// Header and descriptors have to be 16-aligned (16 + 4 * N = 16 * M), and
/// at MTU-sized payloads a transaction holds 10-11 of them, so space is
/// reserved for 12.
pub const PLD_MAX: usize = 12;

/// Payloads and header blocks are padded to multiples of this.
pub const PL_PAD: usize = 16;

/// Fixed message header size, payload descriptors excluded.
pub const HDR_SIZE: usize = 16;

/// Size of one packed payload descriptor.
pub const PLD_DESC_SIZE: usize = 4;

/// The header block reserved when a message is opened: a header plus room
/// for [`PLD_MAX`] descriptors. Unused descriptor slots are trimmed away
/// at close time by relocating the header.
pub const HDR_BLOCK: usize = HDR_SIZE + PLD_MAX * PLD_DESC_SIZE;

/// High bit of a record's `size` word, marking a sentinel run the consumer
/// must skip instead of transmit.
pub const SKIP_FLAG: u32 = 0x8000_0000;

/// Framing barker stamped into the transmit header at take time; tells the
/// device what it is looking at.
pub const H2D_PREVIEW_BARKER: u32 = 0xCAFE_900D;

/// Fill byte for payload and message padding. A recognizable pattern, so
/// stray padding stands out in device-side dumps.
pub const PAD_BYTE: u8 = 0xAD;

/// Descriptor bits holding the payload length.
pub const PLD_LEN_MASK: u32 = 0x0000_3FFF;

/// Shift of the payload type within a descriptor.
pub const PLD_TYPE_SHIFT: u32 = 16;

/// Descriptor bits holding the payload type.
pub const PLD_TYPE_MASK: u32 = 0x000F_0000;

/// Errors surfaced by the TX engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// The FIFO cannot take the payload, even after recycling the tail.
    /// The caller should halt its queue and retry after space is released.
    #[error("TX FIFO out of space")]
    NoSpace,
    /// The ring storage could not be allocated at setup.
    #[error("cannot allocate TX FIFO storage")]
    OutOfMemory,
}

/// Type of a payload handed to [`engine::TxFifo::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Network data frame.
    Data = 0,
    /// Control/management frame.
    Ctrl = 1,
    /// Device trace frame.
    Trace = 2,
    /// Warm reset command. Always ships alone in its own message.
    ResetWarm = 3,
    /// Cold reset command. Always ships alone in its own message.
    ResetCold = 4,
}

impl PayloadType {
    /// Reset payloads must be the sole occupant of their TX message.
    pub fn is_reset(self) -> bool {
        matches!(self, PayloadType::ResetWarm | PayloadType::ResetCold)
    }

    /// Decode the type bits of a descriptor.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(PayloadType::Data),
            1 => Some(PayloadType::Ctrl),
            2 => Some(PayloadType::Trace),
            3 => Some(PayloadType::ResetWarm),
            4 => Some(PayloadType::ResetCold),
            _ => None,
        }
    }
}

/// A packed payload descriptor: length in the low bits, type above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PldDesc(u32);

impl PldDesc {
    /// Pack a descriptor. Lengths above [`PLD_LEN_MASK`] cannot be
    /// represented and are a caller contract violation.
    pub fn new(len: usize, pl_type: PayloadType) -> Self {
        debug_assert!(len as u32 <= PLD_LEN_MASK, "payload too long for descriptor");
        Self((len as u32 & PLD_LEN_MASK) | ((pl_type as u32) << PLD_TYPE_SHIFT))
    }

    /// View a raw little-endian descriptor word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw descriptor word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Payload length in bytes, before 16-byte padding.
    pub fn len(self) -> usize {
        (self.0 & PLD_LEN_MASK) as usize
    }

    /// Whether the payload is empty (reset commands carry no bytes).
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Decoded payload type, if the type bits are known.
    pub fn payload_type(self) -> Option<PayloadType> {
        PayloadType::from_bits((self.0 & PLD_TYPE_MASK) >> PLD_TYPE_SHIFT)
    }
}

/// Round `value` up to the next multiple of `align`.
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    (value + align - 1) / align * align
}

// Field offsets within a message header. All fields are little-endian.
const OFF_SIZE: usize = 0;
const OFF_NUM_PLS: usize = 4;
const OFF_PADDING: usize = 6;
const OFF_BARKER: usize = 8;
const OFF_SEQUENCE: usize = 12;

// The barker and sequence words are dead until stamped at take time, so
// the in-FIFO record reuses the low half of the barker word to remember
// where the relocated header sits. The pre-move header, the only place
// this is read from, is never transmitted.
const OFF_HDR_OFFSET: usize = OFF_BARKER;

/// Offset-based view of a message header inside the ring.
///
/// All accessors read and write little-endian fields at fixed offsets from
/// `base`. Views are cheap and short-lived; the engine creates them under
/// its lock as needed.
pub(crate) struct MsgHdr {
    base: *mut u8,
}

impl MsgHdr {
    /// Build a view at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`HDR_SIZE`] readable and writable
    /// bytes ([`HDR_BLOCK`] if descriptor slots are accessed), valid for
    /// the life of the view.
    pub unsafe fn at(base: *mut u8) -> Self {
        Self { base }
    }

    fn read_u32(&self, off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe { ptr::copy_nonoverlapping(self.base.add(off), bytes.as_mut_ptr(), 4) };
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&self, off: usize, value: u32) {
        let bytes = value.to_le_bytes();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), 4) };
    }

    fn read_u16(&self, off: usize) -> u16 {
        let mut bytes = [0u8; 2];
        unsafe { ptr::copy_nonoverlapping(self.base.add(off), bytes.as_mut_ptr(), 2) };
        u16::from_le_bytes(bytes)
    }

    fn write_u16(&self, off: usize, value: u16) {
        let bytes = value.to_le_bytes();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), 2) };
    }

    /// Record length in the FIFO, [`SKIP_FLAG`] included if set.
    pub fn size(&self) -> u32 {
        self.read_u32(OFF_SIZE)
    }

    pub fn set_size(&self, size: u32) {
        self.write_u32(OFF_SIZE, size);
    }

    /// Number of populated payload descriptors.
    pub fn num_pls(&self) -> u16 {
        self.read_u16(OFF_NUM_PLS)
    }

    pub fn set_num_pls(&self, num_pls: u16) {
        self.write_u16(OFF_NUM_PLS, num_pls);
    }

    pub fn set_padding(&self, padding: u16) {
        self.write_u16(OFF_PADDING, padding);
    }

    /// Distance from this record's start to the relocated transmit header.
    /// Zero until close, and zero afterwards when all descriptor slots
    /// were used.
    pub fn offset(&self) -> u16 {
        self.read_u16(OFF_HDR_OFFSET)
    }

    pub fn set_offset(&self, offset: u16) {
        self.write_u16(OFF_HDR_OFFSET, offset);
    }

    pub fn set_barker(&self, barker: u32) {
        self.write_u32(OFF_BARKER, barker);
    }

    pub fn set_sequence(&self, sequence: u32) {
        self.write_u32(OFF_SEQUENCE, sequence);
    }

    /// Write descriptor slot `idx`.
    pub fn set_pld(&self, idx: usize, desc: PldDesc) {
        debug_assert!(idx < PLD_MAX);
        self.write_u32(HDR_SIZE + idx * PLD_DESC_SIZE, desc.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = PldDesc::new(1400, PayloadType::Data);
        assert_eq!(desc.len(), 1400);
        assert_eq!(desc.payload_type(), Some(PayloadType::Data));

        let desc = PldDesc::new(0, PayloadType::ResetWarm);
        assert!(desc.is_empty());
        assert_eq!(desc.payload_type(), Some(PayloadType::ResetWarm));
        assert!(desc.payload_type().unwrap().is_reset());

        let raw = PldDesc::new(0x3FFF, PayloadType::ResetCold).raw();
        assert_eq!(PldDesc::from_raw(raw).len(), 0x3FFF);
        assert_eq!(raw & PLD_TYPE_MASK, 4 << PLD_TYPE_SHIFT);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(1400, 16), 1408);
        assert_eq!(align_up(48, 256), 256);
        assert_eq!(align_up(14144, 256), 14336);
    }

    #[test]
    fn test_header_view_fields() {
        let mut buf = [0u8; HDR_BLOCK];
        let hdr = unsafe { MsgHdr::at(buf.as_mut_ptr()) };

        hdr.set_size(0x1234 | SKIP_FLAG);
        hdr.set_num_pls(3);
        hdr.set_padding(208);
        hdr.set_offset(32);
        hdr.set_pld(2, PldDesc::new(100, PayloadType::Ctrl));

        assert_eq!(hdr.size(), 0x1234 | SKIP_FLAG);
        assert_eq!(hdr.size() & !SKIP_FLAG, 0x1234);
        assert_eq!(hdr.num_pls(), 3);
        assert_eq!(hdr.offset(), 32);

        // Little-endian on the wire.
        assert_eq!(&buf[0..4], &[0x34, 0x12, 0x00, 0x80]);
        assert_eq!(&buf[4..6], &[3, 0]);
        assert_eq!(&buf[6..8], &[208, 0]);
        let desc = u32::from_le_bytes(buf[HDR_SIZE + 8..HDR_SIZE + 12].try_into().unwrap());
        assert_eq!(PldDesc::from_raw(desc).len(), 100);
    }

    #[test]
    fn test_barker_overlays_offset() {
        let mut buf = [0u8; HDR_SIZE];
        let hdr = unsafe { MsgHdr::at(buf.as_mut_ptr()) };

        hdr.set_offset(48);
        assert_eq!(hdr.offset(), 48);

        // Stamping the barker claims the word back; the offset field is
        // only ever read before that happens.
        hdr.set_barker(H2D_PREVIEW_BARKER);
        assert_eq!(&buf[8..12], &H2D_PREVIEW_BARKER.to_le_bytes());
        hdr.set_sequence(7);
        assert_eq!(&buf[12..16], &7u32.to_le_bytes());
    }
}
