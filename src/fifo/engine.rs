//! The TX batching engine
//!
//! This module implements the software FIFO that coalesces payloads into
//! TX messages for bus delivery. Key properties:
//!
//! - One contiguous 32 KiB ring; allocations are strictly linear and never
//!   split across the wrap, because the bus wants one flat run per transfer
//! - Monotonic `write_pos`/`read_pos` cursors so an empty FIFO is
//!   distinguishable from a full one; physical positions are the cursors
//!   modulo the ring size, and the cursors are leveled off periodically
//! - One message is kept open at the end of the ring and payloads are
//!   appended to it until it runs out of descriptor slots, grows past the
//!   message size limit, a reset payload demands its own message, or the
//!   consumer closes it to ship it
//! - When the tail cannot hold the next run but the head can, the tail is
//!   covered with a sentinel record the consumer skips, and the message
//!   continues at offset 0
//! - A single lock guards all engine state; the bus kick and the
//!   space-available signal are raised after it is released
//!
//! The producer side is [`TxFifo::submit`]; the bus side is
//! [`TxFifo::take_next`] / [`TxFifo::mark_sent`], typically driven from a
//! pump thread blocking in [`TxFifo::wait_for_work`].

use std::marker::PhantomData;
use std::slice;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::fifo::ring::RingStorage;
use crate::fifo::{
    align_up, MsgHdr, PayloadType, PldDesc, TxError, H2D_PREVIEW_BARKER, HDR_BLOCK, HDR_SIZE,
    PAD_BYTE, PLD_DESC_SIZE, PLD_MAX, PL_PAD, SKIP_FLAG, TX_BUF_SIZE,
};

/// Tunables fixed at engine construction.
#[derive(Debug, Clone, Copy)]
pub struct TxFifoConfig {
    /// Granularity the bus demands for each transfer; set by the bus layer
    /// during device bring-up. Must be nonzero.
    pub block_size: usize,
    /// An open message is closed once appending would push it past this
    /// size. The default of half the FIFO matches the device's maximum
    /// transaction and keeps one message in flight while the next builds.
    pub msg_size_limit: usize,
}

impl TxFifoConfig {
    /// Config for `block_size` with the default message size limit.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            msg_size_limit: TX_BUF_SIZE / 2,
        }
    }
}

/// Per-engine TX statistics, sampled at take time.
///
/// Minima start at `u32::MAX` so the first observation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// TX messages handed to the bus.
    pub messages: u64,
    /// Payloads summed over all messages.
    pub payloads: u64,
    /// Fewest payloads seen in one message.
    pub payloads_min: u32,
    /// Most payloads seen in one message.
    pub payloads_max: u32,
    /// On-wire bytes summed over all messages.
    pub bytes: u64,
    /// Smallest on-wire message.
    pub size_min: u32,
    /// Largest on-wire message.
    pub size_max: u32,
}

impl Default for TxStats {
    fn default() -> Self {
        Self {
            messages: 0,
            payloads: 0,
            payloads_min: u32::MAX,
            payloads_max: 0,
            bytes: 0,
            size_min: u32::MAX,
            size_max: 0,
        }
    }
}

/// Mutable engine state, all guarded by the engine lock.
struct TxFifoInner {
    /// Monotonic producer cursor; bytes land at `write_pos % TX_BUF_SIZE`.
    write_pos: u64,
    /// Monotonic consumer cursor; `read_pos <= write_pos` and
    /// `write_pos - read_pos <= TX_BUF_SIZE` always hold.
    read_pos: u64,
    /// Physical offset of the open message's header, if one is open. The
    /// open message is always the last record before `write_pos`.
    open_msg: Option<usize>,
    /// In-FIFO length of the run handed to the bus; 0 when idle. May
    /// exceed the on-wire length when the header was relocated.
    in_flight: usize,
    /// Next sequence number to stamp.
    sequence: u32,
    stats: TxStats,
}

/// Outcome of a contiguous reservation attempt.
enum Reserved {
    /// Run granted at this physical offset.
    At(usize),
    /// The tail cannot hold the run but the head might; the caller should
    /// recycle the tail with a sentinel and retry.
    TailFull,
    /// No room anywhere.
    NoSpace,
}

/// The TX engine: one per device.
///
/// Producers call [`submit`](TxFifo::submit) from any thread; the bus
/// driver drains with [`take_next`](TxFifo::take_next) and
/// [`mark_sent`](TxFifo::mark_sent). All methods take `&self`.
pub struct TxFifo {
    ring: RingStorage,
    state: CachePadded<Mutex<TxFifoInner>>,
    block_size: usize,
    msg_size_limit: usize,
    /// Bus-side notification: there may be data to send.
    kick_signal: (Mutex<bool>, Condvar),
    /// Producer-side notification: FIFO space may have been released.
    space_signal: (Mutex<bool>, Condvar),
}

impl TxFifo {
    /// Set up an engine with the default message size limit.
    ///
    /// # Arguments
    ///
    /// * `block_size` - bus transfer granularity, as fixed by device
    ///   bring-up
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero; the bus layer has to define it.
    pub fn new(block_size: usize) -> Result<Self, TxError> {
        Self::with_config(TxFifoConfig::new(block_size))
    }

    /// Set up an engine from an explicit config.
    pub fn with_config(config: TxFifoConfig) -> Result<Self, TxError> {
        assert!(config.block_size > 0, "bus block size must be nonzero");
        let ring = RingStorage::alloc(TX_BUF_SIZE)?;
        Ok(Self {
            ring,
            state: CachePadded::new(Mutex::new(TxFifoInner {
                write_pos: 0,
                read_pos: 0,
                open_msg: None,
                in_flight: 0,
                sequence: 0,
                stats: TxStats::default(),
            })),
            block_size: config.block_size,
            msg_size_limit: config.msg_size_limit,
            kick_signal: (Mutex::new(false), Condvar::new()),
            space_signal: (Mutex::new(false), Condvar::new()),
        })
    }

    /// Header view at physical offset `off`.
    fn hdr(&self, off: usize) -> MsgHdr {
        unsafe { MsgHdr::at(self.ring.at(off)) }
    }

    /// Reserve `size` contiguous bytes, requiring `padding` more to be
    /// free behind them. The extra space is not consumed; it guarantees a
    /// later close can append its alignment padding without failing.
    fn reserve(&self, st: &mut TxFifoInner, size: usize, padding: usize) -> Reserved {
        let needed = size + padding;
        let room = TX_BUF_SIZE - (st.write_pos - st.read_pos) as usize;
        if room < needed {
            trace!("reserve {}/{}: no space", size, padding);
            return Reserved::NoSpace;
        }
        let phys_in = (st.write_pos % TX_BUF_SIZE as u64) as usize;
        let tail_room = TX_BUF_SIZE - phys_in;
        if tail_room < needed {
            let phys_out = (st.read_pos % TX_BUF_SIZE as u64) as usize;
            return if phys_out < phys_in {
                trace!("reserve {}/{}: tail full", size, padding);
                Reserved::TailFull
            } else {
                trace!("reserve {}/{}: no head space", size, padding);
                Reserved::NoSpace
            };
        }
        trace!("reserve {}/{}: at @{}", size, padding, phys_in);
        st.write_pos += size as u64;
        Reserved::At(phys_in)
    }

    /// Cover the unusable tail with a sentinel record so the next run can
    /// start at offset 0.
    fn skip_tail(&self, st: &mut TxFifoInner) {
        let phys_in = (st.write_pos % TX_BUF_SIZE as u64) as usize;
        let tail_room = TX_BUF_SIZE - phys_in;
        // Every run in the ring is 16-aligned, so the sentinel header
        // always fits.
        debug_assert!(tail_room >= HDR_SIZE);
        self.hdr(phys_in).set_size(tail_room as u32 | SKIP_FLAG);
        debug!("skip tail: {} bytes @{}", tail_room, phys_in);
        st.write_pos += tail_room as u64;
    }

    /// Open a new message: reserve the full header block and zero it.
    ///
    /// Reserves room for [`PLD_MAX`] descriptors even if fewer end up
    /// used; the unused slack is trimmed at close by relocating the
    /// header. Leaves `open_msg` unset when the FIFO cannot hold the
    /// block.
    fn open_msg(&self, st: &mut TxFifoInner) {
        debug_assert!(st.open_msg.is_none());
        loop {
            match self.reserve(st, HDR_BLOCK, 0) {
                Reserved::At(off) => {
                    unsafe { self.ring.fill(off, HDR_BLOCK, 0) };
                    self.hdr(off).set_size(HDR_BLOCK as u32);
                    debug!("new TX message @{}", off);
                    st.open_msg = Some(off);
                    return;
                }
                Reserved::TailFull => {
                    debug!("new TX message: tail full, trying head");
                    self.skip_tail(st);
                }
                Reserved::NoSpace => return,
            }
        }
    }

    /// Close the open message.
    ///
    /// Relocates the header forward so it sits flush against the first
    /// payload, then pads the transmittable run out to the bus block
    /// size. The pre-move header stays in place with the full in-FIFO
    /// size, so the consumer can keep walking record boundaries.
    fn close_msg(&self, st: &mut TxFifoInner) {
        let off = match st.open_msg.take() {
            Some(off) => off,
            None => return,
        };
        let hdr = self.hdr(off);
        if hdr.size() & SKIP_FLAG != 0 {
            // A sentinel cannot be open; leave it alone.
            return;
        }

        let hdr_len = align_up(HDR_SIZE + hdr.num_pls() as usize * PLD_DESC_SIZE, PL_PAD);
        let offset = HDR_BLOCK - hdr_len;
        hdr.set_offset(offset as u16);
        unsafe { self.ring.copy_within(off, off + offset, hdr_len) };
        let moved = self.hdr(off + offset);
        moved.set_size(moved.size() - offset as u32);

        let aligned = align_up(moved.size() as usize, self.block_size);
        let padding = aligned - moved.size() as usize;
        if padding > 0 {
            match self.reserve(st, padding, 0) {
                Reserved::At(pad_off) => unsafe { self.ring.fill(pad_off, padding, PAD_BYTE) },
                Reserved::TailFull | Reserved::NoSpace => {
                    // Payload reservations demand block_size bytes of
                    // contiguous slack exactly so this cannot happen.
                    error!(
                        "padding reservation failed: size {} aligned {} in {} out {}",
                        moved.size(),
                        aligned,
                        st.write_pos,
                        st.read_pos
                    );
                    debug_assert!(false, "close-time padding reservation failed");
                }
            }
        }
        moved.set_padding(padding as u16);
        moved.set_size(moved.size() + padding as u32);
        if offset != 0 {
            hdr.set_size(hdr.size() + padding as u32);
        }
        debug!(
            "closed TX message @{}: {} pls, {} b in fifo",
            off,
            hdr.num_pls(),
            hdr.size()
        );
    }

    /// Append a payload to the TX FIFO.
    ///
    /// The payload joins the open TX message when one exists and has a
    /// free descriptor slot; otherwise the open message is closed and a
    /// new one started. Reset payloads always get a message of their own.
    /// Once this returns, `buf` has been copied and may be reused.
    ///
    /// # Returns
    ///
    /// `Err(TxError::NoSpace)` when the FIFO cannot take the payload even
    /// after recycling the tail; the caller should halt its upper queue
    /// and wait for [`wait_for_space`](TxFifo::wait_for_space).
    pub fn submit(&self, buf: &[u8], pl_type: PayloadType) -> Result<(), TxError> {
        let padded_len = align_up(buf.len(), PL_PAD);
        let singleton = pl_type.is_reset();
        trace!("submit: {} b (padded {}) type {:?}", buf.len(), padded_len, pl_type);

        let result = {
            let mut st = self.state.lock();
            loop {
                match st.open_msg {
                    None => self.open_msg(&mut st),
                    Some(off) => {
                        let num_pls = self.hdr(off).num_pls();
                        if num_pls as usize >= PLD_MAX || (singleton && num_pls != 0) {
                            debug!(
                                "closing TX message (pls {} singleton {})",
                                num_pls, singleton
                            );
                            self.close_msg(&mut st);
                            self.open_msg(&mut st);
                        }
                    }
                }
                if let Some(off) = st.open_msg {
                    if self.hdr(off).size() as usize + padded_len > self.msg_size_limit {
                        debug!("TX message would exceed {} b, going new", self.msg_size_limit);
                        self.close_msg(&mut st);
                        self.open_msg(&mut st);
                    }
                }
                let Some(msg_off) = st.open_msg else {
                    break Err(TxError::NoSpace);
                };

                match self.reserve(&mut st, padded_len, self.block_size) {
                    Reserved::TailFull => {
                        debug!("payload append: tail full");
                        self.close_msg(&mut st);
                        self.skip_tail(&mut st);
                    }
                    Reserved::NoSpace => {
                        debug!("payload append: all full");
                        break Err(TxError::NoSpace);
                    }
                    Reserved::At(pl_off) => {
                        unsafe {
                            self.ring.write(pl_off, buf);
                            self.ring.fill(pl_off + buf.len(), padded_len - buf.len(), PAD_BYTE);
                        }
                        let hdr = self.hdr(msg_off);
                        let num_pls = hdr.num_pls();
                        hdr.set_pld(num_pls as usize, PldDesc::new(buf.len(), pl_type));
                        hdr.set_num_pls(num_pls + 1);
                        hdr.set_size(hdr.size() + padded_len as u32);
                        trace!(
                            "appended pl #{} @{}, msg @{} now {} b",
                            num_pls + 1,
                            pl_off,
                            msg_off,
                            hdr.size()
                        );
                        if singleton {
                            self.close_msg(&mut st);
                        }
                        break Ok(());
                    }
                }
            }
        };
        // Always kick, outside the lock: even a failed append may have
        // closed a message the bus can drain to free space.
        self.kick();
        result
    }

    /// Take the first TX message ready for transmission.
    ///
    /// Skips sentinel and empty records, closes the open message if it is
    /// next in line, stamps barker and sequence, and returns the linear
    /// run to put on the bus. Returns `None` when the FIFO holds nothing
    /// deliverable.
    ///
    /// The returned handle must be passed back through
    /// [`mark_sent`](TxFifo::mark_sent) before the next take.
    pub fn take_next(&self) -> Option<TxMessage<'_>> {
        let mut st = self.state.lock();
        debug_assert!(st.in_flight == 0, "previous TX message not acknowledged");
        loop {
            if st.write_pos == st.read_pos {
                // Empty; level the cursors so the next run starts at 0.
                st.write_pos = 0;
                st.read_pos = 0;
                trace!("take: FIFO empty, cursors reset");
                return None;
            }
            let off = (st.read_pos % TX_BUF_SIZE as u64) as usize;
            let hdr = self.hdr(off);
            let size = hdr.size();
            if size & SKIP_FLAG != 0 {
                debug!("take: skipping sentinel @{} ({} b)", off, size & !SKIP_FLAG);
                st.read_pos += (size & !SKIP_FLAG) as u64;
                continue;
            }
            if hdr.num_pls() == 0 {
                if st.open_msg == Some(off) {
                    // Open and still empty: nothing to send yet.
                    return None;
                }
                debug!("take: skipping empty closed message @{} ({} b)", off, size);
                st.read_pos += size as u64;
                continue;
            }
            if st.open_msg == Some(off) {
                // The producer may still be appending; closing here is
                // what lets the consumer ship it.
                self.close_msg(&mut st);
            }

            // Close grows the record; re-read, and grab the relocation
            // offset before the barker stamp claims that word.
            let size = hdr.size();
            let hdr_offset = hdr.offset() as usize;
            let moved = self.hdr(off + hdr_offset);
            let bus_size = moved.size();
            let pls = moved.num_pls() as u32;

            st.in_flight = size as usize;
            moved.set_barker(H2D_PREVIEW_BARKER);
            moved.set_sequence(st.sequence);
            let sequence = st.sequence;
            st.sequence = st.sequence.wrapping_add(1);

            let stats = &mut st.stats;
            stats.messages += 1;
            stats.payloads += pls as u64;
            stats.payloads_min = stats.payloads_min.min(pls);
            stats.payloads_max = stats.payloads_max.max(pls);
            stats.bytes += bus_size as u64;
            stats.size_min = stats.size_min.min(bus_size);
            stats.size_max = stats.size_max.max(bus_size);

            debug!(
                "take: msg @{} moved +{} fifo {} b bus {} b seq {}",
                off, hdr_offset, size, bus_size, sequence
            );
            return Some(TxMessage {
                ptr: self.ring.at(off + hdr_offset) as *const u8,
                len: bus_size as usize,
                _fifo: PhantomData,
            });
        }
    }

    /// Acknowledge the TX message previously taken, releasing its FIFO
    /// space and re-arming producer backpressure.
    ///
    /// Call this even when the bus reported a transfer failure; the
    /// message is dropped either way and upper layers own any retry.
    pub fn mark_sent(&self, msg: TxMessage<'_>) {
        drop(msg);
        let mut st = self.state.lock();
        debug!("sent: {} b", st.in_flight);
        st.read_pos += st.in_flight as u64;
        st.in_flight = 0;
        debug_assert!(st.read_pos <= st.write_pos);
        // Level the cursors off so they stay bounded.
        let wraps = st.read_pos / TX_BUF_SIZE as u64;
        st.read_pos -= wraps * TX_BUF_SIZE as u64;
        st.write_pos -= wraps * TX_BUF_SIZE as u64;
        drop(st);
        self.signal_space();
    }

    /// Best-effort notification to the bus side that there may be work.
    fn kick(&self) {
        let (lock, cvar) = &self.kick_signal;
        let mut pending = lock.lock();
        *pending = true;
        cvar.notify_one();
    }

    fn signal_space(&self) {
        let (lock, cvar) = &self.space_signal;
        let mut pending = lock.lock();
        *pending = true;
        cvar.notify_all();
    }

    fn wait(signal: &(Mutex<bool>, Condvar), timeout_ms: Option<u64>) -> bool {
        let (lock, cvar) = signal;
        let mut pending = lock.lock();
        if *pending {
            *pending = false;
            return true;
        }
        match timeout_ms {
            Some(ms) => {
                let notified = !cvar
                    .wait_for(&mut pending, Duration::from_millis(ms))
                    .timed_out();
                *pending = false;
                notified
            }
            None => {
                cvar.wait(&mut pending);
                *pending = false;
                true
            }
        }
    }

    /// Block until a kick arrives or `timeout_ms` elapses (`None` waits
    /// indefinitely). Returns whether a kick was seen.
    pub fn wait_for_work(&self, timeout_ms: Option<u64>) -> bool {
        Self::wait(&self.kick_signal, timeout_ms)
    }

    /// Block until FIFO space may have been released or `timeout_ms`
    /// elapses (`None` waits indefinitely). Returns whether the signal was
    /// seen. For producers that got [`TxError::NoSpace`].
    pub fn wait_for_space(&self, timeout_ms: Option<u64>) -> bool {
        Self::wait(&self.space_signal, timeout_ms)
    }

    /// Bus transfer granularity installed at setup.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// FIFO capacity in bytes.
    pub fn capacity(&self) -> usize {
        TX_BUF_SIZE
    }

    /// Current FIFO usage as a percentage.
    pub fn usage_percent(&self) -> f32 {
        let st = self.state.lock();
        ((st.write_pos - st.read_pos) as f32 / TX_BUF_SIZE as f32) * 100.0
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> TxStats {
        self.state.lock().stats
    }
}

/// A closed TX message ready for bus delivery: one linear, block-aligned
/// byte run inside the FIFO.
///
/// The run stays valid and unmodified until the handle is returned through
/// [`TxFifo::mark_sent`]; the engine recycles the space only after that.
pub struct TxMessage<'a> {
    ptr: *const u8,
    len: usize,
    _fifo: PhantomData<&'a TxFifo>,
}

// The run is immutable while the handle exists (producers only ever write
// ahead of the producer cursor) and the backing storage outlives the
// borrow.
unsafe impl Send for TxMessage<'_> {}
unsafe impl Sync for TxMessage<'_> {}

impl TxMessage<'_> {
    /// The bytes to put on the bus.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// On-wire length; always a multiple of the bus block size.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the run is empty. Never true for a taken message.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn le16(&self, off: usize) -> u16 {
        let b = self.as_bytes();
        u16::from_le_bytes([b[off], b[off + 1]])
    }

    fn le32(&self, off: usize) -> u32 {
        let b = self.as_bytes();
        u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
    }

    /// Sequence number stamped into this message.
    pub fn sequence(&self) -> u32 {
        self.le32(12)
    }

    /// Number of payloads carried.
    pub fn num_payloads(&self) -> u16 {
        self.le16(4)
    }
}

#[cfg(test)]
impl TxFifo {
    /// Current (write, read) cursor values.
    fn cursors(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.write_pos, st.read_pos)
    }

    /// Walk the ring from the read cursor to the write cursor, asserting
    /// the structural invariants every record must satisfy.
    fn check_consistency(&self) {
        let st = self.state.lock();
        assert!(st.read_pos <= st.write_pos);
        assert!(st.write_pos - st.read_pos <= TX_BUF_SIZE as u64);

        let mut pos = st.read_pos;
        while pos < st.write_pos {
            let off = (pos % TX_BUF_SIZE as u64) as usize;
            assert_eq!(off % PL_PAD, 0, "record @{} misaligned", off);
            let hdr = self.hdr(off);
            let raw = hdr.size();
            let len = (raw & !SKIP_FLAG) as u64;
            assert!(len > 0, "zero-length record @{}", off);
            if raw & SKIP_FLAG == 0 {
                let num_pls = hdr.num_pls() as usize;
                assert!(num_pls <= PLD_MAX, "descriptor overflow @{}", off);
                let open = st.open_msg == Some(off);
                if !open && num_pls > 0 {
                    let moved = self.hdr(off + hdr.offset() as usize);
                    assert_eq!(
                        moved.size() as usize % self.block_size,
                        0,
                        "closed message @{} not block-aligned",
                        off
                    );
                }
            }
            pos += len;
        }
        assert_eq!(pos, st.write_pos, "record walk overshot the write cursor");
    }
}
