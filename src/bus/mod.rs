//! Bus-facing seam for the TX engine
//!
//! The engine is bus-agnostic: it builds linear, block-aligned TX messages
//! and leaves the actual byte delivery to a transport behind the [`BusTx`]
//! trait. This module provides that trait plus [`BusPump`], a background
//! consumer thread that drains the FIFO through a transport:
//!
//! - The pump blocks in [`TxFifo::wait_for_work`] until a producer kicks
//! - Each ready message is fetched with `take_next`, pushed through
//!   [`BusTx::send`], and acknowledged with `mark_sent`
//! - A failed send is logged and the message dropped; upper layers own
//!   retries
//!
//! One pump per engine, one engine per device; nothing here is global.
//!
//! [`TxFifo::wait_for_work`]: crate::fifo::engine::TxFifo::wait_for_work

pub mod pump;

pub use pump::BusPump;

use std::io;

/// A bus transport that can move one TX message to the device.
///
/// Implementations receive runs whose length is a multiple of the block
/// size the engine was set up with, and must not retain the slice past the
/// call.
pub trait BusTx: Send + Sync {
    /// Deliver one TX message as a single bulk transfer.
    fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Configuration for the bus pump thread.
#[derive(Debug, Clone, Copy)]
pub struct BusPumpConfig {
    /// Upper bound on how long the pump sleeps between kick checks, in
    /// milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for BusPumpConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}
