//! Airlink TX FIFO - the transmit batching engine for Airlink wireless
//! modems.
//!
//! # Overview
//!
//! Data and control frames headed for the device are coalesced in a
//! software FIFO: while the bus is busy reading one transaction, further
//! payloads accumulate under a single message header. The bus layer then
//! gets linear, block-aligned byte runs it can push as single bulk
//! transfers, with no scatter/gather.
//!
//! The crate has two parts:
//!
//! 1. The [`TxFifo`] engine - a contiguous 32 KiB ring holding TX
//!    messages, each a header, up to 12 payload descriptors, the payloads
//!    themselves, and trailing padding
//! 2. The [`bus`] seam - the [`BusTx`] transport trait and the [`BusPump`]
//!    thread that drains the FIFO through it
//!
//! # Key features
//!
//! - Multiple concurrent producers, one consumer, one lock
//! - Payloads padded to 16 bytes; messages padded to the bus block size
//! - Message headers relocated at close time so unused descriptor slots
//!   never ship
//! - Unusable tail space recycled with sentinel records the consumer
//!   skips, keeping every delivered run linear
//! - Reset payloads always shipped alone in their own message
//! - Kick/backpressure signaling on both sides of the FIFO
//!
//! # Usage
//!
//! Set up one engine per device with the block size the bus layer
//! negotiated at bring-up, hand it to a [`BusPump`] (or drive
//! [`TxFifo::take_next`] / [`TxFifo::mark_sent`] from your own transfer
//! loop), and feed it with [`TxFifo::submit`].

#![deny(missing_docs)]

pub mod bus;
pub mod fifo;

pub use bus::{BusPump, BusPumpConfig, BusTx};
pub use fifo::engine::{TxFifo, TxFifoConfig, TxMessage, TxStats};
pub use fifo::{PayloadType, PldDesc, TxError};
