//! Concurrent producers against a draining consumer.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use airlink_tx_fifo::fifo::{PLD_LEN_MASK, PLD_TYPE_MASK, PLD_TYPE_SHIFT};
use airlink_tx_fifo::{PayloadType, TxFifo};

const NUM_PRODUCERS: usize = 2;
const MSGS_PER_PRODUCER: usize = 100;
const PAYLOAD_LEN: usize = 1500;

/// Payload: producer id, a 16-bit per-producer sequence, then a fill byte
/// derived from both, so corruption anywhere in the run is caught.
fn make_payload(producer: u8, seq: u16) -> Vec<u8> {
    let fill = producer.wrapping_mul(31).wrapping_add(seq as u8);
    let mut data = vec![fill; PAYLOAD_LEN];
    data[0] = producer;
    data[1..3].copy_from_slice(&seq.to_le_bytes());
    data
}

fn align16(value: usize) -> usize {
    (value + 15) / 16 * 16
}

/// Pull every payload out of one delivered frame.
fn frame_payloads(frame: &[u8]) -> Vec<Vec<u8>> {
    let num_pls = u16::from_le_bytes([frame[4], frame[5]]) as usize;
    let mut payloads = Vec::new();
    let mut off = align16(16 + num_pls * 4);
    for i in 0..num_pls {
        let desc = u32::from_le_bytes([
            frame[16 + i * 4],
            frame[17 + i * 4],
            frame[18 + i * 4],
            frame[19 + i * 4],
        ]);
        let len = (desc & PLD_LEN_MASK) as usize;
        assert_eq!((desc & PLD_TYPE_MASK) >> PLD_TYPE_SHIFT, PayloadType::Data as u32);
        payloads.push(frame[off..off + len].to_vec());
        off += align16(len);
    }
    payloads
}

#[test]
fn test_two_producers_one_consumer() {
    let fifo = Arc::new(TxFifo::new(256).unwrap());
    let barrier = Arc::new(Barrier::new(NUM_PRODUCERS + 1));

    let mut handles = Vec::new();
    for producer in 0..NUM_PRODUCERS as u8 {
        let fifo = fifo.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for seq in 0..MSGS_PER_PRODUCER as u16 {
                let data = make_payload(producer, seq);
                // NoSpace is backpressure, not failure; wait for the
                // consumer to release a message and retry.
                while fifo.submit(&data, PayloadType::Data).is_err() {
                    fifo.wait_for_space(Some(50));
                }
            }
        }));
    }

    barrier.wait();

    let mut delivered: Vec<Vec<u8>> = Vec::new();
    while delivered.len() < NUM_PRODUCERS * MSGS_PER_PRODUCER {
        match fifo.take_next() {
            Some(msg) => {
                delivered.extend(frame_payloads(msg.as_bytes()));
                fifo.mark_sent(msg);
            }
            None => {
                fifo.wait_for_work(Some(10));
            }
        }
    }
    thread::sleep(Duration::from_millis(50));
    assert!(fifo.take_next().is_none(), "no stray payloads past the count");

    for handle in handles {
        handle.join().unwrap();
    }

    // Every payload arrives exactly once, uncorrupted, and in per-producer
    // submission order; the interleaving between producers is free.
    assert_eq!(delivered.len(), NUM_PRODUCERS * MSGS_PER_PRODUCER);
    let mut next_seq = vec![0u16; NUM_PRODUCERS];
    for data in &delivered {
        assert_eq!(data.len(), PAYLOAD_LEN);
        let producer = data[0] as usize;
        assert!(producer < NUM_PRODUCERS);
        let seq = u16::from_le_bytes([data[1], data[2]]);
        assert_eq!(seq, next_seq[producer], "producer {} out of order", producer);
        next_seq[producer] = seq + 1;

        let fill = (producer as u8).wrapping_mul(31).wrapping_add(seq as u8);
        assert!(data[3..].iter().all(|&b| b == fill), "payload corrupted");
    }
    assert_eq!(fifo.stats().payloads, (NUM_PRODUCERS * MSGS_PER_PRODUCER) as u64);
}
