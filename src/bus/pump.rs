//! Background consumer that drains the TX FIFO through a bus transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error};

use crate::bus::{BusPumpConfig, BusTx};
use crate::fifo::engine::TxFifo;

/// Handle to a running bus pump thread.
///
/// The pump stops when [`stop`](BusPump::stop) is called or the handle is
/// dropped; either way the thread is joined.
pub struct BusPump {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BusPump {
    /// Spawn the pump thread for `fifo`, delivering through `bus`.
    pub fn start(fifo: Arc<TxFifo>, bus: Arc<dyn BusTx>, config: BusPumpConfig) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("airlink-tx-pump".to_string())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    if !fifo.wait_for_work(Some(config.poll_interval_ms)) {
                        continue;
                    }
                    while let Some(msg) = fifo.take_next() {
                        match bus.send(msg.as_bytes()) {
                            Ok(()) => debug!(
                                "sent seq {} ({} b, {} pls)",
                                msg.sequence(),
                                msg.len(),
                                msg.num_payloads()
                            ),
                            // The message is dropped either way; upper
                            // layers own any retry policy.
                            Err(e) => error!("bus send failed (seq {}): {}", msg.sequence(), e),
                        }
                        fifo.mark_sent(msg);
                    }
                }
            })
            .expect("failed to spawn bus pump thread");
        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop the pump and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::PayloadType;
    use parking_lot::Mutex;
    use std::io;
    use std::time::Duration;

    /// Records every frame it is handed; optionally fails each send.
    struct MockBus {
        frames: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl MockBus {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl BusTx for MockBus {
        fn send(&self, frame: &[u8]) -> io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bus gone"));
            }
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within a second");
    }

    #[test]
    fn test_pump_delivers_submitted_payloads() {
        let fifo = Arc::new(TxFifo::new(256).unwrap());
        let bus = Arc::new(MockBus::new());
        let pump = BusPump::start(fifo.clone(), bus.clone(), BusPumpConfig::default());

        fifo.submit(b"ping", PayloadType::Data).unwrap();
        wait_for(|| !bus.frames.lock().is_empty());
        pump.stop();

        let frames = bus.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len() % fifo.block_size(), 0);
        // The payload sits right behind the 32-byte relocated header.
        assert_eq!(&frames[0][32..36], b"ping");
        assert_eq!(fifo.stats().messages, 1);
    }

    #[test]
    fn test_pump_drops_failed_sends() {
        let fifo = Arc::new(TxFifo::new(256).unwrap());
        let bus = Arc::new(MockBus::new());
        bus.fail.store(true, Ordering::SeqCst);
        let pump = BusPump::start(fifo.clone(), bus.clone(), BusPumpConfig::default());

        fifo.submit(b"lost", PayloadType::Data).unwrap();
        // The failed message is still acknowledged and its space freed.
        wait_for(|| fifo.stats().messages == 1);
        wait_for(|| fifo.usage_percent() == 0.0);

        bus.fail.store(false, Ordering::SeqCst);
        fifo.submit(b"kept", PayloadType::Data).unwrap();
        wait_for(|| bus.frames.lock().len() == 1);
        pump.stop();

        assert_eq!(&bus.frames.lock()[0][32..36], b"kept");
    }
}
