// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Sahara watchdog supervisor.
//!
//! Modeled as a supervising task that observes a timestamp the engine
//! updates on every valid frame, and signals back over a channel rather
//! than reaching into the engine directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    SoftReset,
    HardReset,
}

pub struct Watchdog {
    last_feed: Arc<Mutex<Instant>>,
    stall_count: Arc<AtomicU32>,
    rx: Receiver<WatchdogSignal>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the supervisor. `timeout` is the per-feed stall window; after
    /// `stall_threshold` consecutive stalls it emits `HardReset` instead of
    /// another `SoftReset`.
    pub fn spawn(timeout: Duration, stall_threshold: u32) -> Watchdog {
        let last_feed = Arc::new(Mutex::new(Instant::now()));
        let stall_count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let feed_handle = Arc::clone(&last_feed);
        let count_handle = Arc::clone(&stall_count);
        let handle = thread::spawn(move || {
            loop {
                if stop_rx.recv_timeout(POLL_INTERVAL).is_ok() {
                    return;
                }
                let elapsed = feed_handle.lock().unwrap().elapsed();
                if elapsed < timeout {
                    continue;
                }
                let n = count_handle.fetch_add(1, Ordering::SeqCst) + 1;
                let signal = if n >= stall_threshold {
                    WatchdogSignal::HardReset
                } else {
                    WatchdogSignal::SoftReset
                };
                // A send failure means the engine side hung up; stop polling.
                if tx.send(signal).is_err() {
                    return;
                }
                // Avoid re-signaling every poll tick while still stalled.
                *feed_handle.lock().unwrap() = Instant::now();
            }
        });

        Watchdog {
            last_feed,
            stall_count,
            rx,
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Reset the stall clock; called whenever the engine parses a valid
    /// device frame.
    pub fn feed(&self) {
        *self.last_feed.lock().unwrap() = Instant::now();
        self.stall_count.store(0, Ordering::SeqCst);
    }

    /// Non-blocking poll for a pending signal.
    pub fn try_recv(&self) -> Option<WatchdogSignal> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_resets_stall_counter() {
        let wd = Watchdog::spawn(Duration::from_millis(50), 3);
        thread::sleep(Duration::from_millis(120));
        assert!(wd.try_recv().is_some());
        wd.feed();
        assert_eq!(wd.stall_count.load(Ordering::SeqCst), 0);
    }
}
