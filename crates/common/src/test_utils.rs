//! Test utilities for usb-midi-host
//!
//! Raw USB-MIDI packet builders and timeout helpers shared by the crates'
//! tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{concat_packets, note_on_packet, PADDING_PACKET};
//!
//! let buf = concat_packets(&[note_on_packet(0, 60, 100), PADDING_PACKET]);
//! assert_eq!(buf, vec![0x09, 0x90, 60, 100, 0, 0, 0, 0]);
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// All-zero padding packet
pub const PADDING_PACKET: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Timing clock packet (CIN 0xF, status 0xF8)
pub const CLOCK_PACKET: [u8; 4] = [0x0F, 0xF8, 0x00, 0x00];

/// Active sensing packet (CIN 0xF, status 0xFE)
pub const ACTIVE_SENSING_PACKET: [u8; 4] = [0x0F, 0xFE, 0x00, 0x00];

/// USB-MIDI note-on packet on cable 0
pub fn note_on_packet(channel: u8, note: u8, velocity: u8) -> [u8; 4] {
    [0x09, 0x90 | (channel & 0x0F), note, velocity]
}

/// USB-MIDI note-off packet on cable 0
pub fn note_off_packet(channel: u8, note: u8, velocity: u8) -> [u8; 4] {
    [0x08, 0x80 | (channel & 0x0F), note, velocity]
}

/// USB-MIDI control-change packet on cable 0
pub fn control_change_packet(channel: u8, controller: u8, value: u8) -> [u8; 4] {
    [0x0B, 0xB0 | (channel & 0x0F), controller, value]
}

/// Concatenate packets into one bulk buffer
pub fn concat_packets(packets: &[[u8; 4]]) -> Vec<u8> {
    packets.iter().flatten().copied().collect()
}

/// Poll `predicate` until it holds or `timeout` elapses
///
/// Returns the last value of the predicate.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
