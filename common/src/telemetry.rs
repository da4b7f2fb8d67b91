use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    protocol::{is_valid_frame, DeviceStatus},
    types::Mode,
};

pub const SNAPSHOT_CAPACITY: usize = 96;

/// Copy of the most recent status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    raw: [u8; SNAPSHOT_CAPACITY],
    len: u16,
    pub captured_at_ms: u64,
    pub valid: bool,
}

impl TelemetrySnapshot {
    pub fn capture(frame: &[u8], now_ms: u64) -> Self {
        let len = frame.len().min(SNAPSHOT_CAPACITY);
        let mut raw = [0u8; SNAPSHOT_CAPACITY];
        raw[..len].copy_from_slice(&frame[..len]);
        Self {
            raw,
            len: len as u16,
            captured_at_ms: now_ms,
            valid: is_valid_frame(frame),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw[..usize::from(self.len)]
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.captured_at_ms)
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        if !self.valid {
            return None;
        }
        DeviceStatus::decode(self.bytes())
    }
}

/// Latest-frame cell shared between the notification path and everything else.
///
/// Writers and readers only ever copy a whole snapshot in or out under the lock, so no
/// reader observes a partially written frame and the lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    latest: Arc<Mutex<Option<TelemetrySnapshot>>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, frame: &[u8], now_ms: u64) -> TelemetrySnapshot {
        let snapshot = TelemetrySnapshot::capture(frame, now_ms);
        *self.latest.lock() = Some(snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> Option<TelemetrySnapshot> {
        *self.latest.lock()
    }

    /// Decoded status, only if the latest frame is valid and at most `max_age_ms` old.
    pub fn fresh_status(&self, now_ms: u64, max_age_ms: u64) -> Option<DeviceStatus> {
        let snapshot = self.snapshot()?;
        if snapshot.age_ms(now_ms) > max_age_ms {
            return None;
        }
        snapshot.status()
    }

    pub fn current_mode(&self, now_ms: u64, max_age_ms: u64) -> Option<Mode> {
        self.fresh_status(now_ms, max_age_ms)
            .map(|status| status.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sample_frame;

    #[test]
    fn starts_empty() {
        let store = TelemetryStore::new();
        assert!(store.snapshot().is_none());
        assert_eq!(store.current_mode(0, 5_000), None);
    }

    #[test]
    fn fresh_valid_frame_reports_mode() {
        let store = TelemetryStore::new();
        store.record(&sample_frame(1, 10), 1_000);

        assert_eq!(store.current_mode(6_000, 5_000), Some(Mode::Heat));
        assert_eq!(store.current_mode(6_001, 5_000), None);
    }

    #[test]
    fn invalid_frame_is_kept_but_not_trusted() {
        let store = TelemetryStore::new();
        store.record(&sample_frame(4, 10), 100);
        store.record(&[0x00, 0x11, 0x22, 0x33, 0x44], 200);

        let snapshot = store.snapshot().unwrap();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.bytes(), &[0x00, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(store.current_mode(250, 5_000), None);
    }

    #[test]
    fn oversized_frame_is_truncated() {
        let store = TelemetryStore::new();
        let mut frame = sample_frame(2, 5);
        frame.resize(140, 0xAA);

        let snapshot = store.record(&frame, 0);

        assert_eq!(usize::from(snapshot.len()), SNAPSHOT_CAPACITY);
        assert!(snapshot.valid);
        assert_eq!(snapshot.status().map(|s| s.mode), Some(Mode::Turbo));
    }

    #[test]
    fn readers_get_independent_copies() {
        let store = TelemetryStore::new();
        store.record(&sample_frame(1, 1), 10);
        let before = store.snapshot().unwrap();

        store.record(&sample_frame(5, 2), 20);

        assert_eq!(before.status().map(|s| s.mode), Some(Mode::Heat));
        assert_eq!(store.snapshot().unwrap().captured_at_ms, 20);
    }
}
