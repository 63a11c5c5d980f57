//! Command hysteresis
//!
//! Commands sent to DJ Link players take a while to show up in their status
//! packets. Until they do, the poller would see the old flags and "correct" them
//! back. Recording when each command went out lets the poller ignore
//! discrepancies inside a short window.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Send times of sync and master commands
pub struct CommandHysteresis {
    sync_window: Duration,
    master_window: Duration,
    /// Last sync command per player
    sync_sent: DashMap<u8, Instant>,
    /// Last master command (only one player can be master)
    master_sent: Mutex<Option<Instant>>,
}

impl CommandHysteresis {
    pub fn new(sync_window: Duration, master_window: Duration) -> Self {
        Self {
            sync_window,
            master_window,
            sync_sent: DashMap::new(),
            master_sent: Mutex::new(None),
        }
    }

    pub fn record_sync(&self, device: u8) {
        self.record_sync_at(device, Instant::now());
    }

    pub fn record_sync_at(&self, device: u8, at: Instant) {
        self.sync_sent.insert(device, at);
    }

    pub fn record_master(&self) {
        self.record_master_at(Instant::now());
    }

    pub fn record_master_at(&self, at: Instant) {
        *self.master_sent.lock() = Some(at);
    }

    /// Should a sync discrepancy for `device` be ignored right now?
    pub fn sync_suppressed(&self, device: u8) -> bool {
        self.sync_suppressed_at(device, Instant::now())
    }

    pub fn sync_suppressed_at(&self, device: u8, now: Instant) -> bool {
        self.sync_sent
            .get(&device)
            .is_some_and(|sent| now.saturating_duration_since(*sent) < self.sync_window)
    }

    /// Should a master discrepancy be ignored right now?
    pub fn master_suppressed(&self) -> bool {
        self.master_suppressed_at(Instant::now())
    }

    pub fn master_suppressed_at(&self, now: Instant) -> bool {
        self.master_sent
            .lock()
            .is_some_and(|sent| now.saturating_duration_since(sent) < self.master_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hysteresis() -> CommandHysteresis {
        CommandHysteresis::new(Duration::from_millis(250), Duration::from_millis(300))
    }

    #[test]
    fn test_sync_window() {
        let h = hysteresis();
        let t = Instant::now();
        assert!(!h.sync_suppressed_at(1, t));

        h.record_sync_at(1, t);
        assert!(h.sync_suppressed_at(1, t));
        assert!(h.sync_suppressed_at(1, t + Duration::from_millis(249)));
        assert!(!h.sync_suppressed_at(1, t + Duration::from_millis(250)));
    }

    #[test]
    fn test_sync_window_is_per_device() {
        let h = hysteresis();
        let t = Instant::now();
        h.record_sync_at(1, t);
        assert!(!h.sync_suppressed_at(2, t));
    }

    #[test]
    fn test_newer_command_restarts_window() {
        let h = hysteresis();
        let t = Instant::now();
        h.record_sync_at(3, t);
        h.record_sync_at(3, t + Duration::from_millis(200));
        assert!(h.sync_suppressed_at(3, t + Duration::from_millis(400)));
        assert!(!h.sync_suppressed_at(3, t + Duration::from_millis(450)));
    }

    #[test]
    fn test_master_window() {
        let h = hysteresis();
        let t = Instant::now();
        assert!(!h.master_suppressed_at(t));

        h.record_master_at(t);
        assert!(h.master_suppressed_at(t + Duration::from_millis(299)));
        assert!(!h.master_suppressed_at(t + Duration::from_millis(300)));
    }

    #[test]
    fn test_now_based_checks() {
        let h = hysteresis();
        h.record_sync(4);
        h.record_master();
        assert!(h.sync_suppressed(4));
        assert!(h.master_suppressed());
    }
}
