//! Sync mode state machine and master handoff
//!
//! Two directions can be active, never both at once:
//!
//! - Link follows DJ Link (`following_network`): the network master's tempo is
//!   forced on the Link session and its beats drive beat alignment.
//! - DJ Link follows Link (`link_master`): the virtual player becomes tempo
//!   master and copies the Link tempo and phase onto the network.

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{valid_tempo, DeviceView, SyncMode};
use crate::bridge::SyncBridge;
use crate::carabiner::Command;
use crate::error::{BridgeError, Result};
use crate::network::LocalEvent;
use crate::status::Diagnostic;

impl SyncBridge {
    /// Switch sync mode, returning the mode actually granted
    ///
    /// `Full` degrades to `Passive` when the virtual player is not sending
    /// status packets. Any mode other than `Off` needs a Carabiner connection
    /// and an online virtual player.
    pub fn set_sync_mode(&self, requested: SyncMode) -> Result<SyncMode> {
        let granted = if requested == SyncMode::Off {
            SyncMode::Off
        } else {
            if !self.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            if !self.network().is_online() {
                self.force_sync_off();
                self.report(Diagnostic::SyncModeRejected {
                    requested,
                    reason: "the virtual player is not online".to_string(),
                });
                return Err(BridgeError::Offline);
            }
            if requested == SyncMode::Full && !self.network().is_sending_status() {
                self.report(Diagnostic::SyncModeDegraded {
                    requested,
                    granted: SyncMode::Passive,
                });
                SyncMode::Passive
            } else {
                requested
            }
        };

        let previous = std::mem::replace(&mut self.inner.state.lock().sync_mode, granted);
        if previous != granted {
            info!("🎚️ Sync mode {} → {}", previous, granted);
            self.apply_mode_change(previous, granted);
        }
        Ok(granted)
    }

    /// Drop to `Off` without any precondition checks
    pub(crate) fn force_sync_off(&self) {
        let previous = std::mem::replace(&mut self.inner.state.lock().sync_mode, SyncMode::Off);
        if previous != SyncMode::Off {
            self.leave_sync_mode(previous);
        }
    }

    /// Stop everything `previous` was doing; the mode is already `Off`
    pub(crate) fn leave_sync_mode(&self, previous: SyncMode) {
        self.apply_mode_change(previous, SyncMode::Off);
    }

    fn apply_mode_change(&self, previous: SyncMode, current: SyncMode) {
        let (link_sync, link_master) = {
            let state = self.inner.state.lock();
            (state.link_sync, state.link_master)
        };

        if link_master && current != SyncMode::Full {
            self.free_network(current);
        }
        if current == SyncMode::Off || (previous.is_bidirectional() && !current.is_bidirectional()) {
            self.free_link();
        }

        if current == SyncMode::Full && self.network().is_tempo_master() {
            if let Err(e) = self.tie_network_to_link() {
                warn!("Could not hand tempo master to Link: {}", e);
            }
        }
        if current.is_bidirectional() && link_sync && !self.inner.state.lock().link_master {
            self.tie_link_to_network();
        }
    }

    /// Should Link follow the DJ Link tempo master?
    ///
    /// Ignored for the tie itself while the virtual player is mastering for Link,
    /// but remembered so it resumes once that stops.
    pub fn set_link_sync(&self, on: bool) -> Result<()> {
        let link_master = {
            let mut state = self.inner.state.lock();
            if state.sync_mode == SyncMode::Off {
                return Err(BridgeError::SyncOff);
            }
            state.link_sync = on;
            state.link_master
        };

        if !on {
            self.free_link();
        } else if !link_master {
            self.tie_link_to_network();
        }
        Ok(())
    }

    /// Make the virtual player tempo master on behalf of Link, or stop
    pub fn set_link_master(&self, on: bool) -> Result<()> {
        let mode = self.sync_mode();
        if mode != SyncMode::Full {
            return Err(BridgeError::RequiresFullSync);
        }
        if on {
            self.tie_network_to_link()
        } else {
            self.free_network(mode);
            Ok(())
        }
    }

    fn tie_link_to_network(&self) {
        self.inner.state.lock().following_network = true;
        match self.network().master_tempo() {
            Some(bpm) if valid_tempo(bpm) => {
                debug!("Link following DJ Link master at {:.3} BPM", bpm);
                if let Err(e) = self.lock_tempo(bpm) {
                    debug!("Could not follow master tempo: {}", e);
                }
            },
            _ => self.unlock_tempo(),
        }
    }

    fn free_link(&self) {
        let was_following = std::mem::replace(&mut self.inner.state.lock().following_network, false);
        if was_following {
            debug!("Link no longer following DJ Link");
        }
        self.unlock_tempo();
    }

    /// Hand the DJ Link tempo master role to the virtual player, driven by Link
    fn tie_network_to_link(&self) -> Result<()> {
        self.free_link();
        let (link_bpm, generation) = {
            let mut state = self.inner.state.lock();
            state.link_master = true;
            (state.link_bpm, state.generation)
        };

        if let Err(e) = self.request_phase_alignment() {
            debug!("Could not probe Link phase: {}", e);
        }
        let network = self.network();
        if let Some(bpm) = link_bpm.filter(|bpm| valid_tempo(*bpm)) {
            network.set_tempo(bpm);
        }
        if let Err(e) = network
            .become_tempo_master()
            .context("becoming DJ Link tempo master")
        {
            self.inner.state.lock().link_master = false;
            return Err(e.into());
        }
        network.set_playing(true);
        info!("👑 Virtual player is tempo master, following Link");

        // The old master may have changed tempo mid-handoff; ask again
        self.refresh_status_later(generation);
        Ok(())
    }

    pub(crate) fn free_network(&self, mode: SyncMode) {
        let link_sync = {
            let mut state = self.inner.state.lock();
            state.link_master = false;
            state.pending_phase_probe = None;
            state.link_sync
        };
        self.network().set_playing(false);
        info!("Virtual player no longer mastering for Link");

        if link_sync && mode.is_bidirectional() {
            self.tie_link_to_network();
        }
    }

    fn refresh_status_later(&self, generation: u64) {
        let delay = self.inner.options.status_refresh_delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bridge = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = bridge.send_checked(Some(generation), Command::Status) {
                        debug!("Could not refresh Link status: {}", e);
                    }
                });
            },
            Err(_) => {
                if let Err(e) = self.send_checked(Some(generation), Command::Status) {
                    debug!("Could not refresh Link status: {}", e);
                }
            },
        }
    }

    /// React to a notification from the DJ Link network
    pub fn handle_local_event(&self, event: LocalEvent) {
        let (following, align_to_bar) = {
            let state = self.inner.state.lock();
            (state.following_network && !state.link_master, state.align_to_bar)
        };
        if !following {
            return;
        }

        match event {
            LocalEvent::MasterTempoChanged { bpm } if valid_tempo(bpm) => {
                if let Err(e) = self.lock_tempo(bpm) {
                    debug!("Could not follow master tempo: {}", e);
                }
            },
            LocalEvent::MasterTempoChanged { .. } => self.unlock_tempo(),
            LocalEvent::Beat {
                timestamp_us,
                beat_within_bar,
                from_master: true,
                ..
            } => {
                let hint = align_to_bar.then_some(beat_within_bar);
                if let Err(e) = self.request_beat_alignment(timestamp_us, hint) {
                    debug!("Could not align Link beat: {}", e);
                }
            },
            LocalEvent::Beat { .. } => {},
        }
    }

    /// Feed DJ Link notifications into the bridge until the channel closes
    pub fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<LocalEvent>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if bridge.is_shut_down() {
                    break;
                }
                bridge.handle_local_event(event);
            }
            debug!("DJ Link event pump stopped");
        })
    }

    /// Turn sync on or off for player `device`
    pub fn request_device_sync(&self, device: u8, on: bool) -> Result<()> {
        let network = self.network();
        if device == network.device_number() {
            return self.set_link_sync(on);
        }
        if !network.is_online() {
            return Err(BridgeError::Offline);
        }

        self.inner.hysteresis.record_sync(device);
        self.inner.views.lock().entry(device).or_default().synced = on;
        network
            .send_sync_command(device, on)
            .with_context(|| format!("sending sync {} to player {}", on, device))?;
        Ok(())
    }

    /// Ask player `device` to become tempo master
    pub fn request_device_master(&self, device: u8) -> Result<()> {
        let network = self.network();
        if device == network.device_number() {
            return self.set_link_master(true);
        }
        if !network.is_online() {
            return Err(BridgeError::Offline);
        }

        self.inner.hysteresis.record_master();
        {
            let mut views = self.inner.views.lock();
            for (number, view) in views.iter_mut() {
                view.master = *number == device;
            }
            views.entry(device).or_insert(DeviceView {
                synced: false,
                master: true,
            });
        }
        network
            .send_master_command(device)
            .with_context(|| format!("sending master to player {}", device))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::Harness;
    use crate::network::sim::NetworkCall;
    use crate::network::{DeviceNetwork, DeviceState};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn collect_diagnostics(h: &Harness) -> Arc<Mutex<Vec<Diagnostic>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.bridge
            .subscribe_diagnostics(Arc::new(move |d| sink.lock().push(d)));
        seen
    }

    #[test]
    fn test_off_needs_no_connection() {
        let h = Harness::connected();
        h.bridge.disconnect();
        assert_eq!(h.bridge.set_sync_mode(SyncMode::Off).unwrap(), SyncMode::Off);
    }

    #[test]
    fn test_modes_require_connection() {
        let h = Harness::connected();
        h.bridge.disconnect();
        assert!(matches!(
            h.bridge.set_sync_mode(SyncMode::Passive),
            Err(BridgeError::NotConnected)
        ));
        assert_eq!(h.bridge.sync_mode(), SyncMode::Off);
    }

    #[test]
    fn test_offline_device_rejects_mode() {
        let h = Harness::connected();
        let seen = collect_diagnostics(&h);
        h.bridge.set_sync_mode(SyncMode::Triggers).unwrap();

        h.net.set_online(false);
        assert!(matches!(
            h.bridge.set_sync_mode(SyncMode::Passive),
            Err(BridgeError::Offline)
        ));
        assert_eq!(h.bridge.sync_mode(), SyncMode::Off);
        assert!(matches!(
            seen.lock().as_slice(),
            [Diagnostic::SyncModeRejected {
                requested: SyncMode::Passive,
                ..
            }]
        ));
    }

    #[test]
    fn test_full_without_status_packets_degrades_to_passive() {
        for start in [SyncMode::Off, SyncMode::Triggers, SyncMode::Passive] {
            let h = Harness::connected();
            let seen = collect_diagnostics(&h);
            h.bridge.set_sync_mode(start).unwrap();
            h.net.set_sending_status(false);

            assert_eq!(h.bridge.set_sync_mode(SyncMode::Full).unwrap(), SyncMode::Passive);
            assert_eq!(h.bridge.sync_mode(), SyncMode::Passive);
            assert_eq!(
                *seen.lock(),
                vec![Diagnostic::SyncModeDegraded {
                    requested: SyncMode::Full,
                    granted: SyncMode::Passive,
                }]
            );
        }
    }

    #[test]
    fn test_link_sync_requires_mode() {
        let h = Harness::connected();
        assert!(matches!(h.bridge.set_link_sync(true), Err(BridgeError::SyncOff)));
        assert!(matches!(
            h.bridge.set_link_master(true),
            Err(BridgeError::RequiresFullSync)
        ));
    }

    #[test]
    fn test_link_sync_follows_network_master() {
        let mut h = Harness::connected();
        h.net.set_external_master(2, 126.0);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();

        assert_eq!(h.bridge.target_bpm(), Some(126.0));
        assert_eq!(h.sent(), vec!["bpm 126"]);

        h.bridge.set_link_sync(false).unwrap();
        assert_eq!(h.bridge.target_bpm(), None);
    }

    #[test]
    fn test_entering_passive_reties_link_sync() {
        let mut h = Harness::connected();
        h.net.set_external_master(2, 128.0);
        h.bridge.set_sync_mode(SyncMode::Triggers).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        h.bridge.set_sync_mode(SyncMode::Off).unwrap();
        assert_eq!(h.bridge.target_bpm(), None);
        h.sent();

        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        assert_eq!(h.bridge.target_bpm(), Some(128.0));
        assert_eq!(h.sent(), vec!["bpm 128"]);
    }

    #[tokio::test]
    async fn test_master_handoff() {
        let mut h = Harness::connected();
        h.status(124.0, 1);
        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        h.sent();
        h.net.take_calls();

        h.bridge.set_link_master(true).unwrap();
        assert!(h.bridge.state().link_master);
        assert!(h.net.is_tempo_master());
        assert!(h.net.is_playing());
        assert_eq!(
            h.net.take_calls(),
            vec![
                NetworkCall::SetTempo(124.0),
                NetworkCall::BecomeMaster,
                NetworkCall::SetPlaying(true),
            ]
        );
        let probe = h.sent();
        assert_eq!(probe.len(), 1);
        assert!(probe[0].starts_with("phase-at-time "));

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(h.sent(), vec!["status"]);

        h.bridge.set_link_master(false).unwrap();
        assert!(!h.bridge.state().link_master);
        assert!(!h.net.is_playing());
    }

    #[tokio::test]
    async fn test_entering_full_while_master_hands_off() {
        let h = Harness::connected();
        h.status(122.0, 1);
        h.net.become_tempo_master().unwrap();

        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        assert!(h.bridge.state().link_master);
        assert_eq!(h.net.tempo(), 122.0);
    }

    #[tokio::test]
    async fn test_entering_full_as_master_skips_link_tie() {
        let mut h = Harness::connected();
        h.status(122.0, 1);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        h.net.become_tempo_master().unwrap();
        h.sent();

        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        assert!(h.bridge.state().link_master);
        assert!(h.bridge.state().link_sync);
        assert_eq!(h.bridge.target_bpm(), None);
        assert!(!h.sent().iter().any(|line| line.starts_with("bpm")));
    }

    #[test]
    fn test_leaving_bidirectional_mode_keeps_link_sync_flag() {
        let mut h = Harness::connected();
        h.net.set_external_master(2, 126.0);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        assert_eq!(h.bridge.target_bpm(), Some(126.0));
        h.sent();

        h.bridge.set_sync_mode(SyncMode::Triggers).unwrap();
        assert!(h.bridge.state().link_sync);
        assert!(!h.bridge.inner.state.lock().following_network);
        assert_eq!(h.bridge.target_bpm(), None);

        h.bridge.handle_local_event(LocalEvent::MasterTempoChanged { bpm: 100.0 });
        assert_eq!(h.bridge.target_bpm(), None);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stopping_master_resumes_link_sync() {
        let mut h = Harness::connected();
        h.status(120.0, 1);
        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        h.bridge.set_link_master(true).unwrap();
        assert_eq!(h.bridge.target_bpm(), None);

        h.net.set_external_master(3, 130.0);
        h.sent();
        h.bridge.set_link_master(false).unwrap();
        assert_eq!(h.bridge.target_bpm(), Some(130.0));
        assert!(h.sent().contains(&"bpm 130".to_string()));
    }

    #[tokio::test]
    async fn test_handoff_failure_clears_master_flag() {
        let h = Harness::connected();
        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        h.net.set_sending_status(false);
        assert!(matches!(
            h.bridge.set_link_master(true),
            Err(BridgeError::Device(_))
        ));
        assert!(!h.bridge.state().link_master);
    }

    #[tokio::test]
    async fn test_leaving_full_stops_mastering() {
        let h = Harness::connected();
        h.status(120.0, 1);
        h.bridge.set_sync_mode(SyncMode::Full).unwrap();
        h.bridge.set_link_master(true).unwrap();

        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        assert!(!h.bridge.state().link_master);
        assert!(!h.net.is_playing());
    }

    #[test]
    fn test_disconnect_turns_everything_off() {
        let h = Harness::connected();
        h.net.set_external_master(2, 126.0);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();

        h.bridge.disconnect();
        let state = h.bridge.state();
        assert_eq!(state.sync_mode, SyncMode::Off);
        assert_eq!(state.target_bpm, None);
        assert!(!h.bridge.inner.state.lock().following_network);
    }

    #[test]
    fn test_local_events_only_act_while_following() {
        let mut h = Harness::connected();
        h.bridge.handle_local_event(LocalEvent::MasterTempoChanged { bpm: 100.0 });
        assert_eq!(h.bridge.target_bpm(), None);

        h.net.set_external_master(2, 126.0);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        h.sent();

        h.bridge.handle_local_event(LocalEvent::MasterTempoChanged { bpm: 100.0 });
        assert_eq!(h.bridge.target_bpm(), Some(100.0));
        h.bridge.handle_local_event(LocalEvent::MasterTempoChanged { bpm: 0.0 });
        assert_eq!(h.bridge.target_bpm(), None);
        assert_eq!(h.sent(), vec!["bpm 100"]);
    }

    #[test]
    fn test_master_beats_drive_beat_alignment() {
        let mut h = Harness::connected();
        h.bridge.set_latency(0);
        h.net.set_external_master(2, 126.0);
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.set_link_sync(true).unwrap();
        h.sent();

        let beat = |from_master| LocalEvent::Beat {
            device: 2,
            timestamp_us: 7_000,
            beat_within_bar: 3,
            from_master,
        };
        h.bridge.handle_local_event(beat(false));
        assert!(h.sent().is_empty());

        h.bridge.handle_local_event(beat(true));
        assert_eq!(h.sent(), vec!["beat-at-time 7000 4.0"]);
        assert_eq!(
            h.bridge.inner.state.lock().pending_beat_probe.unwrap().beat_within_bar,
            None
        );

        h.bridge.set_align_to_bar(true);
        h.bridge.handle_local_event(beat(true));
        assert_eq!(
            h.bridge.inner.state.lock().pending_beat_probe.unwrap().beat_within_bar,
            Some(3)
        );
    }

    #[test]
    fn test_device_commands_record_hysteresis() {
        let h = Harness::connected();
        h.net.set_device(DeviceState {
            number: 2,
            synced: false,
            tempo_master: false,
        });

        h.bridge.request_device_sync(2, true).unwrap();
        assert!(h.bridge.inner.hysteresis.sync_suppressed(2));
        assert!(h.bridge.device_views()[&2].synced);

        h.bridge.request_device_master(2).unwrap();
        assert!(h.bridge.inner.hysteresis.master_suppressed());
        assert!(h.bridge.device_views()[&2].master);
        assert_eq!(
            h.net.take_calls(),
            vec![
                NetworkCall::SyncCommand {
                    device: 2,
                    synced: true
                },
                NetworkCall::MasterCommand(2),
            ]
        );
    }

    #[test]
    fn test_device_command_to_unknown_player_fails() {
        let h = Harness::connected();
        assert!(matches!(
            h.bridge.request_device_sync(9, true),
            Err(BridgeError::Device(_))
        ));
    }

    #[test]
    fn test_virtual_player_commands_route_to_link() {
        let h = Harness::connected();
        assert!(matches!(
            h.bridge.request_device_sync(5, true),
            Err(BridgeError::SyncOff)
        ));
        h.bridge.set_sync_mode(SyncMode::Passive).unwrap();
        h.bridge.request_device_sync(5, true).unwrap();
        assert!(h.bridge.state().link_sync);
        assert!(matches!(
            h.bridge.request_device_master(5),
            Err(BridgeError::RequiresFullSync)
        ));
    }
}
