//! Periodic reconciliation
//!
//! Polls the DJ Link network on a fixed tick, keeps the per-player view in line
//! with live flags, reacts when the virtual player's own flags change under us,
//! and sends phase probes while the virtual player is mastering for Link.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::{DeviceView, SyncMode};
use crate::bridge::SyncBridge;
use crate::network::DeviceState;
use crate::status::Diagnostic;

impl SyncBridge {
    /// Run one reconciliation pass; `tick` counts passes since startup
    pub fn reconcile_tick(&self, tick: u64) {
        self.reconcile_tick_at(tick, Instant::now());
    }

    pub(crate) fn reconcile_tick_at(&self, tick: u64, now: Instant) {
        let network = self.network();
        if !network.is_online() {
            if self.sync_mode() != SyncMode::Off {
                self.force_sync_off();
                self.report(Diagnostic::WentOffline);
            }
            return;
        }

        let own = network.device_number();
        for device in network.devices() {
            self.reconcile_device(device, device.number == own, now);
        }

        let every = self.inner.options.phase_probe_every.max(1);
        if tick % every == 0 {
            let probing = {
                let state = self.inner.state.lock();
                state.sync_mode == SyncMode::Full && state.link_master
            };
            if probing {
                if let Err(e) = self.request_phase_alignment() {
                    debug!("Skipping phase probe: {}", e);
                }
            }
        }
    }

    fn reconcile_device(&self, live: DeviceState, is_own: bool, now: Instant) {
        let hysteresis = &self.inner.hysteresis;
        let (sync_changed, master_changed) = {
            let mut views = self.inner.views.lock();
            let view = views.entry(live.number).or_default();

            let sync_changed =
                view.synced != live.synced && !hysteresis.sync_suppressed_at(live.number, now);
            let master_changed =
                view.master != live.tempo_master && !hysteresis.master_suppressed_at(now);
            if sync_changed {
                view.synced = live.synced;
            }
            if master_changed {
                view.master = live.tempo_master;
            }
            (sync_changed, master_changed)
        };

        if sync_changed || master_changed {
            trace!(
                device = live.number,
                synced = live.synced,
                master = live.tempo_master,
                "Player flags changed"
            );
        }
        if !is_own {
            return;
        }

        let (mode, link_sync, link_master) = {
            let state = self.inner.state.lock();
            (state.sync_mode, state.link_sync, state.link_master)
        };

        // The view may already show the handoff if we asked for it ourselves
        if link_master && !live.tempo_master && !hysteresis.master_suppressed_at(now) {
            info!("Another player took tempo master from the virtual player");
            self.free_network(mode);
        }
        if sync_changed && mode != SyncMode::Off && link_sync != live.synced {
            if let Err(e) = self.set_link_sync(live.synced) {
                debug!("Could not follow virtual player sync flag: {}", e);
            }
        }
    }

    /// Player flags as last rendered by the reconciliation loop
    pub fn device_views(&self) -> BTreeMap<u8, DeviceView> {
        self.inner.views.lock().clone()
    }

    /// Start the periodic reconciliation task
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.inner.options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tick: u64 = 0;

            loop {
                ticker.tick().await;
                if bridge.is_shut_down() {
                    break;
                }
                tick = tick.wrapping_add(1);
                bridge.reconcile_tick(tick);
            }
            debug!("Reconciliation loop stopped");
        })
    }

    /// Stop background loops and close the connection
    pub fn shutdown(&self) {
        if !self.inner.shutdown_flag.swap(true, Ordering::SeqCst) {
            info!("Shutting down sync bridge");
        }
        self.disconnect();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.inner.shutdown_flag.load(Ordering::SeqCst)
    }
}
