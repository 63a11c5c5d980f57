//! Tempo reconciliation
//!
//! While Link follows DJ Link, `target_bpm` holds the tempo we force on the Link
//! session. While the virtual player is master, the Link tempo is copied onto
//! the virtual player instead.

use tracing::{debug, info, warn};

use crate::bridge::SyncBridge;
use crate::carabiner::Command;
use crate::error::{BridgeError, Result};

/// Lowest and highest tempo Ableton Link accepts (exclusive)
pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 999.0;

/// Differences below this are floating point noise, not tempo changes
const TEMPO_EPSILON: f64 = 0.00001;

/// Can `bpm` be used as a Link session tempo?
pub fn valid_tempo(bpm: f64) -> bool {
    bpm > MIN_TEMPO && bpm < MAX_TEMPO
}

/// What reconciliation should do for a given state
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TempoAction {
    /// Send `bpm` to Carabiner
    ForceLink(f64),
    /// Set the virtual player's tempo
    FollowLink(f64),
    Nothing,
}

pub(crate) fn tempo_action(
    target_bpm: Option<f64>,
    link_bpm: Option<f64>,
    virtual_is_master: bool,
) -> TempoAction {
    let link_bpm = link_bpm.unwrap_or(0.0);
    match target_bpm {
        Some(target) if (link_bpm - target).abs() > TEMPO_EPSILON => TempoAction::ForceLink(target),
        _ if virtual_is_master && link_bpm > 0.0 => TempoAction::FollowLink(link_bpm),
        _ => TempoAction::Nothing,
    }
}

impl SyncBridge {
    /// Bring the two tempos back in line
    pub fn reconcile_tempo(&self) {
        self.reconcile_tempo_for(None);
    }

    pub(crate) fn reconcile_tempo_for(&self, generation: Option<u64>) {
        let (target, link) = {
            let state = self.inner.state.lock();
            (state.target_bpm, state.link_bpm)
        };
        let virtual_is_master = self.network().is_tempo_master();

        match tempo_action(target, link, virtual_is_master) {
            TempoAction::ForceLink(bpm) => {
                if let Err(e) = self.send_checked(generation, Command::Bpm(bpm)) {
                    debug!("Could not force Link tempo: {}", e);
                }
            },
            TempoAction::FollowLink(bpm) => {
                debug!("Virtual player following Link tempo {:.3}", bpm);
                self.network().set_tempo(bpm);
            },
            TempoAction::Nothing => {},
        }
    }

    /// Force the Link session to `bpm`
    pub fn lock_tempo(&self, bpm: f64) -> Result<()> {
        if !valid_tempo(bpm) {
            return Err(BridgeError::InvalidTempo(bpm));
        }
        self.inner.state.lock().target_bpm = Some(bpm);
        debug!("Locking Link tempo to {:.3}", bpm);
        self.reconcile_tempo();
        Ok(())
    }

    /// Stop forcing the Link tempo
    pub fn unlock_tempo(&self) {
        self.inner.state.lock().target_bpm = None;
        self.reconcile_tempo();
    }

    pub(crate) fn handle_status(&self, generation: u64, bpm: f64, peers: i64) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_current(generation) {
                return;
            }
            if state.link_bpm.is_none() {
                info!("Link session at {:.3} BPM with {} peers", bpm, peers);
            }
            state.link_bpm = Some(bpm);
            state.link_peers = Some(peers);
        }
        if !valid_tempo(bpm) {
            warn!("Carabiner reported unusable tempo {}", bpm);
        }
        self.reconcile_tempo_for(Some(generation));
    }
}
