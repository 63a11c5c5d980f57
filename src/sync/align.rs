//! Beat and phase alignment
//!
//! Beat alignment nudges the Link timeline so its beat numbers line up with
//! DJ Link beats (used while Link follows DJ Link). Phase alignment does the
//! opposite: it shifts the virtual player's timeline to match Link (used while
//! the virtual player is master on behalf of Link).
//!
//! Both work by probe and response: we ask Carabiner about a timestamp, remember
//! what we asked, and correct when the answer comes back.

use tracing::{debug, trace, warn};

use crate::bridge::SyncBridge;
use crate::carabiner::{BeatProbe, Command, PhaseProbe, BAR_QUANTUM};
use crate::error::{BridgeError, Result};
use crate::network::TimelineSnapshot;

/// Beat skew tolerated before forcing a correction; stays under beat packet jitter
pub const BEAT_SKEW_TOLERANCE: f64 = 0.0166;

/// Phase shifts larger than this fraction of a beat are applied even if they skip a beat
pub const FORCED_SHIFT_THRESHOLD: f64 = 0.2;

/// Allowance for the time it takes a forward shift to take effect
const SEND_LAG_BEATS: f64 = 0.1;

/// Beat number to force on Link for a `beat-at-time` answer, if it needs correcting
///
/// `beat_within_bar` (1-4) is the DJ Link bar position of the probed beat, when
/// aligning at bar level.
pub fn beat_correction(beat: f64, beat_within_bar: Option<u8>) -> Option<i64> {
    let raw_beat = beat.round() as i64;
    let skew = beat.rem_euclid(1.0);

    let candidate = match beat_within_bar {
        Some(position) => {
            let mut bar_skew = (i64::from(position) - 1) - raw_beat.rem_euclid(4);
            if bar_skew <= -2 {
                // Shorter to rotate forward across the bar line
                bar_skew += 4;
            }
            raw_beat + bar_skew
        },
        None => raw_beat,
    };
    let target = if candidate < 0 { candidate + 4 } else { candidate };

    (skew.abs() > BEAT_SKEW_TOLERANCE || target != raw_beat).then_some(target)
}

/// Signed shortest distance around the unit phase circle, in [-0.5, 0.5]
pub fn closest_delta(delta: f64) -> f64 {
    let wrapped = delta.rem_euclid(1.0);
    if wrapped > 0.5 {
        wrapped - 1.0
    } else {
        wrapped
    }
}

/// Timeline shift needed to match a `phase-at-time` answer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseCorrection {
    /// Milliseconds to move the virtual player's timeline (positive is forward)
    pub ms_delta: i64,
    /// The same shift in beats
    pub beat_delta: f64,
}

/// Compare Link's phase with the virtual player's snapshot
///
/// `link_phase` is Carabiner's phase for a 4-beat quantum, in [0, 4).
pub fn phase_correction(
    link_phase: f64,
    snapshot: &TimelineSnapshot,
    align_to_bar: bool,
) -> Option<PhaseCorrection> {
    let (desired, actual, interval) = if align_to_bar {
        (
            (link_phase / BAR_QUANTUM).rem_euclid(1.0),
            snapshot.bar_phase,
            snapshot.bar_interval_ms,
        )
    } else {
        (
            link_phase.rem_euclid(1.0),
            snapshot.beat_phase,
            snapshot.beat_interval_ms,
        )
    };

    let delta = closest_delta(desired - actual);
    let ms_delta = (delta * interval) as i64;
    if ms_delta == 0 {
        return None;
    }

    let beat_delta = if align_to_bar {
        delta * BAR_QUANTUM
    } else {
        delta
    };
    Some(PhaseCorrection {
        ms_delta,
        beat_delta,
    })
}

/// Apply a shift now, or wait for a moment where it won't skip or repeat a beat?
pub fn should_shift(current_beat_phase: f64, beat_delta: f64) -> bool {
    let lagged = if beat_delta > 0.0 {
        beat_delta + SEND_LAG_BEATS
    } else {
        beat_delta
    };
    let stays_in_beat = (current_beat_phase + lagged).floor() == 0.0;
    stays_in_beat || beat_delta.abs() > FORCED_SHIFT_THRESHOLD
}

impl SyncBridge {
    /// Ask Carabiner which Link beat falls at a DJ Link beat's timestamp
    pub fn request_beat_alignment(&self, at_time_us: i64, beat_within_bar: Option<u8>) -> Result<()> {
        let when = {
            let mut state = self.inner.state.lock();
            if !state.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            let when = at_time_us - state.latency_ms * 1000;
            state.pending_beat_probe = Some(BeatProbe {
                when,
                beat_within_bar,
            });
            when
        };
        self.send(Command::BeatAtTime {
            when,
            quantum: BAR_QUANTUM,
        })
    }

    pub(crate) fn handle_beat_at_time(&self, generation: u64, beat: f64, when: i64) {
        let beat_within_bar = {
            let state = self.inner.state.lock();
            if !state.is_current(generation) {
                return;
            }
            state
                .pending_beat_probe
                .filter(|probe| probe.when == when)
                .and_then(|probe| probe.beat_within_bar)
        };

        if let Some(target) = beat_correction(beat, beat_within_bar) {
            debug!("Link beat {:.4} at {}, forcing beat {}", beat, when, target);
            let command = Command::ForceBeatAtTime {
                beat: target,
                when,
                quantum: BAR_QUANTUM,
            };
            if let Err(e) = self.send_checked(Some(generation), command) {
                debug!("Could not force Link beat: {}", e);
            }
        }
    }

    /// Ask Carabiner for the Link phase a little ahead of now
    ///
    /// Only does anything while the virtual player is master on behalf of Link.
    pub fn request_phase_alignment(&self) -> Result<()> {
        let network = self.network();
        let now = network.now_micros();
        let snapshot = network.timeline_snapshot();

        let when = {
            let mut state = self.inner.state.lock();
            if !state.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            if !state.link_master {
                trace!("Skipping phase probe, virtual player is not mastering for Link");
                return Ok(());
            }
            let when = now + state.latency_ms * 1000;
            state.pending_phase_probe = Some(PhaseProbe { when, snapshot });
            when
        };
        self.send(Command::PhaseAtTime {
            when,
            quantum: BAR_QUANTUM,
        })
    }

    pub(crate) fn handle_phase_at_time(&self, generation: u64, phase: f64, when: i64) {
        let (probe, align_to_bar) = {
            let mut state = self.inner.state.lock();
            if !state.is_current(generation) || !state.link_master {
                return;
            }
            match state.pending_phase_probe {
                Some(probe) if probe.when == when => {
                    state.pending_phase_probe = None;
                    (probe, state.align_to_bar)
                },
                pending => {
                    warn!(
                        "Ignoring phase-at-time response for time {} since was expecting {:?}",
                        when,
                        pending.map(|p| p.when)
                    );
                    return;
                },
            }
        };

        let Some(correction) = phase_correction(phase, &probe.snapshot, align_to_bar) else {
            return;
        };
        let current_phase = self.network().timeline_snapshot().beat_phase;
        if should_shift(current_phase, correction.beat_delta) {
            debug!(
                "Shifting virtual player {}ms ({:.3} beats) to match Link",
                correction.ms_delta, correction.beat_delta
            );
            self.network().adjust_playback_position(correction.ms_delta);
        } else {
            trace!(
                "Deferring {:.3} beat shift until it won't skip a beat",
                correction.beat_delta
            );
        }
    }
}
