//! In-process stand-in for a Pro DJ Link network
//!
//! Models one virtual player with a running timeline plus any number of other
//! players whose flags are set by hand. Used by the binary when no real network
//! library is wired in, and by the tests to observe what the bridge asks of the
//! network.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{DeviceNetwork, DeviceState, LocalEvent, TimelineSnapshot};

/// A call the bridge made into the network, recorded for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCall {
    SetTempo(f64),
    BecomeMaster,
    SetPlaying(bool),
    AdjustPosition(i64),
    SyncCommand { device: u8, synced: bool },
    MasterCommand(u8),
}

struct SimState {
    online: bool,
    sending_status: bool,
    device_number: u8,
    tempo: f64,
    tempo_master: bool,
    synced: bool,
    playing: bool,
    /// Timeline position (beats) at `anchor_us`
    anchor_beat: f64,
    anchor_us: i64,
    frozen_clock_us: Option<i64>,
    snapshot_override: Option<TimelineSnapshot>,
    /// Tempo of a master other than the virtual player
    external_master_tempo: Option<f64>,
    others: BTreeMap<u8, DeviceState>,
}

/// Simulated DJ Link network
pub struct SimulatedNetwork {
    started: Instant,
    state: Mutex<SimState>,
    calls: Mutex<Vec<NetworkCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<LocalEvent>>>,
}

impl SimulatedNetwork {
    /// Create an online network whose virtual player uses `device_number`
    pub fn new(device_number: u8, tempo: f64) -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(SimState {
                online: true,
                sending_status: true,
                device_number,
                tempo,
                tempo_master: false,
                synced: false,
                playing: false,
                anchor_beat: 0.0,
                anchor_us: 0,
                frozen_clock_us: None,
                snapshot_override: None,
                external_master_tempo: None,
                others: BTreeMap::new(),
            }),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    /// Receive the network's notifications; replaces any previous subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LocalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    /// Deliver a notification to the subscriber, if any
    pub fn emit(&self, event: LocalEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    pub fn set_sending_status(&self, sending: bool) {
        self.state.lock().sending_status = sending;
    }

    /// Freeze the clock at `micros` (None resumes real time)
    pub fn freeze_clock(&self, micros: Option<i64>) {
        self.state.lock().frozen_clock_us = micros;
    }

    /// Report a fixed timeline snapshot instead of the running one
    pub fn override_snapshot(&self, snapshot: Option<TimelineSnapshot>) {
        self.state.lock().snapshot_override = snapshot;
    }

    /// Add or update another player's live flags
    pub fn set_device(&self, device: DeviceState) {
        let mut state = self.state.lock();
        if device.number == state.device_number {
            state.synced = device.synced;
            state.tempo_master = device.tempo_master;
        } else {
            state.others.insert(device.number, device);
        }
    }

    /// Make another player tempo master at `bpm`, announcing the tempo change
    pub fn set_external_master(&self, device: u8, bpm: f64) {
        {
            let mut state = self.state.lock();
            state.tempo_master = false;
            for other in state.others.values_mut() {
                other.tempo_master = other.number == device;
            }
            state.others.entry(device).or_insert(DeviceState {
                number: device,
                synced: false,
                tempo_master: true,
            });
            state.external_master_tempo = Some(bpm);
        }
        self.emit(LocalEvent::MasterTempoChanged { bpm });
    }

    pub fn tempo(&self) -> f64 {
        self.state.lock().tempo
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Calls recorded so far
    pub fn calls(&self) -> Vec<NetworkCall> {
        self.calls.lock().clone()
    }

    /// Drain the recorded calls
    pub fn take_calls(&self) -> Vec<NetworkCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: NetworkCall) {
        trace!(?call, "Simulated network call");
        self.calls.lock().push(call);
    }

    fn clock_us(&self, state: &SimState) -> i64 {
        state
            .frozen_clock_us
            .unwrap_or_else(|| self.started.elapsed().as_micros() as i64)
    }

    fn beat_at(state: &SimState, now_us: i64) -> f64 {
        if state.playing {
            let elapsed_minutes = (now_us - state.anchor_us) as f64 / 60_000_000.0;
            state.anchor_beat + elapsed_minutes * state.tempo
        } else {
            state.anchor_beat
        }
    }

    /// Move the anchor to now so tempo or transport changes don't jump the timeline
    fn reanchor(&self, state: &mut SimState) {
        let now = self.clock_us(state);
        state.anchor_beat = Self::beat_at(state, now);
        state.anchor_us = now;
    }

    /// Emit beat notifications from whoever is tempo master until the task is aborted
    pub fn spawn_metronome(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut beat_in_bar: u8 = 1;
            loop {
                let (interval_ms, master) = {
                    let state = self.state.lock();
                    if state.tempo_master && state.playing {
                        (60_000.0 / state.tempo, Some(state.device_number))
                    } else {
                        let external = state
                            .others
                            .values()
                            .find(|d| d.tempo_master)
                            .map(|d| d.number);
                        let tempo = state.external_master_tempo.unwrap_or(state.tempo);
                        (60_000.0 / tempo, external)
                    }
                };

                tokio::time::sleep(Duration::from_secs_f64(interval_ms / 1000.0)).await;

                if let Some(device) = master {
                    let timestamp_us = self.now_micros();
                    debug!(device, beat_in_bar, "Simulated beat");
                    self.emit(LocalEvent::Beat {
                        device,
                        timestamp_us,
                        beat_within_bar: beat_in_bar,
                        from_master: true,
                    });
                    beat_in_bar = beat_in_bar % 4 + 1;
                }
            }
        })
    }
}

impl DeviceNetwork for SimulatedNetwork {
    fn is_online(&self) -> bool {
        self.state.lock().online
    }

    fn device_number(&self) -> u8 {
        self.state.lock().device_number
    }

    fn is_tempo_master(&self) -> bool {
        self.state.lock().tempo_master
    }

    fn is_sending_status(&self) -> bool {
        self.state.lock().sending_status
    }

    fn master_tempo(&self) -> Option<f64> {
        let state = self.state.lock();
        if state.tempo_master {
            Some(state.tempo)
        } else {
            state.external_master_tempo
        }
    }

    fn now_micros(&self) -> i64 {
        let state = self.state.lock();
        self.clock_us(&state)
    }

    fn timeline_snapshot(&self) -> TimelineSnapshot {
        let state = self.state.lock();
        if let Some(snapshot) = state.snapshot_override {
            return snapshot;
        }
        let beat = Self::beat_at(&state, self.clock_us(&state));
        TimelineSnapshot::at_beat(beat, state.tempo)
    }

    fn devices(&self) -> Vec<DeviceState> {
        let state = self.state.lock();
        let mut devices = vec![DeviceState {
            number: state.device_number,
            synced: state.synced,
            tempo_master: state.tempo_master,
        }];
        devices.extend(state.others.values().copied());
        devices
    }

    fn set_tempo(&self, bpm: f64) {
        self.record(NetworkCall::SetTempo(bpm));
        let mut state = self.state.lock();
        self.reanchor(&mut state);
        state.tempo = bpm;
    }

    fn become_tempo_master(&self) -> Result<()> {
        self.record(NetworkCall::BecomeMaster);
        let mut state = self.state.lock();
        if !state.sending_status {
            bail!("the virtual player must send status packets to become tempo master");
        }
        state.tempo_master = true;
        state.external_master_tempo = None;
        for other in state.others.values_mut() {
            other.tempo_master = false;
        }
        Ok(())
    }

    fn set_playing(&self, playing: bool) {
        self.record(NetworkCall::SetPlaying(playing));
        let mut state = self.state.lock();
        self.reanchor(&mut state);
        state.playing = playing;
    }

    fn adjust_playback_position(&self, ms: i64) {
        self.record(NetworkCall::AdjustPosition(ms));
        let mut state = self.state.lock();
        self.reanchor(&mut state);
        state.anchor_beat += ms as f64 * state.tempo / 60_000.0;
    }

    fn send_sync_command(&self, device: u8, synced: bool) -> Result<()> {
        self.record(NetworkCall::SyncCommand { device, synced });
        let mut state = self.state.lock();
        if device == state.device_number {
            state.synced = synced;
        } else if let Some(other) = state.others.get_mut(&device) {
            other.synced = synced;
        } else {
            bail!("no player {} on the network", device);
        }
        Ok(())
    }

    fn send_master_command(&self, device: u8) -> Result<()> {
        self.record(NetworkCall::MasterCommand(device));
        let mut state = self.state.lock();
        if device != state.device_number && !state.others.contains_key(&device) {
            bail!("no player {} on the network", device);
        }
        state.tempo_master = device == state.device_number;
        for other in state.others.values_mut() {
            other.tempo_master = other.number == device;
        }
        Ok(())
    }
}
