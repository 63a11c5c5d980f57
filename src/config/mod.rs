//! Configuration management for the Link sync gateway
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.
//! Every field has a default, so an empty file is a valid configuration.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::bridge::BridgeOptions;
use crate::sync::{valid_tempo, SyncMode};

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub carabiner: CarabinerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Carabiner daemon connection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CarabinerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Delay between DJ Link beat packets and the actual beat, in ms
    #[serde(default = "default_latency_ms")]
    pub latency_ms: i64,
    #[serde(default)]
    pub align_to_bar: bool,
    /// Connect as soon as the gateway starts
    #[serde(default)]
    pub auto_connect: bool,
}

/// Synchronization behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Mode requested once connected
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_phase_probe_every")]
    pub phase_probe_every: u64,
    #[serde(default = "default_sync_hysteresis_ms")]
    pub sync_hysteresis_ms: u64,
    #[serde(default = "default_master_hysteresis_ms")]
    pub master_hysteresis_ms: u64,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

/// Simulated DJ Link network
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_device_number")]
    pub device_number: u8,
    #[serde(default = "default_initial_bpm")]
    pub initial_bpm: f64,
}

impl Default for CarabinerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            latency_ms: default_latency_ms(),
            align_to_bar: false,
            auto_connect: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Off,
            poll_interval_ms: default_poll_interval_ms(),
            phase_probe_every: default_phase_probe_every(),
            sync_hysteresis_ms: default_sync_hysteresis_ms(),
            master_hysteresis_ms: default_master_hysteresis_ms(),
            watchdog_ms: default_watchdog_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_number: default_device_number(),
            initial_bpm: default_initial_bpm(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to load config: {}", path))?;
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn parse(contents: &str) -> Result<Self> {
        // serde_yaml rejects an empty document; treat it as all defaults
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.carabiner.port == 0 {
            anyhow::bail!("carabiner.port cannot be 0");
        }
        if self.carabiner.host.is_empty() {
            anyhow::bail!("carabiner.host cannot be empty");
        }
        if self.sync.poll_interval_ms == 0 {
            anyhow::bail!("sync.poll_interval_ms must be greater than 0");
        }
        if self.sync.phase_probe_every == 0 {
            anyhow::bail!("sync.phase_probe_every must be at least 1");
        }
        if !valid_tempo(self.network.initial_bpm) {
            anyhow::bail!(
                "network.initial_bpm {} is outside the supported range (20, 999)",
                self.network.initial_bpm
            );
        }
        Ok(())
    }

    /// Bridge settings described by this configuration
    pub fn to_bridge_options(&self) -> BridgeOptions {
        let carabiner = &self.carabiner;
        let sync = &self.sync;
        BridgeOptions {
            host: carabiner.host.clone(),
            port: carabiner.port,
            connect_timeout: Duration::from_millis(carabiner.connect_timeout_ms),
            read_timeout: Duration::from_millis(carabiner.read_timeout_ms),
            watchdog: Duration::from_millis(sync.watchdog_ms),
            latency_ms: carabiner.latency_ms,
            align_to_bar: carabiner.align_to_bar,
            poll_interval: Duration::from_millis(sync.poll_interval_ms),
            phase_probe_every: sync.phase_probe_every,
            sync_hysteresis: Duration::from_millis(sync.sync_hysteresis_ms),
            master_hysteresis: Duration::from_millis(sync.master_hysteresis_ms),
            ..BridgeOptions::default()
        }
    }
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 17000 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_read_timeout_ms() -> u64 { 2000 }
fn default_latency_ms() -> i64 { 1 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_phase_probe_every() -> u64 { 2 }
fn default_sync_hysteresis_ms() -> u64 { 250 }
fn default_master_hysteresis_ms() -> u64 { 300 }
fn default_watchdog_ms() -> u64 { 1000 }
fn default_device_number() -> u8 { 5 }
fn default_initial_bpm() -> f64 { 120.0 }
