//! Operator console
//!
//! A small line-oriented REPL that drives the bridge the way the GUI would:
//! connecting, locking tempo, switching sync modes and inspecting state.

use anyhow::{anyhow, bail, Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::str::FromStr;
use tokio::runtime::Handle;

use crate::bridge::SyncBridge;
use crate::sync::SyncMode;

/// A parsed console command
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Connect,
    Disconnect,
    Lock(f64),
    Unlock,
    Mode(SyncMode),
    Sync(bool),
    Master(bool),
    DeviceSync { device: u8, on: bool },
    DeviceMaster(u8),
    Latency(i64),
    Bar(bool),
    Status { json: bool },
    Help,
    Quit,
}

fn on_off(word: Option<&str>) -> Result<bool> {
    match word.map(str::to_ascii_lowercase).as_deref() {
        Some("on") | Some("true") | Some("yes") => Ok(true),
        Some("off") | Some("false") | Some("no") => Ok(false),
        Some(other) => bail!("expected on or off, got '{}'", other),
        None => bail!("expected on or off"),
    }
}

fn number<T: FromStr>(word: Option<&str>, what: &str) -> Result<T> {
    let word = word.ok_or_else(|| anyhow!("missing {}", what))?;
    word.parse()
        .map_err(|_| anyhow!("'{}' is not a valid {}", word, what))
}

impl FromStr for ReplCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "connect" => ReplCommand::Connect,
            "disconnect" => ReplCommand::Disconnect,
            "lock" => ReplCommand::Lock(number(words.next(), "tempo")?),
            "unlock" => ReplCommand::Unlock,
            "mode" => {
                let mode = words.next().ok_or_else(|| anyhow!("missing sync mode"))?;
                ReplCommand::Mode(mode.parse().map_err(|e: String| anyhow!(e))?)
            },
            "sync" => ReplCommand::Sync(on_off(words.next())?),
            "master" => ReplCommand::Master(on_off(words.next())?),
            "device-sync" => ReplCommand::DeviceSync {
                device: number(words.next(), "player number")?,
                on: on_off(words.next())?,
            },
            "device-master" => ReplCommand::DeviceMaster(number(words.next(), "player number")?),
            "latency" => ReplCommand::Latency(number(words.next(), "latency")?),
            "bar" => ReplCommand::Bar(on_off(words.next())?),
            "status" => match words.next() {
                None => ReplCommand::Status { json: false },
                Some("json") => ReplCommand::Status { json: true },
                Some(other) => bail!("unknown status format '{}'", other),
            },
            "help" | "?" => ReplCommand::Help,
            "quit" | "exit" => ReplCommand::Quit,
            other => bail!("unknown command '{}', try 'help'", other),
        };

        if let Some(extra) = words.next() {
            bail!("unexpected argument '{}'", extra);
        }
        Ok(command)
    }
}

const HELP: &[(&str, &str)] = &[
    ("connect", "connect to Carabiner"),
    ("disconnect", "close the Carabiner connection"),
    ("lock <bpm>", "force the Link tempo"),
    ("unlock", "stop forcing the Link tempo"),
    ("mode <off|triggers|passive|full>", "set the sync mode"),
    ("sync on|off", "Link follows the DJ Link master"),
    ("master on|off", "virtual player masters for Link (full mode)"),
    ("device-sync <n> on|off", "sync a player"),
    ("device-master <n>", "make a player tempo master"),
    ("latency <ms>", "DJ Link beat packet latency"),
    ("bar on|off", "align at bar level"),
    ("status [json]", "show bridge state"),
    ("quit", "exit"),
];

fn print_help() {
    println!("\n{}", "Commands:".bold());
    for (usage, description) in HELP {
        println!("  {:<36} {}", usage.cyan(), description);
    }
}

fn print_status(bridge: &SyncBridge, json: bool) -> Result<()> {
    let status = bridge.state();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("Failed to serialize status")?
        );
        return Ok(());
    }

    let connection = if status.connected {
        format!("connected on port {}", status.port).green()
    } else {
        format!("disconnected (port {})", status.port).red()
    };
    let bpm = |v: Option<f64>| v.map_or("-".to_string(), |b| format!("{:.2}", b));

    println!("  Carabiner:  {}", connection);
    println!(
        "  Link:       {} BPM, {} peers",
        bpm(status.link_bpm).yellow(),
        status
            .link_peers
            .map_or("-".to_string(), |p| p.to_string())
            .yellow()
    );
    println!("  Target:     {}", bpm(status.target_bpm).yellow());
    println!(
        "  Sync:       {} (link sync {}, link master {})",
        status.sync_mode.to_string().bold(),
        status.link_sync,
        status.link_master
    );
    println!(
        "  Alignment:  {}, latency {}ms",
        if status.align_to_bar { "bar" } else { "beat" },
        status.latency_ms
    );
    for (device, view) in bridge.device_views() {
        println!(
            "  Player {}:   {}{}",
            device,
            if view.synced { "synced".green() } else { "free".normal() },
            if view.master { ", master".bright_yellow() } else { "".normal() }
        );
    }
    Ok(())
}

/// Run one command; returns false when the console should exit
pub fn execute(bridge: &SyncBridge, runtime: &Handle, command: ReplCommand) -> Result<bool> {
    match command {
        ReplCommand::Connect => {
            if runtime.block_on(bridge.connect()) {
                println!("{}", "✅ Connected".green());
            }
        },
        ReplCommand::Disconnect => bridge.disconnect(),
        ReplCommand::Lock(bpm) => bridge.lock_tempo(bpm)?,
        ReplCommand::Unlock => bridge.unlock_tempo(),
        ReplCommand::Mode(mode) => {
            let granted = bridge.set_sync_mode(mode)?;
            println!("Sync mode {}", granted.to_string().bold());
        },
        ReplCommand::Sync(on) => bridge.set_link_sync(on)?,
        ReplCommand::Master(on) => bridge.set_link_master(on)?,
        ReplCommand::DeviceSync { device, on } => bridge.request_device_sync(device, on)?,
        ReplCommand::DeviceMaster(device) => bridge.request_device_master(device)?,
        ReplCommand::Latency(ms) => bridge.set_latency(ms),
        ReplCommand::Bar(on) => bridge.set_align_to_bar(on),
        ReplCommand::Status { json } => print_status(bridge, json)?,
        ReplCommand::Help => print_help(),
        ReplCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read and execute commands until `quit` or end of input
///
/// Blocks the calling thread; run it with `spawn_blocking`.
pub fn run_repl(bridge: SyncBridge, runtime: Handle) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", "Link Sync GW console, 'help' lists commands".bold().cyan());

    loop {
        match rl.readline("link> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                let result = line
                    .parse::<ReplCommand>()
                    .and_then(|command| execute(&bridge, &runtime, command));
                match result {
                    Ok(true) => {},
                    Ok(false) => break,
                    Err(e) => println!("{} {:#}", "error:".red().bold(), e),
                }
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
