//! End-to-end sessions against a fake Carabiner daemon

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

use link_sync_gw::{
    BridgeOptions, ConnectionStatus, Diagnostic, SimulatedNetwork, SyncBridge, SyncMode,
};

const WAIT: Duration = Duration::from_secs(3);

struct Daemon {
    listener: TcpListener,
    port: u16,
}

impl Daemon {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Accept the bridge and consume its `version` request
    async fn accept(&self) -> Peer {
        let (socket, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
        let (reader, writer) = socket.into_split();
        let mut peer = Peer {
            reader: BufReader::new(reader),
            writer,
        };
        assert_eq!(peer.line().await, "version");
        peer
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a command")
            .unwrap();
        line.trim_end().to_string()
    }

    /// Nothing arrives within `window`
    async fn quiet_for(&mut self, window: Duration) -> bool {
        let mut line = String::new();
        timeout(window, self.reader.read_line(&mut line)).await.is_err()
    }

    async fn write(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn status(&mut self, bpm: f64, peers: i64) {
        self.write(&format!(
            "status {{ :peers {} :bpm {:.6} :start 73743731220 :beat 597.79 }}\n",
            peers, bpm
        ))
        .await;
    }
}

struct Observed {
    statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

fn bridge_on(port: u16) -> (SyncBridge, Arc<SimulatedNetwork>, Observed) {
    let options = BridgeOptions {
        port,
        read_timeout: Duration::from_millis(200),
        ..BridgeOptions::default()
    };
    let network = Arc::new(SimulatedNetwork::new(5, 120.0));
    let bridge = SyncBridge::new(options, network.clone());

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let diagnostics = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    bridge.subscribe_connection_status(Arc::new(move |s| sink.lock().push(s)));
    let sink = Arc::clone(&diagnostics);
    bridge.subscribe_diagnostics(Arc::new(move |d| sink.lock().push(d)));

    (
        bridge,
        network,
        Observed {
            statuses,
            diagnostics,
        },
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_connect_and_receive_status() {
    let daemon = Daemon::start().await;
    let (bridge, _net, observed) = bridge_on(daemon.port);

    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;
    peer.status(120.0, 1).await;

    wait_until(|| bridge.link_bpm() == Some(120.0)).await;
    assert_eq!(bridge.link_peers(), Some(1));

    // The watchdog must leave a live session alone
    sleep(Duration::from_millis(1200)).await;
    assert!(bridge.is_connected());
    assert!(observed.diagnostics.lock().is_empty());
    assert_eq!(
        *observed.statuses.lock(),
        vec![ConnectionStatus::Connected { port: daemon.port }]
    );
}

#[tokio::test]
async fn test_silent_daemon_is_rejected() {
    let daemon = Daemon::start().await;
    let (bridge, _net, observed) = bridge_on(daemon.port);

    assert!(bridge.connect().await);
    let _peer = daemon.accept().await;

    sleep(Duration::from_millis(1500)).await;
    assert!(!bridge.is_connected());
    assert_eq!(
        *observed.diagnostics.lock(),
        vec![Diagnostic::Rejected { port: daemon.port }]
    );
    assert_eq!(
        observed.statuses.lock().last(),
        Some(&ConnectionStatus::Disconnected)
    );
}

#[tokio::test]
async fn test_tempo_lock_is_silent_once_matched() {
    let daemon = Daemon::start().await;
    let (bridge, _net, _observed) = bridge_on(daemon.port);
    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;

    bridge.lock_tempo(128.0).unwrap();
    assert_eq!(peer.line().await, "bpm 128");

    peer.status(128.0, 1).await;
    assert!(peer.quiet_for(Duration::from_millis(300)).await);

    // Another peer drags the tempo away: exactly one correction per status
    peer.status(121.5, 2).await;
    assert_eq!(peer.line().await, "bpm 128");
    assert!(peer.quiet_for(Duration::from_millis(300)).await);

    assert!(bridge.lock_tempo(999.0).is_err());
    assert_eq!(bridge.target_bpm(), Some(128.0));
}

#[tokio::test]
async fn test_batched_and_fragmented_delivery() {
    let daemon = Daemon::start().await;
    let (bridge, _net, _observed) = bridge_on(daemon.port);
    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;

    peer.write("status { :peers 1 :bpm 100.0 }\nstatus { :peers 3 :bpm 101.0 }\n")
        .await;
    wait_until(|| bridge.link_peers() == Some(3)).await;
    assert_eq!(bridge.link_bpm(), Some(101.0));

    peer.write("status { :peers 4 :bp").await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.link_peers(), Some(3));
    peer.write("m 102.5 }\n").await;
    wait_until(|| bridge.link_peers() == Some(4)).await;
    assert_eq!(bridge.link_bpm(), Some(102.5));
}

#[tokio::test]
async fn test_beat_alignment_round_trip() {
    let daemon = Daemon::start().await;
    let (bridge, _net, _observed) = bridge_on(daemon.port);
    bridge.set_latency(0);
    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;
    peer.status(120.0, 1).await;
    wait_until(|| bridge.link_bpm().is_some()).await;

    bridge.request_beat_alignment(5_000_000, None).unwrap();
    assert_eq!(peer.line().await, "beat-at-time 5000000 4.0");

    peer.write("beat-at-time { :when 5000000 :quantum 4.0 :beat 4.02 }\n")
        .await;
    assert_eq!(peer.line().await, "force-beat-at-time 4 5000000 4.0");

    peer.write("beat-at-time { :when 5000000 :quantum 4.0 :beat 8.005 }\n")
        .await;
    assert!(peer.quiet_for(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_unexpected_close() {
    let daemon = Daemon::start().await;
    let (bridge, _net, observed) = bridge_on(daemon.port);
    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;
    peer.status(120.0, 1).await;
    wait_until(|| bridge.link_bpm().is_some()).await;

    drop(peer);
    wait_until(|| !bridge.is_connected()).await;
    assert_eq!(
        *observed.diagnostics.lock(),
        vec![Diagnostic::UnexpectedDisconnect]
    );
    assert_eq!(bridge.link_bpm(), None);
    assert_eq!(bridge.sync_mode(), SyncMode::Off);
}

#[tokio::test]
async fn test_old_connection_cannot_touch_new_one() {
    let daemon = Daemon::start().await;
    let (bridge, _net, observed) = bridge_on(daemon.port);

    assert!(bridge.connect().await);
    let mut old_peer = daemon.accept().await;
    bridge.disconnect();

    assert!(bridge.connect().await);
    let mut new_peer = daemon.accept().await;
    new_peer.status(120.0, 1).await;
    wait_until(|| bridge.link_bpm() == Some(120.0)).await;

    // Late traffic on the superseded socket; the bridge may already have closed it
    let late = "status { :peers 7 :bpm 99.0 }\nunsupported force-beat-at-time\n";
    let _ = old_peer.writer.write_all(late.as_bytes()).await;
    drop(old_peer);
    sleep(Duration::from_millis(400)).await;

    assert!(bridge.is_connected());
    assert_eq!(bridge.link_bpm(), Some(120.0));
    assert_eq!(bridge.link_peers(), Some(1));
    assert!(observed.diagnostics.lock().is_empty());
}

#[tokio::test]
async fn test_sync_mode_over_live_connection() {
    let daemon = Daemon::start().await;
    let (bridge, net, observed) = bridge_on(daemon.port);
    assert!(bridge.connect().await);
    let mut peer = daemon.accept().await;
    peer.status(120.0, 1).await;
    wait_until(|| bridge.link_bpm().is_some()).await;

    net.set_sending_status(false);
    assert_eq!(bridge.set_sync_mode(SyncMode::Full).unwrap(), SyncMode::Passive);
    assert!(matches!(
        observed.diagnostics.lock().as_slice(),
        [Diagnostic::SyncModeDegraded { .. }]
    ));

    net.set_external_master(2, 126.0);
    bridge.set_link_sync(true).unwrap();
    assert_eq!(peer.line().await, "bpm 126");

    bridge.disconnect();
    assert_eq!(bridge.sync_mode(), SyncMode::Off);
    assert_eq!(bridge.target_bpm(), None);
}
