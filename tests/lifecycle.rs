use async_trait::async_trait;
use jkbms_lib::clock::{Clock, ManualClock};
use jkbms_lib::config::{ConnectionParams, EngineConfig};
use jkbms_lib::manager::SessionManager;
use jkbms_lib::protocol::{encode_command, FRAME_LENGTH, FRAME_MARKER};
use jkbms_lib::reassembly::ReassemblyState;
use jkbms_lib::registry::MacAddress;
use jkbms_lib::session::{NotificationOutcome, SessionState};
use jkbms_lib::transport::{
    Discovered, NotificationSink, Result, Transport, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const BMS_A: &str = "c8:47:80:31:9b:02";
const BMS_B: &str = "c8:47:80:31:9b:03";

struct Script {
    advertised: Vec<Discovered>,
    failing_connects: usize,
    has_service: bool,
    has_characteristic: bool,
    scans: usize,
    connects: Vec<MacAddress>,
    disconnects: Vec<MacAddress>,
    writes: Vec<(MacAddress, Vec<u8>)>,
    sinks: HashMap<MacAddress, NotificationSink>,
    /// Frame pushed to this peer, in 20-byte chunks, on every write by another link.
    chatter: Option<(MacAddress, Vec<u8>)>,
    /// Peer reported as disconnected on the next write.
    drop_on_write: Option<MacAddress>,
}

#[derive(Clone)]
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    fn advertising(addresses: &[&str]) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                advertised: addresses.iter().map(|a| advert(a)).collect(),
                failing_connects: 0,
                has_service: true,
                has_characteristic: true,
                scans: 0,
                connects: Vec::new(),
                disconnects: Vec::new(),
                writes: Vec::new(),
                sinks: HashMap::new(),
                chatter: None,
                drop_on_write: None,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.lock().unwrap())
    }

    fn sink(&self, address: &str) -> NotificationSink {
        self.with(|s| s.sinks[&addr(address)].clone())
    }

    fn connects(&self) -> usize {
        self.with(|s| s.connects.len())
    }

    fn disconnects(&self) -> usize {
        self.with(|s| s.disconnects.len())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Link = MacAddress;

    async fn scan(&self, _duration: Duration) -> Result<Vec<Discovered>> {
        Ok(self.with(|s| {
            s.scans += 1;
            s.advertised.clone()
        }))
    }

    async fn connect(&self, address: MacAddress, _params: &ConnectionParams) -> Result<Self::Link> {
        self.with(|s| {
            s.connects.push(address);
            if s.failing_connects > 0 {
                s.failing_connects -= 1;
                return Err(TransportError::ConnectFailed("scripted".into()));
            }
            Ok(address)
        })
    }

    async fn find_service(&self, _link: &MacAddress, _service: Uuid) -> Result<bool> {
        Ok(self.with(|s| s.has_service))
    }

    async fn find_characteristic(
        &self,
        _link: &MacAddress,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<bool> {
        Ok(self.with(|s| s.has_characteristic))
    }

    async fn subscribe(
        &self,
        link: &MacAddress,
        _characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<()> {
        self.with(|s| s.sinks.insert(*link, sink));
        Ok(())
    }

    async fn write(&self, link: &MacAddress, _characteristic: Uuid, data: &[u8]) -> Result<()> {
        let (chatter, dropped) = self.with(|s| {
            s.writes.push((*link, data.to_vec()));
            let chatter = s
                .chatter
                .as_ref()
                .filter(|(peer, _)| peer != link)
                .map(|(peer, bytes)| (s.sinks[peer].clone(), bytes.clone()));
            let dropped = s.drop_on_write.take().map(|peer| s.sinks[&peer].clone());
            (chatter, dropped)
        });
        if let Some((sink, bytes)) = chatter {
            for chunk in bytes.chunks(20) {
                assert!(sink.deliver(chunk), "event queue overflowed");
            }
        }
        if let Some(sink) = dropped {
            assert!(sink.disconnected().await);
        }
        Ok(())
    }

    async fn disconnect(&self, link: &MacAddress) -> Result<()> {
        self.with(|s| s.disconnects.push(*link));
        Ok(())
    }
}

fn addr(address: &str) -> MacAddress {
    address.parse().unwrap()
}

fn advert(address: &str) -> Discovered {
    Discovered {
        address: addr(address),
        name: Some("JK-B2A24S15P".into()),
        rssi: Some(-67),
    }
}

fn frame(frame_type: u8, fields: &[(usize, &[u8])]) -> Vec<u8> {
    let mut buffer = vec![0u8; FRAME_LENGTH];
    buffer[..4].copy_from_slice(&FRAME_MARKER);
    buffer[4] = frame_type;
    for (offset, bytes) in fields {
        buffer[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }
    buffer
}

fn deliver_frame(sink: &NotificationSink, bytes: &[u8]) {
    for chunk in bytes.chunks(128) {
        assert!(sink.deliver(chunk));
    }
}

type Manager = SessionManager<ScriptedTransport, ManualClock>;

fn manager(devices: &[&str], config: EngineConfig) -> (Manager, ScriptedTransport, ManualClock) {
    let transport = ScriptedTransport::advertising(devices);
    let clock = ManualClock::new();
    let config = EngineConfig {
        devices: devices.iter().map(|d| d.to_string()).collect(),
        ..config
    };
    let manager = SessionManager::new(config, transport.clone(), clock.clone()).unwrap();
    (manager, transport, clock)
}

fn state(manager: &Manager, address: &str) -> SessionState {
    manager.session(&addr(address)).unwrap().state()
}

/// Scan on the first tick, connect on the second.
async fn connect_first(manager: &mut Manager) {
    manager.tick().await;
    manager.tick().await;
}

#[tokio::test]
async fn connects_and_sends_init_sequence() {
    let (mut manager, transport, clock) = manager(&[BMS_A], EngineConfig::default());

    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Armed);
    assert_eq!(transport.with(|s| s.scans), 1);

    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);
    assert_eq!(manager.gate().established(), 1);

    let registers: Vec<u8> = transport.with(|s| s.writes.iter().map(|(_, w)| w[4]).collect());
    assert_eq!(registers, vec![0x97, 0x96, 0x1D, 0x1E, 0x1F]);
    let writes = transport.with(|s| s.writes.clone());
    assert_eq!(writes[0].1, encode_command(0x97, 0, 0));
    assert_eq!(writes[2].1, encode_command(0x1D, 1, 4));

    // settle, one service lookup, then the paced init writes
    assert_eq!(clock.elapsed(), Duration::from_millis(100 + 500 + 1000 + 800 + 800 + 3 * 500));
}

#[tokio::test]
async fn stalled_session_times_out_with_one_disconnect() {
    let (mut manager, transport, clock) = manager(&[BMS_A], EngineConfig::default());
    connect_first(&mut manager).await;
    let sink = transport.sink(BMS_A);

    clock.advance(Duration::from_secs(20));
    assert!(sink.deliver(&FRAME_MARKER));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);

    transport.with(|s| s.advertised.clear());
    clock.advance(Duration::from_secs(24));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);

    clock.advance(Duration::from_secs(1));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(manager.gate().established(), 0);
    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.counters().timeouts, 1);

    clock.advance(Duration::from_secs(30));
    manager.tick().await;
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test]
async fn connection_cap_defers_without_consuming_attempts() {
    let config = EngineConfig {
        max_connections: 1,
        ..EngineConfig::default()
    };
    let (mut manager, transport, clock) = manager(&[BMS_A, BMS_B], config);
    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);
    assert_eq!(state(&manager, BMS_B), SessionState::Armed);

    for _ in 0..5 {
        clock.advance(Duration::from_secs(6));
        assert!(transport.sink(BMS_A).deliver(&FRAME_MARKER));
        manager.tick().await;
    }
    assert_eq!(state(&manager, BMS_B), SessionState::Armed);
    assert_eq!(transport.connects(), 1);

    // B gets the freed slot and still has every attempt available.
    transport.with(|s| s.failing_connects = 2);
    assert!(transport.sink(BMS_A).disconnected().await);
    clock.advance(Duration::from_secs(6));
    manager.tick().await;

    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(state(&manager, BMS_B), SessionState::Connected);
    let b_connects = transport.with(|s| s.connects.iter().filter(|a| **a == addr(BMS_B)).count());
    assert_eq!(b_connects, 3);
    assert_eq!(manager.gate().established(), 1);
}

#[tokio::test]
async fn exhausted_retries_return_to_unarmed() {
    let (mut manager, transport, clock) = manager(&[BMS_A], EngineConfig::default());
    transport.with(|s| s.failing_connects = usize::MAX);

    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(transport.connects(), 3);
    assert_eq!(transport.disconnects(), 0);
    assert_eq!(manager.gate().established(), 0);
    // settle plus 3s and 4s between the attempts
    assert_eq!(clock.elapsed(), Duration::from_millis(100 + 3000 + 4000));

    // rediscovered on the next scan
    clock.advance(Duration::from_secs(20));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_A), SessionState::Armed);
}

#[tokio::test]
async fn missing_service_disconnects() {
    let (mut manager, transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    transport.with(|s| s.has_service = false);

    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(manager.gate().established(), 0);
    assert!(transport.with(|s| s.writes.is_empty()));
}

#[tokio::test]
async fn missing_characteristic_disconnects() {
    let (mut manager, transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    transport.with(|s| s.has_characteristic = false);

    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(transport.disconnects(), 1);
    assert!(transport.with(|s| s.sinks.is_empty()));
}

#[tokio::test]
async fn notifications_update_snapshots() {
    let (mut manager, transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    connect_first(&mut manager).await;
    let sink = transport.sink(BMS_A);

    deliver_frame(&sink, &frame(0x03, &[(46, b"JK_B2A24S15P"), (86, b"3010542183")]));
    deliver_frame(
        &sink,
        &frame(0x02, &[(6, &[0xE4, 0x0C]), (150, &[0xD0, 0xCF, 0, 0]), (173, &[80])]),
    );
    manager.tick().await;

    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.device_info().unwrap().serial_number, "3010542183");
    let telemetry = session.telemetry().unwrap();
    assert_eq!(telemetry.remaining_percent, 80);
    assert!((telemetry.battery_voltage - 53.2).abs() < 1e-3);
    assert_eq!(session.echo_gate().remaining(), 10);

    // the echo burst is swallowed, the following frame decodes
    for _ in 0..10 {
        assert!(sink.deliver(&[0xAA, 0x55, 0x90, 0xEB, 0x96]));
    }
    deliver_frame(&sink, &frame(0x01, &[(114, &[16, 0, 0, 0])]));
    manager.tick().await;

    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.settings().unwrap().cell_count, 16);
    assert_eq!(session.counters().suppressed_notifications, 10);
    assert_eq!(session.counters().out_of_sync_chunks, 0);
    assert_eq!(session.counters().frames_decoded, 3);
}

#[tokio::test]
async fn unknown_frame_type_is_counted() {
    let (mut manager, _transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    connect_first(&mut manager).await;

    let bytes = frame(0x05, &[]);
    let outcomes: Vec<_> = bytes
        .chunks(150)
        .map(|chunk| {
            manager.handle_event(TransportEvent::Notification {
                address: addr(BMS_A),
                data: chunk.to_vec(),
            })
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            Some(NotificationOutcome::Pending),
            Some(NotificationOutcome::UnknownFrameType(0x05))
        ]
    );
    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.counters().unknown_frame_types, 1);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn transport_disconnect_resets_session() {
    let (mut manager, transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    connect_first(&mut manager).await;
    let sink = transport.sink(BMS_A);

    assert!(sink.deliver(&frame(0x02, &[])[..128]));
    manager.drain_events();
    assert_eq!(
        manager.session(&addr(BMS_A)).unwrap().reassembly_state(),
        ReassemblyState::Accumulating(128)
    );

    assert!(sink.disconnected().await);
    manager.drain_events();
    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.state(), SessionState::Unarmed);
    assert_eq!(session.reassembly_state(), ReassemblyState::Idle);
    assert_eq!(manager.gate().established(), 0);
    assert_eq!(transport.disconnects(), 0);

    let late = TransportEvent::Notification {
        address: addr(BMS_A),
        data: FRAME_MARKER.to_vec(),
    };
    assert_eq!(manager.handle_event(late), None);
}

#[tokio::test]
async fn register_writes_need_a_connection() {
    let (mut manager, transport, _clock) = manager(&[BMS_A, BMS_B], EngineConfig::default());
    assert_eq!(
        manager.write_register(addr(BMS_A), 0x1D, 0, 4).await,
        Err(TransportError::NotConnected)
    );
    assert_eq!(
        manager
            .write_register(addr("aa:bb:cc:dd:ee:ff"), 0x1D, 0, 4)
            .await,
        Err(TransportError::DeviceNotFound)
    );

    connect_first(&mut manager).await;
    manager.write_register(addr(BMS_A), 0x1D, 0, 4).await.unwrap();
    let last = transport.with(|s| s.writes.last().cloned()).unwrap();
    assert_eq!(last, (addr(BMS_A), encode_command(0x1D, 0, 4).to_vec()));
}

#[tokio::test]
async fn run_stops_on_shutdown_and_disconnects() {
    let config = EngineConfig {
        tick_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    };
    let (mut manager, transport, _clock) = manager(&[BMS_A], config);

    manager
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await;

    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(manager.gate().established(), 0);
}

#[tokio::test]
async fn other_sessions_keep_decoding_while_one_connects() {
    let config = EngineConfig {
        notification_queue: 16,
        ..EngineConfig::default()
    };
    let (mut manager, transport, clock) = manager(&[BMS_A, BMS_B], config);
    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);
    assert_eq!(state(&manager, BMS_B), SessionState::Armed);

    // every init write to B pushes a full settings frame from A
    let settings = frame(0x01, &[(114, &[16, 0, 0, 0])]);
    transport.with(|s| s.chatter = Some((addr(BMS_A), settings)));
    clock.advance(Duration::from_secs(5));
    manager.tick().await;

    assert_eq!(state(&manager, BMS_B), SessionState::Connected);
    let a = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(a.counters().frames_decoded, 5);
    assert_eq!(a.settings().unwrap().cell_count, 16);
    assert_eq!(a.state(), SessionState::Connected);
}

#[tokio::test]
async fn disconnect_of_other_session_applies_during_connect() {
    let (mut manager, transport, clock) = manager(&[BMS_A, BMS_B], EngineConfig::default());
    connect_first(&mut manager).await;
    assert_eq!(manager.gate().established(), 1);

    transport.with(|s| s.drop_on_write = Some(addr(BMS_A)));
    clock.advance(Duration::from_secs(5));
    manager.tick().await;

    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(state(&manager, BMS_B), SessionState::Connected);
    assert_eq!(manager.gate().established(), 1);
    assert_eq!(transport.disconnects(), 0);
}

#[tokio::test]
async fn link_lost_during_init_is_not_marked_connected() {
    let (mut manager, transport, _clock) = manager(&[BMS_A], EngineConfig::default());
    transport.with(|s| s.drop_on_write = Some(addr(BMS_A)));

    connect_first(&mut manager).await;
    let session = manager.session(&addr(BMS_A)).unwrap();
    assert_eq!(session.state(), SessionState::Unarmed);
    assert_eq!(session.counters().reconnects, 0);
    assert_eq!(manager.gate().established(), 0);
    // the remaining init writes are skipped once the link is gone
    assert_eq!(transport.with(|s| s.writes.len()), 1);
}

#[tokio::test]
async fn scans_wait_for_scan_interval() {
    let (mut manager, transport, clock) = manager(&[BMS_A], EngineConfig::default());
    transport.with(|s| s.advertised.clear());

    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 1);

    clock.advance(Duration::from_secs(19));
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 1);

    clock.advance(Duration::from_secs(1));
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 2);
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
}

#[tokio::test]
async fn scans_hold_off_after_connection_attempt() {
    let config = EngineConfig {
        scan_interval: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    let (mut manager, transport, clock) = manager(&[BMS_A], config);
    transport.with(|s| s.failing_connects = usize::MAX);

    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Unarmed);
    assert_eq!(manager.gate().last_attempt(), Some(clock.now()));
    assert_eq!(transport.with(|s| s.scans), 1);

    clock.advance(Duration::from_secs(9));
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 1);

    clock.advance(Duration::from_secs(1));
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 2);
    assert_eq!(state(&manager, BMS_A), SessionState::Armed);
}

#[tokio::test]
async fn no_scan_while_every_session_is_connected() {
    let (mut manager, transport, clock) = manager(&[BMS_A], EngineConfig::default());
    connect_first(&mut manager).await;
    let sink = transport.sink(BMS_A);

    for _ in 0..3 {
        clock.advance(Duration::from_secs(20));
        assert!(sink.deliver(&FRAME_MARKER));
        manager.tick().await;
    }
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);
    assert_eq!(transport.with(|s| s.scans), 1);

    assert!(sink.disconnected().await);
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 2);
    assert_eq!(state(&manager, BMS_A), SessionState::Armed);
}

#[tokio::test]
async fn connect_spacing_serialises_sessions() {
    let (mut manager, transport, clock) = manager(&[BMS_A, BMS_B], EngineConfig::default());
    connect_first(&mut manager).await;
    assert_eq!(state(&manager, BMS_A), SessionState::Connected);

    manager.tick().await;
    clock.advance(Duration::from_secs(4));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_B), SessionState::Armed);
    assert_eq!(transport.connects(), 1);

    clock.advance(Duration::from_secs(1));
    manager.tick().await;
    assert_eq!(state(&manager, BMS_B), SessionState::Connected);
    assert_eq!(
        transport.with(|s| s.connects.clone()),
        vec![addr(BMS_A), addr(BMS_B)]
    );
}

#[tokio::test]
async fn oversized_scan_duration_does_not_panic() {
    let config = EngineConfig {
        scan_duration: Duration::MAX,
        ..EngineConfig::default()
    };
    let (mut manager, transport, _clock) = manager(&[BMS_A], config);
    manager.tick().await;
    assert_eq!(transport.with(|s| s.scans), 1);
    assert_eq!(state(&manager, BMS_A), SessionState::Armed);
}

#[tokio::test]
async fn malformed_target_fails_setup() {
    let config = EngineConfig::with_devices(["c8:47:80:31:9b"]);
    let result = SessionManager::new(
        config,
        ScriptedTransport::advertising(&[]),
        ManualClock::new(),
    );
    assert!(result.is_err());
}
