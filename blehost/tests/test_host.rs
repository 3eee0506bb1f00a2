mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use blehost::att::{AttErrorCode, Uuid};
use blehost::attribute::{AttributeTable, CharacteristicProp};
use blehost::gap::{GapState, HostEvent};
use blehost::hci::{opcodes, AdvertisingData, AdvertisingParameters, ConnectParameters, ScanParameters};
use blehost::l2cap::CID_ATT;
use blehost::types::{AddressType, BdAddr, ErrorCode};
use blehost::{BleError, GattServer, HciTransport, Host, HostConfig};
use parking_lot::Mutex;

use common::*;

const HANDLE: u16 = 0x0040;

fn config() -> HostConfig {
    HostConfig::default().with_poll_timeout(Duration::from_millis(20))
}

fn empty_server() -> GattServer {
    GattServer::new(AttributeTable::new())
}

fn wait_event<T, F>(host: &Host<T>, mut matches: F) -> Option<HostEvent>
where
    T: HciTransport,
    F: FnMut(&HostEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match host.next_event_timeout(remaining) {
            Some(event) if matches(&event) => return Some(event),
            Some(_) => continue,
            None => return None,
        }
    }
    None
}

/// Starts a host on `mock` and brings a peripheral connection up on [`HANDLE`].
fn connected_host(mock: &MockTransport, server: GattServer) -> Host<MockTransport> {
    init_logger();
    let host = Host::new(mock.clone(), config());
    host.start(server).unwrap();
    host.start_advertising(
        AdvertisingParameters::default(),
        AdvertisingData::from_slice(&[0x02, 0x01, 0x06]).unwrap(),
        None,
    )
    .unwrap();
    assert!(wait_for(|| mock
        .written_opcodes()
        .contains(&opcodes::LE_SET_ADVERTISE_ENABLE)));

    mock.inject(&le_connection_complete(HANDLE, 0x01, 0x00));
    let event = wait_event(&host, |e| matches!(e, HostEvent::Connected(_)));
    assert!(event.is_some());
    assert_eq!(host.gap_state(), GapState::Connected);
    host
}

#[test]
fn bring_up_configures_controller() {
    init_logger();
    let mock = MockTransport::new();
    let host = Host::new(mock.clone(), config());
    assert_eq!(host.gap_state(), GapState::Uninit);

    host.start(empty_server()).unwrap();
    assert_eq!(
        mock.written_opcodes(),
        vec![
            opcodes::RESET,
            opcodes::LE_READ_BUFFER_SIZE,
            opcodes::READ_BD_ADDR,
            opcodes::SET_EVENT_MASK,
            opcodes::LE_SET_EVENT_MASK
        ]
    );
    assert_eq!(host.gap_state(), GapState::Idle);
    assert_eq!(host.bd_addr(), Some(BdAddr::new(CONTROLLER_ADDR)));
    assert_eq!(host.acl_credits(), 12);
    assert_eq!(host.acl_max_len(), 27);
    assert_eq!(host.att_mtu(), 23);

    assert!(matches!(host.start(empty_server()), Err(BleError::AlreadyStarted)));
    host.stop();
}

#[test]
fn bring_up_uses_controller_buffer_size() {
    init_logger();
    let mock = MockTransport::with_buffer_size(251, 4);
    let host = Host::new(mock, config());
    host.start(empty_server()).unwrap();
    assert_eq!(host.acl_credits(), 4);
    assert_eq!(host.acl_max_len(), 251);
}

#[test]
fn bring_up_falls_back_when_controller_reports_no_buffers() {
    init_logger();
    let mock = MockTransport::with_buffer_size(0, 0);
    let host = Host::new(mock, config());
    host.start(empty_server()).unwrap();
    assert_eq!(host.acl_credits(), 12);
    assert_eq!(host.acl_max_len(), 27);
}

#[test]
fn bring_up_times_out_against_silent_controller() {
    init_logger();
    let host = Host::new(
        MockTransport::silent(),
        HostConfig::default()
            .with_poll_timeout(Duration::from_millis(10))
            .with_command_attempts(3),
    );
    let res = host.start(empty_server());
    assert!(matches!(res, Err(BleError::Timeout(opcodes::RESET))));
    assert_eq!(host.gap_state(), GapState::Uninit);

    host.stop();
    host.stop();
    assert!(matches!(host.start(empty_server()), Err(BleError::Closed)));
    assert!(matches!(host.next_event(), Err(BleError::Closed)));
}

#[test]
fn bring_up_reports_controller_errors() {
    init_logger();
    let mock = MockTransport::new();
    mock.fail_command(opcodes::LE_SET_EVENT_MASK, 0x12);
    let host = Host::new(mock, config());
    let res = host.start(empty_server());
    assert!(matches!(
        res,
        Err(BleError::CtrlErr(ErrorCode::InvalidHciCommandParameters))
    ));
}

#[test]
fn intents_are_checked_against_gap_state() {
    init_logger();
    let mock = MockTransport::new();
    let host = Host::new(mock.clone(), config());
    assert!(matches!(
        host.start_scanning(ScanParameters::default(), false),
        Err(BleError::InvalidState {
            state: GapState::Uninit,
            ..
        })
    ));

    host.start(empty_server()).unwrap();
    host.start_scanning(ScanParameters::default(), true).unwrap();
    assert_eq!(host.gap_state(), GapState::Scanning);
    assert!(matches!(
        host.start_advertising(AdvertisingParameters::default(), AdvertisingData::new(), None),
        Err(BleError::InvalidState {
            state: GapState::Scanning,
            ..
        })
    ));
    assert!(matches!(
        host.send_data(CID_ATT, &[0x01]),
        Err(BleError::NotConnected)
    ));

    host.stop_scanning().unwrap();
    assert_eq!(host.gap_state(), GapState::Idle);
    assert!(wait_for(|| {
        let ops = mock.written_opcodes();
        ops.iter()
            .filter(|op| **op == opcodes::LE_SET_SCAN_ENABLE)
            .count()
            == 2
    }));
}

#[test]
fn acl_credits_follow_completed_packets() {
    let mock = MockTransport::with_buffer_size(251, 12);
    let host = connected_host(&mock, empty_server());
    assert_eq!(host.acl_max_len(), 251);
    assert_eq!(host.acl_credits(), 12);

    host.send_data(CID_ATT, &[0x5a; 9]).unwrap();
    assert!(wait_for(|| host.acl_credits() == 11));
    let acl = mock.written_acl();
    assert_eq!(acl.len(), 1);
    assert_eq!(
        &acl[0][..9],
        &[0x02, 0x40, 0x00, 0x0d, 0x00, 0x09, 0x00, 0x04, 0x00]
    );

    // more than was in flight still raises the count
    mock.inject(&number_of_completed_packets(HANDLE, 5));
    assert!(wait_for(|| host.acl_credits() == 16));
}

#[test]
fn packet_completed_mid_write_is_not_credited_twice() {
    let mock = MockTransport::with_buffer_size(251, 12);
    mock.complete_acl_during_write(Duration::from_millis(100));
    let host = connected_host(&mock, empty_server());

    host.send_data(CID_ATT, &[0x5a; 9]).unwrap();
    assert!(wait_for(|| mock.written_acl().len() == 1));
    // let the stalled write return after its completion was counted
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(host.acl_credits(), 12);

    mock.inject(&disconnection_complete(HANDLE, 0x13));
    assert!(wait_event(&host, |e| matches!(e, HostEvent::Disconnected { .. })).is_some());
    assert!(host.acl_credits() <= 12);
    assert_eq!(host.acl_credits(), 12);
}

#[test]
fn long_sdus_are_fragmented() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());

    host.send_data(CID_ATT, &[0x11; 60]).unwrap();
    assert!(wait_for(|| mock.written_acl().len() == 3));
    let acl = mock.written_acl();
    assert_eq!(&acl[0][1..5], &[0x40, 0x00, 0x1b, 0x00]);
    assert_eq!(&acl[1][1..5], &[0x40, 0x10, 0x1b, 0x00]);
    assert_eq!(&acl[2][1..5], &[0x40, 0x10, 0x0a, 0x00]);
    assert!(wait_for(|| host.acl_credits() == 9));
}

#[test]
fn writes_block_without_credits() {
    init_logger();
    let mock = MockTransport::with_buffer_size(27, 1);
    let host = connected_host(&mock, empty_server());

    host.send_data(CID_ATT, &[0x01]).unwrap();
    host.send_data(CID_ATT, &[0x02]).unwrap();
    assert!(wait_for(|| mock.written_acl().len() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(mock.written_acl().len(), 1);

    mock.inject(&number_of_completed_packets(HANDLE, 1));
    assert!(wait_for(|| mock.written_acl().len() == 2));
}

#[test]
fn gatt_write_request_is_answered_over_acl() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let mut table = AttributeTable::new();
    let mut svc = table.add_service(Uuid::Uuid16(0x180f));
    let sink = Arc::clone(&writes);
    let handles = svc.add_characteristic_with_handler(
        Uuid::Uuid16(0x2a19),
        &[CharacteristicProp::Read, CharacteristicProp::Write],
        &[100],
        move |req| {
            sink.lock().push(req.value.to_vec());
            Ok::<(), AttErrorCode>(())
        },
    );
    svc.build();
    assert_eq!(handles.value, 3);

    let mock = MockTransport::new();
    let host = connected_host(&mock, GattServer::new(table));

    mock.inject(&att_acl(HANDLE, &[0x12, 0x03, 0x00, 0xca, 0xfe]));
    let write_rsp = vec![0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x13];
    assert!(wait_for(|| mock.written_acl().contains(&write_rsp)));
    assert_eq!(*writes.lock(), vec![vec![0xca, 0xfe]]);

    mock.inject(&att_acl(HANDLE, &[0x0a, 0x03, 0x00]));
    let read_rsp = vec![
        0x02, 0x40, 0x00, 0x07, 0x00, 0x03, 0x00, 0x04, 0x00, 0x0b, 0xca, 0xfe,
    ];
    assert!(wait_for(|| mock.written_acl().contains(&read_rsp)));
    host.stop();
}

#[test]
fn mtu_exchange_updates_host() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());
    assert!(matches!(
        host.notify(0x0003, &[0; 21]),
        Err(BleError::InvalidParameter(_))
    ));

    mock.inject(&att_acl(HANDLE, &[0x02, 0x00, 0x01]));
    let event = wait_event(&host, |e| matches!(e, HostEvent::MtuExchanged { .. }));
    assert_eq!(event, Some(HostEvent::MtuExchanged { mtu: 247 }));
    assert_eq!(host.att_mtu(), 247);
    let rsp = vec![0x02, 0x40, 0x00, 0x07, 0x00, 0x03, 0x00, 0x04, 0x00, 0x03, 0xf7, 0x00];
    assert!(wait_for(|| mock.written_acl().contains(&rsp)));

    host.notify(0x0003, &[0; 21]).unwrap();
}

#[test]
fn peer_notifications_and_indications_become_events() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());

    mock.inject(&att_acl(HANDLE, &[0x1b, 0x10, 0x00, 0x01, 0x02]));
    assert_eq!(
        wait_event(&host, |e| matches!(e, HostEvent::Notification { .. })),
        Some(HostEvent::Notification {
            handle: 0x10,
            value: vec![0x01, 0x02]
        })
    );

    mock.inject(&att_acl(HANDLE, &[0x1d, 0x10, 0x00, 0x03]));
    assert_eq!(
        wait_event(&host, |e| matches!(e, HostEvent::Indication { .. })),
        Some(HostEvent::Indication {
            handle: 0x10,
            value: vec![0x03]
        })
    );
    let confirmation = vec![0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x1e];
    assert!(wait_for(|| mock.written_acl().contains(&confirmation)));

    mock.inject(&att_acl(HANDLE, &[0x13]));
    assert_eq!(
        wait_event(&host, |e| matches!(e, HostEvent::WriteCompleted)),
        Some(HostEvent::WriteCompleted)
    );
}

#[test]
fn client_writes_go_out_as_att_pdus() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());

    host.gatt_write(0x0010, &[0xaa], true).unwrap();
    host.gatt_write(0x0010, &[0xbb], false).unwrap();
    let req = vec![0x02, 0x40, 0x00, 0x08, 0x00, 0x04, 0x00, 0x04, 0x00, 0x12, 0x10, 0x00, 0xaa];
    let cmd = vec![0x02, 0x40, 0x00, 0x08, 0x00, 0x04, 0x00, 0x04, 0x00, 0x52, 0x10, 0x00, 0xbb];
    assert!(wait_for(|| mock.written_acl() == vec![req.clone(), cmd.clone()]));

    host.indicate(0x0003, &[0x01]).unwrap();
    let ind = vec![0x02, 0x40, 0x00, 0x08, 0x00, 0x04, 0x00, 0x04, 0x00, 0x1d, 0x03, 0x00, 0x01];
    assert!(wait_for(|| mock.written_acl().contains(&ind)));
}

#[test]
fn client_writes_are_bounded_by_att_mtu() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());
    assert_eq!(host.att_mtu(), 23);

    assert!(matches!(
        host.gatt_write(0x0010, &[0x00; 21], true),
        Err(BleError::InvalidParameter(_))
    ));
    assert!(matches!(
        host.gatt_write(0x0010, &[0x00; 21], false),
        Err(BleError::InvalidParameter(_))
    ));
    host.gatt_write(0x0010, &[0x00; 20], false).unwrap();
    assert!(wait_for(|| mock.written_acl().len() == 1));
    assert_eq!(mock.written_acl()[0].len(), 5 + 4 + 3 + 20);
}

#[test]
fn disconnect_resets_connection_state() {
    let mock = MockTransport::new();
    let host = connected_host(&mock, empty_server());

    host.send_data(CID_ATT, &[0x01]).unwrap();
    assert!(wait_for(|| host.acl_credits() == 11));

    host.disconnect(ErrorCode::RemoteUserTerminatedConnection)
        .unwrap();
    assert!(wait_for(|| mock.written_opcodes().contains(&opcodes::DISCONNECT)));

    mock.inject(&disconnection_complete(HANDLE, 0x16));
    assert_eq!(
        wait_event(&host, |e| matches!(e, HostEvent::Disconnected { .. })),
        Some(HostEvent::Disconnected {
            handle: HANDLE,
            reason: ErrorCode::ConnectionTerminatedByLocalHost
        })
    );
    assert_eq!(host.gap_state(), GapState::Idle);
    assert_eq!(host.conn_handle(), None);
    assert_eq!(host.acl_credits(), 12);
    assert!(matches!(
        host.send_data(CID_ATT, &[0x01]),
        Err(BleError::NotConnected)
    ));
}

#[test]
fn failed_connect_returns_to_idle() {
    init_logger();
    let mock = MockTransport::new();
    mock.fail_command(opcodes::LE_CREATE_CONNECTION, 0x0c);
    let host = Host::new(mock, config());
    host.start(empty_server()).unwrap();

    host.connect(
        AddressType::Random,
        BdAddr::new([0x4b, 0x7d, 0x99, 0x9c, 0x6f, 0x45]),
        ConnectParameters::default(),
    )
    .unwrap();
    assert_eq!(
        wait_event(&host, |e| matches!(e, HostEvent::ConnectionFailed { .. })),
        Some(HostEvent::ConnectionFailed {
            status: ErrorCode::CommandDisallowed
        })
    );
    assert_eq!(host.gap_state(), GapState::Idle);
}

#[test]
fn transport_failure_closes_host() {
    init_logger();
    let mock = MockTransport::new();
    let host = Host::new(mock.clone(), config());
    host.start(empty_server()).unwrap();

    mock.break_link();
    assert!(matches!(host.next_event(), Err(BleError::Closed)));
    assert!(matches!(
        host.start_scanning(ScanParameters::default(), false),
        Err(BleError::Closed)
    ));
    host.stop();
}

#[test]
fn stop_is_idempotent_and_unblocks_waiters() {
    init_logger();
    let host = Arc::new(Host::new(MockTransport::new(), config()));
    host.start(empty_server()).unwrap();

    let waiter = {
        let host = Arc::clone(&host);
        std::thread::spawn(move || host.next_event())
    };
    std::thread::sleep(Duration::from_millis(20));
    host.stop();
    host.stop();
    assert!(matches!(waiter.join().unwrap(), Err(BleError::Closed)));
    assert_eq!(host.try_next_event(), None);
}
