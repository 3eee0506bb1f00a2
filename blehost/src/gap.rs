use core::fmt;
use std::collections::VecDeque;

use log::{debug, info, trace, warn};

use crate::att::AttErrorCode;
use crate::event::{AdvertisingReport, Event, LeDataLengthChange, LeEvent};
use crate::hci::{
    opcodes, AdvertisingData, AdvertisingParameters, Command, ConnectParameters, ScanParameters,
};
use crate::types::{AddressType, BdAddr, ErrorCode, Role};
use crate::BleError;

pub const DATA_LENGTH_MIN_OCTETS: u16 = 27;
pub const DATA_LENGTH_MAX_OCTETS: u16 = 251;
pub const DATA_LENGTH_MIN_TIME: u16 = 328;
pub const DATA_LENGTH_MAX_TIME: u16 = 17040;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GapState {
    Uninit,
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Connected,
}

impl fmt::Display for GapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GapState::Uninit => "uninit",
            GapState::Idle => "idle",
            GapState::Advertising => "advertising",
            GapState::Scanning => "scanning",
            GapState::Connecting => "connecting",
            GapState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnectionInfo {
    pub handle: u16,
    pub role: Role,
    pub peer_address_type: AddressType,
    pub peer_address: BdAddr,
    /// 1.25 ms units
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

/// Everything the host reports to the application.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HostEvent {
    Connected(ConnectionInfo),
    ConnectionFailed {
        status: ErrorCode,
    },
    Disconnected {
        handle: u16,
        reason: ErrorCode,
    },
    DeviceFound(AdvertisingReport),
    ConnectionUpdated {
        handle: u16,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    DataLengthChanged(LeDataLengthChange),
    PhyUpdated {
        handle: u16,
        status: ErrorCode,
        tx_phy: u8,
        rx_phy: u8,
    },
    CommandFailed {
        opcode: u16,
        status: ErrorCode,
    },
    HardwareError {
        code: u8,
    },
    MtuExchanged {
        mtu: u16,
    },
    Notification {
        handle: u16,
        value: Vec<u8>,
    },
    Indication {
        handle: u16,
        value: Vec<u8>,
    },
    IndicationConfirmed,
    WriteCompleted,
    ReadCompleted {
        value: Vec<u8>,
    },
    AttError {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
    },
}

/// Connection, advertising and scanning state. Pure: commands and events are
/// queued here and drained by the host.
#[derive(Debug)]
pub struct Gap {
    state: GapState,
    connection: Option<ConnectionInfo>,
    commands: VecDeque<Command>,
    events: VecDeque<HostEvent>,
}

impl Default for Gap {
    fn default() -> Self {
        Self::new()
    }
}

impl Gap {
    pub fn new() -> Self {
        Self {
            state: GapState::Uninit,
            connection: None,
            commands: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Controller bring-up finished.
    pub fn initialized(&mut self) {
        if self.state == GapState::Uninit {
            self.set_state(GapState::Idle);
        }
    }

    pub fn state(&self) -> GapState {
        self.state
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.connection
    }

    pub fn conn_handle(&self) -> Option<u16> {
        self.connection.map(|c| c.handle)
    }

    pub fn next_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    fn set_state(&mut self, state: GapState) {
        if self.state != state {
            debug!("[gap] {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn require(&self, allowed: &[GapState], intent: &'static str) -> Result<(), BleError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!("[gap] {} rejected in state {}", intent, self.state);
            Err(BleError::InvalidState {
                state: self.state,
                intent,
            })
        }
    }

    fn emit(&mut self, event: HostEvent) {
        trace!("[gap] event {:?}", event);
        self.events.push_back(event);
    }

    pub fn start_advertising(
        &mut self,
        params: AdvertisingParameters,
        adv_data: AdvertisingData,
        scan_rsp_data: Option<AdvertisingData>,
    ) -> Result<(), BleError> {
        self.require(&[GapState::Idle], "start_advertising")?;
        self.commands
            .push_back(Command::LeSetAdvertisingParameters(params));
        self.commands.push_back(Command::LeSetAdvertisingData(adv_data));
        if let Some(data) = scan_rsp_data {
            self.commands.push_back(Command::LeSetScanResponseData(data));
        }
        self.commands.push_back(Command::LeSetAdvertiseEnable(true));
        self.set_state(GapState::Advertising);
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.require(&[GapState::Advertising], "stop_advertising")?;
        self.commands.push_back(Command::LeSetAdvertiseEnable(false));
        self.set_state(GapState::Idle);
        Ok(())
    }

    pub fn start_scanning(
        &mut self,
        params: ScanParameters,
        filter_duplicates: bool,
    ) -> Result<(), BleError> {
        self.require(&[GapState::Idle], "start_scanning")?;
        self.commands.push_back(Command::LeSetScanParameters(params));
        self.commands.push_back(Command::LeSetScanEnable {
            enable: true,
            filter_duplicates,
        });
        self.set_state(GapState::Scanning);
        Ok(())
    }

    pub fn stop_scanning(&mut self) -> Result<(), BleError> {
        self.require(&[GapState::Scanning], "stop_scanning")?;
        self.commands.push_back(Command::LeSetScanEnable {
            enable: false,
            filter_duplicates: false,
        });
        self.set_state(GapState::Idle);
        Ok(())
    }

    /// Accepted from idle or while scanning; scanning is switched off first.
    pub fn connect(
        &mut self,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        params: ConnectParameters,
    ) -> Result<(), BleError> {
        self.require(&[GapState::Idle, GapState::Scanning], "connect")?;
        if self.state == GapState::Scanning {
            self.commands.push_back(Command::LeSetScanEnable {
                enable: false,
                filter_duplicates: false,
            });
        }
        self.commands.push_back(Command::LeCreateConnection {
            peer_address_type,
            peer_address,
            params,
        });
        self.set_state(GapState::Connecting);
        Ok(())
    }

    /// The controller answers with a failed connection complete, which returns us to idle.
    pub fn cancel_connect(&mut self) -> Result<(), BleError> {
        self.require(&[GapState::Connecting], "cancel_connect")?;
        self.commands.push_back(Command::LeCreateConnectionCancel);
        Ok(())
    }

    pub fn disconnect(&mut self, reason: ErrorCode) -> Result<(), BleError> {
        self.require(&[GapState::Connected], "disconnect")?;
        let handle = self.conn_handle().ok_or(BleError::NotConnected)?;
        self.commands.push_back(Command::Disconnect { handle, reason });
        Ok(())
    }

    pub fn request_data_length(&mut self, tx_octets: u16, tx_time: u16) -> Result<(), BleError> {
        self.require(&[GapState::Connected], "request_data_length")?;
        if !(DATA_LENGTH_MIN_OCTETS..=DATA_LENGTH_MAX_OCTETS).contains(&tx_octets)
            || !(DATA_LENGTH_MIN_TIME..=DATA_LENGTH_MAX_TIME).contains(&tx_time)
        {
            return Err(BleError::InvalidParameter(format!(
                "data length {} octets / {} us out of range",
                tx_octets, tx_time
            )));
        }
        let handle = self.conn_handle().ok_or(BleError::NotConnected)?;
        self.commands.push_back(Command::LeSetDataLength {
            handle,
            tx_octets,
            tx_time,
        });
        Ok(())
    }

    /// `tx_phys`/`rx_phys` are masks of [`crate::hci::phy_mask`].
    pub fn request_phy_update(&mut self, tx_phys: u8, rx_phys: u8) -> Result<(), BleError> {
        self.require(&[GapState::Connected], "request_phy_update")?;
        if tx_phys == 0 || rx_phys == 0 || tx_phys > 0x07 || rx_phys > 0x07 {
            return Err(BleError::InvalidParameter(format!(
                "phy masks tx={:#04x} rx={:#04x}",
                tx_phys, rx_phys
            )));
        }
        let handle = self.conn_handle().ok_or(BleError::NotConnected)?;
        self.commands.push_back(Command::LeSetPhy {
            handle,
            all_phys: 0,
            tx_phys,
            rx_phys,
            phy_options: 0,
        });
        Ok(())
    }

    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::LeMeta(le) => self.handle_le_event(le),
            Event::DisconnectionComplete(d) => {
                if !d.status.is_success() {
                    warn!("[gap] disconnect of {} failed: {}", d.handle, d.status);
                    return;
                }
                if self.conn_handle() != Some(d.handle) {
                    trace!("[gap] disconnection complete for unknown handle {}", d.handle);
                    return;
                }
                info!("[gap] disconnected {}: {}", d.handle, d.reason);
                self.connection = None;
                self.set_state(GapState::Idle);
                self.emit(HostEvent::Disconnected {
                    handle: d.handle,
                    reason: d.reason,
                });
            }
            Event::CommandComplete(cc) => {
                let status = cc.status();
                if !status.is_success() {
                    self.command_failed(cc.opcode, status);
                }
            }
            Event::CommandStatus(cs) => {
                if !cs.status.is_success() {
                    self.command_failed(cs.opcode, cs.status);
                }
            }
            Event::HardwareError { hardware_code } => {
                self.emit(HostEvent::HardwareError {
                    code: *hardware_code,
                });
            }
            _ => {}
        }
    }

    fn command_failed(&mut self, opcode: u16, status: ErrorCode) {
        warn!("[gap] command {:#06x} failed: {}", opcode, status);
        match (opcode, self.state) {
            (opcodes::LE_SET_ADVERTISE_ENABLE, GapState::Advertising)
            | (opcodes::LE_SET_ADVERTISING_PARAMETERS, GapState::Advertising)
            | (opcodes::LE_SET_SCAN_ENABLE, GapState::Scanning)
            | (opcodes::LE_SET_SCAN_PARAMETERS, GapState::Scanning) => {
                self.set_state(GapState::Idle);
            }
            (opcodes::LE_CREATE_CONNECTION, GapState::Connecting) => {
                self.set_state(GapState::Idle);
                self.emit(HostEvent::ConnectionFailed { status });
                return;
            }
            _ => {}
        }
        self.emit(HostEvent::CommandFailed { opcode, status });
    }

    fn handle_le_event(&mut self, event: &LeEvent) {
        match event {
            LeEvent::ConnectionComplete(c) => {
                if !c.status.is_success() {
                    info!("[gap] connection failed: {}", c.status);
                    self.connection = None;
                    self.set_state(GapState::Idle);
                    self.emit(HostEvent::ConnectionFailed { status: c.status });
                    return;
                }
                let info = ConnectionInfo {
                    handle: c.handle,
                    role: c.role,
                    peer_address_type: c.peer_address_type,
                    peer_address: c.peer_address,
                    interval: c.interval,
                    latency: c.latency,
                    supervision_timeout: c.supervision_timeout,
                };
                info!(
                    "[gap] connected {} to {} as {:?}",
                    c.handle, c.peer_address, c.role
                );
                self.connection = Some(info);
                self.set_state(GapState::Connected);
                self.emit(HostEvent::Connected(info));
            }
            LeEvent::AdvertisingReport(reports) => {
                if self.state != GapState::Scanning {
                    trace!("[gap] advertising report outside scanning ignored");
                    return;
                }
                for report in reports {
                    self.emit(HostEvent::DeviceFound(report.clone()));
                }
            }
            LeEvent::ConnectionUpdateComplete(u) => {
                if !u.status.is_success() {
                    warn!("[gap] connection update on {} failed: {}", u.handle, u.status);
                    return;
                }
                let Some(conn) = self.connection.as_mut().filter(|c| c.handle == u.handle) else {
                    return;
                };
                conn.interval = u.interval;
                conn.latency = u.latency;
                conn.supervision_timeout = u.supervision_timeout;
                self.emit(HostEvent::ConnectionUpdated {
                    handle: u.handle,
                    interval: u.interval,
                    latency: u.latency,
                    supervision_timeout: u.supervision_timeout,
                });
            }
            LeEvent::DataLengthChange(d) => {
                debug!(
                    "[gap] data length on {}: tx {} rx {}",
                    d.handle, d.max_tx_octets, d.max_rx_octets
                );
                self.emit(HostEvent::DataLengthChanged(d.clone()));
            }
            LeEvent::PhyUpdateComplete(p) => {
                self.emit(HostEvent::PhyUpdated {
                    handle: p.handle,
                    status: p.status,
                    tx_phy: p.tx_phy,
                    rx_phy: p.rx_phy,
                });
            }
            LeEvent::Unknown { subevent, .. } => {
                trace!("[gap] unhandled LE subevent {:#04x}", subevent);
            }
        }
    }
}
