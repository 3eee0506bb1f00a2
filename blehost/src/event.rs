use binrw::{helpers::until_eof, io::Cursor, meta::ReadEndian, BinRead};
use log::trace;

use crate::types::{AddressType, BdAddr, ErrorCode, Role, EVENT_PKT_HEADER_SIZE, HANDLE_MASK};

pub mod event_code {
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const COMMAND_COMPLETE: u8 = 0x0e;
    pub const COMMAND_STATUS: u8 = 0x0f;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    pub const DATA_BUFFER_OVERFLOW: u8 = 0x1a;
    pub const LE_META: u8 = 0x3e;
}

pub mod le_subevent {
    pub const CONNECTION_COMPLETE: u8 = 0x01;
    pub const ADVERTISING_REPORT: u8 = 0x02;
    pub const CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
    pub const DATA_LENGTH_CHANGE: u8 = 0x07;
    pub const PHY_UPDATE_COMPLETE: u8 = 0x0c;
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct DisconnectionComplete {
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub status: ErrorCode,
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub reason: ErrorCode,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct CommandComplete {
    pub num_hci_command_packets: u8,
    pub opcode: u16,
    #[br(parse_with = until_eof)]
    pub return_parameters: Vec<u8>,
}

impl CommandComplete {
    /// First return parameter; every command the host issues reports its status there.
    pub fn status(&self) -> ErrorCode {
        self.return_parameters
            .first()
            .map_or(ErrorCode::Success, |s| ErrorCode::from(*s))
    }
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct CommandStatus {
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub status: ErrorCode,
    pub num_hci_command_packets: u8,
    pub opcode: u16,
}

#[derive(BinRead, PartialEq, Eq, Clone, Copy, Debug)]
#[br(little)]
pub struct CompletedPackets {
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    pub count: u16,
}

// Controllers send (handle, count) pairs back to back.
#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct NumberOfCompletedPackets {
    pub num_handles: u8,
    #[br(count = num_handles)]
    pub completed: Vec<CompletedPackets>,
}

impl NumberOfCompletedPackets {
    pub fn total(&self) -> usize {
        self.completed.iter().map(|c| c.count as usize).sum()
    }
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct LeConnectionComplete {
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub status: ErrorCode,
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    pub role: Role,
    pub peer_address_type: AddressType,
    pub peer_address: BdAddr,
    /// 1.25 ms units
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct AdvertisingReport {
    pub event_type: u8,
    pub address_type: AddressType,
    pub address: BdAddr,
    pub data_len: u8,
    #[br(count = data_len)]
    pub data: Vec<u8>,
    pub rssi: i8,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
struct AdvertisingReports {
    num_reports: u8,
    #[br(count = num_reports)]
    reports: Vec<AdvertisingReport>,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct LeConnectionUpdateComplete {
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub status: ErrorCode,
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct LeDataLengthChange {
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

#[derive(BinRead, PartialEq, Eq, Clone, Debug)]
#[br(little)]
pub struct LePhyUpdateComplete {
    #[br(map = |x: u8| ErrorCode::from(x))]
    pub status: ErrorCode,
    #[br(map = |x: u16| x & HANDLE_MASK)]
    pub handle: u16,
    pub tx_phy: u8,
    pub rx_phy: u8,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum LeEvent {
    ConnectionComplete(LeConnectionComplete),
    AdvertisingReport(Vec<AdvertisingReport>),
    ConnectionUpdateComplete(LeConnectionUpdateComplete),
    DataLengthChange(LeDataLengthChange),
    PhyUpdateComplete(LePhyUpdateComplete),
    Unknown { subevent: u8, params: Vec<u8> },
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Event {
    DisconnectionComplete(DisconnectionComplete),
    CommandComplete(CommandComplete),
    CommandStatus(CommandStatus),
    HardwareError { hardware_code: u8 },
    NumberOfCompletedPackets(NumberOfCompletedPackets),
    DataBufferOverflow { link_type: u8 },
    LeMeta(LeEvent),
    Unknown { code: u8, params: Vec<u8> },
}

fn read_body<T>(params: &[u8]) -> Option<T>
where
    T: BinRead + ReadEndian,
    for<'a> T::Args<'a>: Default,
{
    match T::read(&mut Cursor::new(params)) {
        Ok(body) => Some(body),
        Err(e) => {
            trace!("[hci] malformed event parameters {:02x?}: {}", params, e);
            None
        }
    }
}

impl LeEvent {
    fn decode(params: &[u8]) -> Option<Self> {
        let (&subevent, body) = params.split_first()?;
        Some(match subevent {
            le_subevent::CONNECTION_COMPLETE => LeEvent::ConnectionComplete(read_body(body)?),
            le_subevent::ADVERTISING_REPORT => {
                LeEvent::AdvertisingReport(read_body::<AdvertisingReports>(body)?.reports)
            }
            le_subevent::CONNECTION_UPDATE_COMPLETE => {
                LeEvent::ConnectionUpdateComplete(read_body(body)?)
            }
            le_subevent::DATA_LENGTH_CHANGE => LeEvent::DataLengthChange(read_body(body)?),
            le_subevent::PHY_UPDATE_COMPLETE => LeEvent::PhyUpdateComplete(read_body(body)?),
            _ => LeEvent::Unknown {
                subevent,
                params: body.to_vec(),
            },
        })
    }
}

impl Event {
    /// Decodes `[event_code][param_len][params]`. Returns `None` when the packet is
    /// shorter than its declared length or a recognized event is malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EVENT_PKT_HEADER_SIZE {
            return None;
        }
        let code = bytes[0];
        let len = bytes[1] as usize;
        let params = bytes.get(EVENT_PKT_HEADER_SIZE..EVENT_PKT_HEADER_SIZE + len)?;

        Some(match code {
            event_code::DISCONNECTION_COMPLETE => Event::DisconnectionComplete(read_body(params)?),
            event_code::COMMAND_COMPLETE => Event::CommandComplete(read_body(params)?),
            event_code::COMMAND_STATUS => Event::CommandStatus(read_body(params)?),
            event_code::HARDWARE_ERROR => Event::HardwareError {
                hardware_code: *params.first()?,
            },
            event_code::NUMBER_OF_COMPLETED_PACKETS => {
                Event::NumberOfCompletedPackets(read_body(params)?)
            }
            event_code::DATA_BUFFER_OVERFLOW => Event::DataBufferOverflow {
                link_type: *params.first()?,
            },
            event_code::LE_META => Event::LeMeta(LeEvent::decode(params)?),
            _ => Event::Unknown {
                code,
                params: params.to_vec(),
            },
        })
    }
}
