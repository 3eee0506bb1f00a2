use binrw::{io::Cursor, meta::WriteEndian, BinRead, BinWrite};
use log::{trace, warn};

use crate::types::{
    AddressType, BdAddr, CommandPacketBuffer, ErrorCode, ACL_PKT_HEADER_SIZE,
    CMD_PKT_HEADER_SIZE, CMD_PKT_PAYLOAD_MAX_SIZE, EVENT_PKT_HEADER_SIZE,
};

pub const CMD_LE_ADV_DATA_MAX_SIZE: usize = 31;
pub type AdvertisingData = heapless::Vec<u8, CMD_LE_ADV_DATA_MAX_SIZE>;

pub mod hcicode {
    pub const COMMAND: u8 = 0x01;
    pub const ACL_DATA: u8 = 0x02;
    pub const EVENT: u8 = 0x04;
}

pub mod ogf {
    pub const LINK_CONTROL: u8 = 0x01;
    pub const CONTROLLER_BASEBAND: u8 = 0x03;
    pub const INFO_PARAM: u8 = 0x04;
    pub const LE_CONTROLLER: u8 = 0x08;
}

pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03ff)
}

pub mod opcodes {
    use super::{ogf, opcode};

    pub const DISCONNECT: u16 = opcode(ogf::LINK_CONTROL, 0x0006);
    pub const SET_EVENT_MASK: u16 = opcode(ogf::CONTROLLER_BASEBAND, 0x0001);
    pub const RESET: u16 = opcode(ogf::CONTROLLER_BASEBAND, 0x0003);
    pub const READ_BD_ADDR: u16 = opcode(ogf::INFO_PARAM, 0x0009);
    pub const LE_SET_EVENT_MASK: u16 = opcode(ogf::LE_CONTROLLER, 0x0001);
    pub const LE_READ_BUFFER_SIZE: u16 = opcode(ogf::LE_CONTROLLER, 0x0002);
    pub const LE_SET_ADVERTISING_PARAMETERS: u16 = opcode(ogf::LE_CONTROLLER, 0x0006);
    pub const LE_SET_ADVERTISING_DATA: u16 = opcode(ogf::LE_CONTROLLER, 0x0008);
    pub const LE_SET_SCAN_RSP_DATA: u16 = opcode(ogf::LE_CONTROLLER, 0x0009);
    pub const LE_SET_ADVERTISE_ENABLE: u16 = opcode(ogf::LE_CONTROLLER, 0x000a);
    pub const LE_SET_SCAN_PARAMETERS: u16 = opcode(ogf::LE_CONTROLLER, 0x000b);
    pub const LE_SET_SCAN_ENABLE: u16 = opcode(ogf::LE_CONTROLLER, 0x000c);
    pub const LE_CREATE_CONNECTION: u16 = opcode(ogf::LE_CONTROLLER, 0x000d);
    pub const LE_CREATE_CONNECTION_CANCEL: u16 = opcode(ogf::LE_CONTROLLER, 0x000e);
    pub const LE_SET_DATA_LENGTH: u16 = opcode(ogf::LE_CONTROLLER, 0x0022);
    pub const LE_SET_PHY: u16 = opcode(ogf::LE_CONTROLLER, 0x0032);
}

// Vol 4 Part E 7.3.1: Disconnection Complete, Hardware Error, Data Buffer Overflow, LE Meta
pub const DEFAULT_EVENT_MASK: u64 = (1 << 4) | (1 << 15) | (1 << 25) | (1 << 61);
// Vol 4 Part E 7.8.1: Connection Complete, Advertising Report, Connection Update Complete,
// Data Length Change, PHY Update Complete
pub const DEFAULT_LE_EVENT_MASK: u64 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 6) | (1 << 11);

pub mod phy_mask {
    pub const LE_1M: u8 = 0x01;
    pub const LE_2M: u8 = 0x02;
    pub const LE_CODED: u8 = 0x04;
}

/// Builds `[0x01][opcode][len][params]`. Parameters beyond 255 bytes are cut off.
pub fn encode_command(opcode: u16, params: &[u8]) -> CommandPacketBuffer {
    let params = &params[..params.len().min(CMD_PKT_PAYLOAD_MAX_SIZE)];
    let mut buf = CommandPacketBuffer::new();
    // capacity covers indicator, header and the clamped parameters
    let _ = buf.push(hcicode::COMMAND);
    let _ = buf.extend_from_slice(&opcode.to_le_bytes());
    let _ = buf.push(params.len() as u8);
    let _ = buf.extend_from_slice(params);
    buf
}

fn to_bytes<T>(value: &T) -> Vec<u8>
where
    T: BinWrite + WriteEndian,
    for<'a> T::Args<'a>: Default,
{
    let mut writer = Cursor::new(Vec::new());
    if let Err(e) = value.write(&mut writer) {
        warn!("[hci] parameter encoding failed: {}", e);
    }
    writer.into_inner()
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum AdvertisingType {
    AdvInd = 0x00,
    AdvDirectInd = 0x01,
    AdvScanInd = 0x02,
    AdvNonConnInd = 0x03,
    AdvDirectIndLowDuty = 0x04,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum OwnAddressType {
    Public = 0x00,
    Random = 0x01,
    ResolvablePrivateAddress = 0x02,
    ResolvablePrivateAddressFromIrk = 0x03,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum AdvertisingFilterPolicy {
    All = 0x00,
    ConnectAllScanFiltered = 0x01,
    ScanAllConnFiltered = 0x02,
    Filtered = 0x03,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum ScanType {
    Passive = 0x00,
    Active = 0x01,
}

#[derive(BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[bw(little)]
pub struct AdvertisingParameters {
    #[bw(map = |x: &u32| (x / 625) as u16)] // us V.4 P.E 7.8.5
    pub interval_min: u32,
    #[bw(map = |x: &u32| (x / 625) as u16)]
    pub interval_max: u32,
    pub advertising_type: AdvertisingType,
    pub own_address_type: OwnAddressType,
    pub peer_address_type: AddressType,
    pub peer_address: BdAddr,
    pub channel_map: u8,
    pub filter_policy: AdvertisingFilterPolicy,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            interval_min: 160_000,
            interval_max: 160_000,
            advertising_type: AdvertisingType::AdvInd,
            own_address_type: OwnAddressType::Public,
            peer_address_type: AddressType::Public,
            peer_address: BdAddr::default(),
            channel_map: 0x07,
            filter_policy: AdvertisingFilterPolicy::All,
        }
    }
}

#[derive(BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[bw(little)]
pub struct ScanParameters {
    pub scan_type: ScanType,
    #[bw(map = |x: &u32| (x / 625) as u16)] // us V.4 P.E 7.8.10
    pub interval: u32,
    #[bw(map = |x: &u32| (x / 625) as u16)]
    pub window: u32,
    pub own_address_type: OwnAddressType,
    pub filter_policy: u8,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            scan_type: ScanType::Active,
            interval: 10_000,
            window: 10_000,
            own_address_type: OwnAddressType::Public,
            filter_policy: 0,
        }
    }
}

/// Connection request parameters for LE Create Connection, in controller units.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct ConnectParameters {
    /// 0.625 ms units
    pub scan_interval: u16,
    pub scan_window: u16,
    pub own_address_type: OwnAddressType,
    /// 1.25 ms units
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

impl Default for ConnectParameters {
    fn default() -> Self {
        Self {
            scan_interval: 0x0060,
            scan_window: 0x0030,
            own_address_type: OwnAddressType::Public,
            interval_min: 0x0018,
            interval_max: 0x0028,
            latency: 0,
            supervision_timeout: 0x01f4,
        }
    }
}

#[derive(BinWrite)]
#[bw(little)]
struct CreateConnectionParams {
    scan_interval: u16,
    scan_window: u16,
    initiator_filter_policy: u8,
    peer_address_type: AddressType,
    peer_address: BdAddr,
    own_address_type: OwnAddressType,
    interval_min: u16,
    interval_max: u16,
    latency: u16,
    supervision_timeout: u16,
    min_ce_length: u16,
    max_ce_length: u16,
}

#[derive(BinWrite)]
#[bw(little)]
struct DisconnectParams {
    handle: u16,
    reason: u8,
}

#[derive(BinWrite)]
#[bw(little)]
struct DataLengthParams {
    handle: u16,
    tx_octets: u16,
    tx_time: u16,
}

#[derive(BinWrite)]
#[bw(little)]
struct PhyParams {
    handle: u16,
    all_phys: u8,
    tx_phys: u8,
    rx_phys: u8,
    phy_options: u16,
}

/// Every command the host issues to the controller.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Command {
    Reset,
    SetEventMask(u64),
    LeSetEventMask(u64),
    LeReadBufferSize,
    ReadBdAddr,
    LeSetAdvertisingParameters(AdvertisingParameters),
    LeSetAdvertisingData(AdvertisingData),
    LeSetScanResponseData(AdvertisingData),
    LeSetAdvertiseEnable(bool),
    LeSetScanParameters(ScanParameters),
    LeSetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    LeCreateConnection {
        peer_address_type: AddressType,
        peer_address: BdAddr,
        params: ConnectParameters,
    },
    LeCreateConnectionCancel,
    Disconnect {
        handle: u16,
        reason: ErrorCode,
    },
    LeSetDataLength {
        handle: u16,
        tx_octets: u16,
        tx_time: u16,
    },
    LeSetPhy {
        handle: u16,
        all_phys: u8,
        tx_phys: u8,
        rx_phys: u8,
        phy_options: u16,
    },
}

fn adv_data_param(data: &AdvertisingData) -> Vec<u8> {
    // V.4 P.E 7.8.7: length byte then a fixed 31 byte field
    let mut params = vec![0u8; 1 + CMD_LE_ADV_DATA_MAX_SIZE];
    params[0] = data.len() as u8;
    params[1..1 + data.len()].copy_from_slice(data);
    params
}

impl Command {
    pub fn opcode(&self) -> u16 {
        use Command::*;
        match self {
            Reset => opcodes::RESET,
            SetEventMask(_) => opcodes::SET_EVENT_MASK,
            LeSetEventMask(_) => opcodes::LE_SET_EVENT_MASK,
            LeReadBufferSize => opcodes::LE_READ_BUFFER_SIZE,
            ReadBdAddr => opcodes::READ_BD_ADDR,
            LeSetAdvertisingParameters(_) => opcodes::LE_SET_ADVERTISING_PARAMETERS,
            LeSetAdvertisingData(_) => opcodes::LE_SET_ADVERTISING_DATA,
            LeSetScanResponseData(_) => opcodes::LE_SET_SCAN_RSP_DATA,
            LeSetAdvertiseEnable(_) => opcodes::LE_SET_ADVERTISE_ENABLE,
            LeSetScanParameters(_) => opcodes::LE_SET_SCAN_PARAMETERS,
            LeSetScanEnable { .. } => opcodes::LE_SET_SCAN_ENABLE,
            LeCreateConnection { .. } => opcodes::LE_CREATE_CONNECTION,
            LeCreateConnectionCancel => opcodes::LE_CREATE_CONNECTION_CANCEL,
            Disconnect { .. } => opcodes::DISCONNECT,
            LeSetDataLength { .. } => opcodes::LE_SET_DATA_LENGTH,
            LeSetPhy { .. } => opcodes::LE_SET_PHY,
        }
    }

    pub fn params(&self) -> Vec<u8> {
        use Command::*;
        match self {
            Reset | LeReadBufferSize | ReadBdAddr | LeCreateConnectionCancel => Vec::new(),
            SetEventMask(mask) | LeSetEventMask(mask) => mask.to_le_bytes().to_vec(),
            LeSetAdvertisingParameters(params) => to_bytes(params),
            LeSetAdvertisingData(data) | LeSetScanResponseData(data) => adv_data_param(data),
            LeSetAdvertiseEnable(enable) => vec![*enable as u8],
            LeSetScanParameters(params) => to_bytes(params),
            LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],
            LeCreateConnection {
                peer_address_type,
                peer_address,
                params,
            } => to_bytes(&CreateConnectionParams {
                scan_interval: params.scan_interval,
                scan_window: params.scan_window,
                initiator_filter_policy: 0,
                peer_address_type: *peer_address_type,
                peer_address: *peer_address,
                own_address_type: params.own_address_type,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                supervision_timeout: params.supervision_timeout,
                min_ce_length: 0,
                max_ce_length: 0,
            }),
            Disconnect { handle, reason } => to_bytes(&DisconnectParams {
                handle: *handle,
                reason: (*reason).into(),
            }),
            LeSetDataLength {
                handle,
                tx_octets,
                tx_time,
            } => to_bytes(&DataLengthParams {
                handle: *handle,
                tx_octets: *tx_octets,
                tx_time: *tx_time,
            }),
            LeSetPhy {
                handle,
                all_phys,
                tx_phys,
                rx_phys,
                phy_options,
            } => to_bytes(&PhyParams {
                handle: *handle,
                all_phys: *all_phys,
                tx_phys: *tx_phys,
                rx_phys: *rx_phys,
                phy_options: *phy_options,
            }),
        }
    }

    pub fn encode(&self) -> CommandPacketBuffer {
        encode_command(self.opcode(), &self.params())
    }
}

/// One complete H4 packet, indicator stripped.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum RawPacket {
    Command(Vec<u8>),
    Acl(Vec<u8>),
    Event(Vec<u8>),
}

/// Reassembles transport reads into whole H4 packets.
#[derive(Default, Debug)]
pub struct PacketFramer {
    buf: Vec<u8>,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_packet(&mut self) -> Option<RawPacket> {
        loop {
            let indicator = *self.buf.first()?;
            let header_len = match indicator {
                hcicode::EVENT => EVENT_PKT_HEADER_SIZE,
                hcicode::ACL_DATA => ACL_PKT_HEADER_SIZE,
                hcicode::COMMAND => CMD_PKT_HEADER_SIZE,
                other => {
                    warn!("[hci] dropping byte with unknown packet indicator {:#04x}", other);
                    self.buf.remove(0);
                    continue;
                }
            };
            if self.buf.len() < 1 + header_len {
                return None;
            }
            let body_len = match indicator {
                hcicode::EVENT => self.buf[2] as usize,
                hcicode::ACL_DATA => u16::from_le_bytes([self.buf[3], self.buf[4]]) as usize,
                _ => self.buf[3] as usize,
            };
            let total = 1 + header_len + body_len;
            if self.buf.len() < total {
                return None;
            }
            let body = self.buf[1..total].to_vec();
            self.buf.drain(..total);
            trace!("[hci] framed packet {:#04x} {:02x?}", indicator, body);
            return Some(match indicator {
                hcicode::EVENT => RawPacket::Event(body),
                hcicode::ACL_DATA => RawPacket::Acl(body),
                _ => RawPacket::Command(body),
            });
        }
    }
}
