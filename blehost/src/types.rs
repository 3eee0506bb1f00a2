use core::fmt;

use binrw::{BinRead, BinWrite};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// Connection handles occupy the low 12 bits of the ACL header word.
pub const HANDLE_MASK: u16 = 0x0fff;

pub const EVENT_PKT_HEADER_SIZE: usize = 2;
pub const EVENT_PKT_PAYLOAD_MAX_SIZE: usize = 255;

pub const ACL_PKT_HEADER_SIZE: usize = 4;
/// LE ACL payload size every controller must support (Vol 6 Part B 4.5.10).
pub const ACL_PKT_PAYLOAD_MIN_SIZE: usize = 27;

pub const CMD_PKT_HEADER_SIZE: usize = 3;
pub const CMD_PKT_PAYLOAD_MAX_SIZE: usize = 255;
/// Indicator byte + header + parameters.
pub const CMD_PKT_MAX_SIZE: usize = 1 + CMD_PKT_HEADER_SIZE + CMD_PKT_PAYLOAD_MAX_SIZE;
pub type CommandPacketBuffer = heapless::Vec<u8, CMD_PKT_MAX_SIZE>;

// Vol 1. Part F. 1.3
#[derive(Error, FromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum ErrorCode {
    #[error("Success")]
    Success = 0x00,
    #[error("Unknown HCI Command")]
    UnknownHciCommand = 0x01,
    #[error("Unknown Connection Identifier")]
    UnknownConnectionIdentifier = 0x02,
    #[error("Hardware Failure")]
    HardwareFailure = 0x03,
    #[error("Page Timeout")]
    PageTimeout = 0x04,
    #[error("Authentication Failure")]
    AuthenticationFailure = 0x05,
    #[error("PIN or Key Missing")]
    PinOrKeyMissing = 0x06,
    #[error("Memory Capacity Exceeded")]
    MemoryCapacityExceeded = 0x07,
    #[error("Connection Timeout")]
    ConnectionTimeout = 0x08,
    #[error("Connection Limit Exceeded")]
    ConnectionLimitExceeded = 0x09,
    #[error("Connection Already Exists")]
    ConnectionAlreadyExists = 0x0b,
    #[error("Command Disallowed")]
    CommandDisallowed = 0x0c,
    #[error("Connection Rejected due to Limited Resources")]
    ConnectionRejectedLimitedResources = 0x0d,
    #[error("Connection Rejected Due To Security Reasons")]
    ConnectionRejectedSecurityReasons = 0x0e,
    #[error("Connection Rejected due to Unacceptable BD_ADDR")]
    ConnectionRejectedUnacceptableBdAddr = 0x0f,
    #[error("Connection Accept Timeout Exceeded")]
    ConnectionAcceptTimeoutExceeded = 0x10,
    #[error("Unsupported Feature or Parameter Value")]
    UnsupportedFeatureOrParameterValue = 0x11,
    #[error("Invalid HCI Command Parameters")]
    InvalidHciCommandParameters = 0x12,
    #[error("Remote User Terminated Connection")]
    RemoteUserTerminatedConnection = 0x13,
    #[error("Remote Device Terminated Connection due to Low Resources")]
    RemoteDeviceTerminatedLowResources = 0x14,
    #[error("Remote Device Terminated Connection due to Power Off")]
    RemoteDeviceTerminatedPowerOff = 0x15,
    #[error("Connection Terminated By Local Host")]
    ConnectionTerminatedByLocalHost = 0x16,
    #[error("Repeated Attempts")]
    RepeatedAttempts = 0x17,
    #[error("Pairing Not Allowed")]
    PairingNotAllowed = 0x18,
    #[error("Unsupported Remote Feature")]
    UnsupportedRemoteFeature = 0x1a,
    #[error("Invalid LL Parameters")]
    InvalidLlParameters = 0x1e,
    #[error("Unspecified Error")]
    UnspecifiedError = 0x1f,
    #[error("Unsupported LL Parameter Value")]
    UnsupportedLlParameterValue = 0x20,
    #[error("LL Response Timeout")]
    LlResponseTimeout = 0x22,
    #[error("LL Procedure Collision")]
    LlProcedureCollision = 0x23,
    #[error("Instant Passed")]
    InstantPassed = 0x28,
    #[error("Different Transaction Collision")]
    DifferentTransactionCollision = 0x2a,
    #[error("Insufficient Security")]
    InsufficientSecurity = 0x2f,
    #[error("Parameter Out Of Mandatory Range")]
    ParameterOutOfMandatoryRange = 0x30,
    #[error("Controller Busy")]
    ControllerBusy = 0x3a,
    #[error("Unacceptable Connection Parameters")]
    UnacceptableConnectionParameters = 0x3b,
    #[error("Advertising Timeout")]
    AdvertisingTimeout = 0x3c,
    #[error("Connection Terminated due to MIC Failure")]
    ConnectionTerminatedMicFailure = 0x3d,
    #[error("Connection Failed to be Established")]
    ConnectionFailedToBeEstablished = 0x3e,
    #[error("Unknown Advertising Identifier")]
    UnknownAdvertisingIdentifier = 0x42,
    #[error("Limit Reached")]
    LimitReached = 0x43,
    #[error("Operation Cancelled by Host")]
    OperationCancelledByHost = 0x44,
    #[error("Packet Too Long")]
    PacketTooLong = 0x45,
    #[error("Unknown status code {0:#04x}")]
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum Role {
    Central = 0x00,
    Peripheral = 0x01,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum AddressType {
    Public = 0x00,
    Random = 0x01,
    PublicIdentity = 0x02,
    RandomIdentity = 0x03,
}

/// A device address in wire (little-endian) byte order.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Default, Hash)]
#[brw(little)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({})", self)
    }
}

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 2]
pub enum PacketBoundary {
    FirstNonAutoFlushable,
    Continuing,
    FirstAutoFlushable,
    Complete,
}

impl PacketBoundary {
    /// Both "first" flavors open a new L2CAP PDU.
    pub fn is_first(&self) -> bool {
        matches!(
            self,
            PacketBoundary::FirstNonAutoFlushable | PacketBoundary::FirstAutoFlushable
        )
    }
}

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 2]
pub enum BroadcastFlag {
    PointToPoint,
    BrEdrBroadcast,
    Reserved1,
    Reserved2,
}

/// The first 16-bit word of an ACL data packet.
#[bitfield]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AclHandleField {
    pub handle: B12,
    pub packet_boundary: PacketBoundary,
    pub broadcast: BroadcastFlag,
}

/// Opcode split into its group (OGF) and command (OCF) fields.
#[bitfield]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Opcode {
    pub ocf: B10,
    pub ogf: B6,
}

impl Opcode {
    pub fn from_raw(opcode: u16) -> Self {
        Self::from_bytes(opcode.to_le_bytes())
    }

    pub fn raw(&self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }
}
