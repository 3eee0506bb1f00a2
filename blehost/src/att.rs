use core::fmt;

use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0a;
pub const ATT_READ_RSP: u8 = 0x0b;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1b;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1d;
pub const ATT_HANDLE_VALUE_CFM: u8 = 0x1e;
pub const ATT_WRITE_CMD: u8 = 0x52;

pub const ATT_DEFAULT_MTU: u16 = 23;
pub const ATT_SERVER_MTU: u16 = 247;

/// Find Information response format: 16-bit UUIDs.
pub const FIND_INFO_FORMAT_UUID16: u8 = 0x01;
/// Find Information response format: 128-bit UUIDs.
pub const FIND_INFO_FORMAT_UUID128: u8 = 0x02;

// Vol 3, Part F 3.4.1.1
#[derive(Error, FromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum AttErrorCode {
    #[error("invalid handle")]
    InvalidHandle = 0x01,
    #[error("read not permitted")]
    ReadNotPermitted = 0x02,
    #[error("write not permitted")]
    WriteNotPermitted = 0x03,
    #[error("invalid pdu")]
    InvalidPdu = 0x04,
    #[error("insufficient authentication")]
    InsufficientAuthentication = 0x05,
    #[error("request not supported")]
    RequestNotSupported = 0x06,
    #[error("invalid offset")]
    InvalidOffset = 0x07,
    #[error("insufficient authorization")]
    InsufficientAuthorization = 0x08,
    #[error("prepare queue full")]
    PrepareQueueFull = 0x09,
    #[error("attribute not found")]
    AttributeNotFound = 0x0a,
    #[error("attribute not long")]
    AttributeNotLong = 0x0b,
    #[error("insufficient encryption key size")]
    InsufficientEncryptionKeySize = 0x0c,
    #[error("invalid attribute value length")]
    InvalidAttributeValueLength = 0x0d,
    #[error("unlikely error")]
    UnlikelyError = 0x0e,
    #[error("insufficient encryption")]
    InsufficientEncryption = 0x0f,
    #[error("unsupported group type")]
    UnsupportedGroupType = 0x10,
    #[error("insufficient resources")]
    InsufficientResources = 0x11,
    #[error("value not allowed")]
    ValueNotAllowed = 0x13,
    #[error("application error {0:#04x}")]
    #[num_enum(catch_all)]
    Other(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uuid {
    Uuid16(u16),
    /// Little-endian, as carried on the wire.
    Uuid128([u8; 16]),
}

impl Uuid {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Uuid::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(bytes);
                Some(Uuid::Uuid128(raw))
            }
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Uuid::Uuid16(v) => v.to_le_bytes().to_vec(),
            Uuid::Uuid128(raw) => raw.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Uuid::Uuid16(_) => 2,
            Uuid::Uuid128(_) => 16,
        }
    }
}

impl From<u16> for Uuid {
    fn from(value: u16) -> Self {
        Uuid::Uuid16(value)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(value: [u8; 16]) -> Self {
        Uuid::Uuid128(value)
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uuid::Uuid16(v) => write!(f, "Uuid16({:#06x})", v),
            Uuid::Uuid128(raw) => {
                write!(f, "Uuid128(")?;
                for b in raw.iter().rev() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One ATT PDU, borrowing its variable-length parts from the received buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttPdu<'a> {
    ErrorRsp {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
    },
    ExchangeMtuReq {
        mtu: u16,
    },
    ExchangeMtuRsp {
        mtu: u16,
    },
    FindInformationReq {
        start: u16,
        end: u16,
    },
    FindInformationRsp {
        format: u8,
        data: &'a [u8],
    },
    ReadByTypeReq {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    ReadByTypeRsp {
        length: u8,
        data: &'a [u8],
    },
    ReadReq {
        handle: u16,
    },
    ReadRsp {
        value: &'a [u8],
    },
    ReadByGroupTypeReq {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    ReadByGroupTypeRsp {
        length: u8,
        data: &'a [u8],
    },
    WriteReq {
        handle: u16,
        value: &'a [u8],
    },
    WriteRsp,
    WriteCmd {
        handle: u16,
        value: &'a [u8],
    },
    HandleValueNtf {
        handle: u16,
        value: &'a [u8],
    },
    HandleValueInd {
        handle: u16,
        value: &'a [u8],
    },
    HandleValueCfm,
    Unknown {
        opcode: u8,
        params: &'a [u8],
    },
}

fn u16_at(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

impl<'a> AttPdu<'a> {
    /// `None` for an empty buffer or a known opcode with truncated parameters.
    pub fn decode(data: &'a [u8]) -> Option<Self> {
        let (&opcode, p) = data.split_first()?;
        Some(match opcode {
            ATT_ERROR_RSP => AttPdu::ErrorRsp {
                request_opcode: *p.first()?,
                handle: u16_at(p, 1)?,
                code: AttErrorCode::from(*p.get(3)?),
            },
            ATT_EXCHANGE_MTU_REQ => AttPdu::ExchangeMtuReq { mtu: u16_at(p, 0)? },
            ATT_EXCHANGE_MTU_RSP => AttPdu::ExchangeMtuRsp { mtu: u16_at(p, 0)? },
            ATT_FIND_INFORMATION_REQ => AttPdu::FindInformationReq {
                start: u16_at(p, 0)?,
                end: u16_at(p, 2)?,
            },
            ATT_FIND_INFORMATION_RSP => AttPdu::FindInformationRsp {
                format: *p.first()?,
                data: &p[1..],
            },
            ATT_READ_BY_TYPE_REQ => AttPdu::ReadByTypeReq {
                start: u16_at(p, 0)?,
                end: u16_at(p, 2)?,
                attribute_type: Uuid::from_slice(p.get(4..)?)?,
            },
            ATT_READ_BY_TYPE_RSP => AttPdu::ReadByTypeRsp {
                length: *p.first()?,
                data: &p[1..],
            },
            ATT_READ_REQ => AttPdu::ReadReq { handle: u16_at(p, 0)? },
            ATT_READ_RSP => AttPdu::ReadRsp { value: p },
            ATT_READ_BY_GROUP_TYPE_REQ => AttPdu::ReadByGroupTypeReq {
                start: u16_at(p, 0)?,
                end: u16_at(p, 2)?,
                group_type: Uuid::from_slice(p.get(4..)?)?,
            },
            ATT_READ_BY_GROUP_TYPE_RSP => AttPdu::ReadByGroupTypeRsp {
                length: *p.first()?,
                data: &p[1..],
            },
            ATT_WRITE_REQ => AttPdu::WriteReq {
                handle: u16_at(p, 0)?,
                value: &p[2..],
            },
            ATT_WRITE_RSP => AttPdu::WriteRsp,
            ATT_WRITE_CMD => AttPdu::WriteCmd {
                handle: u16_at(p, 0)?,
                value: &p[2..],
            },
            ATT_HANDLE_VALUE_NTF => AttPdu::HandleValueNtf {
                handle: u16_at(p, 0)?,
                value: &p[2..],
            },
            ATT_HANDLE_VALUE_IND => AttPdu::HandleValueInd {
                handle: u16_at(p, 0)?,
                value: &p[2..],
            },
            ATT_HANDLE_VALUE_CFM => AttPdu::HandleValueCfm,
            _ => AttPdu::Unknown { opcode, params: p },
        })
    }

    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorRsp { .. } => ATT_ERROR_RSP,
            AttPdu::ExchangeMtuReq { .. } => ATT_EXCHANGE_MTU_REQ,
            AttPdu::ExchangeMtuRsp { .. } => ATT_EXCHANGE_MTU_RSP,
            AttPdu::FindInformationReq { .. } => ATT_FIND_INFORMATION_REQ,
            AttPdu::FindInformationRsp { .. } => ATT_FIND_INFORMATION_RSP,
            AttPdu::ReadByTypeReq { .. } => ATT_READ_BY_TYPE_REQ,
            AttPdu::ReadByTypeRsp { .. } => ATT_READ_BY_TYPE_RSP,
            AttPdu::ReadReq { .. } => ATT_READ_REQ,
            AttPdu::ReadRsp { .. } => ATT_READ_RSP,
            AttPdu::ReadByGroupTypeReq { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            AttPdu::ReadByGroupTypeRsp { .. } => ATT_READ_BY_GROUP_TYPE_RSP,
            AttPdu::WriteReq { .. } => ATT_WRITE_REQ,
            AttPdu::WriteRsp => ATT_WRITE_RSP,
            AttPdu::WriteCmd { .. } => ATT_WRITE_CMD,
            AttPdu::HandleValueNtf { .. } => ATT_HANDLE_VALUE_NTF,
            AttPdu::HandleValueInd { .. } => ATT_HANDLE_VALUE_IND,
            AttPdu::HandleValueCfm => ATT_HANDLE_VALUE_CFM,
            AttPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = vec![self.opcode()];
        match self {
            AttPdu::ErrorRsp {
                request_opcode,
                handle,
                code,
            } => {
                w.push(*request_opcode);
                w.extend_from_slice(&handle.to_le_bytes());
                w.push((*code).into());
            }
            AttPdu::ExchangeMtuReq { mtu } | AttPdu::ExchangeMtuRsp { mtu } => {
                w.extend_from_slice(&mtu.to_le_bytes());
            }
            AttPdu::FindInformationReq { start, end } => {
                w.extend_from_slice(&start.to_le_bytes());
                w.extend_from_slice(&end.to_le_bytes());
            }
            AttPdu::ReadByTypeReq {
                start,
                end,
                attribute_type: uuid,
            }
            | AttPdu::ReadByGroupTypeReq {
                start,
                end,
                group_type: uuid,
            } => {
                w.extend_from_slice(&start.to_le_bytes());
                w.extend_from_slice(&end.to_le_bytes());
                w.extend_from_slice(&uuid.to_bytes());
            }
            AttPdu::FindInformationRsp { format: n, data }
            | AttPdu::ReadByTypeRsp { length: n, data }
            | AttPdu::ReadByGroupTypeRsp { length: n, data } => {
                w.push(*n);
                w.extend_from_slice(data);
            }
            AttPdu::ReadReq { handle } => w.extend_from_slice(&handle.to_le_bytes()),
            AttPdu::ReadRsp { value } => w.extend_from_slice(value),
            AttPdu::WriteReq { handle, value }
            | AttPdu::WriteCmd { handle, value }
            | AttPdu::HandleValueNtf { handle, value }
            | AttPdu::HandleValueInd { handle, value } => {
                w.extend_from_slice(&handle.to_le_bytes());
                w.extend_from_slice(value);
            }
            AttPdu::WriteRsp | AttPdu::HandleValueCfm => {}
            AttPdu::Unknown { params, .. } => w.extend_from_slice(params),
        }
        w
    }
}

pub fn encode_error_response(request_opcode: u8, handle: u16, code: AttErrorCode) -> Vec<u8> {
    AttPdu::ErrorRsp {
        request_opcode,
        handle,
        code,
    }
    .encode()
}

pub fn encode_notification(handle: u16, value: &[u8]) -> Vec<u8> {
    AttPdu::HandleValueNtf { handle, value }.encode()
}

pub fn encode_indication(handle: u16, value: &[u8]) -> Vec<u8> {
    AttPdu::HandleValueInd { handle, value }.encode()
}

pub fn encode_confirmation() -> Vec<u8> {
    AttPdu::HandleValueCfm.encode()
}

pub fn encode_write(handle: u16, value: &[u8], with_response: bool) -> Vec<u8> {
    if with_response {
        AttPdu::WriteReq { handle, value }.encode()
    } else {
        AttPdu::WriteCmd { handle, value }.encode()
    }
}
