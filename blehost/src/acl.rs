use crate::hci::hcicode;
use crate::types::{AclHandleField, BroadcastFlag, PacketBoundary, ACL_PKT_HEADER_SIZE, HANDLE_MASK};

/// Decoded `[handle+flags:u16][data_len:u16]` header of an ACL data packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AclHeader {
    pub handle: u16,
    pub boundary: PacketBoundary,
    pub broadcast: BroadcastFlag,
    pub len: u16,
}

impl AclHeader {
    pub fn new(handle: u16, boundary: PacketBoundary, len: u16) -> Self {
        Self {
            handle,
            boundary,
            broadcast: BroadcastFlag::PointToPoint,
            len,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..ACL_PKT_HEADER_SIZE)?;
        let field = AclHandleField::from_bytes([header[0], header[1]]);
        Some(Self {
            handle: field.handle(),
            boundary: field.packet_boundary(),
            broadcast: field.broadcast(),
            len: u16::from_le_bytes([header[2], header[3]]),
        })
    }

    pub fn encode(&self) -> [u8; ACL_PKT_HEADER_SIZE] {
        let field = AclHandleField::new()
            .with_handle(self.handle & HANDLE_MASK)
            .with_packet_boundary(self.boundary)
            .with_broadcast(self.broadcast)
            .into_bytes();
        let len = self.len.to_le_bytes();
        [field[0], field[1], len[0], len[1]]
    }
}

/// Splits an ACL packet (indicator stripped) into header and payload.
/// The payload must be exactly as long as the header declares.
pub fn parse_acl_packet(bytes: &[u8]) -> Option<(AclHeader, &[u8])> {
    let header = AclHeader::parse(bytes)?;
    let payload = &bytes[ACL_PKT_HEADER_SIZE..];
    if payload.len() != header.len as usize {
        return None;
    }
    Some((header, payload))
}

/// Builds a complete H4 ACL packet, indicator byte included.
pub fn encode_acl_fragment(handle: u16, boundary: PacketBoundary, payload: &[u8]) -> Vec<u8> {
    let header = AclHeader::new(handle, boundary, payload.len() as u16);
    let mut packet = Vec::with_capacity(1 + ACL_PKT_HEADER_SIZE + payload.len());
    packet.push(hcicode::ACL_DATA);
    packet.extend_from_slice(&header.encode());
    packet.extend_from_slice(payload);
    packet
}
