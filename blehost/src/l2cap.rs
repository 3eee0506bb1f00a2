use std::collections::HashMap;

use log::{trace, warn};

use crate::acl::{encode_acl_fragment, AclHeader};
use crate::types::PacketBoundary;

pub const L2CAP_HEADER_SIZE: usize = 4;

pub const CID_ATT: u16 = 0x0004;
pub const CID_LE_SIGNALING: u16 = 0x0005;
pub const CID_SMP: u16 = 0x0006;

/// A complete L2CAP service data unit.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Sdu {
    pub handle: u16,
    pub cid: u16,
    pub payload: Vec<u8>,
}

struct Assembly {
    cid: u16,
    length: usize,
    payload: Vec<u8>,
}

/// Rebuilds L2CAP SDUs from ACL fragments, one assembly per connection handle.
#[derive(Default)]
pub struct Reassembler {
    in_progress: HashMap<u16, Assembly>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the SDU once its last fragment arrives.
    pub fn feed(&mut self, header: &AclHeader, payload: &[u8]) -> Option<Sdu> {
        let handle = header.handle;
        if header.boundary.is_first() {
            if payload.len() < L2CAP_HEADER_SIZE {
                warn!("[l2cap] first fragment on {} shorter than basic header, dropped", handle);
                return None;
            }
            if self.in_progress.remove(&handle).is_some() {
                warn!("[l2cap] unfinished SDU on {} replaced by a new one", handle);
            }
            let length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            let cid = u16::from_le_bytes([payload[2], payload[3]]);
            let mut data = Vec::with_capacity(length);
            data.extend_from_slice(&payload[L2CAP_HEADER_SIZE..]);
            self.in_progress.insert(
                handle,
                Assembly {
                    cid,
                    length,
                    payload: data,
                },
            );
        } else if header.boundary == PacketBoundary::Continuing {
            let Some(assembly) = self.in_progress.get_mut(&handle) else {
                warn!("[l2cap] continuation on {} without a started SDU, dropped", handle);
                return None;
            };
            assembly.payload.extend_from_slice(payload);
        } else {
            warn!("[l2cap] unsupported boundary flag {:?} on {}", header.boundary, handle);
            return None;
        }

        self.complete(handle)
    }

    fn complete(&mut self, handle: u16) -> Option<Sdu> {
        let assembly = self.in_progress.get(&handle)?;
        let written = assembly.payload.len();
        if written < assembly.length {
            trace!("[l2cap] {} of {} bytes on {}", written, assembly.length, handle);
            return None;
        }
        let assembly = self.in_progress.remove(&handle)?;
        if written > assembly.length {
            warn!(
                "[l2cap] SDU on {} overflowed ({} > {}), dropped",
                handle, written, assembly.length
            );
            return None;
        }
        Some(Sdu {
            handle,
            cid: assembly.cid,
            payload: assembly.payload,
        })
    }

    /// Forgets any partial SDU of a disconnected handle.
    pub fn disconnected(&mut self, handle: u16) {
        self.in_progress.remove(&handle);
    }

    pub fn in_progress(&self, handle: u16) -> bool {
        self.in_progress.contains_key(&handle)
    }
}

/// `[len:u16][cid:u16][payload]`
pub fn encode_sdu(cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(L2CAP_HEADER_SIZE + payload.len());
    pdu.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pdu.extend_from_slice(&cid.to_le_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

/// Splits an SDU into H4 ACL packets carrying at most `max_fragment_len` payload bytes each.
pub fn fragment(handle: u16, cid: u16, payload: &[u8], max_fragment_len: usize) -> Vec<Vec<u8>> {
    let pdu = encode_sdu(cid, payload);
    let max = max_fragment_len.max(1);
    pdu.chunks(max)
        .enumerate()
        .map(|(i, chunk)| {
            let boundary = if i == 0 {
                PacketBoundary::FirstNonAutoFlushable
            } else {
                PacketBoundary::Continuing
            };
            encode_acl_fragment(handle, boundary, chunk)
        })
        .collect()
}
