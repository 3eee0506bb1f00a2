use log::{debug, trace, warn};

use crate::att::{
    encode_error_response, AttErrorCode, AttPdu, Uuid, ATT_DEFAULT_MTU, ATT_SERVER_MTU,
    FIND_INFO_FORMAT_UUID128, FIND_INFO_FORMAT_UUID16,
};
use crate::attribute::{
    AttributeData, AttributeTable, WriteRequest, CCCD_INDICATE, CCCD_NOTIFY,
    PRIMARY_SERVICE_UUID16,
};

/// Serves an [`AttributeTable`] to the connected client.
pub struct GattServer {
    table: AttributeTable,
    mtu: u16,
}

impl GattServer {
    pub fn new(table: AttributeTable) -> Self {
        Self {
            table,
            mtu: ATT_DEFAULT_MTU,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn table(&self) -> &AttributeTable {
        &self.table
    }

    /// Replaces a characteristic value without notifying anyone.
    pub fn set_value(&mut self, handle: u16, value: &[u8]) -> Result<(), AttErrorCode> {
        match self.table.find_mut(handle).map(|a| &mut a.data) {
            Some(AttributeData::Value { value: stored, .. }) => {
                *stored = value.to_vec();
                Ok(())
            }
            Some(_) => Err(AttErrorCode::WriteNotPermitted),
            None => Err(AttErrorCode::InvalidHandle),
        }
    }

    pub fn is_notify_enabled(&self, value_handle: u16) -> bool {
        matches!(
            self.table.find(value_handle.saturating_add(1)).map(|a| &a.data),
            Some(AttributeData::Cccd {
                notifications: true,
                ..
            })
        )
    }

    pub fn is_indicate_enabled(&self, value_handle: u16) -> bool {
        matches!(
            self.table.find(value_handle.saturating_add(1)).map(|a| &a.data),
            Some(AttributeData::Cccd {
                indications: true,
                ..
            })
        )
    }

    /// Resets per-connection state: the MTU and every CCCD.
    pub fn disconnected(&mut self) {
        self.mtu = ATT_DEFAULT_MTU;
        for handle in 1..self.table.next_handle() {
            if let Some(AttributeData::Cccd {
                notifications,
                indications,
            }) = self.table.find_mut(handle).map(|a| &mut a.data)
            {
                *notifications = false;
                *indications = false;
            }
        }
    }

    /// Answers one raw ATT PDU. `None` means nothing goes back on the wire.
    pub fn handle_pdu(&mut self, conn: u16, data: &[u8]) -> Option<Vec<u8>> {
        match AttPdu::decode(data) {
            Some(pdu) => self.handle_request(conn, &pdu),
            None => {
                let opcode = *data.first()?;
                warn!("[att] malformed PDU {:02x?}", data);
                Some(encode_error_response(opcode, 0, AttErrorCode::InvalidPdu))
            }
        }
    }

    pub fn handle_request(&mut self, conn: u16, pdu: &AttPdu<'_>) -> Option<Vec<u8>> {
        trace!("[att] request {:?}", pdu);
        let opcode = pdu.opcode();
        let result = match *pdu {
            AttPdu::ExchangeMtuReq { mtu } => Ok(self.exchange_mtu(mtu)),
            AttPdu::ReadReq { handle } => self.read(handle),
            AttPdu::ReadByGroupTypeReq {
                start,
                end,
                group_type,
            } => self.read_by_group_type(start, end, group_type),
            AttPdu::ReadByTypeReq {
                start,
                end,
                attribute_type,
            } => self.read_by_type(start, end, attribute_type),
            AttPdu::FindInformationReq { start, end } => self.find_information(start, end),
            AttPdu::WriteReq { handle, value } => self
                .write(conn, handle, value, true)
                .map(|_| AttPdu::WriteRsp.encode())
                .map_err(|code| (handle, code)),
            AttPdu::WriteCmd { handle, value } => {
                if let Err(code) = self.write(conn, handle, value, false) {
                    debug!("[att] write command on {:#06x} rejected: {}", handle, code);
                }
                return None;
            }
            _ => {
                debug!("[att] ignoring opcode {:#04x}", opcode);
                return None;
            }
        };

        Some(match result {
            Ok(rsp) => rsp,
            Err((handle, code)) => {
                debug!("[att] opcode {:#04x} on {:#06x} failed: {}", opcode, handle, code);
                encode_error_response(opcode, handle, code)
            }
        })
    }

    fn exchange_mtu(&mut self, client_mtu: u16) -> Vec<u8> {
        self.mtu = client_mtu.clamp(ATT_DEFAULT_MTU, ATT_SERVER_MTU);
        debug!("[att] MTU exchanged, now {}", self.mtu);
        AttPdu::ExchangeMtuRsp {
            mtu: ATT_SERVER_MTU,
        }
        .encode()
    }

    fn read(&self, handle: u16) -> Result<Vec<u8>, (u16, AttErrorCode)> {
        let attr = self
            .table
            .find(handle)
            .ok_or((handle, AttErrorCode::InvalidHandle))?;
        if !attr.readable() {
            return Err((handle, AttErrorCode::ReadNotPermitted));
        }
        let mut value = attr.value();
        value.truncate(self.mtu as usize - 1);
        Ok(AttPdu::ReadRsp { value: &value }.encode())
    }

    fn check_range(start: u16, end: u16) -> Result<(), (u16, AttErrorCode)> {
        if start == 0 || start > end {
            return Err((start, AttErrorCode::InvalidHandle));
        }
        Ok(())
    }

    fn read_by_group_type(
        &self,
        start: u16,
        end: u16,
        group_type: Uuid,
    ) -> Result<Vec<u8>, (u16, AttErrorCode)> {
        Self::check_range(start, end)?;
        if group_type != PRIMARY_SERVICE_UUID16 {
            return Err((start, AttErrorCode::UnsupportedGroupType));
        }

        let limit = self.mtu as usize - 2;
        let mut length = 0usize;
        let mut data = Vec::new();
        for attr in self.table.iter() {
            if attr.handle < start || attr.handle > end {
                continue;
            }
            let AttributeData::Service { uuid } = &attr.data else {
                continue;
            };
            let entry_len = 4 + uuid.len();
            if length == 0 {
                length = entry_len;
            } else if entry_len != length {
                break;
            }
            if data.len() + entry_len > limit {
                break;
            }
            data.extend_from_slice(&attr.handle.to_le_bytes());
            data.extend_from_slice(&attr.last_handle_in_group.to_le_bytes());
            data.extend_from_slice(&uuid.to_bytes());
        }

        if data.is_empty() {
            return Err((start, AttErrorCode::AttributeNotFound));
        }
        Ok(AttPdu::ReadByGroupTypeRsp {
            length: length as u8,
            data: &data,
        }
        .encode())
    }

    fn read_by_type(
        &self,
        start: u16,
        end: u16,
        attribute_type: Uuid,
    ) -> Result<Vec<u8>, (u16, AttErrorCode)> {
        Self::check_range(start, end)?;

        let limit = self.mtu as usize - 2;
        let max_value = (self.mtu as usize - 4).min(253);
        let mut length = 0usize;
        let mut data = Vec::new();
        for attr in self.table.iter() {
            if attr.handle < start || attr.handle > end || attr.uuid != attribute_type {
                continue;
            }
            if !attr.readable() {
                if data.is_empty() {
                    return Err((attr.handle, AttErrorCode::ReadNotPermitted));
                }
                break;
            }
            let mut value = attr.value();
            value.truncate(max_value);
            let entry_len = 2 + value.len();
            if length == 0 {
                length = entry_len;
            } else if entry_len != length {
                break;
            }
            if data.len() + entry_len > limit {
                break;
            }
            data.extend_from_slice(&attr.handle.to_le_bytes());
            data.extend_from_slice(&value);
        }

        if data.is_empty() {
            return Err((start, AttErrorCode::AttributeNotFound));
        }
        Ok(AttPdu::ReadByTypeRsp {
            length: length as u8,
            data: &data,
        }
        .encode())
    }

    fn find_information(&self, start: u16, end: u16) -> Result<Vec<u8>, (u16, AttErrorCode)> {
        Self::check_range(start, end)?;

        let limit = self.mtu as usize - 2;
        let mut format = 0u8;
        let mut data = Vec::new();
        for attr in self.table.iter() {
            if attr.handle < start || attr.handle > end {
                continue;
            }
            let entry_format = match attr.uuid {
                Uuid::Uuid16(_) => FIND_INFO_FORMAT_UUID16,
                Uuid::Uuid128(_) => FIND_INFO_FORMAT_UUID128,
            };
            if format == 0 {
                format = entry_format;
            } else if entry_format != format {
                break;
            }
            let entry_len = 2 + attr.uuid.len();
            if data.len() + entry_len > limit {
                break;
            }
            data.extend_from_slice(&attr.handle.to_le_bytes());
            data.extend_from_slice(&attr.uuid.to_bytes());
        }

        if data.is_empty() {
            return Err((start, AttErrorCode::AttributeNotFound));
        }
        Ok(AttPdu::FindInformationRsp {
            format,
            data: &data,
        }
        .encode())
    }

    fn write(
        &mut self,
        conn: u16,
        handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), AttErrorCode> {
        let attr = self
            .table
            .find_mut(handle)
            .ok_or(AttErrorCode::InvalidHandle)?;
        if !attr.writable() {
            return Err(AttErrorCode::WriteNotPermitted);
        }

        match &mut attr.data {
            AttributeData::Cccd {
                notifications,
                indications,
            } => {
                if value.len() != 2 {
                    return Err(AttErrorCode::InvalidAttributeValueLength);
                }
                let bits = u16::from_le_bytes([value[0], value[1]]);
                *notifications = bits & CCCD_NOTIFY != 0;
                *indications = bits & CCCD_INDICATE != 0;
                debug!("[att] CCCD {:#06x} set to {:#06x}", handle, bits);
                Ok(())
            }
            AttributeData::Value {
                value: stored,
                handler,
                ..
            } => {
                if let Some(handler) = handler {
                    handler(&WriteRequest {
                        conn,
                        handle,
                        value,
                        with_response,
                    })?;
                }
                *stored = value.to_vec();
                Ok(())
            }
            _ => Err(AttErrorCode::WriteNotPermitted),
        }
    }
}
