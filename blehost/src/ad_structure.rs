use thiserror::Error;

use crate::att::Uuid;
use crate::hci::AdvertisingData;

pub const AD_FLAG_LE_LIMITED_DISCOVERABLE: u8 = 0b00000001;
pub const LE_GENERAL_DISCOVERABLE: u8 = 0b00000010;
pub const BR_EDR_NOT_SUPPORTED: u8 = 0b00000100;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdvertisementDataError {
    #[error("advertising data exceeds 31 bytes")]
    TooLong,
}

#[derive(Debug, Copy, Clone)]
pub enum AdStructure<'a> {
    /// Device flags and baseband capabilities. Must not be used in scan response data.
    Flags(u8),
    ServiceUuids16(&'a [u16]),
    ServiceUuids128(&'a [Uuid]),
    ServiceData16 {
        uuid: u16,
        data: &'a [u8],
    },
    CompleteLocalName(&'a str),
    ShortenedLocalName(&'a str),
    ManufacturerSpecificData {
        company_identifier: u16,
        payload: &'a [u8],
    },
    Unknown {
        ty: u8,
        data: &'a [u8],
    },
}

impl AdStructure<'_> {
    fn append_to(&self, out: &mut Vec<u8>) {
        let (ty, body): (u8, Vec<u8>) = match self {
            AdStructure::Flags(flags) => (0x01, vec![*flags]),
            AdStructure::ServiceUuids16(uuids) => {
                (0x02, uuids.iter().flat_map(|u| u.to_le_bytes()).collect())
            }
            AdStructure::ServiceUuids128(uuids) => {
                (0x06, uuids.iter().flat_map(|u| u.to_bytes()).collect())
            }
            AdStructure::ShortenedLocalName(name) => (0x08, name.as_bytes().to_vec()),
            AdStructure::CompleteLocalName(name) => (0x09, name.as_bytes().to_vec()),
            AdStructure::ServiceData16 { uuid, data } => {
                let mut body = uuid.to_le_bytes().to_vec();
                body.extend_from_slice(data);
                (0x16, body)
            }
            AdStructure::ManufacturerSpecificData {
                company_identifier,
                payload,
            } => {
                let mut body = company_identifier.to_le_bytes().to_vec();
                body.extend_from_slice(payload);
                (0xff, body)
            }
            AdStructure::Unknown { ty, data } => (*ty, data.to_vec()),
        };
        out.push((body.len() + 1) as u8);
        out.push(ty);
        out.extend_from_slice(&body);
    }
}

/// Packs AD structures into an advertising (or scan response) payload.
pub fn create_advertising_data(ad: &[AdStructure]) -> Result<AdvertisingData, AdvertisementDataError> {
    let mut raw = Vec::new();
    for item in ad {
        item.append_to(&mut raw);
    }
    AdvertisingData::from_slice(&raw).map_err(|_| AdvertisementDataError::TooLong)
}
