use core::fmt;

use crate::att::{AttErrorCode, Uuid};

pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x2800);
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::Uuid16(0x2803);
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::Uuid16(0x2902);

pub const CCCD_NOTIFY: u16 = 0x0001;
pub const CCCD_INDICATE: u16 = 0x0002;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CharacteristicProp {
    Broadcast = 0x01,
    Read = 0x02,
    WriteWithoutResponse = 0x04,
    Write = 0x08,
    Notify = 0x10,
    Indicate = 0x20,
    AuthenticatedWrite = 0x40,
    Extended = 0x80,
}

/// Bitmask of [`CharacteristicProp`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct CharacteristicProps(u8);

impl CharacteristicProps {
    pub fn new(props: &[CharacteristicProp]) -> Self {
        Self(props.iter().fold(0, |acc, p| acc | *p as u8))
    }

    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        props.iter().any(|p| self.0 & *p as u8 != 0)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// What a write handler sees of an incoming write.
#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub conn: u16,
    pub handle: u16,
    pub value: &'a [u8],
    pub with_response: bool,
}

pub type WriteHandler = Box<dyn FnMut(&WriteRequest<'_>) -> Result<(), AttErrorCode> + Send>;

pub(crate) enum AttributeData {
    Service {
        uuid: Uuid,
    },
    Declaration {
        props: CharacteristicProps,
        value_handle: u16,
        uuid: Uuid,
    },
    Value {
        props: CharacteristicProps,
        value: Vec<u8>,
        handler: Option<WriteHandler>,
    },
    Cccd {
        notifications: bool,
        indications: bool,
    },
}

pub struct Attribute {
    pub(crate) uuid: Uuid,
    pub(crate) handle: u16,
    pub(crate) last_handle_in_group: u16,
    pub(crate) data: AttributeData,
}

impl Attribute {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub(crate) fn readable(&self) -> bool {
        match &self.data {
            AttributeData::Value { props, .. } => props.any(&[CharacteristicProp::Read]),
            _ => true,
        }
    }

    pub(crate) fn writable(&self) -> bool {
        match &self.data {
            AttributeData::Value { props, .. } => props.any(&[
                CharacteristicProp::Write,
                CharacteristicProp::WriteWithoutResponse,
                CharacteristicProp::AuthenticatedWrite,
            ]),
            AttributeData::Cccd { .. } => true,
            _ => false,
        }
    }

    /// The value as a client reads it.
    pub fn value(&self) -> Vec<u8> {
        match &self.data {
            AttributeData::Service { uuid } => uuid.to_bytes(),
            AttributeData::Declaration {
                props,
                value_handle,
                uuid,
            } => {
                let mut v = vec![props.raw()];
                v.extend_from_slice(&value_handle.to_le_bytes());
                v.extend_from_slice(&uuid.to_bytes());
                v
            }
            AttributeData::Value { value, .. } => value.clone(),
            AttributeData::Cccd {
                notifications,
                indications,
            } => {
                let mut bits = 0u16;
                if *notifications {
                    bits |= CCCD_NOTIFY;
                }
                if *indications {
                    bits |= CCCD_INDICATE;
                }
                bits.to_le_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("handle", &self.handle)
            .field("uuid", &self.uuid)
            .field("last_handle_in_group", &self.last_handle_in_group)
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CharacteristicHandles {
    pub declaration: u16,
    pub value: u16,
    pub cccd: Option<u16>,
}

/// Handles a characteristic gets when its declaration lands on `declaration`.
pub const fn characteristic_handles(declaration: u16, has_cccd: bool) -> CharacteristicHandles {
    CharacteristicHandles {
        declaration,
        value: declaration + 1,
        cccd: if has_cccd {
            Some(declaration + 2)
        } else {
            None
        },
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ServiceHandles {
    pub start: u16,
    pub end: u16,
}

/// The attribute database. Handles are assigned sequentially from 0x0001.
#[derive(Default, Debug)]
pub struct AttributeTable {
    attributes: Vec<Attribute>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_handle(&self) -> u16 {
        self.attributes.len() as u16 + 1
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub fn find(&self, handle: u16) -> Option<&Attribute> {
        let index = usize::from(handle).checked_sub(1)?;
        self.attributes.get(index)
    }

    pub(crate) fn find_mut(&mut self, handle: u16) -> Option<&mut Attribute> {
        let index = usize::from(handle).checked_sub(1)?;
        self.attributes.get_mut(index)
    }

    fn push(&mut self, uuid: Uuid, data: AttributeData) -> u16 {
        let handle = self.next_handle();
        self.attributes.push(Attribute {
            uuid,
            handle,
            last_handle_in_group: handle,
            data,
        });
        handle
    }

    pub fn add_service(&mut self, uuid: Uuid) -> ServiceBuilder<'_> {
        let start = self.push(PRIMARY_SERVICE_UUID16, AttributeData::Service { uuid });
        ServiceBuilder { table: self, start }
    }
}

pub struct ServiceBuilder<'a> {
    table: &'a mut AttributeTable,
    start: u16,
}

impl ServiceBuilder<'_> {
    pub fn add_characteristic(
        &mut self,
        uuid: Uuid,
        props: &[CharacteristicProp],
        value: &[u8],
    ) -> CharacteristicHandles {
        self.push_characteristic(uuid, CharacteristicProps::new(props), value, None)
    }

    pub fn add_characteristic_with_handler<F>(
        &mut self,
        uuid: Uuid,
        props: &[CharacteristicProp],
        value: &[u8],
        handler: F,
    ) -> CharacteristicHandles
    where
        F: FnMut(&WriteRequest<'_>) -> Result<(), AttErrorCode> + Send + 'static,
    {
        self.push_characteristic(
            uuid,
            CharacteristicProps::new(props),
            value,
            Some(Box::new(handler)),
        )
    }

    fn push_characteristic(
        &mut self,
        uuid: Uuid,
        props: CharacteristicProps,
        value: &[u8],
        handler: Option<WriteHandler>,
    ) -> CharacteristicHandles {
        let has_cccd = props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]);
        let handles = characteristic_handles(self.table.next_handle(), has_cccd);

        self.table.push(
            CHARACTERISTIC_UUID16,
            AttributeData::Declaration {
                props,
                value_handle: handles.value,
                uuid,
            },
        );
        self.table.push(
            uuid,
            AttributeData::Value {
                props,
                value: value.to_vec(),
                handler,
            },
        );
        if has_cccd {
            self.table.push(
                CHARACTERISTIC_CCCD_UUID16,
                AttributeData::Cccd {
                    notifications: false,
                    indications: false,
                },
            );
        }

        let end = self.table.next_handle() - 1;
        if let Some(service) = self.table.find_mut(self.start) {
            service.last_handle_in_group = end;
        }
        handles
    }

    pub fn build(self) -> ServiceHandles {
        let end = self.table.next_handle() - 1;
        ServiceHandles {
            start: self.start,
            end,
        }
    }
}
