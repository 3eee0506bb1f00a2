use std::io;

use thiserror::Error;

pub mod acl;
pub mod ad_structure;
pub mod att;
pub mod attribute;
pub mod attribute_server;
pub mod config;
pub mod event;
pub mod gap;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod queue;
pub mod semaphore;
pub mod transport;
pub mod types;

pub use attribute::{AttributeTable, CharacteristicHandles, CharacteristicProp, WriteRequest};
pub use attribute_server::GattServer;
pub use config::HostConfig;
pub use event::{Event, LeEvent};
pub use gap::{Gap, GapState, HostEvent};
pub use hci::Command;
pub use host::{Host, TxPacket};
pub use queue::QueueError;
pub use transport::{HciTransport, PollFlags};
pub use types::{BdAddr, ErrorCode};

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(String),
    #[error("Packet Format Error")]
    PacketFormatError,
    #[error("Timeout waiting for command {0:#06x}")]
    Timeout(u16),
    #[error("IOError: {0}")]
    IOError(#[from] io::Error),
    #[error("Controller Error: {0}")]
    CtrlErr(ErrorCode),
    #[error("{intent} not allowed in state {state}")]
    InvalidState { state: GapState, intent: &'static str },
    #[error("Not Connected")]
    NotConnected,
    #[error("Host Closed")]
    Closed,
    #[error("Host Already Started")]
    AlreadyStarted,
}

impl From<QueueError> for BleError {
    fn from(_: QueueError) -> Self {
        BleError::Closed
    }
}
