#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blehost::hci::{opcodes, PacketFramer, RawPacket};
use blehost::{HciTransport, PollFlags};
use parking_lot::{Condvar, Mutex};

pub const CONTROLLER_ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct State {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    framer: PacketFramer,
    auto_answer: bool,
    acl_max_len: u16,
    acl_slots: u8,
    failures: HashMap<u16, u8>,
    broken: bool,
    complete_during_write: Option<Duration>,
}

/// An in-memory controller. Commands are answered the way a healthy controller
/// would unless the mock was created `silent`.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    readable: Arc<Condvar>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_buffer_size(27, 12)
    }

    pub fn with_buffer_size(acl_max_len: u16, acl_slots: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rx: VecDeque::new(),
                written: Vec::new(),
                framer: PacketFramer::new(),
                auto_answer: true,
                acl_max_len,
                acl_slots,
                failures: HashMap::new(),
                broken: false,
                complete_during_write: None,
            })),
            readable: Arc::new(Condvar::new()),
        }
    }

    /// Never answers anything.
    pub fn silent() -> Self {
        let mock = Self::new();
        mock.state.lock().auto_answer = false;
        mock
    }

    /// Answers `opcode` with `status` instead of success.
    pub fn fail_command(&self, opcode: u16, status: u8) {
        self.state.lock().failures.insert(opcode, status);
    }

    /// Reports every ACL packet as completed while its `write` is still running,
    /// then holds the write for `delay`.
    pub fn complete_acl_during_write(&self, delay: Duration) {
        self.state.lock().complete_during_write = Some(delay);
    }

    /// Every later read fails as if the device went away.
    pub fn break_link(&self) {
        self.state.lock().broken = true;
        self.readable.notify_all();
    }

    /// Queues raw H4 bytes for the host to read.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
        self.readable.notify_all();
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn written_packets(&self) -> Vec<RawPacket> {
        let mut framer = PacketFramer::new();
        framer.push(&self.written());
        std::iter::from_fn(|| framer.next_packet()).collect()
    }

    /// Opcodes of every command written so far, in order.
    pub fn written_opcodes(&self) -> Vec<u16> {
        self.written_packets()
            .into_iter()
            .filter_map(|p| match p {
                RawPacket::Command(body) => Some(u16::from_le_bytes([body[0], body[1]])),
                _ => None,
            })
            .collect()
    }

    /// ACL packets written so far, H4 indicator included.
    pub fn written_acl(&self) -> Vec<Vec<u8>> {
        self.written_packets()
            .into_iter()
            .filter_map(|p| match p {
                RawPacket::Acl(body) => {
                    let mut packet = vec![0x02];
                    packet.extend_from_slice(&body);
                    Some(packet)
                }
                _ => None,
            })
            .collect()
    }

    fn answer(state: &mut State, opcode: u16) {
        let status = state.failures.get(&opcode).copied().unwrap_or(0);
        let reply = match opcode {
            opcodes::LE_CREATE_CONNECTION | opcodes::DISCONNECT | opcodes::LE_SET_PHY => {
                command_status(opcode, status)
            }
            opcodes::LE_READ_BUFFER_SIZE => {
                let len = state.acl_max_len.to_le_bytes();
                command_complete(opcode, status, &[len[0], len[1], state.acl_slots])
            }
            opcodes::READ_BD_ADDR => command_complete(opcode, status, &CONTROLLER_ADDR),
            _ => command_complete(opcode, status, &[]),
        };
        state.rx.extend(reply);
    }
}

impl HciTransport for MockTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if state.rx.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.written.extend_from_slice(buf);
        let mut stall = None;
        if state.auto_answer {
            state.framer.push(buf);
            while let Some(packet) = state.framer.next_packet() {
                match packet {
                    RawPacket::Command(body) => {
                        let opcode = u16::from_le_bytes([body[0], body[1]]);
                        Self::answer(&mut state, opcode);
                    }
                    RawPacket::Acl(body) => {
                        if let Some(delay) = state.complete_during_write {
                            let handle = u16::from_le_bytes([body[0], body[1]]) & 0x0fff;
                            state.rx.extend(number_of_completed_packets(handle, 1));
                            stall = Some(delay);
                        }
                    }
                    RawPacket::Event(_) => {}
                }
            }
            if !state.rx.is_empty() {
                self.readable.notify_all();
            }
        }
        drop(state);
        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        Ok(buf.len())
    }

    fn poll(&self, interest: PollFlags, timeout: Duration) -> io::Result<PollFlags> {
        if interest.writable {
            return Ok(PollFlags::WRITABLE);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.rx.is_empty() && !state.broken {
            if self.readable.wait_until(&mut state, deadline).timed_out() {
                return Ok(PollFlags::NONE);
            }
        }
        Ok(PollFlags::READABLE)
    }
}

pub fn command_complete(opcode: u16, status: u8, extra: &[u8]) -> Vec<u8> {
    let op = opcode.to_le_bytes();
    let mut packet = vec![0x04, 0x0e, (4 + extra.len()) as u8, 0x01, op[0], op[1], status];
    packet.extend_from_slice(extra);
    packet
}

pub fn command_status(opcode: u16, status: u8) -> Vec<u8> {
    let op = opcode.to_le_bytes();
    vec![0x04, 0x0f, 0x04, status, 0x01, op[0], op[1]]
}

pub fn le_connection_complete(handle: u16, role: u8, status: u8) -> Vec<u8> {
    let h = handle.to_le_bytes();
    vec![
        0x04, 0x3e, 0x13, 0x01, status, h[0], h[1], role, 0x01, 0x4b, 0x7d, 0x99, 0x9c, 0x6f,
        0x45, 0x18, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x05,
    ]
}

pub fn disconnection_complete(handle: u16, reason: u8) -> Vec<u8> {
    let h = handle.to_le_bytes();
    vec![0x04, 0x05, 0x04, 0x00, h[0], h[1], reason]
}

pub fn number_of_completed_packets(handle: u16, count: u16) -> Vec<u8> {
    let h = handle.to_le_bytes();
    let c = count.to_le_bytes();
    vec![0x04, 0x13, 0x05, 0x01, h[0], h[1], c[0], c[1]]
}

/// One ACL packet carrying a complete L2CAP frame on the ATT channel.
pub fn att_acl(handle: u16, att: &[u8]) -> Vec<u8> {
    let h = handle.to_le_bytes();
    let acl_len = ((att.len() + 4) as u16).to_le_bytes();
    let l2cap_len = (att.len() as u16).to_le_bytes();
    let mut packet = vec![
        0x02,
        h[0],
        h[1] | 0x20,
        acl_len[0],
        acl_len[1],
        l2cap_len[0],
        l2cap_len[1],
        0x04,
        0x00,
    ];
    packet.extend_from_slice(att);
    packet
}

/// Polls `condition` for up to two seconds.
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
