use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::acl::parse_acl_packet;
use crate::att::{
    encode_confirmation, encode_indication, encode_notification, encode_write, AttPdu,
    ATT_DEFAULT_MTU, ATT_SERVER_MTU,
};
use crate::attribute_server::GattServer;
use crate::config::HostConfig;
use crate::event::{CommandComplete, Event};
use crate::gap::{Gap, GapState, HostEvent};
use crate::hci::{
    AdvertisingData, AdvertisingParameters, Command, ConnectParameters, PacketFramer, RawPacket,
    ScanParameters,
};
use crate::l2cap::{fragment, Reassembler, Sdu, CID_ATT, CID_LE_SIGNALING, CID_SMP};
use crate::queue::Queue;
use crate::semaphore::CreditSemaphore;
use crate::transport::{HciTransport, PollFlags};
use crate::types::{AddressType, BdAddr, ErrorCode};
use crate::BleError;

const READ_CHUNK_SIZE: usize = 1024;

/// One packet bound for the controller, H4 indicator included.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TxPacket {
    /// Not subject to ACL flow control.
    Command(Vec<u8>),
    /// Takes one controller buffer credit.
    Acl(Vec<u8>),
}

struct Shared<T> {
    transport: T,
    config: HostConfig,
    gap: Mutex<Gap>,
    /// One entry per SDU or command burst, so fragments never interleave.
    tx_queue: Queue<Vec<TxPacket>>,
    event_queue: Queue<HostEvent>,
    credits: CreditSemaphore,
    cancel: AtomicBool,
    acl_max_len: AtomicUsize,
    att_mtu: AtomicU16,
    in_flight: AtomicUsize,
    bd_addr: Mutex<Option<BdAddr>>,
}

impl<T: HciTransport> Shared<T> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        self.tx_queue.close();
        self.event_queue.close();
        self.credits.close();
    }

    /// Drains whatever the transport has buffered into the framer.
    fn read_available(&self, framer: &mut PacketFramer) -> Result<(), BleError> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => framer.push(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes every byte. `Ok(false)` when cancelled before finishing.
    fn write_all(&self, bytes: &[u8]) -> Result<bool, BleError> {
        let mut offset = 0;
        while offset < bytes.len() {
            if self.cancelled() {
                return Ok(false);
            }
            let ready = self
                .transport
                .poll(PollFlags::WRITABLE, self.config.poll_timeout)?;
            if !ready.writable {
                continue;
            }
            match self.transport.write(&bytes[offset..]) {
                Ok(n) => offset += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Synchronous round trip used during bring-up, before the loops exist.
    fn command(
        &self,
        framer: &mut PacketFramer,
        command: Command,
    ) -> Result<CommandComplete, BleError> {
        let opcode = command.opcode();
        debug!("[host] bring-up command {:#06x}", opcode);
        if !self.write_all(&command.encode())? {
            return Err(BleError::Closed);
        }

        for _ in 0..self.config.command_attempts {
            if self.cancelled() {
                return Err(BleError::Closed);
            }
            let ready = self
                .transport
                .poll(PollFlags::READABLE, self.config.poll_timeout)?;
            if ready.readable {
                self.read_available(framer)?;
            }
            while let Some(packet) = framer.next_packet() {
                let RawPacket::Event(bytes) = packet else {
                    trace!("[host] non-event packet during bring-up dropped");
                    continue;
                };
                match Event::decode(&bytes) {
                    Some(Event::CommandComplete(cc)) if cc.opcode == opcode => {
                        let status = cc.status();
                        if !status.is_success() {
                            return Err(BleError::CtrlErr(status));
                        }
                        return Ok(cc);
                    }
                    Some(Event::CommandStatus(cs)) if cs.opcode == opcode => {
                        if !cs.status.is_success() {
                            return Err(BleError::CtrlErr(cs.status));
                        }
                    }
                    other => trace!("[host] ignoring {:?} during bring-up", other),
                }
            }
        }
        Err(BleError::Timeout(opcode))
    }

    fn bring_up(&self, framer: &mut PacketFramer) -> Result<(), BleError> {
        self.command(framer, Command::Reset)?;

        let rsp = self.command(framer, Command::LeReadBufferSize)?;
        let params = &rsp.return_parameters;
        if params.len() < 4 {
            return Err(BleError::PacketFormatError);
        }
        let mut max_len = u16::from_le_bytes([params[1], params[2]]) as usize;
        let mut slots = params[3] as usize;
        if max_len == 0 {
            max_len = self.config.fallback_acl_max_len;
        }
        if slots == 0 {
            slots = self.config.fallback_acl_slots;
        }
        self.acl_max_len.store(max_len, Ordering::Release);
        self.credits.init(slots);
        info!("[host] controller ACL buffers: {} x {} bytes", slots, max_len);

        let rsp = self.command(framer, Command::ReadBdAddr)?;
        let addr = rsp
            .return_parameters
            .get(1..7)
            .ok_or(BleError::PacketFormatError)?;
        let mut raw = [0u8; 6];
        raw.copy_from_slice(addr);
        let addr = BdAddr::new(raw);
        info!("[host] controller address {}", addr);
        *self.bd_addr.lock() = Some(addr);

        self.command(framer, Command::SetEventMask(self.config.event_mask))?;
        self.command(framer, Command::LeSetEventMask(self.config.le_event_mask))?;

        self.gap.lock().initialized();
        Ok(())
    }

    fn publish(&self, events: Vec<HostEvent>) {
        for event in events {
            if self.event_queue.try_send(event).is_err() {
                warn!("[host] event queue full or closed, event dropped");
            }
        }
    }

    fn send_acl(&self, fragments: Vec<Vec<u8>>, from_read_loop: bool) -> Result<(), BleError> {
        let packets = fragments.into_iter().map(TxPacket::Acl).collect();
        if from_read_loop {
            self.tx_queue.force_send(packets)?;
        } else {
            self.tx_queue.send(packets)?;
        }
        Ok(())
    }

    fn read_loop(&self, mut server: GattServer, mut framer: PacketFramer) {
        let mut reassembler = Reassembler::new();
        debug!("[host] read loop started");

        while !self.cancelled() {
            while let Some(packet) = framer.next_packet() {
                match packet {
                    RawPacket::Event(bytes) => self.on_event(&bytes, &mut server, &mut reassembler),
                    RawPacket::Acl(bytes) => self.on_acl(&bytes, &mut server, &mut reassembler),
                    RawPacket::Command(_) => trace!("[host] command packet from controller ignored"),
                }
            }

            let ready = match self
                .transport
                .poll(PollFlags::READABLE, self.config.poll_timeout)
            {
                Ok(ready) => ready,
                Err(e) => {
                    error!("[host] transport poll failed: {}", e);
                    break;
                }
            };
            if ready.readable {
                if let Err(e) = self.read_available(&mut framer) {
                    error!("[host] transport read failed: {}", e);
                    break;
                }
            }
        }

        if !self.cancelled() {
            self.shutdown();
        }
        debug!("[host] read loop exited");
    }

    fn on_event(&self, bytes: &[u8], server: &mut GattServer, reassembler: &mut Reassembler) {
        let Some(event) = Event::decode(bytes) else {
            warn!("[host] undecodable event {:02x?}", bytes);
            return;
        };
        trace!("[host] event {:?}", event);

        match &event {
            Event::NumberOfCompletedPackets(ncp) => {
                let total = ncp.total();
                let _ = self
                    .in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_sub(total))
                    });
                self.credits.release(total);
                return;
            }
            Event::DataBufferOverflow { link_type } => {
                warn!("[host] controller data buffer overflow (link type {})", link_type);
                return;
            }
            Event::HardwareError { hardware_code } => {
                error!("[host] controller hardware error {:#04x}", hardware_code);
            }
            _ => {}
        }

        let mut gap = self.gap.lock();
        let previous = gap.conn_handle();
        gap.handle_event(&event);

        if let (Some(handle), None) = (previous, gap.conn_handle()) {
            reassembler.disconnected(handle);
            server.disconnected();
            self.att_mtu.store(ATT_DEFAULT_MTU, Ordering::Release);
            let pending = self.in_flight.swap(0, Ordering::AcqRel);
            self.credits.release(pending);
        }

        let commands: Vec<TxPacket> = std::iter::from_fn(|| gap.next_command())
            .map(|c| TxPacket::Command(c.encode().to_vec()))
            .collect();
        let events: Vec<HostEvent> = std::iter::from_fn(|| gap.poll_event()).collect();
        if !commands.is_empty() {
            if let Err(e) = self.tx_queue.force_send(commands) {
                debug!("[host] commands dropped: {}", e);
            }
        }
        drop(gap);
        self.publish(events);
    }

    fn on_acl(&self, bytes: &[u8], server: &mut GattServer, reassembler: &mut Reassembler) {
        let Some((header, payload)) = parse_acl_packet(bytes) else {
            warn!("[host] malformed ACL packet {:02x?}", bytes);
            return;
        };
        let Some(sdu) = reassembler.feed(&header, payload) else {
            return;
        };
        match sdu.cid {
            CID_ATT => self.on_att(sdu, server),
            CID_LE_SIGNALING | CID_SMP => {
                debug!("[host] L2CAP channel {:#06x} not handled", sdu.cid)
            }
            cid => debug!("[host] SDU on unknown channel {:#06x} dropped", cid),
        }
    }

    fn on_att(&self, sdu: Sdu, server: &mut GattServer) {
        let mut events = Vec::new();
        let mut reply = None;

        match AttPdu::decode(&sdu.payload) {
            Some(AttPdu::HandleValueNtf { handle, value }) => events.push(HostEvent::Notification {
                handle,
                value: value.to_vec(),
            }),
            Some(AttPdu::HandleValueInd { handle, value }) => {
                events.push(HostEvent::Indication {
                    handle,
                    value: value.to_vec(),
                });
                reply = Some(encode_confirmation());
            }
            Some(AttPdu::HandleValueCfm) => events.push(HostEvent::IndicationConfirmed),
            Some(AttPdu::WriteRsp) => events.push(HostEvent::WriteCompleted),
            Some(AttPdu::ReadRsp { value }) => events.push(HostEvent::ReadCompleted {
                value: value.to_vec(),
            }),
            Some(AttPdu::ErrorRsp {
                request_opcode,
                handle,
                code,
            }) => events.push(HostEvent::AttError {
                request_opcode,
                handle,
                code,
            }),
            Some(AttPdu::ExchangeMtuRsp { mtu }) => {
                let mtu = mtu.clamp(ATT_DEFAULT_MTU, ATT_SERVER_MTU);
                self.att_mtu.store(mtu, Ordering::Release);
                events.push(HostEvent::MtuExchanged { mtu });
            }
            Some(pdu @ AttPdu::ExchangeMtuReq { .. }) => {
                reply = server.handle_request(sdu.handle, &pdu);
                let mtu = server.mtu();
                self.att_mtu.store(mtu, Ordering::Release);
                events.push(HostEvent::MtuExchanged { mtu });
            }
            Some(pdu) => reply = server.handle_request(sdu.handle, &pdu),
            None => reply = server.handle_pdu(sdu.handle, &sdu.payload),
        }

        if let Some(rsp) = reply {
            let max_len = self.acl_max_len.load(Ordering::Acquire);
            let fragments = fragment(sdu.handle, CID_ATT, &rsp, max_len);
            if let Err(e) = self.send_acl(fragments, true) {
                debug!("[host] ATT response dropped: {}", e);
            }
        }
        self.publish(events);
    }

    /// Hands back the credit of an ACL packet that never reached the controller,
    /// unless a disconnection already reclaimed it.
    fn unsent(&self) {
        let taken = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if taken.is_ok() {
            self.credits.release(1);
        }
    }

    /// `false` once the write loop has to stop.
    fn write_packet(&self, packet: &TxPacket) -> bool {
        let result = match packet {
            TxPacket::Command(bytes) => self.write_all(bytes),
            TxPacket::Acl(bytes) => {
                if !self.credits.acquire() {
                    return false;
                }
                // The controller may complete the packet before write returns.
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                let result = self.write_all(bytes);
                if !matches!(result, Ok(true)) {
                    self.unsent();
                }
                result
            }
        };
        match result {
            Ok(true) => {
                trace!("[host] wrote {:?}", packet);
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("[host] transport write failed: {}", e);
                self.shutdown();
                false
            }
        }
    }

    fn write_loop(&self) {
        debug!("[host] write loop started");
        'batches: while let Some(batch) = self.tx_queue.recv() {
            for packet in &batch {
                if !self.write_packet(packet) {
                    break 'batches;
                }
            }
        }
        debug!("[host] write loop exited");
    }
}

/// The host coordinator: controller bring-up, the `ble-read` and `ble-write`
/// threads, and the thread-safe application API.
pub struct Host<T: HciTransport> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<T: HciTransport> Host<T> {
    pub fn new(transport: T, config: HostConfig) -> Self {
        let shared = Shared {
            transport,
            gap: Mutex::new(Gap::new()),
            tx_queue: Queue::new(config.tx_queue_capacity),
            event_queue: Queue::new(config.event_queue_capacity),
            credits: CreditSemaphore::new(config.fallback_acl_slots),
            cancel: AtomicBool::new(false),
            acl_max_len: AtomicUsize::new(config.fallback_acl_max_len),
            att_mtu: AtomicU16::new(ATT_DEFAULT_MTU),
            in_flight: AtomicUsize::new(0),
            bd_addr: Mutex::new(None),
            config,
        };
        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Brings the controller up, then hands `server` to the read loop and starts both threads.
    pub fn start(&self, server: GattServer) -> Result<(), BleError> {
        if self.shared.cancelled() {
            return Err(BleError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BleError::AlreadyStarted);
        }

        let mut framer = PacketFramer::new();
        if let Err(e) = self.shared.bring_up(&mut framer) {
            error!("[host] controller bring-up failed: {}", e);
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        let reader = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("ble-read".into())
                .spawn(move || shared.read_loop(server, framer))?
        };
        self.workers.lock().push(reader);

        let writer = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("ble-write".into())
                .spawn(move || shared.write_loop())
        };
        match writer {
            Ok(handle) => self.workers.lock().push(handle),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }
        info!("[host] started");
        Ok(())
    }

    /// Closes everything and joins both threads. Safe to call at any time, more than once.
    pub fn stop(&self) {
        self.shared.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("[host] worker thread panicked");
            }
        }
    }

    fn intent<F>(&self, f: F) -> Result<(), BleError>
    where
        F: FnOnce(&mut Gap) -> Result<(), BleError>,
    {
        if self.shared.cancelled() {
            return Err(BleError::Closed);
        }
        let mut gap = self.shared.gap.lock();
        f(&mut gap)?;
        let commands: Vec<TxPacket> = std::iter::from_fn(|| gap.next_command())
            .map(|c| TxPacket::Command(c.encode().to_vec()))
            .collect();
        // Never block with the GAP lock held: the read loop needs it to return credits.
        if !commands.is_empty() {
            self.shared.tx_queue.force_send(commands)?;
        }
        Ok(())
    }

    pub fn start_advertising(
        &self,
        params: AdvertisingParameters,
        adv_data: AdvertisingData,
        scan_rsp_data: Option<AdvertisingData>,
    ) -> Result<(), BleError> {
        self.intent(|gap| gap.start_advertising(params, adv_data, scan_rsp_data))
    }

    pub fn stop_advertising(&self) -> Result<(), BleError> {
        self.intent(|gap| gap.stop_advertising())
    }

    pub fn start_scanning(
        &self,
        params: ScanParameters,
        filter_duplicates: bool,
    ) -> Result<(), BleError> {
        self.intent(|gap| gap.start_scanning(params, filter_duplicates))
    }

    pub fn stop_scanning(&self) -> Result<(), BleError> {
        self.intent(|gap| gap.stop_scanning())
    }

    pub fn connect(
        &self,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        params: ConnectParameters,
    ) -> Result<(), BleError> {
        self.intent(|gap| gap.connect(peer_address_type, peer_address, params))
    }

    pub fn cancel_connect(&self) -> Result<(), BleError> {
        self.intent(|gap| gap.cancel_connect())
    }

    pub fn disconnect(&self, reason: ErrorCode) -> Result<(), BleError> {
        self.intent(|gap| gap.disconnect(reason))
    }

    pub fn request_data_length(&self, tx_octets: u16, tx_time: u16) -> Result<(), BleError> {
        self.intent(|gap| gap.request_data_length(tx_octets, tx_time))
    }

    pub fn request_phy_update(&self, tx_phys: u8, rx_phys: u8) -> Result<(), BleError> {
        self.intent(|gap| gap.request_phy_update(tx_phys, rx_phys))
    }

    /// Sends one L2CAP SDU on the current connection.
    pub fn send_data(&self, cid: u16, payload: &[u8]) -> Result<(), BleError> {
        if self.shared.cancelled() {
            return Err(BleError::Closed);
        }
        let handle = self.conn_handle().ok_or(BleError::NotConnected)?;
        let fragments = fragment(handle, cid, payload, self.acl_max_len());
        self.shared.send_acl(fragments, false)
    }

    pub fn gatt_write(&self, handle: u16, value: &[u8], with_response: bool) -> Result<(), BleError> {
        self.check_value_len(value)?;
        self.send_data(CID_ATT, &encode_write(handle, value, with_response))
    }

    fn check_value_len(&self, value: &[u8]) -> Result<(), BleError> {
        let max = self.att_mtu() as usize - 3;
        if value.len() > max {
            return Err(BleError::InvalidParameter(format!(
                "value of {} bytes exceeds ATT MTU payload {}",
                value.len(),
                max
            )));
        }
        Ok(())
    }

    /// Sent whether or not the client enabled notifications in its CCCD.
    pub fn notify(&self, handle: u16, value: &[u8]) -> Result<(), BleError> {
        self.check_value_len(value)?;
        self.send_data(CID_ATT, &encode_notification(handle, value))
    }

    pub fn indicate(&self, handle: u16, value: &[u8]) -> Result<(), BleError> {
        self.check_value_len(value)?;
        self.send_data(CID_ATT, &encode_indication(handle, value))
    }

    /// Blocks until the next event; `Closed` once the host stopped.
    pub fn next_event(&self) -> Result<HostEvent, BleError> {
        self.shared.event_queue.recv().ok_or(BleError::Closed)
    }

    pub fn try_next_event(&self) -> Option<HostEvent> {
        self.shared.event_queue.try_recv()
    }

    pub fn next_event_timeout(&self, timeout: Duration) -> Option<HostEvent> {
        self.shared.event_queue.recv_timeout(timeout)
    }

    pub fn acl_credits(&self) -> usize {
        self.shared.credits.available()
    }

    pub fn acl_max_len(&self) -> usize {
        self.shared.acl_max_len.load(Ordering::Acquire)
    }

    pub fn bd_addr(&self) -> Option<BdAddr> {
        *self.shared.bd_addr.lock()
    }

    pub fn gap_state(&self) -> GapState {
        self.shared.gap.lock().state()
    }

    pub fn conn_handle(&self) -> Option<u16> {
        self.shared.gap.lock().conn_handle()
    }

    pub fn att_mtu(&self) -> u16 {
        self.shared.att_mtu.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }
}

impl<T: HciTransport> Drop for Host<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
