//! Ties every component into one clock-driven node (spec §4.12, §5).
//!
//! Grounded on the teacher's top-level driver shape (one struct owning every
//! subsystem, a single `clock()` entry point, a re-entrancy guard) rather than
//! any one teacher file; the fixed tick order below is this crate's analogue
//! of the teacher's "poll transport, then run application logic" loop.

use crate::address::{AddressEvent, AddressManager};
use crate::equation::Engine;
use crate::event_index::EventIndex;
use crate::frame::{CanId, RawFrame};
use crate::ftp::client::{FtpClient, FtpOutcome};
use crate::ftp::server::FtpServer;
use crate::ftp::RequestKind;
use crate::host::HostInterface;
use crate::receiver::{DispatchKind, Receiver};
use crate::sequencer::Sequencer;
use crate::token::{self, KeyPrefix, Token};
use crate::transmitter::Transmitter;

const BROADCAST: u8 = 0;
/// `RequestAddress`/`ResponseAddressInUse` live in the named one-byte region
/// (original source: `Region_Base__Named_Misc_One_Byte`, ids 1000/1001).
const ID_REQUEST_ADDRESS: u16 = 1000;
const ID_RESPONSE_ADDRESS_IN_USE: u16 = 1001;
/// Beacon period jitter-by-address, so peers don't all beacon in lockstep
/// (spec §4.12: "+940+ownAddress ms").
const BEACON_PERIOD_BASE_MS: u64 = 940;

fn key_request_address() -> u16 {
    token::with_prefix(KeyPrefix::Command, ID_REQUEST_ADDRESS)
}

fn key_response_address_in_use() -> u16 {
    token::with_prefix(KeyPrefix::Command, ID_RESPONSE_ADDRESS_IN_USE)
}

/// One clock-driven ECCONet/Matrix node: wires C5 through C11 together.
pub struct Coordinator {
    address: AddressManager,
    receiver: Receiver,
    transmitter: Transmitter,
    ftp_server: FtpServer,
    ftp_client: FtpClient,
    equation: Engine,
    sequencer: Sequencer,
    event_index: EventIndex,
    next_beacon_ms: Option<u64>,
    ticking: bool,
}

impl Coordinator {
    #[must_use]
    pub fn new(address: AddressManager) -> Self {
        let own = address.own_address().unwrap_or(0);
        Self {
            address,
            receiver: Receiver::new(own),
            transmitter: Transmitter::new(),
            ftp_server: FtpServer::new(),
            ftp_client: FtpClient::new(),
            equation: Engine::new(),
            sequencer: Sequencer::new(),
            event_index: EventIndex::new(),
            next_beacon_ms: None,
            ticking: false,
        }
    }

    #[must_use]
    pub fn own_address(&self) -> Option<u8> {
        self.address.own_address()
    }

    pub fn load_equations(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        self.equation.load(bytes)
    }

    pub fn load_patterns(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        self.sequencer.load(bytes)
    }

    #[must_use]
    pub fn equation_engine(&self) -> &Engine {
        &self.equation
    }

    pub fn equation_engine_mut(&mut self) -> &mut Engine {
        &mut self.equation
    }

    pub fn ftp_client_mut(&mut self) -> &mut FtpClient {
        &mut self.ftp_client
    }

    /// Transmit the [`ClientAction`] an [`FtpClient`] request method returned,
    /// locking the receiver onto `server` for the duration of the transaction
    /// (spec §4.9: one outstanding request per node, replies expected from
    /// that one peer).
    pub fn send_ftp_request(&mut self, server: u8, action: &crate::ftp::client::ClientAction, now_ms: u64) {
        self.transmitter.start_message(server, action.request.key(), self.event_index.get());
        self.transmitter.add_u16(action.request.key());
        self.transmitter.add_bytes(&action.body);
        let own = self.address.own_address().unwrap_or(0);
        self.transmitter.finish_message(own);
        self.receiver.set_source_filter(server, now_ms);
    }

    /// Feed one raw CAN frame the host observed on the bus into the
    /// reassembly front (spec §4.6). Frames whose `frameType` isn't one of
    /// SINGLE/BODY/LAST are silently ignored, not errored (spec §4.6).
    pub fn on_can_frame(&mut self, id: u32, data: &[u8], now_ms: u64) {
        let Some(can_id) = CanId::decode(id) else {
            return;
        };
        let Ok(frame) = RawFrame::new(can_id, data.to_vec()) else {
            return;
        };
        self.receiver.push_frame(frame, now_ms);
    }

    /// Reset every component and schedule the first beacon (spec §4.12).
    /// A static node's one-shot `AddressInUse` announce is sent immediately.
    pub fn reset(&mut self, host: &mut impl HostInterface, now_ms: u64) {
        self.receiver = Receiver::new(self.address.own_address().unwrap_or(0));
        self.transmitter = Transmitter::new();
        self.ftp_server = FtpServer::new();
        self.ftp_client = FtpClient::new();
        self.event_index = EventIndex::new();

        if let Some(event) = self.address.reset() {
            self.handle_address_event(event);
        }
        self.next_beacon_ms = Some(now_ms + AddressManager::beacon_delay_ms());
    }

    /// Run one clock: poll inbound, run every component in spec §4.12's fixed
    /// order, flush outbound, and return any FTP client outcomes this tick
    /// produced (the host has no dedicated FTP callback, so the caller reads
    /// these directly).
    pub fn clock(&mut self, host: &mut impl HostInterface, now_ms: u64) -> Vec<FtpOutcome> {
        if self.ticking {
            tracing::warn!("coordinator clock re-entered while already ticking; ignoring");
            return Vec::new();
        }
        self.ticking = true;
        let outcomes = self.clock_inner(host, now_ms);
        self.ticking = false;
        outcomes
    }

    fn clock_inner(&mut self, host: &mut impl HostInterface, now_ms: u64) -> Vec<FtpOutcome> {
        let mut outcomes = Vec::new();

        // C6: receiver -- reassemble and dispatch inbound messages.
        let inbound = self.receiver.tick(now_ms);
        for msg in inbound {
            self.address.on_frame_from_source(msg.source);
            if msg.accelerate_beacon {
                self.next_beacon_ms = Some(self.next_beacon_ms.unwrap_or(now_ms).min(now_ms));
            }
            match msg.kind {
                DispatchKind::Tokens(tokens) => {
                    for t in tokens {
                        self.handle_inbound_token(host, &t, now_ms);
                    }
                }
                DispatchKind::PatternSync { enumeration } => {
                    let own = self.address.own_address().unwrap_or(0);
                    self.sequencer.on_pattern_sync(msg.source, own, enumeration, now_ms);
                }
                DispatchKind::FtpRequest { key, body } => {
                    if let Some(kind) = RequestKind::from_request_key(key) {
                        self.handle_ftp_request(host, msg.source, kind, &body, now_ms);
                    }
                }
                DispatchKind::FtpResponse { key, body } => {
                    if let Some(kind) = RequestKind::from_response_key(key) {
                        self.handle_ftp_response(msg.source, kind, &body, now_ms, &mut outcomes);
                    }
                }
            }
        }

        // C5: drain anything queued while dispatching inbound (FTP replies).
        self.transmitter.drain(host);

        // C7: address self-negotiation.
        if let Some(event) = self.address.clock(now_ms) {
            self.handle_address_event(event);
        }

        // C10: time-logic engine.
        match self.equation.clock(now_ms) {
            Ok(emissions) => {
                for emission in emissions {
                    let token = Token::new(emission.address, emission.key, emission.value);
                    host.token_callback(token);
                    self.sequencer.dispatch(emission.address, emission.key, emission.value, now_ms);
                    if emission.is_public {
                        self.send_tokens(BROADCAST, &[token]);
                    }
                }
            }
            Err(err) => tracing::warn!("{err}; equation engine needs reload"),
        }

        // C8/C9: FTP server and client timeouts.
        self.ftp_server.tick(now_ms);
        if let Some(outcome) = self.ftp_client.tick(now_ms) {
            outcomes.push(outcome);
        }

        // C11: pattern sequencer.
        for emission in self.sequencer.clock(now_ms) {
            if let Some(enumeration) = emission.send_sync {
                self.send_pattern_sync(enumeration);
            }
            for token in &emission.tokens {
                self.equation.observe(token.address, token.key, token.value, now_ms);
                host.token_callback(*token);
            }
            if !emission.tokens.is_empty() {
                self.send_tokens(BROADCAST, &emission.tokens);
            }
        }

        self.maybe_beacon(now_ms);
        self.transmitter.drain(host);
        outcomes
    }

    fn handle_inbound_token(&mut self, host: &mut impl HostInterface, token: &Token, now_ms: u64) {
        if token.key == key_request_address() {
            if let Some(event) = self.address.on_request_address(token.value as u8) {
                self.handle_address_event(event);
            }
        } else if token.key == key_response_address_in_use() {
            self.address.on_address_in_use(token.value as u8);
        }
        self.equation.observe(token.address, token.key, token.value, now_ms);
        self.sequencer.dispatch(token.address, token.key, token.value, now_ms);
        host.token_callback(*token);
    }

    fn handle_address_event(&mut self, event: AddressEvent) {
        match event {
            AddressEvent::ProposeCandidate(candidate) => {
                self.send_command(key_request_address(), u32::from(candidate), 1);
            }
            AddressEvent::AnnounceInUse(addr) => {
                self.send_command(key_response_address_in_use(), u32::from(addr), 1);
                if self.address.own_address() == Some(addr) {
                    self.receiver.set_own_address(addr);
                }
            }
        }
    }

    fn handle_ftp_request(&mut self, host: &mut impl HostInterface, requester: u8, kind: RequestKind, body: &[u8], now_ms: u64) {
        match self.ftp_server.handle_request(host, requester, kind, body, now_ms) {
            Ok(Some(reply_body)) => {
                self.transmitter.start_message(requester, kind.response_key(), self.event_index.get());
                self.transmitter.add_u16(kind.response_key());
                self.transmitter.add_bytes(&reply_body);
                let own = self.address.own_address().unwrap_or(0);
                self.transmitter.finish_message(own);
                self.receiver.set_source_filter(requester, now_ms);
            }
            Ok(None) => self.receiver.clear_source_filter(),
            Err(err) => tracing::warn!(requester, "FTP request rejected: {err}"),
        }
    }

    fn handle_ftp_response(&mut self, from: u8, kind: RequestKind, body: &[u8], now_ms: u64, outcomes: &mut Vec<FtpOutcome>) {
        let (next, outcome) = self.ftp_client.on_response(from, kind, body, now_ms);
        if let Some(action) = next {
            self.transmitter.start_message(from, action.request.key(), self.event_index.get());
            self.transmitter.add_u16(action.request.key());
            self.transmitter.add_bytes(&action.body);
            let own = self.address.own_address().unwrap_or(0);
            self.transmitter.finish_message(own);
            self.receiver.set_source_filter(from, now_ms);
        }
        if let Some(outcome) = outcome {
            self.transmitter
                .start_message(from, RequestKind::FileTransferComplete.key(), self.event_index.get());
            self.transmitter.add_u16(RequestKind::FileTransferComplete.key());
            let own = self.address.own_address().unwrap_or(0);
            self.transmitter.finish_message(own);
            outcomes.push(outcome);
            self.receiver.clear_source_filter();
        }
    }

    fn send_command(&mut self, key: u16, value: u32, width: usize) {
        let token = Token::new(BROADCAST, key, value);
        let own = self.address.own_address().unwrap_or(0);
        self.transmitter.start_message(BROADCAST, key, self.event_index.get());
        self.transmitter.add_token(&token, width);
        self.transmitter.finish_message(own);
    }

    fn send_tokens(&mut self, dest: u8, tokens: &[Token]) {
        if tokens.is_empty() {
            return;
        }
        let own = self.address.own_address().unwrap_or(0);
        let event_index = self.event_index.next();
        self.transmitter.start_message(dest, tokens[0].key, event_index);
        self.transmitter.add_bytes(&crate::codec::compress(tokens));
        self.transmitter.finish_message(own);
    }

    fn send_pattern_sync(&mut self, enumeration: u16) {
        let own = self.address.own_address().unwrap_or(0);
        let key = token::with_prefix(KeyPrefix::PatternSync, 0);
        let event_index = self.event_index.next();
        self.transmitter.start_message(BROADCAST, key, event_index);
        self.transmitter.add_u16(key);
        self.transmitter.add_u16(enumeration);
        self.transmitter.finish_message(own);
    }

    /// Periodic beacon: re-broadcast every `SHOULD_BROADCAST`-flagged token in
    /// the time-logic table (spec §4.12), skipped mid-FTP so the bus isn't
    /// contended during a transfer.
    fn maybe_beacon(&mut self, now_ms: u64) {
        let Some(own) = self.address.own_address() else {
            return;
        };
        let Some(due) = self.next_beacon_ms else {
            return;
        };
        if now_ms < due {
            return;
        }
        if !self.ftp_server.is_idle() || !self.ftp_client.is_idle() {
            self.next_beacon_ms = Some(now_ms + 50);
            return;
        }

        let tokens: Vec<Token> = self
            .equation
            .table()
            .iter()
            .filter(|e| e.flags.contains(crate::token::TokenFlags::SHOULD_BROADCAST))
            .map(|e| Token::new(e.address, e.key, e.value))
            .collect();
        if !tokens.is_empty() {
            self.send_tokens(BROADCAST, &tokens);
        }
        self.next_beacon_ms = Some(now_ms + BEACON_PERIOD_BASE_MS + u64::from(own));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FileMetadata, FlashVolume, SendStatus};

    struct FakeHost {
        sent: Vec<(u32, Vec<u8>)>,
        guid: [u32; 4],
        callbacks: Vec<Token>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                guid: [1, 2, 3, 4],
                callbacks: Vec::new(),
            }
        }
    }

    impl HostInterface for FakeHost {
        fn send_can_frame(&mut self, id: u32, data: &[u8]) -> SendStatus {
            self.sent.push((id, data.to_vec()));
            SendStatus::Ok
        }
        fn flash_read(&mut self, _: u8, _: u32, _: &mut [u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn flash_write(&mut self, _: u8, _: u32, _: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn flash_erase(&mut self, _: u8, _: u32, _: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn file_name_to_volume_index(&self, _: &str) -> crate::error::Result<u8> {
            Ok(0)
        }
        fn file_info(&self, _: &str) -> crate::error::Result<FileMetadata> {
            Err(crate::error::MatrixError::FileNotFound)
        }
        fn indexed_file_info(&self, _: u8, _: u16) -> crate::error::Result<FileMetadata> {
            Err(crate::error::MatrixError::FileNotFound)
        }
        fn read_file_segment(&mut self, _: &FileMetadata, _: u16, _: &mut [u8]) -> crate::error::Result<usize> {
            Ok(0)
        }
        fn begin_file_write(&mut self, _: &str, _: u32, _: u16, _: u32) -> crate::error::Result<FileMetadata> {
            Err(crate::error::MatrixError::FtpDiskFull)
        }
        fn write_file_segment(&mut self, _: &FileMetadata, _: u16, _: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn delete_file(&mut self, _: &str) -> crate::error::Result<()> {
            Ok(())
        }
        fn get_guid(&self) -> [u32; 4] {
            self.guid
        }
        fn token_callback(&mut self, token: Token) {
            self.callbacks.push(token);
        }
        fn flash_volumes(&self) -> [FlashVolume; 4] {
            [FlashVolume { base: 0, size: 0 }; 4]
        }
    }

    #[test]
    fn static_node_reset_announces_address_in_use() {
        let mut coordinator = Coordinator::new(AddressManager::new_static(42));
        let mut host = FakeHost::new();
        coordinator.reset(&mut host, 0);
        coordinator.transmitter.drain(&mut host);
        assert_eq!(host.sent.len(), 1);
    }

    #[test]
    fn unassigned_node_negotiates_an_address_over_two_ticks() {
        let guid = [0xEE4C_AD97, 0x331C_E9EC, 0x9E95_7DBC, 0xA4A6_9FE5];
        let mut coordinator = Coordinator::new(AddressManager::new_unassigned(guid));
        let mut host = FakeHost::new();
        coordinator.reset(&mut host, 0);

        coordinator.clock(&mut host, 0); // propose
        assert!(coordinator.own_address().is_none());
        coordinator.clock(&mut host, 150); // timeout -> assign
        assert!(coordinator.own_address().is_some());
    }

    #[test]
    fn reentrant_clock_call_is_ignored() {
        let mut coordinator = Coordinator::new(AddressManager::new_static(5));
        let mut host = FakeHost::new();
        coordinator.ticking = true;
        let outcomes = coordinator.clock(&mut host, 0);
        assert!(outcomes.is_empty());
        assert!(host.sent.is_empty());
    }

    #[test]
    fn beacon_fires_after_schedule_and_reschedules() {
        let mut coordinator = Coordinator::new(AddressManager::new_static(5));
        let mut host = FakeHost::new();
        coordinator.reset(&mut host, 0);
        host.sent.clear();

        coordinator.clock(&mut host, 1000);
        coordinator.transmitter.drain(&mut host);
        assert!(coordinator.next_beacon_ms.unwrap() > 1000);
    }
}
