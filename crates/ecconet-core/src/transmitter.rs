//! Fragment, CRC, index, and enqueue outbound frames (spec §4.5).
//!
//! Grounded on the same "accumulate into a buffer, then split into frames"
//! shape the teacher's transport-protocol code walks in reverse (`tp.rs`
//! reassembles frames into a message; this is message-into-frames).

use std::collections::VecDeque;

use crate::crc::Crc16;
use crate::frame::{CanId, FrameType, MAX_FRAME_LEN, RawFrame};
use crate::host::{HostInterface, SendStatus};
use crate::token::{KeyPrefix, Token, prefix};

/// Ring buffer capacity for outbound frames (spec §4.5: "safety over
/// reliability: status resends within 1s anyway").
const QUEUE_CAPACITY: usize = 64;

/// Accumulates one outgoing message's bytes, then frames and enqueues it.
pub struct Transmitter {
    fifo: Vec<u8>,
    crc: Crc16,
    dest: u8,
    is_event: bool,
    frame_index: u8,
    queue: VecDeque<RawFrame>,
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmitter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fifo: Vec::new(),
            crc: Crc16::new(),
            dest: 0,
            is_event: false,
            frame_index: 0,
            queue: VecDeque::new(),
        }
    }

    /// Begin a new message. `key_hint` decides the event flag: set for
    /// `InputStatus`/`OutputStatus` prefixed keys, matching spec §4.5 and the
    /// §9 note that address-negotiation messages keep `event_index == 0`
    /// regardless (callers pass a `Command`-prefixed `key_hint` for those).
    pub fn start_message(&mut self, dest: u8, key_hint: u16, event_index: u8) {
        self.fifo.clear();
        self.crc = Crc16::new();
        self.dest = dest;
        self.is_event = matches!(prefix(key_hint), KeyPrefix::InputStatus | KeyPrefix::OutputStatus);
        self.add_byte(event_index);
    }

    pub fn add_byte(&mut self, byte: u8) {
        self.fifo.push(byte);
        self.crc.add_byte(byte);
    }

    pub fn add_u16(&mut self, value: u16) {
        for b in value.to_be_bytes() {
            self.add_byte(b);
        }
    }

    pub fn add_u32(&mut self, value: u32) {
        for b in value.to_be_bytes() {
            self.add_byte(b);
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.add_byte(b);
        }
    }

    /// Append a token's key followed by its (width-appropriate) value.
    pub fn add_token(&mut self, token: &Token, width: usize) {
        self.add_u16(token.key);
        let bytes = token.value.to_be_bytes();
        self.add_bytes(&bytes[4 - width..]);
    }

    /// Finish the message: suffix the CRC if multi-frame, split into frames,
    /// and push them onto the outbound ring (oldest dropped on overflow).
    pub fn finish_message(&mut self, own_address: u8) {
        let mut bytes = std::mem::take(&mut self.fifo);
        if bytes.len() > MAX_FRAME_LEN {
            let crc = self.crc.finish();
            bytes.extend_from_slice(&crc.to_be_bytes());
        }

        let chunks: Vec<&[u8]> = bytes.chunks(MAX_FRAME_LEN).collect();
        let single = chunks.len() <= 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let frame_type = if single {
                FrameType::Single
            } else if i + 1 == chunks.len() {
                FrameType::Last
            } else {
                FrameType::Body
            };
            let id = CanId {
                frame_index: self.frame_index,
                dest_address: self.dest,
                event_flag: self.is_event,
                src_address: own_address,
                frame_type,
            };
            self.frame_index = (self.frame_index + 1) % 32;
            self.enqueue(RawFrame {
                id,
                data: chunk.to_vec(),
            });
        }
    }

    fn enqueue(&mut self, frame: RawFrame) {
        if self.queue.len() == QUEUE_CAPACITY {
            self.queue.pop_front();
            tracing::warn!("transmitter ring overflowed; dropped oldest queued frame");
        }
        self.queue.push_back(frame);
    }

    /// Drain as many queued frames as the host will accept this tick.
    pub fn drain(&mut self, host: &mut impl HostInterface) {
        while let Some(frame) = self.queue.front() {
            let id = frame.id.encode();
            let data = frame.data.clone();
            match host.send_can_frame(id, &data) {
                SendStatus::Ok => {
                    self.queue.pop_front();
                }
                SendStatus::Busy => break,
            }
        }
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{KeyPrefix, with_prefix};

    #[test]
    fn s1_single_frame_message() {
        let mut tx = Transmitter::new();
        tx.start_message(0, with_prefix(KeyPrefix::InputStatus, 1), 7);
        tx.add_u16(0x2064);
        tx.add_byte(0x05);
        tx.finish_message(42);

        assert_eq!(tx.queue_len(), 1);
        let frame = &tx.queue[0];
        assert_eq!(frame.id.frame_type, FrameType::Single);
        assert_eq!(frame.id.src_address, 42);
        assert_eq!(frame.data, vec![7, 0x20, 0x64, 0x05]);
    }

    #[test]
    fn multi_frame_message_gets_trailing_crc() {
        let mut tx = Transmitter::new();
        tx.start_message(5, with_prefix(KeyPrefix::OutputStatus, 1), 1);
        for _ in 0..20 {
            tx.add_byte(0xAB);
        }
        tx.finish_message(9);

        assert!(tx.queue_len() > 1);
        assert_eq!(tx.queue.back().unwrap().id.frame_type, FrameType::Last);
        assert_eq!(tx.queue.front().unwrap().id.frame_type, FrameType::Body);

        let mut all_payload = Vec::new();
        for f in &tx.queue {
            all_payload.extend_from_slice(&f.data);
        }
        let (body, crc_bytes) = all_payload.split_at(all_payload.len() - 2);
        let expected_crc = crate::crc::crc16(body);
        assert_eq!(u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]), expected_crc);
    }

    #[test]
    fn frame_index_increments_and_wraps_mod_32() {
        let mut tx = Transmitter::new();
        tx.frame_index = 30;
        tx.start_message(0, with_prefix(KeyPrefix::InputStatus, 1), 1);
        for _ in 0..20 {
            tx.add_byte(0);
        }
        tx.finish_message(1);
        let indices: Vec<u8> = tx.queue.iter().map(|f| f.id.frame_index).collect();
        assert_eq!(indices, vec![30, 31, 0]);
    }

    #[test]
    fn event_flag_stable_across_all_frames_of_a_message() {
        let mut tx = Transmitter::new();
        tx.start_message(0, with_prefix(KeyPrefix::InputStatus, 1), 1);
        for _ in 0..20 {
            tx.add_byte(0);
        }
        tx.finish_message(1);
        assert!(tx.queue.iter().all(|f| f.id.event_flag));
    }

    #[test]
    fn command_prefix_is_not_an_event() {
        let mut tx = Transmitter::new();
        tx.start_message(0, with_prefix(KeyPrefix::Command, 1), 0);
        tx.add_byte(0);
        tx.finish_message(1);
        assert!(!tx.queue[0].id.event_flag);
    }

    struct CountingHost {
        sent: Vec<Vec<u8>>,
        busy_for: usize,
    }

    impl HostInterface for CountingHost {
        fn send_can_frame(&mut self, _id: u32, data: &[u8]) -> SendStatus {
            if self.busy_for > 0 {
                self.busy_for -= 1;
                return SendStatus::Busy;
            }
            self.sent.push(data.to_vec());
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
        fn file_info(&self, _: &str) -> crate::error::Result<crate::host::FileMetadata> {
            Err(crate::error::MatrixError::FileNotFound)
        }
        fn indexed_file_info(&self, _: u8, _: u16) -> crate::error::Result<crate::host::FileMetadata> {
            Err(crate::error::MatrixError::FileNotFound)
        }
        fn read_file_segment(&mut self, _: &crate::host::FileMetadata, _: u16, _: &mut [u8]) -> crate::error::Result<usize> {
            Ok(0)
        }
        fn begin_file_write(&mut self, _: &str, _: u32, _: u16, _: u32) -> crate::error::Result<crate::host::FileMetadata> {
            Err(crate::error::MatrixError::FtpDiskFull)
        }
        fn write_file_segment(&mut self, _: &crate::host::FileMetadata, _: u16, _: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn delete_file(&mut self, _: &str) -> crate::error::Result<()> {
            Ok(())
        }
        fn get_guid(&self) -> [u32; 4] {
            [0; 4]
        }
        fn token_callback(&mut self, _: Token) {}
        fn flash_volumes(&self) -> [crate::host::FlashVolume; 4] {
            [crate::host::FlashVolume { base: 0, size: 0 }; 4]
        }
    }

    #[test]
    fn busy_host_leaves_frame_queued_for_next_drain() {
        let mut tx = Transmitter::new();
        tx.start_message(0, with_prefix(KeyPrefix::InputStatus, 1), 1);
        tx.add_byte(1);
        tx.finish_message(1);

        let mut host = CountingHost { sent: vec![], busy_for: 1 };
        tx.drain(&mut host);
        assert_eq!(tx.queue_len(), 1);
        assert!(host.sent.is_empty());

        tx.drain(&mut host);
        assert_eq!(tx.queue_len(), 0);
        assert_eq!(host.sent.len(), 1);
    }

    #[test]
    fn ring_overflow_drops_oldest() {
        let mut tx = Transmitter::new();
        for i in 0..(QUEUE_CAPACITY + 5) {
            tx.start_message(0, with_prefix(KeyPrefix::InputStatus, 1), 1);
            tx.add_byte(i as u8);
            tx.finish_message(1);
        }
        assert_eq!(tx.queue_len(), QUEUE_CAPACITY);
        assert_eq!(tx.queue.front().unwrap().data[1], 5);
    }
}
