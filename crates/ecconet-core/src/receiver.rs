//! Reassemble inbound frames into messages and dispatch by key (spec §4.6).
//!
//! Grounded on the teacher's `can/tp.rs` reassembly loop and its `Session`
//! trait from `can/session.rs`: accumulate frames for a source until a
//! terminal frame closes the run, verify, then hand the payload onward. The
//! teacher's session keys on (source, PGN); this keys on (source, frameIndex)
//! with a 5-bit wrap instead of J1939's.

use serde::Serialize;

use crate::crc::crc16;
use crate::error::MatrixError;
use crate::event_index::EventIndex;
use crate::frame::{FrameType, RawFrame};
use crate::token::{self, KeyPrefix, Token, prefix};

const STALE_MS: u64 = 750;
const LOOKBACK_WINDOW: usize = 15;
const BROADCAST: u8 = 0;

/// What an assembled, dispatched message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DispatchKind {
    /// Synthesized `KeyTokenSequencerSync` token; route to sequencer + address manager.
    PatternSync { enumeration: u16 },
    FtpResponse { key: u16, body: Vec<u8> },
    FtpRequest { key: u16, body: Vec<u8> },
    Tokens(Vec<Token>),
}

/// One dispatched inbound message, plus the bookkeeping the coordinator needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inbound {
    pub source: u8,
    /// True if the frame carrying this message was event-flagged (spec §4.6
    /// step 6): the coordinator should schedule its next beacon sooner.
    pub accelerate_beacon: bool,
    pub kind: DispatchKind,
}

struct FrontEntry {
    frame: RawFrame,
    received_at_ms: u64,
}

/// The front ring: reorders, dedupes, and ages out stale frames, then
/// assembles and dispatches complete messages on each tick.
pub struct Receiver {
    own_address: u8,
    source_filter: Option<(u8, u64)>,
    event_index: EventIndex,
    front: Vec<FrontEntry>,
}

impl Receiver {
    #[must_use]
    pub fn new(own_address: u8) -> Self {
        Self {
            own_address,
            source_filter: None,
            event_index: EventIndex::new(),
            front: Vec::new(),
        }
    }

    pub fn set_own_address(&mut self, address: u8) {
        self.own_address = address;
    }

    /// Lock onto a single peer (used during FTP) for up to 1000 ms.
    pub fn set_source_filter(&mut self, source: u8, now_ms: u64) {
        self.source_filter = Some((source, now_ms + 1000));
    }

    pub fn clear_source_filter(&mut self) {
        self.source_filter = None;
    }

    fn accepts(&self, frame: &RawFrame, now_ms: u64) -> bool {
        let id = frame.id;
        if id.dest_address != BROADCAST && id.dest_address != self.own_address {
            return false;
        }
        if let Some((source, expires)) = self.source_filter {
            if id.src_address != source || now_ms > expires {
                return false;
            }
        }
        true
    }

    /// Feed one newly-arrived frame (already filtered by frame type at decode
    /// time: `CanId::decode` returns `None` for non-SINGLE/BODY/LAST types, so
    /// only those ever reach here).
    pub fn push_frame(&mut self, frame: RawFrame, now_ms: u64) {
        if !self.accepts(&frame, now_ms) {
            return;
        }
        self.insert_sorted(frame, now_ms);
    }

    fn insert_sorted(&mut self, frame: RawFrame, now_ms: u64) {
        let id = frame.id;
        if let Some(existing) = self
            .front
            .iter_mut()
            .find(|e| e.frame.id.src_address == id.src_address && e.frame.id.frame_index == id.frame_index)
        {
            existing.frame = frame;
            existing.received_at_ms = now_ms;
            return;
        }

        let mut insert_at = self.front.len();
        let mut same_source_seen = 0;
        for i in (0..self.front.len()).rev() {
            if self.front[i].frame.id.src_address != id.src_address {
                continue;
            }
            same_source_seen += 1;
            if same_source_seen > LOOKBACK_WINDOW {
                break;
            }
            if signed5(id.frame_index, self.front[i].frame.id.frame_index) >= 0 {
                insert_at = i + 1;
                break;
            }
            insert_at = i;
        }
        self.front.insert(
            insert_at,
            FrontEntry {
                frame,
                received_at_ms: now_ms,
            },
        );
    }

    fn drop_stale(&mut self, now_ms: u64) {
        self.front
            .retain(|e| now_ms.saturating_sub(e.received_at_ms) <= STALE_MS);
    }

    /// Run one tick: age out stale frames, assemble complete messages, and
    /// dispatch each by key.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Inbound> {
        self.drop_stale(now_ms);
        self.assemble_and_dispatch()
    }

    fn assemble_and_dispatch(&mut self) -> Vec<Inbound> {
        let mut consumed = vec![false; self.front.len()];
        let mut dispatches = Vec::new();
        let mut i = 0;
        while i < self.front.len() {
            if consumed[i] {
                i += 1;
                continue;
            }
            match self.front[i].frame.id.frame_type {
                FrameType::Single => {
                    consumed[i] = true;
                    let entry = &self.front[i];
                    if let Some(inbound) = self.dispatch_payload(
                        entry.frame.id.src_address,
                        entry.frame.id.event_flag,
                        entry.frame.data.clone(),
                    ) {
                        dispatches.push(inbound);
                    }
                    i += 1;
                }
                FrameType::Body => {
                    let source = self.front[i].frame.id.src_address;
                    let mut expected = self.front[i].frame.id.frame_index;
                    let mut run = Vec::new();
                    let mut complete = false;
                    let mut j = i;
                    while j < self.front.len() {
                        let f = &self.front[j].frame;
                        if f.id.src_address != source || f.id.frame_index != expected {
                            break;
                        }
                        run.push(j);
                        if f.id.frame_type == FrameType::Last {
                            complete = true;
                            j += 1;
                            break;
                        }
                        expected = (expected + 1) % 32;
                        j += 1;
                    }
                    if complete {
                        let event_flag = self.front[run[0]].frame.id.event_flag;
                        let mut payload = Vec::new();
                        for &k in &run {
                            payload.extend_from_slice(&self.front[k].frame.data);
                            consumed[k] = true;
                        }
                        if let Some(inbound) = self.verify_and_dispatch(source, event_flag, payload) {
                            dispatches.push(inbound);
                        }
                        i = j;
                    } else {
                        // Incomplete so far; leave queued for a future tick
                        // (either completed, or eventually aged out as stale).
                        i += 1;
                    }
                }
                FrameType::Last => {
                    // Orphan LAST with no preceding BODY: nothing to reassemble.
                    consumed[i] = true;
                    i += 1;
                }
            }
        }
        let mut idx = 0;
        self.front.retain(|_| {
            let keep = !consumed[idx];
            idx += 1;
            keep
        });
        dispatches
    }

    fn verify_and_dispatch(&mut self, source: u8, event_flag: bool, mut payload: Vec<u8>) -> Option<Inbound> {
        if payload.len() < 2 {
            tracing::debug!(source, "discarding truncated multi-frame message");
            return None;
        }
        let crc_offset = payload.len() - 2;
        let expected = u16::from_be_bytes([payload[crc_offset], payload[crc_offset + 1]]);
        let actual = crc16(&payload[..crc_offset]);
        if expected != actual {
            tracing::warn!(source, "{}", MatrixError::CrcMismatch);
            return None;
        }
        payload.truncate(crc_offset);
        self.dispatch_payload(source, event_flag, payload)
    }

    fn dispatch_payload(&mut self, source: u8, event_flag: bool, payload: Vec<u8>) -> Option<Inbound> {
        if payload.is_empty() {
            return None;
        }
        let event_byte = payload[0];
        let body = &payload[1..];

        if event_flag {
            self.event_index.observe(event_byte);
        }

        let first_key = if body.len() >= 2 {
            Some(u16::from_be_bytes([body[0], body[1]]))
        } else {
            None
        };
        let is_command = first_key.is_some_and(|k| prefix(k) == KeyPrefix::Command);

        if !event_flag && self.event_index.is_expired(event_byte) && !is_command {
            tracing::debug!(source, event_byte, "dropping expired non-event message");
            return None;
        }

        let kind = match first_key {
            Some(key) if prefix(key) == KeyPrefix::PatternSync => {
                let enumeration = body.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]])).unwrap_or(0) & 0x1FFF;
                DispatchKind::PatternSync { enumeration }
            }
            Some(key) if token::is_ftp_response(key) => DispatchKind::FtpResponse {
                key,
                body: body[2..].to_vec(),
            },
            Some(key) if token::is_ftp_request(key) => DispatchKind::FtpRequest {
                key,
                body: body[2..].to_vec(),
            },
            _ => match crate::codec::decompress(body, source) {
                Ok(tokens) => DispatchKind::Tokens(tokens),
                Err(err) => {
                    tracing::warn!(source, "{err}");
                    return None;
                }
            },
        };

        Some(Inbound {
            source,
            accelerate_beacon: event_flag,
            kind,
        })
    }
}

/// `(int5)(a - b)` for the 5-bit frame-index wrap window.
fn signed5(a: u8, b: u8) -> i8 {
    let d = a.wrapping_sub(b) & 0x1F;
    if d & 0x10 != 0 { d as i8 - 32 } else { d as i8 }
}
