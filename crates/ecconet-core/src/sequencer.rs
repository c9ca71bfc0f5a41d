//! Cross-node pattern sequencer (spec §4.11).
//!
//! Grounded on the teacher's state-machine shape (`address.rs` lives in this
//! crate now, but the "enum of phases plus an explicit tick" idiom comes from
//! the teacher's `tp.rs`): each sequencer slot is a small stack machine
//! stepped once per clock.

use crate::error::{MatrixError, Result};
use crate::token::{ADDR_SEQUENCER_BASE, Token};

const MAGIC: u32 = 0x4865_433B;
const MAX_SEQUENCERS: usize = 6;
const STACK_DEPTH: usize = 3;
const SEQUENCER_KEY_BASE: u16 = 8150;

mod steptag {
    pub const PATTERN_WITH_REPEATS: u8 = 0x50; // low nibble = repeat count, 0 = infinite
    pub const PATTERN_WITH_REPEATS_MASK: u8 = 0xF0;
    pub const ALL_OFF: u8 = 0x5F;
    pub const SECTION_START: u8 = 0x60;
    pub const SECTION_END: u8 = 0x61;
    pub const STEP_WITH_PERIOD: u8 = 0x62;
    pub const STEP_WITH_NESTED: u8 = 0x63;
    pub const PATTERN_END: u8 = 0x6F;
}

/// The pattern's 3-bit step-mode prefix (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonKeyMode {
    MultiKey,
    StepDictionaryKey,
    LedMatrixMessage,
}

impl CommonKeyMode {
    fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            0 => Ok(Self::MultiKey),
            1 => Ok(Self::StepDictionaryKey),
            2 => Ok(Self::LedMatrixMessage),
            _ => Err(MatrixError::PatternFileError),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    SectionStart { repeats: u8 },
    SectionEnd,
    Period { period_ms: u32, payload: Vec<u8> },
    Nested { pattern_index: u16, repeats: u8 },
}

#[derive(Debug, Clone)]
struct Pattern {
    repeats: u8,
    mode: CommonKeyMode,
    all_off: Option<Vec<u8>>,
    steps: Vec<Step>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(MatrixError::PatternFileError)?;
        let slice = self.bytes.get(self.pos..end).ok_or(MatrixError::PatternFileError)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

fn decode_steps(cursor: &mut Cursor<'_>) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    loop {
        if cursor.remaining() == 0 {
            return Err(MatrixError::PatternFileError);
        }
        let tag = cursor.bytes[cursor.pos];
        if tag == steptag::PATTERN_END {
            cursor.pos += 1;
            break;
        }
        cursor.pos += 1;
        match tag {
            steptag::SECTION_START => {
                let repeats = cursor.take_u8()?;
                steps.push(Step::SectionStart { repeats });
            }
            steptag::SECTION_END => steps.push(Step::SectionEnd),
            steptag::STEP_WITH_PERIOD => {
                let period_ms = u32::from(cursor.take_u16()?);
                let len = cursor.take_u8()? as usize;
                let payload = cursor.take(len)?.to_vec();
                steps.push(Step::Period { period_ms, payload });
            }
            steptag::STEP_WITH_NESTED => {
                let pattern_index = cursor.take_u16()?;
                let repeats = cursor.take_u8()?;
                steps.push(Step::Nested { pattern_index, repeats });
            }
            _ => return Err(MatrixError::PatternFileError),
        }
    }
    Ok(steps)
}

fn decode_pattern(cursor: &mut Cursor<'_>) -> Result<Pattern> {
    let header = cursor.take_u8()?;
    if header & steptag::PATTERN_WITH_REPEATS_MASK != steptag::PATTERN_WITH_REPEATS {
        return Err(MatrixError::PatternFileError);
    }
    let repeats = header & 0x0F;
    let enumeration = cursor.take_u16()?;
    let mode = CommonKeyMode::from_bits((enumeration >> 13) & 0x7)?;

    let mut all_off = None;
    if cursor.remaining() > 0 && cursor.bytes[cursor.pos] == steptag::ALL_OFF {
        cursor.pos += 1;
        let len = cursor.take_u8()? as usize;
        all_off = Some(cursor.take(len)?.to_vec());
    }

    let steps = decode_steps(cursor)?;
    Ok(Pattern { repeats, mode, all_off, steps })
}

/// Parse `patterns.tbl` (spec §6): magic, 2-byte count, then patterns.
fn decode_file(bytes: &[u8]) -> Result<Vec<Pattern>> {
    let mut cursor = Cursor { bytes, pos: 0 };
    if cursor.take_u32()? != MAGIC {
        return Err(MatrixError::PatternFileError);
    }
    let count = cursor.take_u16()?;
    let mut patterns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        patterns.push(decode_pattern(&mut cursor)?);
    }
    Ok(patterns)
}

/// `bottom..top` inclusive, `Exact`, or no sync (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRange {
    None,
    Range(u16, u16),
    Exact,
}

impl SyncRange {
    fn accepts(self, enumeration: u16, running_root_enum: u16) -> bool {
        match self {
            SyncRange::None => false,
            SyncRange::Range(bottom, top) => enumeration >= bottom && enumeration <= top,
            SyncRange::Exact => enumeration == running_root_enum,
        }
    }
}

struct Frame {
    pattern_index: u16,
    step_pos: usize,
    remaining_repeats: u8,
    /// `None` means infinite repeat (spec §4.11: "0 = infinite").
    infinite: bool,
}

/// One of up to [`MAX_SEQUENCERS`] concurrently-running pattern players.
pub struct Slot {
    intensity: u8,
    sync_range: SyncRange,
    stack: Vec<Frame>,
    step_time: u64,
    running: bool,
    root_enumeration: u16,
}

impl Slot {
    fn new() -> Self {
        Self {
            intensity: 100,
            sync_range: SyncRange::None,
            stack: Vec::new(),
            step_time: 0,
            running: false,
            root_enumeration: 0,
        }
    }

    fn start(&mut self, pattern_index: u16, patterns: &[Pattern], now_ms: u64) {
        let Some(pattern) = patterns.get(pattern_index as usize) else {
            return;
        };
        self.stack.clear();
        self.stack.push(Frame {
            pattern_index,
            step_pos: 0,
            remaining_repeats: pattern.repeats,
            infinite: pattern.repeats == 0,
        });
        self.root_enumeration = pattern_index;
        self.step_time = now_ms;
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.stack.clear();
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a stepped sequencer slot emitted this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerEmission {
    pub tokens: Vec<Token>,
    /// Emit a `PatternSync` onto the bus (spec §4.11 step 2).
    pub send_sync: Option<u16>,
}

/// Up to [`MAX_SEQUENCERS`] concurrent pattern players (spec §4.11).
pub struct Sequencer {
    patterns: Vec<Pattern>,
    slots: Vec<Slot>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            slots: (0..MAX_SEQUENCERS).map(|_| Slot::new()).collect(),
        }
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        self.patterns = decode_file(bytes)?;
        Ok(())
    }

    /// `KeyIndexedSequencer`/`KeyTokenSequencerPattern` dispatch (spec §4.11).
    pub fn dispatch(&mut self, address: u8, key: u16, value: u32, now_ms: u64) {
        let index = if crate::token::is_indexed_sequencer(key) {
            (crate::token::without_prefix(key) - SEQUENCER_KEY_BASE) as usize
        } else if (ADDR_SEQUENCER_BASE..ADDR_SEQUENCER_BASE + MAX_SEQUENCERS as u8).contains(&address) {
            (address - ADDR_SEQUENCER_BASE) as usize
        } else {
            return;
        };
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let intensity = ((value >> 16) & 0xFF) as u8;
        let pattern = (value & 0xFFFF) as u16;
        slot.intensity = intensity;
        if pattern == 0 {
            slot.stop();
        } else {
            slot.start(pattern - 1, &self.patterns, now_ms);
        }
    }

    /// Set a slot's sync range directly (used by configuration, not wire dispatch).
    pub fn set_sync_range(&mut self, slot: usize, range: SyncRange) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.sync_range = range;
        }
    }

    /// An inbound `PatternSync(enumeration)` from a higher CAN address: restart
    /// any slot whose sync range accepts it (spec §4.11 "Cross-node sync").
    pub fn on_pattern_sync(&mut self, from_address: u8, own_address: u8, enumeration: u16, now_ms: u64) {
        if from_address <= own_address {
            return;
        }
        for slot in &mut self.slots {
            if !slot.running {
                continue;
            }
            if slot.sync_range.accepts(enumeration, slot.root_enumeration) {
                if let Some(root) = slot.stack.first() {
                    let idx = root.pattern_index;
                    slot.start(idx, &self.patterns, now_ms);
                }
            }
        }
    }

    /// Step every due slot once (spec §4.11's per-clock step loop).
    pub fn clock(&mut self, now_ms: u64) -> Vec<SequencerEmission> {
        let mut out = Vec::new();
        for i in 0..self.slots.len() {
            if let Some(emission) = self.step_slot(i, now_ms) {
                out.push(emission);
            }
        }
        out
    }

    fn step_slot(&mut self, slot_idx: usize, now_ms: u64) -> Option<SequencerEmission> {
        if !self.slots[slot_idx].running || now_ms < self.slots[slot_idx].step_time {
            return None;
        }

        let mut tokens = Vec::new();
        let mut send_sync = None;

        loop {
            let Some(frame) = self.slots[slot_idx].stack.last() else {
                self.slots[slot_idx].running = false;
                break;
            };
            let pattern_index = frame.pattern_index;
            let Some(pattern) = self.patterns.get(pattern_index as usize).cloned() else {
                self.slots[slot_idx].stop();
                break;
            };

            // 1. end of pattern handling.
            if self.slots[slot_idx].stack.last().unwrap().step_pos >= pattern.steps.len() {
                let frame = self.slots[slot_idx].stack.last_mut().unwrap();
                if !frame.infinite {
                    if frame.remaining_repeats > 0 {
                        frame.remaining_repeats -= 1;
                    }
                    if frame.remaining_repeats == 0 {
                        self.slots[slot_idx].stack.pop();
                        if let Some(off) = &pattern.all_off {
                            tokens.extend(decode_payload_tokens(off, pattern.mode, ADDR_SEQUENCER_BASE + slot_idx as u8));
                        }
                        if self.slots[slot_idx].stack.is_empty() {
                            self.slots[slot_idx].running = false;
                            return Some(SequencerEmission { tokens, send_sync });
                        }
                        continue;
                    }
                }
                self.slots[slot_idx].stack.last_mut().unwrap().step_pos = 0;
            }

            // 2. root-pattern sync emission on restart at step 0.
            let frame = self.slots[slot_idx].stack.last().unwrap();
            let is_root = self.slots[slot_idx].stack.len() == 1;
            if is_root && frame.step_pos == 0 && pattern.steps.len() > 1 {
                if let SyncRange::Range(..) | SyncRange::Exact = self.slots[slot_idx].sync_range {
                    send_sync = Some(pattern_index);
                }
            }

            let step_pos = self.slots[slot_idx].stack.last().unwrap().step_pos;
            match pattern.steps.get(step_pos).cloned() {
                Some(Step::SectionStart { .. } | Step::SectionEnd) => {
                    // Sub-loop bracket bookkeeping; this port treats brackets
                    // as transparent (repeats are carried on the pattern frame).
                    self.slots[slot_idx].stack.last_mut().unwrap().step_pos += 1;
                }
                Some(Step::Period { period_ms, payload }) => {
                    self.slots[slot_idx].stack.last_mut().unwrap().step_pos += 1;
                    self.slots[slot_idx].step_time = now_ms + u64::from(period_ms);
                    let intensity = self.slots[slot_idx].intensity;
                    let addr = ADDR_SEQUENCER_BASE + slot_idx as u8;
                    let mut emitted = decode_payload_tokens(&payload, pattern.mode, addr);
                    for t in &mut emitted {
                        t.value = scale_intensity(t.value, intensity);
                    }
                    tokens.extend(emitted);
                    return Some(SequencerEmission { tokens, send_sync });
                }
                Some(Step::Nested { pattern_index: child, repeats }) => {
                    self.slots[slot_idx].stack.last_mut().unwrap().step_pos += 1;
                    if self.slots[slot_idx].stack.len() < STACK_DEPTH {
                        self.slots[slot_idx].stack.push(Frame {
                            pattern_index: child,
                            step_pos: 0,
                            remaining_repeats: repeats,
                            infinite: repeats == 0,
                        });
                    }
                }
                None => {
                    self.slots[slot_idx].stack.last_mut().unwrap().step_pos = pattern.steps.len();
                }
            }
        }

        if tokens.is_empty() && send_sync.is_none() {
            None
        } else {
            Some(SequencerEmission { tokens, send_sync })
        }
    }
}

fn scale_intensity(value: u32, intensity: u8) -> u32 {
    (value * u32::from(intensity)) / 100
}

fn decode_payload_tokens(payload: &[u8], mode: CommonKeyMode, address: u8) -> Vec<Token> {
    match mode {
        CommonKeyMode::MultiKey => crate::codec::decompress(payload, address).unwrap_or_default(),
        CommonKeyMode::StepDictionaryKey | CommonKeyMode::LedMatrixMessage => {
            if payload.len() < 2 {
                return Vec::new();
            }
            let key = u16::from_be_bytes([payload[0], payload[1]]);
            let mut buf = [0u8; 4];
            let width = (payload.len() - 2).min(4);
            buf[4 - width..].copy_from_slice(&payload[2..2 + width]);
            vec![Token::new(address, key, u32::from_be_bytes(buf))]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file(steps: Vec<u8>) -> Vec<u8> {
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&1u16.to_be_bytes()); // 1 pattern
        bytes.push(steptag::PATTERN_WITH_REPEATS); // repeats = 0 (infinite)
        bytes.extend_from_slice(&0u16.to_be_bytes()); // enumeration, mode = MultiKey
        bytes.extend_from_slice(&steps);
        bytes.push(steptag::PATTERN_END);
        bytes
    }

    #[test]
    fn load_parses_minimal_single_step_pattern() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0); // zero-length payload
        let bytes = minimal_file(step);

        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();
        assert_eq!(seq.patterns.len(), 1);
    }

    #[test]
    fn indexed_sequencer_dispatch_starts_pattern_with_intensity() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0);
        let bytes = minimal_file(step);

        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();

        let key = crate::token::with_prefix(crate::token::KeyPrefix::Command, SEQUENCER_KEY_BASE);
        let value = (50u32 << 16) | 1; // intensity 50, pattern index 1 (1-based)
        seq.dispatch(0, key, value, 0);
        assert!(seq.slots[0].running);
        assert_eq!(seq.slots[0].intensity, 50);
    }

    #[test]
    fn zero_pattern_value_stops_the_slot() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0);
        let bytes = minimal_file(step);
        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();

        let key = crate::token::with_prefix(crate::token::KeyPrefix::Command, SEQUENCER_KEY_BASE);
        seq.dispatch(0, key, 1, 0);
        assert!(seq.slots[0].running);
        seq.dispatch(0, key, 0, 0);
        assert!(!seq.slots[0].running);
    }

    #[test]
    fn step_advances_and_reschedules_step_time() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0);
        let bytes = minimal_file(step.clone());
        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();
        seq.slots[0].start(0, &seq.patterns.clone(), 0);

        let emissions = seq.clock(0);
        assert_eq!(emissions.len(), 1);
        assert_eq!(seq.slots[0].step_time, 10);
    }

    #[test]
    fn cross_node_sync_from_higher_address_restarts_root() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0);
        let bytes = minimal_file(step);
        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();
        seq.set_sync_range(0, SyncRange::Exact);
        let patterns = seq.patterns.clone();
        seq.slots[0].start(0, &patterns, 0);
        seq.slots[0].step_time = 100;

        seq.on_pattern_sync(5, 2, 0, 50);
        assert_eq!(seq.slots[0].step_time, 50);
    }

    #[test]
    fn sync_from_lower_address_is_ignored() {
        let mut step = vec![steptag::STEP_WITH_PERIOD];
        step.extend_from_slice(&10u16.to_be_bytes());
        step.push(0);
        let bytes = minimal_file(step);
        let mut seq = Sequencer::new();
        seq.load(&bytes).unwrap();
        seq.set_sync_range(0, SyncRange::Exact);
        let patterns = seq.patterns.clone();
        seq.slots[0].start(0, &patterns, 0);
        seq.slots[0].step_time = 100;

        seq.on_pattern_sync(1, 5, 0, 50);
        assert_eq!(seq.slots[0].step_time, 100);
    }
}
