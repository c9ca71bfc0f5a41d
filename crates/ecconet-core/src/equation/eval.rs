//! Equation files, output options, and the time-logic [`Engine`] (spec §4.10).

use crate::equation::bytecode::{self, Cursor, ExprToken, Terminator};
use crate::equation::table::TokenTable;
use crate::error::{MatrixError, Result};
use crate::token::is_input_status;

const MAGIC: u32 = 0x1C3D_5C47;
const CONSTANTS_TAG: u16 = 0xCAFE;

/// How an equation is scheduled relative to the others in its file (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// Evaluated once per clock when its round-robin turn comes.
    Normal,
    /// Evaluated every clock, before any `Normal` equation in the same tick.
    Priority,
    /// Evaluated in the same tick as the equation immediately before it.
    Successive,
}

mod eqtag {
    pub const EQUATION_START: u8 = 0x40;
    pub const PRIORITY_EQUATION_START: u8 = 0x41;
    pub const SUCCESSIVE_EQUATION_START: u8 = 0x42;
}

/// One post-calculation behavior, applied in file order after the expression
/// is evaluated (spec §4.10's "Output options").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOption {
    ActivityMonitor { max_count_ms: u32 },
    RisingEdgeCounter { modulo: u32 },
    FallingEdgeCounter { modulo: u32 },
    RisingEdgeToggle,
    FallingEdgeToggle,
    RisingEdgeSkipToggle { other_address: u8, other_key: u16 },
    FallingEdgeSkipToggle { other_address: u8, other_key: u16 },
    RisingEdgeVariableClear { other_address: u8, other_key: u16 },
    FallingEdgeVariableClear { other_address: u8, other_key: u16 },
    RisingEdgeDelay { delay_ms: u32 },
    FallingEdgeDelay { delay_ms: u32 },
    SendOnChange,
    SendRisingEdge,
    SendFallingEdge,
    SendRisingByValue { threshold: i32 },
    SendFallingByValue { threshold: i32 },
}

mod opttag {
    pub const ACTIVITY_MONITOR: u8 = 0x01;
    pub const RISING_EDGE_COUNTER: u8 = 0x02;
    pub const FALLING_EDGE_COUNTER: u8 = 0x03;
    pub const RISING_EDGE_TOGGLE: u8 = 0x04;
    pub const FALLING_EDGE_TOGGLE: u8 = 0x05;
    pub const RISING_EDGE_SKIP_TOGGLE: u8 = 0x06;
    pub const FALLING_EDGE_SKIP_TOGGLE: u8 = 0x07;
    pub const RISING_EDGE_VARIABLE_CLEAR: u8 = 0x08;
    pub const FALLING_EDGE_VARIABLE_CLEAR: u8 = 0x09;
    pub const RISING_EDGE_DELAY: u8 = 0x0A;
    pub const FALLING_EDGE_DELAY: u8 = 0x0B;
    pub const SEND_ON_CHANGE: u8 = 0x0C;
    pub const SEND_RISING_EDGE: u8 = 0x0D;
    pub const SEND_FALLING_EDGE: u8 = 0x0E;
    pub const SEND_RISING_BY_VALUE: u8 = 0x0F;
    pub const SEND_FALLING_BY_VALUE: u8 = 0x10;
    pub const OPTIONS_END: u8 = 0x00;
    pub const EQUATION_END: u8 = 0xFF;
}

fn decode_output_option(cursor: &mut Cursor<'_>) -> Result<OutputOption> {
    let tag = cursor.take_u8()?;
    Ok(match tag {
        opttag::ACTIVITY_MONITOR => OutputOption::ActivityMonitor {
            max_count_ms: cursor.take_u32()?,
        },
        opttag::RISING_EDGE_COUNTER => OutputOption::RisingEdgeCounter {
            modulo: cursor.take_u32()?,
        },
        opttag::FALLING_EDGE_COUNTER => OutputOption::FallingEdgeCounter {
            modulo: cursor.take_u32()?,
        },
        opttag::RISING_EDGE_TOGGLE => OutputOption::RisingEdgeToggle,
        opttag::FALLING_EDGE_TOGGLE => OutputOption::FallingEdgeToggle,
        opttag::RISING_EDGE_SKIP_TOGGLE => OutputOption::RisingEdgeSkipToggle {
            other_address: cursor.take_u8()?,
            other_key: cursor.take_u16()?,
        },
        opttag::FALLING_EDGE_SKIP_TOGGLE => OutputOption::FallingEdgeSkipToggle {
            other_address: cursor.take_u8()?,
            other_key: cursor.take_u16()?,
        },
        opttag::RISING_EDGE_VARIABLE_CLEAR => OutputOption::RisingEdgeVariableClear {
            other_address: cursor.take_u8()?,
            other_key: cursor.take_u16()?,
        },
        opttag::FALLING_EDGE_VARIABLE_CLEAR => OutputOption::FallingEdgeVariableClear {
            other_address: cursor.take_u8()?,
            other_key: cursor.take_u16()?,
        },
        opttag::RISING_EDGE_DELAY => OutputOption::RisingEdgeDelay {
            delay_ms: cursor.take_u32()?,
        },
        opttag::FALLING_EDGE_DELAY => OutputOption::FallingEdgeDelay {
            delay_ms: cursor.take_u32()?,
        },
        opttag::SEND_ON_CHANGE => OutputOption::SendOnChange,
        opttag::SEND_RISING_EDGE => OutputOption::SendRisingEdge,
        opttag::SEND_FALLING_EDGE => OutputOption::SendFallingEdge,
        opttag::SEND_RISING_BY_VALUE => OutputOption::SendRisingByValue {
            threshold: cursor.take_i32()?,
        },
        opttag::SEND_FALLING_BY_VALUE => OutputOption::SendFallingByValue {
            threshold: cursor.take_i32()?,
        },
        _ => return Err(MatrixError::BytecodeError),
    })
}

/// Per-option runtime state that can't live in the token table itself because
/// it belongs to the equation, not to a single table entry (an edge-delay's
/// "since when" timestamp, for instance).
#[derive(Debug, Default, Clone)]
struct OptionState {
    edge_since_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Equation {
    pub kind: EquationKind,
    pub expr: Vec<ExprToken>,
    pub out_address: u8,
    pub out_key: u16,
    pub mapped_local_key: Option<u16>,
    pub options: Vec<OutputOption>,
    option_state: Vec<OptionState>,
    last_activity_ms: u64,
}

impl Equation {
    fn decode(cursor: &mut Cursor<'_>, kind: EquationKind) -> Result<Self> {
        let (expr, terminator) = bytecode::decode_expr_from(cursor)?;
        let out_key = cursor.take_u16()?;
        let out_address = cursor.take_u8()?;
        let mapped_local_key = match terminator {
            Terminator::Equals => None,
            Terminator::Lambda => Some(out_key),
        };

        let mut options = Vec::new();
        loop {
            if cursor.remaining() == 0 {
                return Err(MatrixError::BytecodeError);
            }
            if cursor.bytes[cursor.pos] == opttag::OPTIONS_END || cursor.bytes[cursor.pos] == opttag::EQUATION_END {
                cursor.pos += 1;
                break;
            }
            options.push(decode_output_option(cursor)?);
        }

        let option_state = vec![OptionState::default(); options.len()];
        Ok(Self {
            kind,
            expr,
            out_address,
            out_key,
            mapped_local_key,
            options,
            option_state,
            last_activity_ms: 0,
        })
    }
}

/// The output of one equation's evaluation this tick, for the caller
/// ([`crate::coordinator::Coordinator`]) to forward to the sequencer, the
/// host callback, and (if public) the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub address: u8,
    pub key: u16,
    pub value: u32,
    pub is_public: bool,
}

/// The time-logic engine: a token table plus the loaded equations, driven one
/// clock at a time (spec §4.10).
#[derive(Debug, Default)]
pub struct Engine {
    table: TokenTable,
    equations: Vec<Equation>,
    /// Index of the next `Normal`-group to run; advances one group per tick.
    next_normal_group: usize,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: TokenTable::new(),
            equations: Vec::new(),
            next_normal_group: 0,
        }
    }

    #[must_use]
    pub fn table(&self) -> &TokenTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut TokenTable {
        &mut self.table
    }

    /// Parse an equation file (spec §6: `equation.btc` / `eq_user1..6.btc`),
    /// rebuilding the token table by scanning every `TokenRef` occurrence.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(bytes);
        if cursor.take_u32()? != MAGIC {
            return Err(MatrixError::BytecodeError);
        }

        if cursor.remaining() >= 2 {
            let save = cursor.pos;
            if cursor.take_u16()? == CONSTANTS_TAG {
                let len = cursor.take_u16()? as usize;
                cursor.take(len)?;
            } else {
                cursor.pos = save;
            }
        }

        let mut equations = Vec::new();
        while cursor.remaining() > 0 {
            let kind = match cursor.take_u8()? {
                eqtag::EQUATION_START => EquationKind::Normal,
                eqtag::PRIORITY_EQUATION_START => EquationKind::Priority,
                eqtag::SUCCESSIVE_EQUATION_START => EquationKind::Successive,
                _ => return Err(MatrixError::BytecodeError),
            };
            equations.push(Equation::decode(&mut cursor, kind)?);
        }

        let mut table = TokenTable::new();
        for eq in &equations {
            for token in &eq.expr {
                if let ExprToken::Operand(bytecode::Operand::TokenRef { address, key }) = *token {
                    table.ensure(address, key);
                }
            }
            let entry = table.ensure(eq.out_address, eq.out_key);
            entry.flags.insert(crate::token::TokenFlags::IS_EQUATION_OUTPUT);
            entry.mapped_local_key = eq.mapped_local_key;
        }

        self.table = table;
        self.equations = equations;
        self.next_normal_group = 0;
        Ok(())
    }

    /// Apply an inbound token to the live table (spec §4.10's update semantics).
    pub fn observe(&mut self, address: u8, key: u16, value: u32, now_ms: u64) {
        self.table.apply_inbound(address, key, value, is_input_status(key), now_ms);
    }

    /// Group boundaries: each `Normal`/`Priority` equation starts a group that
    /// absorbs any immediately-following `Successive` equations.
    fn groups(&self) -> Vec<(EquationKind, std::ops::Range<usize>)> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < self.equations.len() {
            let kind = self.equations[i].kind;
            let start = i;
            i += 1;
            while i < self.equations.len() && self.equations[i].kind == EquationKind::Successive {
                i += 1;
            }
            groups.push((kind, start..i));
        }
        groups
    }

    /// Run one clock: every `Priority` group, then one `Normal` group in
    /// round-robin order. Returns the emissions produced, and clears the
    /// per-entry "received since last eval" flags it consumed.
    pub fn clock(&mut self, now_ms: u64) -> Result<Vec<Emission>> {
        let groups = self.groups();
        let normal_groups: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, (k, _))| *k == EquationKind::Normal)
            .map(|(i, _)| i)
            .collect();

        let mut emissions = Vec::new();

        for (kind, range) in &groups {
            if *kind == EquationKind::Priority {
                self.run_group(range.clone(), now_ms, &mut emissions)?;
            }
        }

        if !normal_groups.is_empty() {
            let idx = normal_groups[self.next_normal_group % normal_groups.len()];
            let range = groups[idx].1.clone();
            self.run_group(range, now_ms, &mut emissions)?;
            self.next_normal_group = (self.next_normal_group + 1) % normal_groups.len();
        }

        self.table.clear_received_flags();
        Ok(emissions)
    }

    fn run_group(&mut self, range: std::ops::Range<usize>, now_ms: u64, emissions: &mut Vec<Emission>) -> Result<()> {
        for i in range {
            if let Some(emission) = self.run_one(i, now_ms)? {
                emissions.push(emission);
            }
        }
        Ok(())
    }

    fn run_one(&mut self, index: usize, now_ms: u64) -> Result<Option<Emission>> {
        let expr = self.equations[index].expr.clone();
        let raw = bytecode::eval_tokens(&expr, &self.table)?;

        let had_input = expr.iter().any(|t| match t {
            ExprToken::Operand(bytecode::Operand::TokenRef { address, key }) => self
                .table
                .get(*address, *key)
                .is_some_and(|e| e.flags.contains(crate::token::TokenFlags::RECEIVED_SINCE_LAST_EVAL)),
            _ => false,
        });
        if had_input {
            self.equations[index].last_activity_ms = now_ms;
        }

        let (out_address, out_key) = (self.equations[index].out_address, self.equations[index].out_key);
        let old_value = self.table.get(out_address, out_key).map_or(0, |e| e.value as i32);
        let mut new_value = raw;
        let rising = old_value == 0 && new_value != 0;
        let falling = old_value != 0 && new_value == 0;

        let mut should_send = false;
        let mut zero_other: Option<(u8, u16)> = None;
        let mut skip_other: Option<(u8, u16)> = None;

        let options = self.equations[index].options.clone();
        for (opt_idx, option) in options.iter().enumerate() {
            match *option {
                OutputOption::ActivityMonitor { max_count_ms } => {
                    let since = now_ms.saturating_sub(self.equations[index].last_activity_ms);
                    if since >= u64::from(max_count_ms) {
                        new_value = 0;
                    }
                }
                OutputOption::RisingEdgeCounter { modulo } => {
                    if rising {
                        let skip = self
                            .table
                            .get(out_address, out_key)
                            .is_some_and(|e| e.flags.contains(crate::token::TokenFlags::SKIP_TOGGLE));
                        if skip {
                            self.clear_skip_toggle(out_address, out_key);
                        } else if modulo > 0 {
                            new_value = (old_value + 1).rem_euclid(modulo as i32);
                        }
                    } else {
                        new_value = old_value;
                    }
                }
                OutputOption::FallingEdgeCounter { modulo } => {
                    if falling {
                        let skip = self
                            .table
                            .get(out_address, out_key)
                            .is_some_and(|e| e.flags.contains(crate::token::TokenFlags::SKIP_TOGGLE));
                        if skip {
                            self.clear_skip_toggle(out_address, out_key);
                        } else if modulo > 0 {
                            new_value = (old_value + 1).rem_euclid(modulo as i32);
                        }
                    } else {
                        new_value = old_value;
                    }
                }
                OutputOption::RisingEdgeToggle => {
                    new_value = if rising { i32::from(old_value == 0) } else { old_value };
                }
                OutputOption::FallingEdgeToggle => {
                    new_value = if falling { i32::from(old_value == 0) } else { old_value };
                }
                OutputOption::RisingEdgeSkipToggle { other_address, other_key } => {
                    if rising {
                        skip_other = Some((other_address, other_key));
                    }
                }
                OutputOption::FallingEdgeSkipToggle { other_address, other_key } => {
                    if falling {
                        skip_other = Some((other_address, other_key));
                    }
                }
                OutputOption::RisingEdgeVariableClear { other_address, other_key } => {
                    if rising {
                        zero_other = Some((other_address, other_key));
                    }
                }
                OutputOption::FallingEdgeVariableClear { other_address, other_key } => {
                    if falling {
                        zero_other = Some((other_address, other_key));
                    }
                }
                OutputOption::RisingEdgeDelay { delay_ms } => {
                    let state = &mut self.equations[index].option_state[opt_idx];
                    if rising {
                        state.edge_since_ms.get_or_insert(now_ms);
                    } else if falling {
                        state.edge_since_ms = None;
                    }
                    let asserted = state
                        .edge_since_ms
                        .is_some_and(|since| now_ms.saturating_sub(since) >= u64::from(delay_ms));
                    new_value = i32::from(asserted);
                }
                OutputOption::FallingEdgeDelay { delay_ms } => {
                    let state = &mut self.equations[index].option_state[opt_idx];
                    if falling {
                        state.edge_since_ms.get_or_insert(now_ms);
                    } else if rising {
                        state.edge_since_ms = None;
                    }
                    let asserted = state
                        .edge_since_ms
                        .is_some_and(|since| now_ms.saturating_sub(since) >= u64::from(delay_ms));
                    new_value = i32::from(!asserted);
                }
                OutputOption::SendOnChange => should_send |= new_value != old_value,
                OutputOption::SendRisingEdge => should_send |= rising,
                OutputOption::SendFallingEdge => should_send |= falling,
                OutputOption::SendRisingByValue { threshold } => {
                    should_send |= old_value < threshold && new_value >= threshold;
                }
                OutputOption::SendFallingByValue { threshold } => {
                    should_send |= old_value >= threshold && new_value < threshold;
                }
            }
        }

        if let Some((addr, key)) = zero_other {
            self.table.apply_inbound(addr, key, 0, true, now_ms);
        }
        if let Some((addr, key)) = skip_other {
            if let Some(entry) = self.table.get_mut(addr, key) {
                entry.flags.insert(crate::token::TokenFlags::SKIP_TOGGLE);
            }
        }

        let value = new_value as u32;
        self.table.apply_inbound(out_address, out_key, value, true, now_ms);
        if let Some(entry) = self.table.get_mut(out_address, out_key) {
            entry.flags.insert(crate::token::TokenFlags::IS_EQUATION_OUTPUT);
        }

        if !should_send {
            return Ok(None);
        }

        let mapped = self.equations[index].mapped_local_key;
        let emit_key = mapped.unwrap_or(out_key);
        // A lambda-mapped entry is a local variable: it reaches the host
        // callback but never goes out over the bus (spec §4.10).
        let is_public = mapped.is_none();
        Ok(Some(Emission {
            address: out_address,
            key: emit_key,
            value,
            is_public,
        }))
    }

    fn clear_skip_toggle(&mut self, address: u8, key: u16) {
        if let Some(entry) = self.table.get_mut(address, key) {
            entry.flags.remove(crate::token::TokenFlags::SKIP_TOGGLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_one_equation(expr: &[u8], out_key: u16, out_address: u8, options: &[u8]) -> Vec<u8> {
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.push(eqtag::EQUATION_START);
        bytes.extend_from_slice(expr);
        bytes.push(bytecode_tag_equals());
        bytes.extend_from_slice(&out_key.to_be_bytes());
        bytes.push(out_address);
        bytes.extend_from_slice(options);
        bytes.push(opttag::EQUATION_END);
        bytes
    }

    // Mirrors `bytecode::tag::EQUALS`; kept local since that module's tags aren't public.
    fn bytecode_tag_equals() -> u8 {
        0xFE
    }

    fn literal(v: i32) -> Vec<u8> {
        let mut b = vec![0x01];
        b.extend_from_slice(&v.to_be_bytes());
        b
    }

    #[test]
    fn load_builds_table_from_token_refs() {
        let mut expr = vec![0x02, 7, 0x00, 0x64]; // TokenRef addr=7 key=0x0064
        expr.push(0x15); // Add
        expr.extend_from_slice(&literal(1));
        let bytes = file_with_one_equation(&expr, 0x0065, 7, &[]);

        let mut engine = Engine::new();
        engine.load(&bytes).unwrap();
        assert!(engine.table().get(7, 0x0064).is_some());
        assert!(engine.table().get(7, 0x0065).unwrap().flags.contains(crate::token::TokenFlags::IS_EQUATION_OUTPUT));
    }

    #[test]
    fn send_on_change_emits_only_when_value_changes() {
        let expr = literal(5);
        let bytes = file_with_one_equation(&expr, 0x0001, 1, &[opttag::SEND_ON_CHANGE]);
        let mut engine = Engine::new();
        engine.load(&bytes).unwrap();

        let first = engine.clock(0).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, 5);

        let second = engine.clock(10).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn rising_edge_toggle_flips_on_zero_to_nonzero_transition() {
        let expr = vec![0x02, 1, 0x00, 0x01]; // TokenRef addr=1 key=1 (input)
        let bytes = file_with_one_equation(&expr, 0x0002, 1, &[opttag::RISING_EDGE_TOGGLE, opttag::SEND_ON_CHANGE]);
        let mut engine = Engine::new();
        engine.load(&bytes).unwrap();
        engine.table_mut().ensure(1, 1);

        let e1 = engine.clock(0).unwrap();
        assert!(e1.is_empty()); // input still 0, no rising edge

        engine.observe(1, 1, 1, 1);
        let e2 = engine.clock(1).unwrap();
        assert_eq!(e2.len(), 1);
        assert_eq!(e2[0].value, 1);
    }

    #[test]
    fn division_by_zero_propagates_as_bytecode_error() {
        let mut expr = literal(1);
        expr.push(0x13); // Div
        expr.extend_from_slice(&literal(0));
        let bytes = file_with_one_equation(&expr, 0x0001, 1, &[]);
        let mut engine = Engine::new();
        engine.load(&bytes).unwrap();
        assert_eq!(engine.clock(0), Err(MatrixError::BytecodeError));
    }

    #[test]
    fn priority_equations_run_every_tick_normal_round_robins() {
        let mut bytes = MAGIC.to_be_bytes().to_vec();

        bytes.push(eqtag::PRIORITY_EQUATION_START);
        bytes.extend_from_slice(&literal(1));
        bytes.push(bytecode_tag_equals());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(1);
        bytes.push(opttag::SEND_ON_CHANGE);
        bytes.push(opttag::EQUATION_END);

        bytes.push(eqtag::EQUATION_START);
        bytes.extend_from_slice(&literal(2));
        bytes.push(bytecode_tag_equals());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.push(1);
        bytes.push(opttag::SEND_ON_CHANGE);
        bytes.push(opttag::EQUATION_END);

        bytes.push(eqtag::EQUATION_START);
        bytes.extend_from_slice(&literal(3));
        bytes.push(bytecode_tag_equals());
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.push(1);
        bytes.push(opttag::SEND_ON_CHANGE);
        bytes.push(opttag::EQUATION_END);

        let mut engine = Engine::new();
        engine.load(&bytes).unwrap();

        let tick1 = engine.clock(0).unwrap();
        // priority equation (key 1) + first normal group (key 2)
        assert!(tick1.iter().any(|e| e.key == 1));
        assert!(tick1.iter().any(|e| e.key == 2));
        assert!(!tick1.iter().any(|e| e.key == 3));
    }
}
