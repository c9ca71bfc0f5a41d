//! Equation bytecode: operand/operator tokens, decoding, and the
//! shunting-yard evaluator (spec §4.10).
//!
//! The on-flash byte encoding isn't pinned down numerically by the
//! specification (the authoring toolchain that emits it is explicitly out of
//! core scope); the tag layout below is this port's own, documented in
//! `DESIGN.md`.

use crate::error::{MatrixError, Result};
use crate::equation::table::TokenTable;

const STACK_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Literal(i32),
    TokenRef { address: u8, key: u16 },
}

/// Operators, annotated with spec §4.10's precedence (lower binds tighter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Not,
    BitNot,
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl Operator {
    fn precedence(self) -> u8 {
        use Operator::*;
        match self {
            Not | BitNot => 0,
            Mul | Div | Mod => 1,
            Add | Sub => 2,
            Shl | Shr => 3,
            Lt | Le | Gt | Ge => 4,
            Eq | Ne => 5,
            BitAnd => 6,
            BitXor => 7,
            BitOr => 8,
            And => 9,
            Or => 10,
        }
    }

    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(self, Operator::Not | Operator::BitNot)
    }
}

/// A flat infix token stream, the unit [`decode_expr`] produces and
/// [`eval_tokens`] consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprToken {
    Operand(Operand),
    Operator(Operator),
    LParen,
    RParen,
    Question,
    Colon,
}

// Tag bytes for the decoder.
mod tag {
    pub const LITERAL: u8 = 0x01;
    pub const TOKEN_REF: u8 = 0x02;
    pub const NOT: u8 = 0x10;
    pub const BIT_NOT: u8 = 0x11;
    pub const MUL: u8 = 0x12;
    pub const DIV: u8 = 0x13;
    pub const MOD: u8 = 0x14;
    pub const ADD: u8 = 0x15;
    pub const SUB: u8 = 0x16;
    pub const SHL: u8 = 0x17;
    pub const SHR: u8 = 0x18;
    pub const LT: u8 = 0x19;
    pub const LE: u8 = 0x1A;
    pub const GT: u8 = 0x1B;
    pub const GE: u8 = 0x1C;
    pub const EQ: u8 = 0x1D;
    pub const NE: u8 = 0x1E;
    pub const BIT_AND: u8 = 0x1F;
    pub const BIT_XOR: u8 = 0x20;
    pub const BIT_OR: u8 = 0x21;
    pub const AND: u8 = 0x22;
    pub const OR: u8 = 0x23;
    pub const LPAREN: u8 = 0x24;
    pub const RPAREN: u8 = 0x25;
    pub const QUESTION: u8 = 0x26;
    pub const COLON: u8 = 0x27;
    /// Terminates a plain assignment (spec §6: "terminated by `Equals`/`Lambda`").
    pub const EQUALS: u8 = 0xFE;
    /// Terminates an expression whose result rebinds a public token to a
    /// local variable (spec §4.10's "mapped local key").
    pub const LAMBDA: u8 = 0xFD;
}

/// Which of the two expression terminators ended a [`decode_expr`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Equals,
    Lambda,
}

pub(crate) struct Cursor<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(MatrixError::BytecodeError)?;
        let slice = self.bytes.get(self.pos..end).ok_or(MatrixError::BytecodeError)?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn take_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Decode one expression: a flat token stream terminated by `Equals` or
/// `Lambda`. Returns the tokens, which terminator ended it, and the number of
/// bytes consumed (including the terminator) so callers can continue parsing.
pub fn decode_expr(bytes: &[u8]) -> Result<(Vec<ExprToken>, Terminator, usize)> {
    let mut cursor = Cursor::new(bytes);
    let (tokens, terminator) = decode_expr_from(&mut cursor)?;
    Ok((tokens, terminator, cursor.pos))
}

/// Same as [`decode_expr`] but continues from an existing cursor, for parsing
/// an expression embedded in a larger file.
pub(crate) fn decode_expr_from(cursor: &mut Cursor<'_>) -> Result<(Vec<ExprToken>, Terminator)> {
    let mut tokens = Vec::new();
    let terminator = loop {
        let t = cursor.take_u8()?;
        let token = match t {
            tag::EQUALS => break Terminator::Equals,
            tag::LAMBDA => break Terminator::Lambda,
            tag::LITERAL => ExprToken::Operand(Operand::Literal(cursor.take_i32()?)),
            tag::TOKEN_REF => {
                let address = cursor.take_u8()?;
                let key = cursor.take_u16()?;
                ExprToken::Operand(Operand::TokenRef { address, key })
            }
            tag::NOT => ExprToken::Operator(Operator::Not),
            tag::BIT_NOT => ExprToken::Operator(Operator::BitNot),
            tag::MUL => ExprToken::Operator(Operator::Mul),
            tag::DIV => ExprToken::Operator(Operator::Div),
            tag::MOD => ExprToken::Operator(Operator::Mod),
            tag::ADD => ExprToken::Operator(Operator::Add),
            tag::SUB => ExprToken::Operator(Operator::Sub),
            tag::SHL => ExprToken::Operator(Operator::Shl),
            tag::SHR => ExprToken::Operator(Operator::Shr),
            tag::LT => ExprToken::Operator(Operator::Lt),
            tag::LE => ExprToken::Operator(Operator::Le),
            tag::GT => ExprToken::Operator(Operator::Gt),
            tag::GE => ExprToken::Operator(Operator::Ge),
            tag::EQ => ExprToken::Operator(Operator::Eq),
            tag::NE => ExprToken::Operator(Operator::Ne),
            tag::BIT_AND => ExprToken::Operator(Operator::BitAnd),
            tag::BIT_XOR => ExprToken::Operator(Operator::BitXor),
            tag::BIT_OR => ExprToken::Operator(Operator::BitOr),
            tag::AND => ExprToken::Operator(Operator::And),
            tag::OR => ExprToken::Operator(Operator::Or),
            tag::LPAREN => ExprToken::LParen,
            tag::RPAREN => ExprToken::RParen,
            tag::QUESTION => ExprToken::Question,
            tag::COLON => ExprToken::Colon,
            _ => return Err(MatrixError::BytecodeError),
        };
        tokens.push(token);
    };
    Ok((tokens, terminator))
}

fn resolve(operand: Operand, table: &TokenTable) -> i32 {
    match operand {
        Operand::Literal(v) => v,
        Operand::TokenRef { address, key } => table.get(address, key).map_or(0, |e| e.value as i32),
    }
}

fn apply_binary(op: Operator, a: i32, b: i32) -> Result<i32> {
    use Operator::*;
    Ok(match op {
        Mul => a.wrapping_mul(b),
        Div => a.checked_div(b).ok_or(MatrixError::BytecodeError)?,
        Mod => a.checked_rem(b).ok_or(MatrixError::BytecodeError)?,
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Shl => a.wrapping_shl(b as u32),
        Shr => a.wrapping_shr(b as u32),
        Lt => i32::from(a < b),
        Le => i32::from(a <= b),
        Gt => i32::from(a > b),
        Ge => i32::from(a >= b),
        Eq => i32::from(a == b),
        Ne => i32::from(a != b),
        BitAnd => a & b,
        BitXor => a ^ b,
        BitOr => a | b,
        And => i32::from(a != 0 && b != 0),
        Or => i32::from(a != 0 || b != 0),
        Not | BitNot => unreachable!("unary operator in binary position"),
    })
}

fn apply_unary(op: Operator, a: i32) -> i32 {
    match op {
        Operator::Not => i32::from(a == 0),
        Operator::BitNot => !a,
        _ => unreachable!("binary operator in unary position"),
    }
}

/// Evaluate a flat infix token stream, short-circuiting ternary branches so a
/// division by zero in the untaken branch never fires (spec §4.10: "classic
/// shunting-yard over a small operand stack ... and operator stack").
pub fn eval_tokens(tokens: &[ExprToken], table: &TokenTable) -> Result<i32> {
    if let Some(qpos) = top_level_question(tokens) {
        let colon = top_level_colon(&tokens[qpos + 1..]).ok_or(MatrixError::BytecodeError)? + qpos + 1;
        let cond = eval_tokens(&tokens[..qpos], table)?;
        if cond != 0 {
            eval_tokens(&tokens[qpos + 1..colon], table)
        } else {
            eval_tokens(&tokens[colon + 1..], table)
        }
    } else {
        eval_shunting_yard(tokens, table)
    }
}

fn depth_at(tokens: &[ExprToken], idx: usize) -> i32 {
    let mut depth = 0;
    for t in &tokens[..idx] {
        match t {
            ExprToken::LParen => depth += 1,
            ExprToken::RParen => depth -= 1,
            _ => {}
        }
    }
    depth
}

fn top_level_question(tokens: &[ExprToken]) -> Option<usize> {
    tokens
        .iter()
        .position(|t| matches!(t, ExprToken::Question))
        .filter(|&i| depth_at(tokens, i) == 0)
}

fn top_level_colon(tokens: &[ExprToken]) -> Option<usize> {
    let mut depth = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t {
            ExprToken::LParen => depth += 1,
            ExprToken::RParen => depth -= 1,
            ExprToken::Colon if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn eval_shunting_yard(tokens: &[ExprToken], table: &TokenTable) -> Result<i32> {
    let mut operands: Vec<i32> = Vec::new();
    let mut operators: Vec<Operator> = Vec::new();
    let mut paren_depth: Vec<usize> = Vec::new();

    fn pop_apply(operands: &mut Vec<i32>, operators: &mut Vec<Operator>) -> Result<()> {
        let op = operators.pop().ok_or(MatrixError::BytecodeError)?;
        if op.is_unary() {
            let a = operands.pop().ok_or(MatrixError::BytecodeError)?;
            operands.push(apply_unary(op, a));
        } else {
            let b = operands.pop().ok_or(MatrixError::BytecodeError)?;
            let a = operands.pop().ok_or(MatrixError::BytecodeError)?;
            operands.push(apply_binary(op, a, b)?);
        }
        Ok(())
    }

    for token in tokens {
        match *token {
            ExprToken::Operand(operand) => {
                operands.push(resolve(operand, table));
                if operands.len() > STACK_DEPTH {
                    return Err(MatrixError::BytecodeError);
                }
            }
            ExprToken::LParen => {
                paren_depth.push(operators.len());
            }
            ExprToken::RParen => {
                let floor = paren_depth.pop().ok_or(MatrixError::BytecodeError)?;
                while operators.len() > floor {
                    pop_apply(&mut operands, &mut operators)?;
                }
            }
            ExprToken::Operator(op) => {
                while let Some(&top) = operators.last() {
                    if paren_depth.last().is_some_and(|&f| operators.len() <= f) {
                        break;
                    }
                    if top.precedence() <= op.precedence() && !op.is_unary() {
                        pop_apply(&mut operands, &mut operators)?;
                    } else {
                        break;
                    }
                }
                operators.push(op);
                if operators.len() > STACK_DEPTH {
                    return Err(MatrixError::BytecodeError);
                }
            }
            ExprToken::Question | ExprToken::Colon => {
                return Err(MatrixError::BytecodeError); // handled by eval_tokens before we get here
            }
        }
    }
    while !operators.is_empty() {
        pop_apply(&mut operands, &mut operators)?;
    }
    operands.pop().ok_or(MatrixError::BytecodeError)
}
