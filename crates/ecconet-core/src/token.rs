//! Keys, tokens, and the pure region-classification functions (spec §3, §4.1).
//!
//! A [`Token`] is the universal message unit on the bus: `(address, key, value)`
//! plus an internal `flags` side-band the time-logic engine (`crate::equation`)
//! uses and which never appears on the wire.
//!
//! All of the functions below are total: an unrecognized key yields `value_size
//! == 0` rather than panicking, per spec §4.1 ("All are total functions;
//! unknown keys return value size 0. No state.").

use serde::Serialize;

/// Top 3 bits of a 16-bit key, fixed by the wire format (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyPrefix {
    Command,
    OutputStatus,
    InputStatus,
    BinaryRepeat,
    AnalogRepeat,
    PatternSync,
    /// Top-3-bit patterns 6 and 7 are reserved by the wire format.
    Reserved,
}

const PREFIX_MASK: u16 = 0xE000;
const PREFIX_SHIFT: u32 = 13;

/// Classify the top 3 bits of `key`.
#[inline]
#[must_use]
pub fn prefix(key: u16) -> KeyPrefix {
    match (key & PREFIX_MASK) >> PREFIX_SHIFT {
        0 => KeyPrefix::Command,
        1 => KeyPrefix::OutputStatus,
        2 => KeyPrefix::InputStatus,
        3 => KeyPrefix::BinaryRepeat,
        4 => KeyPrefix::AnalogRepeat,
        5 => KeyPrefix::PatternSync,
        _ => KeyPrefix::Reserved,
    }
}

/// Strip the prefix bits, leaving the 13-bit region-encoded identifier.
#[inline]
#[must_use]
pub fn without_prefix(key: u16) -> u16 {
    key & !PREFIX_MASK
}

/// Re-attach a prefix to a 13-bit identifier.
#[inline]
#[must_use]
pub fn with_prefix(prefix: KeyPrefix, id: u16) -> u16 {
    let bits: u16 = match prefix {
        KeyPrefix::Command => 0,
        KeyPrefix::OutputStatus => 1,
        KeyPrefix::InputStatus => 2,
        KeyPrefix::BinaryRepeat => 3,
        KeyPrefix::AnalogRepeat => 4,
        KeyPrefix::PatternSync => 5,
        KeyPrefix::Reserved => 6,
    };
    ((bits << PREFIX_SHIFT) & PREFIX_MASK) | without_prefix(id)
}

#[inline]
#[must_use]
pub fn is_command(key: u16) -> bool {
    prefix(key) == KeyPrefix::Command
}

#[inline]
#[must_use]
pub fn is_output_status(key: u16) -> bool {
    prefix(key) == KeyPrefix::OutputStatus
}

#[inline]
#[must_use]
pub fn is_input_status(key: u16) -> bool {
    prefix(key) == KeyPrefix::InputStatus
}

/// Region boundaries within the 13-bit region id (spec §3; original source
/// `matrix_token_regions.h`).
mod region {
    pub const LOCAL_BASE: u16 = 1;
    pub const LOCAL_SIZE: u16 = 199;
    pub const LOCAL_ONE_BYTE_BASE: u16 = 1;
    pub const LOCAL_ONE_BYTE_SIZE: u16 = 119;
    pub const LOCAL_TWO_BYTE_BASE: u16 = 120;
    pub const LOCAL_TWO_BYTE_SIZE: u16 = 50;
    pub const LOCAL_FOUR_BYTE_BASE: u16 = 170;
    pub const LOCAL_FOUR_BYTE_SIZE: u16 = 20;
    pub const LOCAL_ZERO_BYTE_BASE: u16 = 190;
    pub const LOCAL_ZERO_BYTE_SIZE: u16 = 10;

    pub const INDEXED_INPUT_BASE: u16 = 200;
    pub const INDEXED_INPUT_SIZE: u16 = 300;
    pub const INDEXED_OUTPUT_BASE: u16 = 500;
    pub const INDEXED_OUTPUT_SIZE: u16 = 500;

    pub const NAMED_ONE_BYTE_BASE: u16 = 1000;
    pub const NAMED_ONE_BYTE_SIZE: u16 = 4000;
    pub const NAMED_TWO_BYTE_BASE: u16 = 5000;
    pub const NAMED_TWO_BYTE_SIZE: u16 = 2000;
    pub const NAMED_FOUR_BYTE_BASE: u16 = 7000;
    pub const NAMED_FOUR_BYTE_SIZE: u16 = 1000;
    pub const NAMED_ZERO_BYTE_BASE: u16 = 8000;
    pub const NAMED_ZERO_BYTE_SIZE: u16 = 150;

    pub const SEQUENCER_BASE: u16 = 8150;
    pub const SEQUENCER_SIZE: u16 = 10;

    pub const FTP_BASE: u16 = 8160;
    pub const FTP_SIZE: u16 = 22;
}

#[inline]
fn in_range(id: u16, base: u16, size: u16) -> bool {
    id >= base && id < base + size
}

/// True if `key`'s region id falls in `1..199` (spec §3).
#[inline]
#[must_use]
pub fn is_local(key: u16) -> bool {
    in_range(without_prefix(key), region::LOCAL_BASE, region::LOCAL_SIZE)
}

#[inline]
#[must_use]
pub fn is_indexed_input(key: u16) -> bool {
    in_range(
        without_prefix(key),
        region::INDEXED_INPUT_BASE,
        region::INDEXED_INPUT_SIZE,
    )
}

#[inline]
#[must_use]
pub fn is_indexed_output(key: u16) -> bool {
    in_range(
        without_prefix(key),
        region::INDEXED_OUTPUT_BASE,
        region::INDEXED_OUTPUT_SIZE,
    )
}

#[inline]
#[must_use]
pub fn is_named(key: u16) -> bool {
    let id = without_prefix(key);
    in_range(id, region::NAMED_ONE_BYTE_BASE, region::NAMED_ONE_BYTE_SIZE)
        || in_range(id, region::NAMED_TWO_BYTE_BASE, region::NAMED_TWO_BYTE_SIZE)
        || in_range(id, region::NAMED_FOUR_BYTE_BASE, region::NAMED_FOUR_BYTE_SIZE)
        || in_range(id, region::NAMED_ZERO_BYTE_BASE, region::NAMED_ZERO_BYTE_SIZE)
}

#[inline]
#[must_use]
pub fn is_indexed_sequencer(key: u16) -> bool {
    in_range(
        without_prefix(key),
        region::SEQUENCER_BASE,
        region::SEQUENCER_SIZE,
    )
}

/// True if `key` is an FTP request/response key (region `8160..8181`, spec §3).
#[inline]
#[must_use]
pub fn is_ftp(key: u16) -> bool {
    in_range(without_prefix(key), region::FTP_BASE, region::FTP_SIZE)
}

/// FTP requests are the first 10 of the 22-wide FTP region; responses the rest
/// (spec §3: "8160..8181"; original source splits 8160..8170 requests /
/// 8170..8182 responses).
#[inline]
#[must_use]
pub fn is_ftp_request(key: u16) -> bool {
    in_range(without_prefix(key), region::FTP_BASE, 10)
}

#[inline]
#[must_use]
pub fn is_ftp_response(key: u16) -> bool {
    in_range(without_prefix(key), region::FTP_BASE + 10, 12)
}

/// Value width in bytes, a pure function of `key` (spec §3 invariant).
///
/// Unknown/reserved keys return `0` rather than panicking, matching the
/// "total function" contract spec §4.1 requires.
#[must_use]
pub fn value_size(key: u16) -> usize {
    let id = without_prefix(key);

    if in_range(id, region::LOCAL_ONE_BYTE_BASE, region::LOCAL_ONE_BYTE_SIZE) {
        return 1;
    }
    if in_range(id, region::LOCAL_TWO_BYTE_BASE, region::LOCAL_TWO_BYTE_SIZE) {
        return 2;
    }
    if in_range(id, region::LOCAL_FOUR_BYTE_BASE, region::LOCAL_FOUR_BYTE_SIZE) {
        return 4;
    }
    if in_range(id, region::LOCAL_ZERO_BYTE_BASE, region::LOCAL_ZERO_BYTE_SIZE) {
        return 0;
    }
    if in_range(id, region::INDEXED_INPUT_BASE, region::INDEXED_INPUT_SIZE) {
        return 1;
    }
    if in_range(id, region::INDEXED_OUTPUT_BASE, region::INDEXED_OUTPUT_SIZE) {
        return 1;
    }
    if in_range(id, region::NAMED_ONE_BYTE_BASE, region::NAMED_ONE_BYTE_SIZE) {
        return 1;
    }
    if in_range(id, region::NAMED_TWO_BYTE_BASE, region::NAMED_TWO_BYTE_SIZE) {
        return 2;
    }
    if in_range(id, region::NAMED_FOUR_BYTE_BASE, region::NAMED_FOUR_BYTE_SIZE) {
        return 4;
    }
    if in_range(id, region::NAMED_ZERO_BYTE_BASE, region::NAMED_ZERO_BYTE_SIZE) {
        return 0;
    }
    if in_range(id, region::SEQUENCER_BASE, region::SEQUENCER_SIZE) {
        return 3;
    }
    if prefix(key) == KeyPrefix::PatternSync {
        return 2;
    }
    // FTP payloads are variable-length and handled out-of-band by the FTP
    // client/server, not by the codec; 0 here just means "codec doesn't own this".
    0
}

/// Reboot request shared between the bootloader and the main application
/// (spec §9: "treat the reboot handler as a host capability, not a core
/// responsibility").
pub const KEY_REQUEST_SYSTEM_REBOOT: u32 = 0x4C7E_146F;

/// Pseudo-address of the equation processor (spec §4.10, §6).
pub const ADDR_EQUATION_PROCESSOR: u8 = 132;
/// Pseudo-addresses of sequencers 0..5 (spec §6).
pub const ADDR_SEQUENCER_BASE: u8 = 133;

/// Synthesized internal key the receiver builds out of an inbound
/// `PatternSync` message (spec §4.6 step 7) to forward to the sequencer and
/// address manager. Never appears on the wire; parked in the `Reserved`
/// prefix space so it can never collide with a real key.
pub const KEY_TOKEN_SEQUENCER_SYNC: u16 = 0xC000;

/// `(address, key, value)` plus the internal `flags` side-band (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Token {
    pub address: u8,
    pub key: u16,
    pub value: u32,
    /// Internal side-band consumed only by `crate::equation`; never placed on the wire.
    #[serde(skip)]
    pub flags: TokenFlags,
}

/// A tiny hand-rolled bitflags type: the teacher has no bitflags dependency and
/// this repo only needs five independent bits, so a `const fn`-friendly wrapper
/// avoids pulling in a crate for it.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: Self = Self($value);)*

            #[inline]
            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }
        }
    };
}

bitflags_like! {
    /// Per-entry state bits used by the time-logic engine's token table (spec §4.10).
    pub struct TokenFlags: u8 {
        const INPUT_BITSTATE = 0b0000_0001;
        const SKIP_TOGGLE = 0b0000_0010;
        const IS_EQUATION_OUTPUT = 0b0000_0100;
        const SHOULD_BROADCAST = 0b0000_1000;
        const RECEIVED_SINCE_LAST_EVAL = 0b0001_0000;
    }
}

impl Token {
    #[must_use]
    pub fn new(address: u8, key: u16, value: u32) -> Self {
        Self {
            address,
            key,
            value,
            flags: TokenFlags::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_decodes_top_three_bits() {
        assert_eq!(prefix(0x0064), KeyPrefix::Command);
        assert_eq!(prefix(0x2064), KeyPrefix::OutputStatus);
        assert_eq!(prefix(0x4064), KeyPrefix::InputStatus);
        assert_eq!(prefix(0x6064), KeyPrefix::BinaryRepeat);
        assert_eq!(prefix(0x8064), KeyPrefix::AnalogRepeat);
        assert_eq!(prefix(0xA064), KeyPrefix::PatternSync);
        assert_eq!(prefix(0xC064), KeyPrefix::Reserved);
    }

    #[test]
    fn without_prefix_strips_top_bits_only() {
        assert_eq!(without_prefix(0x4064), 0x0064);
        assert_eq!(with_prefix(KeyPrefix::InputStatus, 0x0064), 0x4064);
    }

    #[test]
    fn value_size_matches_regions() {
        assert_eq!(value_size(with_prefix(KeyPrefix::InputStatus, 1000)), 1); // named one-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::InputStatus, 5000)), 2); // named two-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::InputStatus, 7000)), 4); // named four-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::InputStatus, 8000)), 0); // named zero-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::InputStatus, 200)), 1); // indexed input
        assert_eq!(value_size(with_prefix(KeyPrefix::OutputStatus, 500)), 1); // indexed output
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 8150)), 3); // indexed sequencer
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 1)), 1); // local one-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 120)), 2); // local two-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 170)), 4); // local four-byte
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 190)), 0); // local zero-byte
    }

    #[test]
    fn unknown_key_has_zero_value_size() {
        // 8182..8192 falls after the FTP region (8160..8182) and before the
        // 13-bit id space runs out; no region claims it.
        assert_eq!(value_size(with_prefix(KeyPrefix::Command, 8185)), 0);
    }

    #[test]
    fn is_local_matches_spec_range() {
        assert!(is_local(with_prefix(KeyPrefix::Command, 1)));
        assert!(is_local(with_prefix(KeyPrefix::Command, 199)));
        assert!(!is_local(with_prefix(KeyPrefix::Command, 200)));
    }

    #[test]
    fn ftp_request_response_split() {
        assert!(is_ftp_request(with_prefix(KeyPrefix::Command, 8160)));
        assert!(is_ftp_request(with_prefix(KeyPrefix::Command, 8169)));
        assert!(is_ftp_response(with_prefix(KeyPrefix::Command, 8170)));
        assert!(is_ftp(with_prefix(KeyPrefix::Command, 8175)));
    }
}
