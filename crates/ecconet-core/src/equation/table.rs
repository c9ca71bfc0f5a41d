//! The live token table the equation engine evaluates against (spec §4.10).

use crate::token::TokenFlags;

/// One row of the token table: a token's latest value plus the flag bits and
/// optional local-key remap the engine needs to apply update semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTableEntry {
    pub address: u8,
    pub key: u16,
    pub value: u32,
    pub last_change_ms: u64,
    pub flags: TokenFlags,
    /// If a lambda rebinds a public token to a local variable (spec §4.10).
    pub mapped_local_key: Option<u16>,
}

impl TokenTableEntry {
    fn new(address: u8, key: u16) -> Self {
        Self {
            address,
            key,
            value: 0,
            last_change_ms: 0,
            flags: TokenFlags::empty(),
            mapped_local_key: None,
        }
    }
}

/// Sorted by `(address, key)`; looked up by binary search (spec §4.10).
#[derive(Debug, Default)]
pub struct TokenTable {
    entries: Vec<TokenTableEntry>,
}

impl TokenTable {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn search(&self, address: u8, key: u16) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&(address, key), |e| (e.address, e.key))
    }

    /// Insert a row for `(address, key)` if it doesn't already exist; a
    /// rebuild step scans all `TokenKey(...)` occurrences in the bytecode and
    /// calls this once per distinct pair (spec §4.10).
    pub fn ensure(&mut self, address: u8, key: u16) -> &mut TokenTableEntry {
        match self.search(address, key) {
            Ok(i) => &mut self.entries[i],
            Err(i) => {
                self.entries.insert(i, TokenTableEntry::new(address, key));
                &mut self.entries[i]
            }
        }
    }

    #[must_use]
    pub fn get(&self, address: u8, key: u16) -> Option<&TokenTableEntry> {
        self.search(address, key).ok().map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, address: u8, key: u16) -> Option<&mut TokenTableEntry> {
        self.search(address, key).ok().map(move |i| &mut self.entries[i])
    }

    /// Apply an inbound token per spec §4.10's update semantics: accepted
    /// unless the entry is an equation output and the incoming token is not
    /// itself an input-status (prevents external writes from clobbering
    /// computed outputs).
    pub fn apply_inbound(&mut self, address: u8, key: u16, value: u32, is_input_status: bool, now_ms: u64) {
        let Some(entry) = self.get_mut(address, key) else {
            return;
        };
        if entry.flags.contains(TokenFlags::IS_EQUATION_OUTPUT) && !is_input_status {
            return;
        }
        if entry.value != value {
            entry.last_change_ms = now_ms;
        }
        entry.value = value;
        entry.flags.insert(TokenFlags::RECEIVED_SINCE_LAST_EVAL);
    }

    pub fn clear_received_flags(&mut self) {
        for e in &mut self.entries {
            e.flags.remove(TokenFlags::RECEIVED_SINCE_LAST_EVAL);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenTableEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent_and_keeps_sorted_order() {
        let mut table = TokenTable::new();
        table.ensure(5, 200);
        table.ensure(1, 100);
        table.ensure(5, 100);
        assert_eq!(table.len(), 3);
        let addrs: Vec<(u8, u16)> = table.iter().map(|e| (e.address, e.key)).collect();
        assert_eq!(addrs, vec![(1, 100), (5, 100), (5, 200)]);
    }

    #[test]
    fn apply_inbound_rejects_writes_to_equation_outputs_unless_input_status() {
        let mut table = TokenTable::new();
        table.ensure(0, 1).flags.insert(TokenFlags::IS_EQUATION_OUTPUT);
        table.apply_inbound(0, 1, 42, false, 0);
        assert_eq!(table.get(0, 1).unwrap().value, 0);
        table.apply_inbound(0, 1, 42, true, 0);
        assert_eq!(table.get(0, 1).unwrap().value, 42);
    }

    #[test]
    fn apply_inbound_marks_received_and_stamps_change_time() {
        let mut table = TokenTable::new();
        table.ensure(0, 1);
        table.apply_inbound(0, 1, 7, false, 100);
        let entry = table.get(0, 1).unwrap();
        assert_eq!(entry.value, 7);
        assert_eq!(entry.last_change_ms, 100);
        assert!(entry.flags.contains(TokenFlags::RECEIVED_SINCE_LAST_EVAL));
    }
}
