//! Handle table: managed values as native words
//!
//! Native code never sees a managed value directly, only a word naming an
//! entry in this table. The same value always gets the same word, so
//! handles can be compared for identity on the native side.
//!
//! A word packs a generation number into its upper half and a 1-based slot
//! index into its lower half. Word `0` is never issued. `reset` drops every
//! entry and moves to the next generation, so words from before the reset
//! no longer resolve.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tendril_vm::Value;
use tracing::trace;

use super::deopt::DeoptMap;
use super::BridgeError;

/// A native machine word
pub type Word = usize;

/// Width of a native word in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// The word that never names a managed value; returned by the raw entry
/// points on failure
pub const NULL_HANDLE: Word = 0;

const INDEX_BITS: u32 = Word::BITS / 2;
const INDEX_MASK: Word = (1 << INDEX_BITS) - 1;

/// Anything native code can hold a handle to
#[derive(Debug, Clone)]
pub enum Managed {
    Value(Value),
    DeoptMap(Arc<DeoptMap>),
}

impl Managed {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Managed::Value(_) => "value",
            Managed::DeoptMap(_) => "deopt map",
        }
    }

    fn key(&self) -> HandleKey {
        match self {
            Managed::Value(value) => HandleKey::Value(value.clone()),
            Managed::DeoptMap(map) => HandleKey::DeoptMap(Arc::as_ptr(map) as usize),
        }
    }
}

/// Identity of a managed entry: values by equality, deopt maps by address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HandleKey {
    Value(Value),
    DeoptMap(usize),
}

/// Bijective mapping between managed entries and handle words
#[derive(Debug)]
pub struct HandleTable {
    entries: Vec<Managed>,
    slots: FxHashMap<HandleKey, usize>,
    generation: Word,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            entries: Vec::new(),
            slots: FxHashMap::default(),
            generation: 1,
        }
    }

    /// The handle for `managed`, allocating one on first sight
    pub fn handle_for(&mut self, managed: Managed) -> Result<Word, BridgeError> {
        let key = managed.key();
        if let Some(&slot) = self.slots.get(&key) {
            return Ok(self.word(slot));
        }

        let slot = self.entries.len();
        if slot + 1 > INDEX_MASK {
            return Err(BridgeError::TableFull);
        }
        trace!(slot, kind = managed.kind_name(), "new handle");
        self.entries.push(managed);
        self.slots.insert(key, slot);
        Ok(self.word(slot))
    }

    pub fn value_handle(&mut self, value: Value) -> Result<Word, BridgeError> {
        self.handle_for(Managed::Value(value))
    }

    pub fn deopt_map_handle(&mut self, map: Arc<DeoptMap>) -> Result<Word, BridgeError> {
        self.handle_for(Managed::DeoptMap(map))
    }

    pub fn get(&self, word: Word) -> Result<&Managed, BridgeError> {
        let slot = word & INDEX_MASK;
        if slot == 0 || word >> INDEX_BITS != self.generation_bits() {
            return Err(BridgeError::UnknownHandle(word));
        }
        self.entries.get(slot - 1).ok_or(BridgeError::UnknownHandle(word))
    }

    /// The value named by `word`
    pub fn value(&self, word: Word) -> Result<Value, BridgeError> {
        match self.get(word)? {
            Managed::Value(value) => Ok(value.clone()),
            other => Err(BridgeError::WrongKind {
                word,
                expected: "value",
                found: other.kind_name(),
            }),
        }
    }

    /// The deopt map named by `word`
    pub fn deopt_map(&self, word: Word) -> Result<Arc<DeoptMap>, BridgeError> {
        match self.get(word)? {
            Managed::DeoptMap(map) => Ok(Arc::clone(map)),
            other => Err(BridgeError::WrongKind {
                word,
                expected: "deopt map",
                found: other.kind_name(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> Word {
        self.generation
    }

    /// Forget every entry. Handles issued so far stop resolving.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.slots.clear();
        self.generation = self.generation.wrapping_add(1);
        if self.generation_bits() == 0 {
            self.generation = 1;
        }
    }

    fn generation_bits(&self) -> Word {
        self.generation & INDEX_MASK
    }

    fn word(&self, slot: usize) -> Word {
        (self.generation_bits() << INDEX_BITS) | (slot + 1)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendril_vm::Insn;

    #[test]
    fn test_same_value_same_handle() {
        let mut table = HandleTable::new();
        let a = table.value_handle(Value::Int(14)).unwrap();
        let b = table.value_handle(Value::Int(2)).unwrap();
        let c = table.value_handle(Value::Int(14)).unwrap();

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_ne!(a, NULL_HANDLE);
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(b), Ok(Value::Int(2)));
    }

    #[test]
    fn test_unknown_and_null_handles() {
        let table = HandleTable::new();
        assert_eq!(table.value(NULL_HANDLE), Err(BridgeError::UnknownHandle(0)));
        assert!(matches!(table.value(12345), Err(BridgeError::UnknownHandle(12345))));
    }

    #[test]
    fn test_deopt_maps_by_identity() {
        let mut table = HandleTable::new();
        let map = Arc::new(DeoptMap::new(vec![Insn::Return], 0));
        let twin = Arc::new(DeoptMap::new(vec![Insn::Return], 0));

        let first = table.deopt_map_handle(Arc::clone(&map)).unwrap();
        assert_eq!(table.deopt_map_handle(Arc::clone(&map)).unwrap(), first);
        assert_ne!(table.deopt_map_handle(twin).unwrap(), first);
        assert!(Arc::ptr_eq(&table.deopt_map(first).unwrap(), &map));
    }

    #[test]
    fn test_wrong_kind() {
        let mut table = HandleTable::new();
        let value = table.value_handle(Value::Nil).unwrap();
        let map = table.deopt_map_handle(Arc::new(DeoptMap::new(Vec::<Insn>::new(), 0))).unwrap();

        assert!(matches!(
            table.deopt_map(value),
            Err(BridgeError::WrongKind { expected: "deopt map", found: "value", .. })
        ));
        assert!(matches!(
            table.value(map),
            Err(BridgeError::WrongKind { expected: "value", found: "deopt map", .. })
        ));
    }

    #[test]
    fn test_reset_invalidates_old_handles() {
        let mut table = HandleTable::new();
        let old = table.value_handle(Value::Int(1)).unwrap();
        table.reset();

        assert!(table.is_empty());
        assert_eq!(table.value(old), Err(BridgeError::UnknownHandle(old)));
        let new = table.value_handle(Value::Int(1)).unwrap();
        assert_ne!(new, old);
        assert_eq!(table.value(new), Ok(Value::Int(1)));
    }
}
