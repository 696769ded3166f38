//! Where simulated register values come from.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

use super::UnitId;

/// The two single-bit tables of the Modbus data model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitTable {
    Coils,
    DiscreteInputs,
}

/// The two 16-bit tables of the Modbus data model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WordTable {
    HoldingRegisters,
    InputRegisters,
}

/// Supplies the values a read request answers with.
///
/// Implementations must return exactly `quantity` values.
pub trait DataSource: Send + Sync {
    fn read_bits(&self, unit: UnitId, table: BitTable, address: u16, quantity: u16) -> Vec<bool>;

    fn read_words(&self, unit: UnitId, table: WordTable, address: u16, quantity: u16) -> Vec<u16>;
}

/// Answers every read with fresh random values.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSource;

impl DataSource for RandomSource {
    fn read_bits(
        &self,
        _unit: UnitId,
        _table: BitTable,
        _address: u16,
        quantity: u16,
    ) -> Vec<bool> {
        let mut rng = rand::thread_rng();
        (0..quantity).map(|_| rng.gen()).collect()
    }

    fn read_words(
        &self,
        _unit: UnitId,
        _table: WordTable,
        _address: u16,
        quantity: u16,
    ) -> Vec<u16> {
        let mut rng = rand::thread_rng();
        (0..quantity).map(|_| rng.gen()).collect()
    }
}

/// Deterministic in-memory tables, shared by every unit.
///
/// Addresses that were never written read as `false` / `0`. Writes may happen while the server is
/// running, e.g. from an operator front end.
#[derive(Debug, Default)]
pub struct MemoryMap {
    bits: RwLock<HashMap<(BitTable, u16), bool>>,
    words: RwLock<HashMap<(WordTable, u16), u16>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bit(&self, table: BitTable, address: u16, value: bool) {
        self.bits.write().insert((table, address), value);
    }

    pub fn put_bits(&self, table: BitTable, address: u16, values: &[bool]) {
        let mut bits = self.bits.write();
        for (address, value) in (address..).zip(values) {
            bits.insert((table, address), *value);
        }
    }

    pub fn put_word(&self, table: WordTable, address: u16, value: u16) {
        self.words.write().insert((table, address), value);
    }

    pub fn get_word(&self, table: WordTable, address: u16) -> Option<u16> {
        self.words.read().get(&(table, address)).copied()
    }
}

impl DataSource for MemoryMap {
    fn read_bits(&self, _unit: UnitId, table: BitTable, address: u16, quantity: u16) -> Vec<bool> {
        let bits = self.bits.read();
        (0..quantity)
            .map(|offset| {
                let address = address.wrapping_add(offset);
                bits.get(&(table, address)).copied().unwrap_or(false)
            })
            .collect()
    }

    fn read_words(&self, _unit: UnitId, table: WordTable, address: u16, quantity: u16) -> Vec<u16> {
        let words = self.words.read();
        (0..quantity)
            .map(|offset| {
                let address = address.wrapping_add(offset);
                words.get(&(table, address)).copied().unwrap_or(0)
            })
            .collect()
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn random_source_returns_requested_quantity() {
    let source = RandomSource;
    assert_eq!(source.read_bits(1, BitTable::DiscreteInputs, 0, 9).len(), 9);
    assert_eq!(source.read_words(1, WordTable::InputRegisters, 0, 3).len(), 3);
    assert!(source.read_bits(1, BitTable::Coils, 0, 0).is_empty());
}

#[test]
fn memory_map_reads_back_what_was_put() {
    let map = MemoryMap::new();
    map.put_bits(BitTable::DiscreteInputs, 10, &[true, false, true]);
    map.put_bit(BitTable::Coils, 11, true);
    map.put_word(WordTable::HoldingRegisters, 5, 0xBEEF);

    assert_eq!(
        map.read_bits(101, BitTable::DiscreteInputs, 9, 5),
        vec![false, true, false, true, false]
    );
    assert_eq!(map.read_bits(101, BitTable::Coils, 10, 2), vec![false, true]);
    assert_eq!(
        map.read_words(101, WordTable::HoldingRegisters, 4, 2),
        vec![0, 0xBEEF]
    );
    assert_eq!(map.get_word(WordTable::InputRegisters, 5), None);
}
