use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use super::UnitId;

/// Tracks which slaves are currently reachable.
///
/// Cloning is cheap and every clone shares the same state, so one handle goes to the operator
/// front end and another to each connection. A unit that was never connected is offline.
#[derive(Clone, Debug, Default)]
pub struct SlaveRegistry {
    slaves: Arc<RwLock<HashMap<UnitId, bool>>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, unit: UnitId) {
        debug!(unit, "slave online");
        self.slaves.write().insert(unit, true);
    }

    pub fn disconnect(&self, unit: UnitId) {
        debug!(unit, "slave offline");
        self.slaves.write().insert(unit, false);
    }

    pub fn is_online(&self, unit: UnitId) -> bool {
        self.slaves.read().get(&unit).copied().unwrap_or(false)
    }

    /// All units currently online, in ascending order.
    pub fn online(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self
            .slaves
            .read()
            .iter()
            .filter_map(|(unit, online)| online.then_some(*unit))
            .collect();
        units.sort_unstable();
        units
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn unknown_slaves_are_offline() {
    let registry = SlaveRegistry::new();
    assert!(!registry.is_online(101));
    assert!(registry.online().is_empty());
}

#[test]
fn toggles_slaves() {
    let registry = SlaveRegistry::new();
    let ui = registry.clone();

    ui.connect(101);
    ui.connect(7);
    assert!(registry.is_online(101));
    assert_eq!(registry.online(), vec![7, 101]);

    ui.disconnect(101);
    assert!(!registry.is_online(101));
    assert_eq!(registry.online(), vec![7]);
}

#[test]
fn concurrent_toggling_and_reads() {
    let registry = SlaveRegistry::new();

    let writers: Vec<_> = (0..4u8)
        .map(|n| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let unit = n * 10 + (i % 10) as u8;
                    if i % 2 == 0 {
                        registry.connect(unit);
                    } else {
                        registry.disconnect(unit);
                    }
                }
                registry.connect(n * 10);
            })
        })
        .collect();

    let reader = {
        let registry = registry.clone();
        std::thread::spawn(move || {
            for i in 0..4000u32 {
                let _ = registry.is_online((i % 40) as u8);
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    for n in 0..4u8 {
        assert!(registry.is_online(n * 10));
    }
}
