//! Dependency ledger: terminal outcome per command ID, shared by every in-flight
//! delivery.
//!
//! Entries are created the first time an ID is referenced, either as a dependency
//! or as a completed command. Only terminal entries are ever evicted, oldest first,
//! once the retention bound is exceeded.

use indexmap::IndexMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Known outcome of a command ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unresolved,
    Success,
    Fatal,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Self::Unresolved
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "UNRESOLVED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Verdict of the dependency gate for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Every dependency succeeded (or there are none).
    Ready,
    /// These dependencies have no terminal outcome yet.
    Wait(Vec<String>),
    /// This dependency failed terminally.
    Failed(String),
}

pub struct DependencyLedger {
    entries: Mutex<IndexMap<String, Outcome>>,
    retention: usize,
}

impl DependencyLedger {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Outcome>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outcome recorded for an ID, if it has ever been referenced.
    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.lock().get(id).copied()
    }

    /// Check a dependency list. A failed dependency wins over unresolved ones;
    /// IDs never seen before are registered as unresolved.
    pub fn check(&self, dependencies: &[String]) -> Gate {
        let mut entries = self.lock();
        let mut waiting = Vec::new();
        for dep in dependencies {
            let outcome = *entries.entry(dep.clone()).or_insert(Outcome::Unresolved);
            match outcome {
                Outcome::Fatal => return Gate::Failed(dep.clone()),
                Outcome::Unresolved => waiting.push(dep.clone()),
                Outcome::Success => {}
            }
        }
        if waiting.is_empty() {
            Gate::Ready
        } else {
            Gate::Wait(waiting)
        }
    }

    /// Record an outcome. A terminal outcome is never overwritten, so the first
    /// terminal result for an ID is the one every dependent observes.
    pub fn record(&self, id: &str, outcome: Outcome) -> Outcome {
        let mut entries = self.lock();
        let current = entries.get(id).copied();
        let stored = match current {
            Some(existing) if existing.is_terminal() => existing,
            _ => {
                // Re-insert so eviction order follows the time an ID turned terminal.
                entries.shift_remove(id);
                entries.insert(id.to_string(), outcome);
                outcome
            }
        };
        if outcome.is_terminal() {
            evict(&mut entries, self.retention);
        }
        stored
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drop the oldest terminal entries until at most `retention` terminal entries remain.
fn evict(entries: &mut IndexMap<String, Outcome>, retention: usize) {
    let terminal = entries.values().filter(|o| o.is_terminal()).count();
    if terminal <= retention {
        return;
    }
    let mut excess = terminal - retention;
    entries.retain(|_, outcome| {
        if excess > 0 && outcome.is_terminal() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ledger_empty_dependencies_ready() {
        let ledger = DependencyLedger::new(10);
        assert_eq!(ledger.check(&[]), Gate::Ready);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ledger_first_reference_creates_unresolved() {
        let ledger = DependencyLedger::new(10);
        assert_eq!(ledger.check(&ids(&["a"])), Gate::Wait(ids(&["a"])));
        assert_eq!(ledger.outcome("a"), Some(Outcome::Unresolved));
    }

    #[test]
    fn test_ledger_success_unblocks() {
        let ledger = DependencyLedger::new(10);
        ledger.record("a", Outcome::Success);
        ledger.record("b", Outcome::Success);
        assert_eq!(ledger.check(&ids(&["a", "b"])), Gate::Ready);
    }

    #[test]
    fn test_ledger_fatal_wins_over_unresolved() {
        let ledger = DependencyLedger::new(10);
        ledger.record("bad", Outcome::Fatal);
        assert_eq!(
            ledger.check(&ids(&["pending", "bad"])),
            Gate::Failed("bad".to_string())
        );
    }

    #[test]
    fn test_ledger_terminal_not_overwritten() {
        let ledger = DependencyLedger::new(10);
        assert_eq!(ledger.record("a", Outcome::Success), Outcome::Success);
        assert_eq!(ledger.record("a", Outcome::Fatal), Outcome::Success);
        assert_eq!(ledger.outcome("a"), Some(Outcome::Success));
    }

    #[test]
    fn test_ledger_retention_evicts_oldest_terminal() {
        let ledger = DependencyLedger::new(2);
        ledger.check(&ids(&["waiting"]));
        ledger.record("a", Outcome::Success);
        ledger.record("b", Outcome::Fatal);
        ledger.record("c", Outcome::Success);
        assert_eq!(ledger.outcome("a"), None);
        assert_eq!(ledger.outcome("b"), Some(Outcome::Fatal));
        assert_eq!(ledger.outcome("c"), Some(Outcome::Success));
        assert_eq!(ledger.outcome("waiting"), Some(Outcome::Unresolved));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_ledger_concurrent_records() {
        let ledger = Arc::new(DependencyLedger::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ledger.record(&format!("{}-{}", t, i), Outcome::Success);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.len(), 400);
    }

    proptest! {
        #[test]
        fn prop_ledger_gate_matches_outcomes(
            states in proptest::collection::vec(0u8..3, 0..12)
        ) {
            let ledger = DependencyLedger::new(100);
            let deps: Vec<String> = (0..states.len()).map(|i| format!("d{}", i)).collect();
            for (dep, s) in deps.iter().zip(&states) {
                match s {
                    0 => { ledger.check(std::slice::from_ref(dep)); }
                    1 => { ledger.record(dep, Outcome::Success); }
                    _ => { ledger.record(dep, Outcome::Fatal); }
                }
            }
            let gate = ledger.check(&deps);
            if states.contains(&2) {
                prop_assert!(matches!(gate, Gate::Failed(_)));
            } else if states.contains(&0) {
                prop_assert!(matches!(gate, Gate::Wait(_)));
            } else {
                prop_assert_eq!(gate, Gate::Ready);
            }
        }
    }
}
