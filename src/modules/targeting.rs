//! Per-input targeting state
//!
//! Which input receives the next reading is kept in an explicit table keyed by
//! [`InputId`]; the surface only renders it. Every operation returns the
//! [`Transition`]s it caused so the caller can project them.
//!
//! ```text
//!        set_waiting            fulfill
//! Idle ───────────────► Waiting ────────► Fulfilled
//!  ▲                       │                  │
//!  └──── set_idle ─────────┴──── set_idle ────┘
//! ```
//!
//! At most one input is `Waiting`: `set_waiting` demotes the previous one in
//! the same call.

use std::collections::BTreeMap;

use crate::surface::InputId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    Idle,
    Waiting,
    Fulfilled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub input: InputId,
    pub from: TargetState,
    pub to: TargetState,
}

#[derive(Debug, Default)]
pub struct TargetTable {
    states: BTreeMap<InputId, TargetState>,
}

impl TargetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, input: &InputId) -> TargetState {
        self.states.get(input).copied().unwrap_or_default()
    }

    fn set(&mut self, input: &InputId, to: TargetState) -> Option<Transition> {
        let from = self.state(input);
        if from == to {
            return None;
        }
        if to == TargetState::Idle {
            self.states.remove(input);
        } else {
            self.states.insert(input.clone(), to);
        }
        Some(Transition {
            input: input.clone(),
            from,
            to,
        })
    }

    /// Make `input` the single waiting input
    pub fn set_waiting(&mut self, input: &InputId) -> Vec<Transition> {
        let others: Vec<InputId> = self
            .states
            .iter()
            .filter(|(id, state)| **state == TargetState::Waiting && *id != input)
            .map(|(id, _)| id.clone())
            .collect();
        let mut transitions: Vec<Transition> = others
            .iter()
            .filter_map(|id| self.set(id, TargetState::Idle))
            .collect();
        transitions.extend(self.set(input, TargetState::Waiting));
        transitions
    }

    pub fn set_idle(&mut self, input: &InputId) -> Option<Transition> {
        self.set(input, TargetState::Idle)
    }

    /// Waiting → Fulfilled. Any other starting state is left alone.
    pub fn fulfill(&mut self, input: &InputId) -> Option<Transition> {
        if self.state(input) != TargetState::Waiting {
            return None;
        }
        self.set(input, TargetState::Fulfilled)
    }

    pub fn waiting(&self) -> Option<InputId> {
        self.states
            .iter()
            .find(|(_, state)| **state == TargetState::Waiting)
            .map(|(id, _)| id.clone())
    }

    pub fn in_state(&self, state: TargetState) -> Vec<InputId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Return every input in `state` to Idle
    pub fn reset_state(&mut self, state: TargetState) -> Vec<Transition> {
        self.in_state(state)
            .iter()
            .filter_map(|id| self.set_idle(id))
            .collect()
    }

    pub fn reset_all(&mut self) -> Vec<Transition> {
        let ids: Vec<InputId> = self.states.keys().cloned().collect();
        ids.iter().filter_map(|id| self.set_idle(id)).collect()
    }

    pub fn count(&self, state: TargetState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InputId {
        InputId::new(s)
    }

    #[test]
    fn test_single_waiting_input() {
        let mut table = TargetTable::new();
        table.set_waiting(&id("a"));
        let transitions = table.set_waiting(&id("b"));

        assert_eq!(table.state(&id("a")), TargetState::Idle);
        assert_eq!(table.state(&id("b")), TargetState::Waiting);
        assert_eq!(table.count(TargetState::Waiting), 1);
        assert_eq!(
            transitions,
            vec![
                Transition {
                    input: id("a"),
                    from: TargetState::Waiting,
                    to: TargetState::Idle
                },
                Transition {
                    input: id("b"),
                    from: TargetState::Idle,
                    to: TargetState::Waiting
                },
            ]
        );
    }

    #[test]
    fn test_waiting_invariant_over_mixed_sequence() {
        let mut table = TargetTable::new();
        let inputs = ["a", "b", "c", "d"];
        for step in 0..40 {
            let target = id(inputs[(step * 7) % inputs.len()]);
            match step % 4 {
                0 | 1 => {
                    table.set_waiting(&target);
                }
                2 => {
                    if let Some(waiting) = table.waiting() {
                        table.fulfill(&waiting);
                    }
                }
                _ => {
                    table.set_idle(&target);
                }
            }
            assert!(table.count(TargetState::Waiting) <= 1);
        }
    }

    #[test]
    fn test_fulfill_requires_waiting() {
        let mut table = TargetTable::new();
        assert!(table.fulfill(&id("a")).is_none());
        table.set_waiting(&id("a"));
        assert!(table.fulfill(&id("a")).is_some());
        assert_eq!(table.state(&id("a")), TargetState::Fulfilled);

        // Fulfilled inputs may coexist with a new waiting one
        table.set_waiting(&id("b"));
        assert_eq!(table.state(&id("a")), TargetState::Fulfilled);
        assert_eq!(table.reset_state(TargetState::Fulfilled).len(), 1);
        assert_eq!(table.waiting(), Some(id("b")));
    }

    #[test]
    fn test_repeated_transition_is_silent() {
        let mut table = TargetTable::new();
        assert_eq!(table.set_waiting(&id("a")).len(), 1);
        assert!(table.set_waiting(&id("a")).is_empty());
        assert!(table.set_idle(&id("z")).is_none());
        assert_eq!(table.reset_all().len(), 1);
    }
}
