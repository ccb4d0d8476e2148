use tracing::{info, warn};

/// A bank of on/off outputs addressed by slot.
pub trait Actuator {
    fn relay_count(&self) -> usize;

    fn relay_state(&self, slot: usize) -> bool;

    /// Switch a relay. Implementations ignore requests that would not change the state.
    fn set_relay_state(&mut self, slot: usize, on: bool);

    /// Record a state reported by the hardware without switching anything.
    fn observe(&mut self, slot: usize, on: bool);
}

/// Relays that only exist in memory. Used when nothing downstream is configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryRelays {
    states: Vec<bool>,
    switches: u64,
}

impl MemoryRelays {
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![false; count],
            switches: 0,
        }
    }

    /// Number of actual state changes so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }
}

impl Actuator for MemoryRelays {
    fn relay_count(&self) -> usize {
        self.states.len()
    }

    fn relay_state(&self, slot: usize) -> bool {
        self.states.get(slot).copied().unwrap_or(false)
    }

    fn set_relay_state(&mut self, slot: usize, on: bool) {
        match self.states.get_mut(slot) {
            Some(state) if *state != on => {
                *state = on;
                self.switches += 1;
                info!(slot, on, "Relay switched");
            }
            Some(_) => {}
            None => warn!(slot, "No such relay"),
        }
    }

    fn observe(&mut self, slot: usize, on: bool) {
        if let Some(state) = self.states.get_mut(slot) {
            *state = on;
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn memory_relays_only_count_real_changes() {
    let mut relays = MemoryRelays::new(2);

    relays.set_relay_state(1, true);
    relays.set_relay_state(1, true);
    relays.set_relay_state(0, false);
    relays.set_relay_state(7, true);

    assert!(relays.relay_state(1));
    assert!(!relays.relay_state(0));
    assert!(!relays.relay_state(7));
    assert_eq!(relays.switches(), 1);
}

#[test]
fn observed_state_is_not_a_switch() {
    let mut relays = MemoryRelays::new(1);
    relays.observe(0, true);

    assert!(relays.relay_state(0));
    assert_eq!(relays.switches(), 0);
}
