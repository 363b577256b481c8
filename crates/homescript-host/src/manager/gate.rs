use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Created during loading; events are dropped until resumed
    Pending,
    Open,
    /// Stopped; never reopens
    Closed,
}

#[derive(Debug)]
struct GateState {
    phase: Phase,
    in_flight: usize,
}

/// Admission control for dispatches into one manager
///
/// Closing the gate refuses new dispatches and then waits for the ones
/// already admitted to leave.
#[derive(Debug)]
pub(crate) struct DispatchGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl DispatchGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                phase: Phase::Pending,
                in_flight: 0,
            }),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start admitting dispatches. A closed gate stays closed.
    pub(crate) fn open(&self) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::Pending {
            state.phase = Phase::Open;
        }
        state.phase == Phase::Open
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().phase == Phase::Open
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().phase == Phase::Closed
    }

    /// Admit one dispatch, if open. The dispatch counts as in flight until
    /// the guard drops.
    pub(crate) fn enter(&self) -> Option<GateGuard<'_>> {
        let mut state = self.lock();
        if state.phase != Phase::Open {
            return None;
        }
        state.in_flight += 1;
        Some(GateGuard { gate: self })
    }

    /// Close and wait up to `timeout` for in-flight dispatches to finish.
    ///
    /// Returns the number still running when the wait gave up.
    pub(crate) fn close_and_drain(&self, timeout: Duration) -> usize {
        let mut state = self.lock();
        state.phase = Phase::Closed;
        if state.in_flight == 0 {
            return 0;
        }
        let (state, _) = self
            .drained
            .wait_timeout_while(state, timeout, |s| s.in_flight > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.in_flight
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a DispatchGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pending_gate_refuses() {
        let gate = DispatchGate::new();
        assert!(gate.enter().is_none());
        assert!(gate.open());
        assert!(gate.enter().is_some());
    }

    #[test]
    fn test_closed_gate_never_reopens() {
        let gate = DispatchGate::new();
        gate.open();
        assert_eq!(gate.close_and_drain(Duration::from_millis(10)), 0);
        assert!(!gate.open());
        assert!(gate.is_closed());
        assert!(gate.enter().is_none());
    }

    #[test]
    fn test_close_waits_for_in_flight_dispatch() {
        let gate = Arc::new(DispatchGate::new());
        gate.open();

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || {
                let _guard = gate.enter().expect("gate should be open");
                thread::sleep(Duration::from_millis(50));
            })
        };
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        assert_eq!(gate.close_and_drain(Duration::from_secs(5)), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
        worker.join().unwrap();
    }

    #[test]
    fn test_close_gives_up_after_timeout() {
        let gate = Arc::new(DispatchGate::new());
        gate.open();
        let guard = gate.enter();

        assert_eq!(gate.close_and_drain(Duration::from_millis(20)), 1);
        drop(guard);
    }
}
