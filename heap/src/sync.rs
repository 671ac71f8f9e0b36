//! Stop-the-world rendezvous of the mutators.
//!
//! One packed word tells every mutator whether a stop was requested, which
//! collection phase runs and how many mutators take part. A sense barrier
//! lines the participants up between the submit, collect and resume steps.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::CollectionPhase;

// ── Packed state ──────────────────────────────────────────────────────

/// Decoded view of a [`GcState`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSnapshot {
    /// A collection was requested and mutators must join it.
    pub stop_requested: bool,
    pub phase: CollectionPhase,
    /// Number of the latest requested cycle (wrapping).
    pub cycle: u32,
    /// Registered mutators, each of which must reach the rendezvous.
    pub mutators: u32,
}

/// Packed collector state shared by all mutators.
///
/// ```text
/// bit  0:      stop requested
/// bits 1..4:   collection phase
/// bits 4..32:  cycle number (wrapping)
/// bits 32..64: registered mutators
/// ```
#[derive(Debug)]
pub struct GcState(AtomicU64);

impl GcState {
    const STOP_BIT: u64 = 1;
    const PHASE_SHIFT: u32 = 1;
    const PHASE_MASK: u64 = 0b111;
    const CYCLE_SHIFT: u32 = 4;
    const CYCLE_MASK: u64 = (1u64 << 28) - 1;
    const MUTATORS_SHIFT: u32 = 32;

    #[inline(always)]
    fn pack(snapshot: GcSnapshot) -> u64 {
        debug_assert!((snapshot.cycle as u64) <= Self::CYCLE_MASK);
        (snapshot.stop_requested as u64)
            | ((snapshot.phase as u64) << Self::PHASE_SHIFT)
            | ((snapshot.cycle as u64) << Self::CYCLE_SHIFT)
            | ((snapshot.mutators as u64) << Self::MUTATORS_SHIFT)
    }

    #[inline(always)]
    fn unpack(word: u64) -> GcSnapshot {
        let phase = (word >> Self::PHASE_SHIFT) & Self::PHASE_MASK;
        GcSnapshot {
            stop_requested: word & Self::STOP_BIT != 0,
            phase: CollectionPhase::from_u8(phase as u8),
            cycle: ((word >> Self::CYCLE_SHIFT) & Self::CYCLE_MASK) as u32,
            mutators: (word >> Self::MUTATORS_SHIFT) as u32,
        }
    }

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::pack(GcSnapshot {
            stop_requested: false,
            phase: CollectionPhase::Idle,
            cycle: 0,
            mutators: 0,
        })))
    }

    #[inline(always)]
    pub fn load(&self, ord: Ordering) -> GcSnapshot {
        Self::unpack(self.0.load(ord))
    }

    /// CAS loop applying `f` until it succeeds or `f` declines with `None`.
    /// Returns the snapshot `f` accepted, or the one it declined.
    fn update(
        &self,
        mut f: impl FnMut(GcSnapshot) -> Option<GcSnapshot>,
    ) -> Result<GcSnapshot, GcSnapshot> {
        use Ordering::*;
        let mut cur = self.0.load(Acquire);
        loop {
            let snapshot = Self::unpack(cur);
            let Some(next) = f(snapshot) else {
                return Err(snapshot);
            };
            match self.0.compare_exchange_weak(
                cur,
                Self::pack(next),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Publishes the phase the collector is running.
    pub fn set_phase(&self, phase: CollectionPhase) {
        let _ = self.update(|s| Some(GcSnapshot { phase, ..s }));
    }

    /// Registers a mutator. Waits out a requested collection, which counted
    /// its participants already.
    pub fn register_mutator(&self) -> GcSnapshot {
        loop {
            let registered = self.update(|s| {
                (!s.stop_requested).then(|| GcSnapshot {
                    mutators: s
                        .mutators
                        .checked_add(1)
                        .expect("mutator count overflow"),
                    ..s
                })
            });
            match registered {
                Ok(snapshot) => return snapshot,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    /// Deregisters a mutator unless a collection was requested meanwhile.
    fn try_deregister_mutator(&self) -> bool {
        self.update(|s| {
            (!s.stop_requested).then(|| GcSnapshot {
                mutators: s
                    .mutators
                    .checked_sub(1)
                    .expect("mutator count underflow"),
                ..s
            })
        })
        .is_ok()
    }

    /// Requests a collection. Returns whether the caller won the election
    /// and coordinates it, along with the resulting state.
    pub fn request_stop(&self) -> (bool, GcSnapshot) {
        match self.update(|s| {
            (!s.stop_requested).then(|| GcSnapshot {
                stop_requested: true,
                cycle: s.cycle.wrapping_add(1) & Self::CYCLE_MASK as u32,
                ..s
            })
        }) {
            Ok(snapshot) => (true, snapshot),
            Err(snapshot) => (false, snapshot),
        }
    }

    /// Lets the mutators run again. Coordinator only.
    pub fn resume(&self) {
        let _ = self.update(|s| {
            s.stop_requested
                .then_some(GcSnapshot { stop_requested: false, ..s })
        });
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

// ── Sense barrier ─────────────────────────────────────────────────────

/// Reusable barrier that puts waiting mutators to sleep.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// (arrived, sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `participants` threads arrived. Returns `true` on the
    /// thread that arrived last.
    pub fn wait(&self, participants: usize) -> bool {
        let mut state = self.state.lock();
        let sense = state.1;
        state.0 += 1;

        if state.0 == participants {
            state.0 = 0;
            state.1 = !sense;
            self.cvar.notify_all();
            return true;
        }
        while state.1 == sense {
            self.cvar.wait(&mut state);
        }
        false
    }
}

// ── Rendezvous ────────────────────────────────────────────────────────

/// What a leaving mutator is asked to do with its remaining buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOver {
    /// A collection is waiting for this mutator; join it.
    Join,
    /// No collection runs; submit for the next one.
    Submit,
}

/// Synchronization state for the stop-the-world rendezvous.
#[derive(Debug, Default)]
pub struct SyncState {
    pub state: GcState,
    pub barrier: SenseBarrier,
}

impl SyncState {
    /// Three-barrier stop: every participant submits its input, the
    /// coordinator runs the cycle and clears the stop bit, then all leave
    /// through the exit handshake.
    ///
    /// Returns `false` without running anything if no stop is requested.
    pub fn stop_the_world(
        &self,
        is_coordinator: bool,
        submit: impl FnOnce(),
        run_cycle: impl FnOnce(),
    ) -> bool {
        let snapshot = self.state.load(Ordering::Acquire);
        if !snapshot.stop_requested {
            return false;
        }
        let participants = snapshot.mutators as usize;

        submit();
        // every mutator stopped and submitted
        self.barrier.wait(participants);

        if is_coordinator {
            run_cycle();
        }
        // cycle done
        self.barrier.wait(participants);
        if is_coordinator {
            self.state.resume();
        }
        // exit handshake
        self.barrier.wait(participants);
        true
    }

    /// Removes a mutator from the set. A mutator that leaves while a stop
    /// is requested is still counted as participant, so `hand_over` joins
    /// the cycle as a ghost first; otherwise it submits before leaving.
    pub fn leave(&self, mut hand_over: impl FnMut(HandOver)) {
        loop {
            if self.state.load(Ordering::Acquire).stop_requested {
                hand_over(HandOver::Join);
                continue;
            }
            hand_over(HandOver::Submit);
            if self.state.try_deregister_mutator() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn pack_round_trip() {
        let snapshot = GcSnapshot {
            stop_requested: true,
            phase: CollectionPhase::ProcessZct,
            cycle: 1234,
            mutators: 7,
        };
        assert_eq!(GcState::unpack(GcState::pack(snapshot)), snapshot);
    }

    #[test]
    fn only_one_coordinator_per_cycle() {
        let state = GcState::new();
        state.register_mutator();
        state.register_mutator();

        let (first, requested) = state.request_stop();
        let (second, same) = state.request_stop();
        assert!(first);
        assert!(!second);
        assert_eq!(requested.cycle, same.cycle);
        assert_eq!(requested.mutators, 2);

        assert!(!state.try_deregister_mutator());
        state.resume();
        assert!(state.try_deregister_mutator());
        assert_eq!(state.load(Ordering::Relaxed).mutators, 1);
    }

    #[test]
    fn phase_survives_registration_changes() {
        let state = GcState::new();
        state.set_phase(CollectionPhase::Release);
        state.register_mutator();
        state.request_stop();
        state.resume();
        let snapshot = state.load(Ordering::Relaxed);
        assert_eq!(snapshot.phase, CollectionPhase::Release);
        assert_eq!(snapshot.mutators, 1);
        assert_eq!(snapshot.cycle, 1);
    }

    #[test]
    fn leaving_joins_a_requested_stop() {
        let sync = Arc::new(SyncState::default());
        sync.state.register_mutator();
        sync.state.register_mutator();
        let (is_coordinator, _) = sync.state.request_stop();
        assert!(is_coordinator);

        let cycles = Arc::new(AtomicUsize::new(0));
        let coordinator = {
            let sync = sync.clone();
            let cycles = cycles.clone();
            thread::spawn(move || {
                sync.stop_the_world(true, || {}, || {
                    cycles.fetch_add(1, Ordering::Relaxed);
                })
            })
        };

        let mut steps = Vec::new();
        sync.leave(|step| {
            steps.push(step);
            if step == HandOver::Join {
                sync.stop_the_world(false, || {}, || {});
            }
        });
        assert!(coordinator.join().expect("coordinator panicked"));

        assert_eq!(steps.last(), Some(&HandOver::Submit));
        assert!(steps.contains(&HandOver::Join));
        assert_eq!(cycles.load(Ordering::Relaxed), 1);
        let snapshot = sync.state.load(Ordering::Relaxed);
        assert!(!snapshot.stop_requested);
        assert_eq!(snapshot.mutators, 1);
    }

    #[test]
    fn barrier_releases_all_waiters_repeatedly() {
        let barrier = Arc::new(SenseBarrier::new());
        let passed = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));
        let threads = 4;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = barrier.clone();
                let passed = passed.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    for _ in 0..3 {
                        if barrier.wait(threads) {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                        passed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(passed.load(Ordering::Relaxed), threads * 3);
        assert_eq!(leaders.load(Ordering::Relaxed), 3);
    }
}
