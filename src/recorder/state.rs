use std::sync::atomic::{AtomicU8, Ordering};

/// The recorder's lifecycle, as a small state machine: only `Idle` accepts a
/// start request, and `stop` is idempotent from any state.
/// Kept as a plain atomic rather than a full `(State, Event) -> (State,
/// Vec<SideEffect>)` table: the recorder has no branching transitions to
/// make illegal, just three states guarding one background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl RunState {
    fn from_u8(value: u8) -> RunState {
        match value {
            1 => RunState::Running,
            2 => RunState::Stopping,
            _ => RunState::Idle,
        }
    }
}

/// Atomic holder for [`RunState`], shared between the public API and the
/// dedicated capture thread.
pub struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    pub fn new() -> Self {
        Self(AtomicU8::new(RunState::Idle as u8))
    }

    pub fn load(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts `Idle -> Running`. Returns false if not currently idle.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Running -> Stopping`. A no-op (returns false) if not running, which
    /// makes `stop()` idempotent at the call site.
    pub fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Stopping -> Idle`, performed by the background thread once the camera
    /// handle has been released.
    pub fn finish_stop(&self) {
        self.0.store(RunState::Idle as u8, Ordering::Release);
    }
}
