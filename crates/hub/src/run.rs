//! The exclusive-run slot. At most one program or manual command drives the
//! valves at any instant; both paths acquire here, and losing the race is an
//! immediate `AlreadyRunning`, never a wait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AlreadyRunning;

/// Copy of the active run for status readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    pub is_active: bool,
    pub label: Option<String>,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub planned_end_at: Option<DateTime<Utc>>,
}

struct ActiveRun {
    generation: u64,
    label: String,
    current_step: Option<String>,
    started_at: DateTime<Utc>,
    planned_end_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    active: Option<ActiveRun>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Proof of holding the slot. Dropping it releases the slot, so every exit
/// path of the holder (including a panic) frees it.
pub struct RunHandle {
    generation: u64,
    label: String,
    cancel: CancellationToken,
    slot: Arc<Mutex<Slot>>,
}

impl RunHandle {
    /// Token cancelled by [`RunCoordinator::request_stop`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        release_generation(&self.slot, self.generation);
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("generation", &self.generation)
            .field("label", &self.label)
            .finish()
    }
}

/// Clears the slot only if it still belongs to `generation`, which makes
/// release idempotent.
fn release_generation(slot: &Mutex<Slot>, generation: u64) {
    let mut s = lock(slot);
    if s.active.as_ref().is_some_and(|r| r.generation == generation) {
        if let Some(run) = s.active.take() {
            info!(
                label = %run.label,
                secs = (Utc::now() - run.started_at).num_seconds(),
                "run released"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RunCoordinator {
    slot: Arc<Mutex<Slot>>,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or report who holds it.
    pub fn try_acquire(&self, label: impl Into<String>) -> Result<RunHandle, AlreadyRunning> {
        let label = label.into();
        let mut s = lock(&self.slot);
        if let Some(active) = &s.active {
            debug!(wanted = %label, holder = %active.label, "run slot busy");
            return Err(AlreadyRunning {
                label: active.label.clone(),
            });
        }

        s.next_generation += 1;
        let generation = s.next_generation;
        let cancel = CancellationToken::new();
        s.active = Some(ActiveRun {
            generation,
            label: label.clone(),
            current_step: None,
            started_at: Utc::now(),
            planned_end_at: None,
            cancel: cancel.clone(),
        });
        info!(%label, "run started");

        Ok(RunHandle {
            generation,
            label,
            cancel,
            slot: Arc::clone(&self.slot),
        })
    }

    fn with_active(&self, handle: &RunHandle, f: impl FnOnce(&mut ActiveRun)) {
        let mut s = lock(&self.slot);
        if let Some(run) = s.active.as_mut().filter(|r| r.generation == handle.generation) {
            f(run);
        }
    }

    pub fn update_step(&self, handle: &RunHandle, description: impl Into<String>) {
        let description = description.into();
        self.with_active(handle, |run| run.current_step = Some(description));
    }

    pub fn set_planned_end(&self, handle: &RunHandle, end: Option<DateTime<Utc>>) {
        self.with_active(handle, |run| run.planned_end_at = end);
    }

    /// Give the slot back. Equivalent to dropping the handle.
    pub fn release(&self, handle: RunHandle) {
        drop(handle);
    }

    /// Ask the active run to stop. Returns its label if one was active.
    pub fn request_stop(&self) -> Option<String> {
        let s = lock(&self.slot);
        let run = s.active.as_ref()?;
        info!(label = %run.label, "stop requested");
        run.cancel.cancel();
        Some(run.label.clone())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot).active.is_some()
    }

    pub fn snapshot(&self) -> RunState {
        match &lock(&self.slot).active {
            Some(run) => RunState {
                is_active: true,
                label: Some(run.label.clone()),
                current_step: run.current_step.clone(),
                started_at: Some(run.started_at),
                planned_end_at: run.planned_end_at,
            },
            None => RunState::default(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn second_acquire_is_rejected() {
        let runs = RunCoordinator::new();
        let _h = runs.try_acquire("Morning Lawn").unwrap();
        let err = runs.try_acquire("Manual Front Bed").unwrap_err();
        assert_eq!(err.label, "Morning Lawn");
    }

    #[test]
    fn release_frees_slot_and_is_idempotent() {
        let runs = RunCoordinator::new();
        let h = runs.try_acquire("a").unwrap();
        runs.release(h);
        assert!(!runs.is_active());

        let h2 = runs.try_acquire("b").unwrap();
        // A stale release for generation 1 must not clear run "b".
        release_generation(&runs.slot, 1);
        assert_eq!(runs.snapshot().label.as_deref(), Some("b"));
        drop(h2);
        assert!(!runs.is_active());
    }

    #[test]
    fn concurrent_acquire_exactly_one_wins() {
        const N: usize = 16;
        let runs = RunCoordinator::new();
        let barrier = Barrier::new(N);

        let results: Vec<Result<RunHandle, AlreadyRunning>> = std::thread::scope(|scope| {
            let joins: Vec<_> = (0..N)
                .map(|i| {
                    let runs = &runs;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        runs.try_acquire(format!("contender {i}"))
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(runs.snapshot().is_active);
    }

    #[tokio::test]
    async fn panicking_holder_releases() {
        let runs = RunCoordinator::new();
        let task_runs = runs.clone();
        let joined = tokio::spawn(async move {
            let _h = task_runs.try_acquire("doomed").unwrap();
            panic!("step blew up");
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert!(!runs.is_active());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let runs = RunCoordinator::new();
        let h = runs.try_acquire("Morning Lawn").unwrap();
        runs.update_step(&h, "1/2: R1 (10m)");
        let snap = runs.snapshot();
        runs.update_step(&h, "2/2: R2 (5m)");

        assert_eq!(snap.current_step.as_deref(), Some("1/2: R1 (10m)"));
        assert_eq!(
            runs.snapshot().current_step.as_deref(),
            Some("2/2: R2 (5m)")
        );
    }

    #[test]
    fn request_stop_cancels_holder() {
        let runs = RunCoordinator::new();
        assert_eq!(runs.request_stop(), None);

        let h = runs.try_acquire("Morning Lawn").unwrap();
        assert!(!h.is_stop_requested());
        assert_eq!(runs.request_stop().as_deref(), Some("Morning Lawn"));
        assert!(h.is_stop_requested());
        // Stopping does not release; the holder does.
        assert!(runs.is_active());
    }
}
