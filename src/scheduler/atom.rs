// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Units of work submitted to the [`super::JobScheduler`].

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::Instant;

use crate::scheduler::semaphore::Semaphore;

pub type ConnectionId = u64;

/// A client of the scheduler. Atoms only hold weak references to their connection: once the
/// connection is gone, its atoms are dropped and no longer block anybody.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self { id })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// How an atom ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    /// Preempted at a safe point; the atom runs again later.
    SoftStopped,
    /// Forcibly stopped.
    HardStopped,
    TimedOut,
    Canceled,
    Failed,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    /// Wait for the other atom to finish, whatever its result.
    Order,
    /// Wait for the other atom to succeed and take over its output address.
    Data,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    atom: Weak<Atom>,
    kind: DependencyType,
}

#[derive(Debug, Clone)]
pub enum AtomKind {
    /// Work for a hardware slot. `address` is where the job starts, `length` how much of it
    /// there is.
    Job { address: u64, length: u32 },
    SemaphoreSet(Arc<Semaphore>),
    SemaphoreReset(Arc<Semaphore>),
    SemaphoreWait(Arc<Semaphore>),
}

/// Why the scheduler asked an atom to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Preempted,
    TimedOut,
}

/// Whether an atom's dependencies let it run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DependencyStatus {
    Pending,
    Satisfied,
    /// A data dependency failed with the given result.
    Failed(ResultCode),
}

#[derive(Debug, Default)]
struct AtomState {
    result: Option<ResultCode>,
    canceled: bool,
    enqueued: bool,
    /// Output address of a data dependency, replacing the job's own address.
    substituted_address: Option<u64>,
    /// Where a soft-stopped job picks up.
    resume_address: Option<u64>,
    output_address: Option<u64>,
    tick_deadline: Option<Instant>,
    timeout_deadline: Option<Instant>,
    hard_stop_deadline: Option<Instant>,
    soft_stop_requested: bool,
    hard_stop_requested: bool,
    stop_reason: Option<StopReason>,
}

#[derive(Debug)]
pub struct Atom {
    id: u64,
    connection: Weak<Connection>,
    connection_id: ConnectionId,
    slot: usize,
    priority: i32,
    protected: bool,
    kind: AtomKind,
    dependencies: Vec<Dependency>,
    state: Mutex<AtomState>,
}

/// Builder for [`Atom`]s.
pub struct AtomBuilder {
    id: u64,
    connection: Weak<Connection>,
    connection_id: ConnectionId,
    slot: usize,
    priority: i32,
    protected: bool,
    kind: AtomKind,
    dependencies: Vec<Dependency>,
}

impl AtomBuilder {
    pub fn new(id: u64, connection: &Arc<Connection>, kind: AtomKind) -> Self {
        Self {
            id,
            connection: Arc::downgrade(connection),
            connection_id: connection.id(),
            slot: 0,
            priority: 0,
            protected: false,
            kind,
            dependencies: Vec::new(),
        }
    }

    pub fn job(id: u64, connection: &Arc<Connection>, address: u64, length: u32) -> Self {
        Self::new(id, connection, AtomKind::Job { address, length })
    }

    pub fn slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    pub fn depends_on(mut self, atom: &Arc<Atom>, kind: DependencyType) -> Self {
        self.dependencies.push(Dependency {
            atom: Arc::downgrade(atom),
            kind,
        });
        self
    }

    pub fn build(self) -> Arc<Atom> {
        Arc::new(Atom {
            id: self.id,
            connection: self.connection,
            connection_id: self.connection_id,
            slot: self.slot,
            priority: self.priority,
            protected: self.protected,
            kind: self.kind,
            dependencies: self.dependencies,
            state: Default::default(),
        })
    }
}

impl Atom {
    fn state(&self) -> MutexGuard<'_, AtomState> {
        // The state is plain data, a panic while holding the lock cannot leave it inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn kind(&self) -> &AtomKind {
        &self.kind
    }

    /// Semaphore atoms are handled by the scheduler itself and never occupy a slot.
    pub fn is_soft(&self) -> bool {
        !matches!(self.kind, AtomKind::Job { .. })
    }

    pub fn result(&self) -> Option<ResultCode> {
        self.state().result
    }

    pub fn is_canceled(&self) -> bool {
        self.state().canceled
    }

    /// Address the job should start at: where it was soft-stopped, the output of its data
    /// dependency, or its own address.
    pub fn address(&self) -> Option<u64> {
        let state = self.state();
        match self.kind {
            AtomKind::Job { address, .. } => Some(
                state
                    .resume_address
                    .or(state.substituted_address)
                    .unwrap_or(address),
            ),
            _ => None,
        }
    }

    pub fn output_address(&self) -> Option<u64> {
        self.state().output_address
    }

    pub fn is_resumed(&self) -> bool {
        self.state().resume_address.is_some()
    }

    /// Marks the atom as handed to a scheduler. Returns whether it already was.
    pub(crate) fn mark_enqueued(&self) -> bool {
        std::mem::replace(&mut self.state().enqueued, true)
    }

    pub(crate) fn dependency_status(&self) -> DependencyStatus {
        let mut substituted = None;

        for dependency in &self.dependencies {
            // Dependencies that are gone, canceled, or belong to a dead connection never block.
            let Some(atom) = dependency.atom.upgrade() else {
                continue;
            };
            if atom.is_canceled() || atom.connection().is_none() {
                continue;
            }

            match (atom.result(), dependency.kind) {
                (None, _) => return DependencyStatus::Pending,
                (Some(_), DependencyType::Order) => (),
                (Some(ResultCode::Success), DependencyType::Data) => {
                    substituted = substituted.or(atom.output_address());
                }
                (Some(result), DependencyType::Data) => return DependencyStatus::Failed(result),
            }
        }

        if let Some(address) = substituted {
            self.state().substituted_address = Some(address);
        }

        DependencyStatus::Satisfied
    }

    pub(crate) fn complete(&self, result: ResultCode, output_address: Option<u64>) {
        let mut state = self.state();
        state.result = Some(result);
        state.output_address = output_address;
        state.soft_stop_requested = false;
        state.hard_stop_requested = false;
        state.hard_stop_deadline = None;
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.state();
        state.canceled = true;
        state.result.get_or_insert(ResultCode::Canceled);
    }

    pub(crate) fn start(&self, tick_deadline: Instant, timeout_deadline: Instant) {
        let mut state = self.state();
        state.tick_deadline = Some(tick_deadline);
        state.timeout_deadline = Some(timeout_deadline);
        state.hard_stop_deadline = None;
        state.soft_stop_requested = false;
        state.hard_stop_requested = false;
        state.stop_reason = None;
    }

    /// Puts a stopped atom back in line. A soft-stopped atom resumes at `resume_address`, a
    /// hard-stopped one restarts from scratch.
    pub(crate) fn requeue(&self, resume_address: Option<u64>) {
        let mut state = self.state();
        state.resume_address = resume_address;
        state.tick_deadline = None;
        state.timeout_deadline = None;
        state.hard_stop_deadline = None;
        state.soft_stop_requested = false;
        state.hard_stop_requested = false;
    }

    pub(crate) fn request_soft_stop(&self, reason: StopReason, hard_stop_deadline: Instant) {
        let mut state = self.state();
        state.soft_stop_requested = true;
        state.stop_reason = Some(reason);
        state.hard_stop_deadline = Some(hard_stop_deadline);
    }

    pub(crate) fn request_hard_stop(&self) {
        self.state().hard_stop_requested = true;
    }

    pub fn soft_stop_requested(&self) -> bool {
        self.state().soft_stop_requested
    }

    pub fn hard_stop_requested(&self) -> bool {
        self.state().hard_stop_requested
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state().stop_reason
    }

    pub(crate) fn tick_deadline(&self) -> Option<Instant> {
        self.state().tick_deadline
    }

    pub(crate) fn timeout_deadline(&self) -> Option<Instant> {
        self.state().timeout_deadline
    }

    pub(crate) fn hard_stop_deadline(&self) -> Option<Instant> {
        self.state().hard_stop_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_dependency_waits_for_any_result() {
        let connection = Connection::new(1);
        let first = AtomBuilder::job(1, &connection, 0x1000, 16).build();
        let second = AtomBuilder::job(2, &connection, 0x2000, 16)
            .depends_on(&first, DependencyType::Order)
            .build();

        assert_eq!(second.dependency_status(), DependencyStatus::Pending);
        first.complete(ResultCode::Failed, None);
        assert_eq!(second.dependency_status(), DependencyStatus::Satisfied);
        assert_eq!(second.address(), Some(0x2000));
    }

    #[test]
    fn data_dependency_substitutes_address() {
        let connection = Connection::new(1);
        let first = AtomBuilder::job(1, &connection, 0x1000, 16).build();
        let second = AtomBuilder::job(2, &connection, 0x2000, 16)
            .depends_on(&first, DependencyType::Data)
            .build();

        first.complete(ResultCode::Success, Some(0x1800));
        assert_eq!(second.dependency_status(), DependencyStatus::Satisfied);
        assert_eq!(second.address(), Some(0x1800));

        // A resumed job starts where it stopped.
        second.requeue(Some(0x1900));
        assert_eq!(second.address(), Some(0x1900));
        assert!(second.is_resumed());
    }

    #[test]
    fn data_dependency_propagates_failure() {
        let connection = Connection::new(1);
        let first = AtomBuilder::job(1, &connection, 0, 0).build();
        let second = AtomBuilder::job(2, &connection, 0, 0)
            .depends_on(&first, DependencyType::Data)
            .build();

        first.complete(ResultCode::TimedOut, None);
        assert_eq!(
            second.dependency_status(),
            DependencyStatus::Failed(ResultCode::TimedOut)
        );
    }

    #[test]
    fn canceled_and_orphaned_dependencies_do_not_block() {
        let connection = Connection::new(1);
        let other = Connection::new(2);
        let canceled = AtomBuilder::job(1, &connection, 0, 0).build();
        let orphan = AtomBuilder::job(2, &other, 0, 0).build();
        let waiter = AtomBuilder::job(3, &connection, 0, 0)
            .depends_on(&canceled, DependencyType::Data)
            .depends_on(&orphan, DependencyType::Data)
            .build();

        assert_eq!(waiter.dependency_status(), DependencyStatus::Pending);
        canceled.cancel();
        assert_eq!(waiter.dependency_status(), DependencyStatus::Pending);
        drop(other);
        assert_eq!(waiter.dependency_status(), DependencyStatus::Satisfied);
    }

    #[test]
    fn enqueue_is_tracked() {
        let connection = Connection::new(1);
        let atom = AtomBuilder::job(1, &connection, 0, 0).build();

        assert!(!atom.mark_enqueued());
        assert!(atom.mark_enqueued());
    }
}
