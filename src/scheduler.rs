// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Arbitration of hardware slots between connections.
//!
//! Work is submitted as [`Atom`]s. An atom first waits in the scheduler's queue until its
//! dependencies are resolved, then becomes runnable on its slot, and eventually executes. Only one
//! atom executes per slot at a time. Semaphore atoms never execute: the scheduler resolves them
//! itself, parking wait atoms on a [`WaitPort`] until their semaphore is signaled.
//!
//! The scheduler does not touch the hardware. Everything it decides is carried out by a
//! [`JobOwner`], which must eventually report every atom it was asked to run through
//! [`JobScheduler::job_completed`].
//!
//! Between runnable atoms of a slot, the scheduler alternates between connections and picks the
//! highest priority atom of the chosen connection. Atoms running in protected mode never share the
//! hardware with normal atoms: a mode switch only happens once no atom of the current mode is
//! executing or runnable.

pub mod atom;
pub mod semaphore;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::trace;
use log::warn;
use nix::errno::Errno;

use crate::scheduler::atom::Atom;
use crate::scheduler::atom::AtomKind;
use crate::scheduler::atom::ConnectionId;
use crate::scheduler::atom::DependencyStatus;
use crate::scheduler::atom::ResultCode;
use crate::scheduler::atom::StopReason;
use crate::scheduler::semaphore::WaitPort;

/// Executes the scheduler's decisions.
pub trait JobOwner {
    fn run_atom(&mut self, atom: &Arc<Atom>);
    /// Called exactly once for every atom that does not come back as stopped.
    fn atom_completed(&mut self, atom: &Arc<Atom>, result: ResultCode);
    /// Asks the atom to stop at the next safe point and report [`ResultCode::SoftStopped`].
    fn soft_stop_atom(&mut self, atom: &Arc<Atom>);
    /// Stops the atom right away. The owner must still report [`ResultCode::HardStopped`].
    fn hard_stop_atom(&mut self, atom: &Arc<Atom>);
    /// Returns whether the switch succeeded.
    fn enter_protected_mode(&mut self) -> bool;
    /// Returns whether the switch succeeded.
    fn exit_protected_mode(&mut self) -> bool;
    fn is_in_protected_mode(&self) -> bool;
    /// Called after each scheduling pass with whether any slot is busy.
    fn update_hardware_active(&mut self, _active: bool) {}
}

/// Source of time, replaceable in tests.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub num_slots: usize,
    /// Time an atom runs before it can be preempted.
    pub job_tick: Duration,
    /// Time after which a running atom is considered hung.
    pub timeout: Duration,
    /// Time a soft-stopped atom has to yield before it is hard-stopped.
    pub hard_stop_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_slots: 1,
            job_tick: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            hard_stop_grace: Duration::from_millis(500),
        }
    }
}

pub struct JobScheduler {
    config: SchedulerConfig,
    clock: Box<dyn Clock>,
    /// Atoms waiting for their dependencies.
    atoms: VecDeque<Arc<Atom>>,
    runnable: Vec<VecDeque<Arc<Atom>>>,
    executing: Vec<Option<Arc<Atom>>>,
    /// Connection whose atom last started on each slot.
    last_connection: Vec<Option<ConnectionId>>,
    /// Semaphore wait atoms parked on the port.
    waiting: Vec<Arc<Atom>>,
    port: WaitPort,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, Errno> {
        let num_slots = config.num_slots.max(1);

        Ok(Self {
            config,
            clock: Box::new(SystemClock),
            atoms: VecDeque::new(),
            runnable: (0..num_slots).map(|_| VecDeque::new()).collect(),
            executing: vec![None; num_slots],
            last_connection: vec![None; num_slots],
            waiting: Vec::new(),
            port: WaitPort::new()?,
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.set_clock(clock);
        self
    }

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn num_slots(&self) -> usize {
        self.executing.len()
    }

    pub fn wait_port(&self) -> &WaitPort {
        &self.port
    }

    pub fn executing_atom(&self, slot: usize) -> Option<&Arc<Atom>> {
        self.executing.get(slot).and_then(Option::as_ref)
    }

    /// Slot executing an atom of `connection`, if any.
    pub fn slot_of(&self, connection: ConnectionId) -> Option<usize> {
        self.executing
            .iter()
            .position(|a| a.as_ref().is_some_and(|a| a.connection_id() == connection))
    }

    /// Number of atoms that have not completed yet, executing ones excluded.
    pub fn pending_atoms(&self) -> usize {
        self.atoms.len()
            + self.runnable.iter().map(VecDeque::len).sum::<usize>()
            + self.waiting.len()
    }

    /// Adds an atom. It is only looked at on the next [`Self::try_to_schedule`].
    pub fn enqueue_atom(&mut self, atom: Arc<Atom>) {
        assert!(
            atom.slot() < self.num_slots(),
            "atom {} targets nonexistent slot {}",
            atom.id(),
            atom.slot()
        );
        assert!(!atom.mark_enqueued(), "atom {} enqueued twice", atom.id());

        trace!("enqueued atom {}", atom.id());
        self.atoms.push_back(atom);
    }

    /// Resolves whatever can be resolved and starts atoms on idle slots.
    pub fn try_to_schedule(&mut self, owner: &mut dyn JobOwner) {
        loop {
            let moved = self.move_atoms_to_runnable(owner);
            let started = self.schedule_runnable_atoms(owner);
            if !moved && !started {
                break;
            }
        }

        let now = self.clock.now();
        self.request_preemptions(owner, now);

        let active = self.executing.iter().any(Option::is_some);
        owner.update_hardware_active(active);
    }

    fn complete_atom(
        &mut self,
        owner: &mut dyn JobOwner,
        atom: &Arc<Atom>,
        result: ResultCode,
        output_address: Option<u64>,
    ) {
        debug!("atom {} completed: {:?}", atom.id(), result);
        atom.complete(result, output_address);
        owner.atom_completed(atom, result);
    }

    fn move_atoms_to_runnable(&mut self, owner: &mut dyn JobOwner) -> bool {
        let mut progress = false;
        let mut i = 0;

        while i < self.atoms.len() {
            let atom = Arc::clone(&self.atoms[i]);

            if atom.connection().is_none() {
                debug!("dropping atom {} of a closed connection", atom.id());
                self.atoms.remove(i);
                atom.cancel();
                progress = true;
                continue;
            }

            match atom.dependency_status() {
                DependencyStatus::Pending => {
                    i += 1;
                    continue;
                }
                DependencyStatus::Failed(result) => {
                    self.atoms.remove(i);
                    self.complete_atom(owner, &atom, result, None);
                }
                DependencyStatus::Satisfied => {
                    self.atoms.remove(i);
                    if atom.is_soft() {
                        self.process_soft_atom(owner, atom);
                    } else {
                        self.runnable[atom.slot()].push_back(atom);
                    }
                }
            }
            progress = true;
        }

        progress
    }

    fn process_soft_atom(&mut self, owner: &mut dyn JobOwner, atom: Arc<Atom>) {
        match atom.kind() {
            AtomKind::SemaphoreSet(semaphore) => {
                semaphore.signal();
                self.complete_atom(owner, &atom, ResultCode::Success, None);
            }
            AtomKind::SemaphoreReset(semaphore) => {
                semaphore.reset();
                self.complete_atom(owner, &atom, ResultCode::Success, None);
            }
            AtomKind::SemaphoreWait(semaphore) => {
                if semaphore.is_signaled() {
                    self.complete_atom(owner, &atom, ResultCode::Success, None);
                    return;
                }

                let semaphore = Arc::clone(semaphore);
                match self.port.register(&semaphore) {
                    Ok(()) => {
                        trace!("atom {} waits on semaphore {}", atom.id(), semaphore.id());
                        self.waiting.push(atom);
                    }
                    Err(e) => {
                        error!("cannot wait on semaphore {}: {}", semaphore.id(), e);
                        self.complete_atom(owner, &atom, ResultCode::Failed, None);
                    }
                }
            }
            AtomKind::Job { .. } => {
                error!("job atom {} processed as a soft atom", atom.id());
                self.runnable[atom.slot()].push_back(atom);
            }
        }
    }

    /// Completes the wait atoms whose semaphore was signaled, then reschedules.
    pub fn handle_port_signal(&mut self, owner: &mut dyn JobOwner) {
        if let Err(e) = self.port.poll() {
            error!("failed to poll the wait port: {}", e);
        }

        let (done, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.waiting)
                .into_iter()
                .partition(|atom| match atom.kind() {
                    AtomKind::SemaphoreWait(semaphore) => semaphore.is_signaled(),
                    _ => true,
                });
        self.waiting = waiting;

        let still_waited: Vec<u64> = self
            .waiting
            .iter()
            .filter_map(|atom| match atom.kind() {
                AtomKind::SemaphoreWait(semaphore) => Some(semaphore.id()),
                _ => None,
            })
            .collect();
        self.port.retain(|id| still_waited.contains(&id));

        for atom in done {
            self.complete_atom(owner, &atom, ResultCode::Success, None);
        }

        self.try_to_schedule(owner);
    }

    fn schedule_runnable_atoms(&mut self, owner: &mut dyn JobOwner) -> bool {
        let mut protected = owner.is_in_protected_mode();

        let any_executing = self.executing.iter().any(Option::is_some);
        let current_mode_runnable = self
            .runnable
            .iter()
            .flatten()
            .any(|a| a.is_protected() == protected);

        if !any_executing && !current_mode_runnable {
            let wanted = self.runnable.iter().flatten().next().map(|a| a.is_protected());
            if let Some(wanted) = wanted {
                debug!(
                    "switching {} protected mode",
                    if wanted { "to" } else { "out of" }
                );
                let switched = if wanted {
                    owner.enter_protected_mode()
                } else {
                    owner.exit_protected_mode()
                };

                if !switched {
                    error!("protected mode switch failed, failing the atoms needing it");
                    self.fail_runnable_atoms(owner, wanted);
                    return true;
                }
                protected = wanted;
            }
        }

        let mut started = false;
        for slot in 0..self.num_slots() {
            if self.executing[slot].is_some() {
                continue;
            }

            let Some(position) = self.pick_runnable(slot, protected) else {
                continue;
            };
            if let Some(atom) = self.runnable[slot].remove(position) {
                self.start_atom(owner, slot, atom);
                started = true;
            }
        }

        started
    }

    fn fail_runnable_atoms(&mut self, owner: &mut dyn JobOwner, protected: bool) {
        for slot in 0..self.num_slots() {
            let (failed, kept): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut self.runnable[slot])
                    .into_iter()
                    .partition(|a| a.is_protected() == protected);
            self.runnable[slot] = kept;

            for atom in failed {
                self.complete_atom(owner, &atom, ResultCode::Failed, None);
            }
        }
    }

    /// Picks the next atom to run on `slot`: the highest priority atom of the connection that
    /// follows the last one to run there, earliest first among equals.
    ///
    /// Connections take turns in id order, wrapping around, so every connection with runnable
    /// work gets one atom per round.
    fn pick_runnable(&self, slot: usize, protected: bool) -> Option<usize> {
        let candidates: Vec<(usize, &Arc<Atom>)> = self.runnable[slot]
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_protected() == protected)
            .collect();

        let lowest = candidates.iter().map(|(_, a)| a.connection_id()).min()?;
        let connection = match self.last_connection[slot] {
            Some(last) => candidates
                .iter()
                .map(|(_, a)| a.connection_id())
                .filter(|&c| c > last)
                .min()
                .unwrap_or(lowest),
            None => candidates[0].1.connection_id(),
        };

        let mut best: Option<(usize, i32)> = None;
        for (position, atom) in candidates {
            if atom.connection_id() != connection {
                continue;
            }
            if best.map_or(true, |(_, priority)| atom.priority() > priority) {
                best = Some((position, atom.priority()));
            }
        }

        best.map(|(position, _)| position)
    }

    fn start_atom(&mut self, owner: &mut dyn JobOwner, slot: usize, atom: Arc<Atom>) {
        let now = self.clock.now();
        atom.start(now + self.config.job_tick, now + self.config.timeout);

        debug!(
            "running atom {} of connection {} on slot {}",
            atom.id(),
            atom.connection_id(),
            slot
        );
        self.last_connection[slot] = Some(atom.connection_id());
        self.executing[slot] = Some(Arc::clone(&atom));
        owner.run_atom(&atom);
    }

    /// Whether a runnable atom deserves to preempt `executing`.
    fn has_competitor(&self, slot: usize, executing: &Atom) -> bool {
        self.runnable[slot].iter().any(|waiting| {
            waiting.is_protected() == executing.is_protected()
                && (waiting.connection_id() != executing.connection_id()
                    || waiting.priority() >= executing.priority())
        })
    }

    fn request_preemptions(&mut self, owner: &mut dyn JobOwner, now: Instant) {
        for slot in 0..self.num_slots() {
            let Some(atom) = self.executing[slot].clone() else {
                continue;
            };
            if atom.soft_stop_requested() {
                continue;
            }
            if atom.tick_deadline().map_or(true, |deadline| now < deadline) {
                continue;
            }

            if self.has_competitor(slot, &atom) {
                debug!("preempting atom {} on slot {}", atom.id(), slot);
                atom.request_soft_stop(StopReason::Preempted, now + self.config.hard_stop_grace);
                owner.soft_stop_atom(&atom);
            }
        }
    }

    /// Soft-stops atoms that ran past their timeout and hard-stops atoms that ignored a soft stop.
    pub fn handle_timed_out_atoms(&mut self, owner: &mut dyn JobOwner) {
        let now = self.clock.now();

        for slot in 0..self.num_slots() {
            let Some(atom) = self.executing[slot].clone() else {
                continue;
            };

            if let Some(deadline) = atom.hard_stop_deadline() {
                if now >= deadline && !atom.hard_stop_requested() {
                    warn!("atom {} did not yield, hard stopping it", atom.id());
                    atom.request_hard_stop();
                    owner.hard_stop_atom(&atom);
                }
                continue;
            }

            if atom.timeout_deadline().is_some_and(|deadline| now >= deadline) {
                warn!("atom {} timed out on slot {}", atom.id(), slot);
                atom.request_soft_stop(StopReason::TimedOut, now + self.config.hard_stop_grace);
                owner.soft_stop_atom(&atom);
            }
        }

        self.request_preemptions(owner, now);
    }

    /// Time until [`Self::handle_timed_out_atoms`] has something to do.
    pub fn current_timeout_duration(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut earliest: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(deadline) = deadline {
                earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
            }
        };

        for (slot, atom) in self.executing.iter().enumerate() {
            let Some(atom) = atom else {
                continue;
            };

            if atom.soft_stop_requested() {
                if !atom.hard_stop_requested() {
                    consider(atom.hard_stop_deadline());
                }
                continue;
            }

            consider(atom.timeout_deadline());
            if self.has_competitor(slot, atom) {
                consider(atom.tick_deadline());
            }
        }

        earliest.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Reports the end of the atom executing on `slot`. `output_address` is where the job stopped
    /// or ended.
    pub fn job_completed(
        &mut self,
        owner: &mut dyn JobOwner,
        slot: usize,
        result: ResultCode,
        output_address: Option<u64>,
    ) {
        let Some(atom) = self.executing.get_mut(slot).and_then(Option::take) else {
            warn!("completion reported on idle slot {}", slot);
            return;
        };

        match result {
            ResultCode::SoftStopped => {
                debug!("atom {} yielded at {:?}", atom.id(), output_address);
                atom.requeue(output_address);
                self.runnable[slot].push_front(atom);
            }
            ResultCode::HardStopped if atom.stop_reason() == Some(StopReason::Preempted) => {
                debug!("atom {} preempted, it will restart", atom.id());
                atom.requeue(None);
                self.runnable[slot].push_front(atom);
            }
            ResultCode::HardStopped => {
                self.complete_atom(owner, &atom, ResultCode::TimedOut, None);
            }
            result => {
                self.complete_atom(owner, &atom, result, output_address);
            }
        }

        self.try_to_schedule(owner);
    }

    /// Cancels every atom of `connection` that is not executing, along with the atoms of closed
    /// connections. Canceled atoms are not reported to the owner.
    pub fn cancel_atoms_for_connection(
        &mut self,
        owner: &mut dyn JobOwner,
        connection: ConnectionId,
    ) {
        let matches =
            |atom: &Arc<Atom>| atom.connection_id() == connection || atom.connection().is_none();
        let mut canceled = 0;

        let mut cancel_matching = |list: &mut VecDeque<Arc<Atom>>| {
            list.retain(|atom| {
                if matches(atom) {
                    atom.cancel();
                    canceled += 1;
                    false
                } else {
                    true
                }
            });
        };

        cancel_matching(&mut self.atoms);
        for runnable in &mut self.runnable {
            cancel_matching(runnable);
        }

        let mut waiting: VecDeque<_> = std::mem::take(&mut self.waiting).into();
        cancel_matching(&mut waiting);
        self.waiting = waiting.into();

        let still_waited: Vec<u64> = self
            .waiting
            .iter()
            .filter_map(|atom| match atom.kind() {
                AtomKind::SemaphoreWait(semaphore) => Some(semaphore.id()),
                _ => None,
            })
            .collect();
        self.port.retain(|id| still_waited.contains(&id));

        debug!("canceled {} atoms of connection {}", canceled, connection);
        self.try_to_schedule(owner);
    }
}
