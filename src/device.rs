// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owner of the decoder core.
//!
//! A [`VideoDevice`] holds the hardware, the memory allocator, the [`JobScheduler`] and every
//! decoder instance behind a single lock. Each instance is a connection of the scheduler: its
//! decode units become job atoms, and the scheduler's decisions are carried out on the instances
//! by a short-lived binding implementing [`JobOwner`].
//!
//! Only one instance is bound to the core at a time. Switching instances saves the context of the
//! outgoing one and restores (or initializes) the context of the incoming one. Interrupts always
//! concern the bound instance.

pub mod watchdog;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;
use nix::errno::Errno;
use thiserror::Error;

use crate::backend::BufferAllocator;
use crate::backend::Vp9Hardware;
use crate::decoder::frame_pool::FrameBuffer;
use crate::decoder::pts::PtsMark;
use crate::decoder::vp9::Core;
use crate::decoder::vp9::DecoderState;
use crate::decoder::vp9::InterruptOutcome;
use crate::decoder::vp9::Vp9Decoder;
use crate::decoder::vp9::Vp9DecoderConfig;
use crate::decoder::DecoderCallbacks;
use crate::decoder::DecoderError;
use crate::decoder::OutputFrame;
use crate::device::watchdog::ThreadWatchdog;
use crate::scheduler::atom::Atom;
use crate::scheduler::atom::AtomBuilder;
use crate::scheduler::atom::AtomKind;
use crate::scheduler::atom::Connection;
use crate::scheduler::atom::ConnectionId;
use crate::scheduler::atom::DependencyType;
use crate::scheduler::atom::ResultCode;
use crate::scheduler::Clock;
use crate::scheduler::JobOwner;
use crate::scheduler::JobScheduler;
use crate::scheduler::SchedulerConfig;
use crate::Resolution;

#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub scheduler: SchedulerConfig,
    /// Priority of the atoms of instances created without one.
    pub default_priority: i32,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no decoder instance for connection {0}")]
    UnknownInstance(ConnectionId),
    #[error("connection {0} already has a decoder instance")]
    DuplicateInstance(ConnectionId),
    #[error("failed to set up the scheduler: {0}")]
    Scheduler(Errno),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

struct Instance {
    connection: Arc<Connection>,
    decoder: Vp9Decoder,
    config: Vp9DecoderConfig,
    priority: i32,
    /// Last decode unit queued, which the next one is ordered after.
    last_atom: Option<Weak<Atom>>,
    /// Atom the instance is currently executing.
    running: Option<u64>,
}

/// Everything guarded by the device lock.
pub struct DeviceState {
    hw: Box<dyn Vp9Hardware>,
    allocator: Box<dyn BufferAllocator>,
    scheduler: JobScheduler,
    instances: HashMap<ConnectionId, Instance>,
    /// Instance bound to the core.
    current: Option<ConnectionId>,
    in_protected_mode: bool,
    next_atom_id: u64,
    default_priority: i32,
}

impl DeviceState {
    pub fn current_instance(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn is_in_protected_mode(&self) -> bool {
        self.in_protected_mode
    }

    pub fn decoder(&self, id: ConnectionId) -> Option<&Vp9Decoder> {
        self.instances.get(&id).map(|instance| &instance.decoder)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Returns an id no atom of this device uses yet.
    pub fn allocate_atom_id(&mut self) -> u64 {
        let id = self.next_atom_id;
        self.next_atom_id += 1;
        id
    }

    /// Runs `f` with the scheduler and a binding of the instances to the core, then reports to the
    /// scheduler the completions the binding collected meanwhile.
    fn with_binding<R>(&mut self, f: impl FnOnce(&mut JobScheduler, &mut Binding<'_>) -> R) -> R {
        let Self {
            hw,
            allocator,
            scheduler,
            instances,
            current,
            in_protected_mode,
            ..
        } = self;

        let mut binding = Binding {
            hw: hw.as_mut(),
            allocator: allocator.as_mut(),
            instances,
            current,
            in_protected_mode,
            completions: Vec::new(),
        };

        let result = f(scheduler, &mut binding);
        binding.drain(scheduler);

        result
    }
}

/// A job that ended while the scheduler was calling into the binding. It is reported once the
/// scheduler call returns.
struct Completion {
    connection: ConnectionId,
    atom: u64,
    result: ResultCode,
    output_address: Option<u64>,
}

/// The instances, seen from the scheduler.
struct Binding<'a> {
    hw: &'a mut dyn Vp9Hardware,
    allocator: &'a mut dyn BufferAllocator,
    instances: &'a mut HashMap<ConnectionId, Instance>,
    current: &'a mut Option<ConnectionId>,
    in_protected_mode: &'a mut bool,
    completions: Vec<Completion>,
}

impl Binding<'_> {
    fn drain(&mut self, scheduler: &mut JobScheduler) {
        while !self.completions.is_empty() {
            for completion in std::mem::take(&mut self.completions) {
                let slot = scheduler.slot_of(completion.connection).filter(|&slot| {
                    scheduler
                        .executing_atom(slot)
                        .is_some_and(|atom| atom.id() == completion.atom)
                });

                match slot {
                    Some(slot) => scheduler.job_completed(
                        self,
                        slot,
                        completion.result,
                        completion.output_address,
                    ),
                    None => warn!(
                        "atom {} is not executing, dropping its completion",
                        completion.atom
                    ),
                }
            }
        }
    }

    fn record(
        &mut self,
        connection: ConnectionId,
        atom: u64,
        result: ResultCode,
        tail: Option<u64>,
    ) {
        trace!("atom {} ends with {:?}", atom, result);
        self.completions.push(Completion {
            connection,
            atom,
            result,
            output_address: tail,
        });
    }

    /// Ends the atom `id` is executing, if any.
    fn finish(&mut self, id: ConnectionId, result: ResultCode, tail: Option<u64>) {
        let Some(atom) = self.instances.get_mut(&id).and_then(|i| i.running.take()) else {
            return;
        };
        self.record(id, atom, result, tail);
    }

    /// Saves the context of the bound instance and leaves the core unbound.
    fn release_core(&mut self) {
        let Some(previous) = self.current.take() else {
            return;
        };
        if let Some(instance) = self.instances.get_mut(&previous) {
            instance.decoder.swap_out(self.hw);
        }
    }

    /// Makes `id` give the core up at a safe point, to be resumed later.
    fn yield_core(&mut self, id: ConnectionId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };

        debug!("instance {} yields the core", id);
        instance.decoder.swap_out(self.hw);
        let tail = instance.decoder.stream_read_offset();
        if *self.current == Some(id) {
            *self.current = None;
        }
        self.finish(id, ResultCode::SoftStopped, Some(tail));
    }

    /// Acts on what the decoder of `id` reported.
    fn settle(&mut self, id: ConnectionId, outcome: InterruptOutcome) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };

        match outcome {
            InterruptOutcome::Ignored
            | InterruptOutcome::Continue
            | InterruptOutcome::Starved => (),
            InterruptOutcome::PausedAtHeader => {
                if instance.decoder.is_waiting_for_client() && instance.decoder.take_yield_request()
                {
                    self.yield_core(id);
                }
            }
            InterruptOutcome::InputConsumed | InterruptOutcome::EndOfStream => {
                instance.decoder.take_yield_request();
                let tail = instance.decoder.stream_read_offset();
                self.finish(id, ResultCode::Success, Some(tail));
            }
            InterruptOutcome::FrameProduced => {
                if instance.decoder.take_yield_request() {
                    self.yield_core(id);
                } else if let Err(e) = instance.decoder.continue_decoding(self.hw) {
                    instance.decoder.report_error(e);
                    self.finish(id, ResultCode::Failed, None);
                }
            }
            InterruptOutcome::Failed => {
                self.hw.stop_decoding();
                self.finish(id, ResultCode::Failed, None);
            }
        }
    }

    fn interrupt(&mut self, id: ConnectionId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            warn!("interrupt for vanished instance {}", id);
            return;
        };

        let mut core = Core {
            hw: &mut *self.hw,
            allocator: &mut *self.allocator,
        };
        let outcome = instance.decoder.handle_interrupt(&mut core);
        trace!("instance {} interrupt: {:?}", id, outcome);
        self.settle(id, outcome);
    }

    fn return_frame(&mut self, id: ConnectionId, frame: &OutputFrame) -> Result<(), DeviceError> {
        let bound = *self.current == Some(id);
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(DeviceError::UnknownInstance(id))?;

        let core = if bound {
            Some(Core {
                hw: &mut *self.hw,
                allocator: &mut *self.allocator,
            })
        } else {
            None
        };
        let outcome = instance.decoder.return_frame(core, frame)?;
        self.settle(id, outcome);

        Ok(())
    }

    fn initialized_frames(
        &mut self,
        id: ConnectionId,
        buffers: Vec<FrameBuffer>,
        coded: Resolution,
        stride: u32,
    ) -> Result<(), DeviceError> {
        let bound = *self.current == Some(id);
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(DeviceError::UnknownInstance(id))?;

        let core = if bound {
            Some(Core {
                hw: &mut *self.hw,
                allocator: &mut *self.allocator,
            })
        } else {
            None
        };
        match instance.decoder.initialized_frames(core, buffers, coded, stride) {
            Ok(outcome) => {
                self.settle(id, outcome);
                Ok(())
            }
            Err(e) => {
                self.settle(id, InterruptOutcome::Failed);
                Err(e.into())
            }
        }
    }

    /// Fails `id` with whatever `fail` does to its decoder.
    fn fail(
        &mut self,
        id: ConnectionId,
        fail: impl FnOnce(&mut Vp9Decoder),
    ) -> Result<(), DeviceError> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(DeviceError::UnknownInstance(id))?;

        fail(&mut instance.decoder);
        if *self.current == Some(id) {
            self.hw.stop_decoding();
        }
        self.finish(id, ResultCode::Failed, None);

        Ok(())
    }

    fn watchdog_fired(&mut self, id: ConnectionId) {
        if *self.current != Some(id) {
            debug!("watchdog of unbound instance {} fired, ignoring", id);
            return;
        }
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };

        if instance.decoder.on_signaled_watchdog(self.hw) {
            self.finish(id, ResultCode::Failed, None);
        }
    }

    /// Takes the core away from `id` for good, canceling the atom it executes.
    fn unbind(&mut self, id: ConnectionId) {
        if *self.current == Some(id) {
            self.hw.stop_decoding();
            self.hw.power_off();
            *self.current = None;
        }
        self.finish(id, ResultCode::Canceled, None);
    }
}

impl JobOwner for Binding<'_> {
    fn run_atom(&mut self, atom: &Arc<Atom>) {
        let id = atom.connection_id();
        let length = match atom.kind() {
            AtomKind::Job { length, .. } => *length,
            kind => {
                error!("cannot run {:?} on the core", kind);
                self.record(id, atom.id(), ResultCode::Failed, None);
                return;
            }
        };

        let Some(instance) = self.instances.get_mut(&id) else {
            warn!("atom {} belongs to no instance", atom.id());
            self.record(id, atom.id(), ResultCode::Canceled, None);
            return;
        };
        instance.running = Some(atom.id());

        if *self.current != Some(id) {
            self.release_core();

            let Some(instance) = self.instances.get_mut(&id) else {
                return;
            };
            if let Err(e) = instance.decoder.swap_in(self.hw) {
                instance.decoder.report_error(e);
                self.finish(id, ResultCode::Failed, None);
                return;
            }
            *self.current = Some(id);
            debug!("instance {} bound to the core", id);
        }

        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        let outcome = match instance.decoder.state() {
            DecoderState::FrameJustProduced => instance
                .decoder
                .continue_decoding(self.hw)
                .map(|()| InterruptOutcome::Continue),
            DecoderState::InitialWaitingForInput | DecoderState::StoppedWaitingForInput => instance
                .decoder
                .update_decode_size(self.hw, length)
                .map(|()| InterruptOutcome::Continue),
            DecoderState::PausedAtHeader => {
                let mut core = Core {
                    hw: &mut *self.hw,
                    allocator: &mut *self.allocator,
                };
                Ok(instance.decoder.resume(&mut core))
            }
            DecoderState::PausedAtEndOfStream => Ok(InterruptOutcome::EndOfStream),
            DecoderState::Failed => Ok(InterruptOutcome::Failed),
            state @ (DecoderState::Running | DecoderState::SwappedOut) => {
                Err(DecoderError::InvalidState(state))
            }
        };

        match outcome {
            Ok(outcome) => self.settle(id, outcome),
            Err(e) => {
                instance.decoder.report_error(e);
                self.finish(id, ResultCode::Failed, None);
            }
        }
    }

    fn atom_completed(&mut self, atom: &Arc<Atom>, result: ResultCode) {
        let Some(instance) = self.instances.get_mut(&atom.connection_id()) else {
            return;
        };
        if instance.running == Some(atom.id()) {
            instance.running = None;
        }

        match result {
            ResultCode::TimedOut => {
                error!("decode unit {} timed out", atom.id());
                instance.decoder.mark_hung();
            }
            ResultCode::Success => trace!("decode unit {} done", atom.id()),
            result => debug!("decode unit {} ended with {:?}", atom.id(), result),
        }
    }

    fn soft_stop_atom(&mut self, atom: &Arc<Atom>) {
        let id = atom.connection_id();
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };

        instance.decoder.request_yield();
        // Nothing happens on the core while the client is awaited.
        if instance.decoder.is_waiting_for_client() {
            instance.decoder.take_yield_request();
            self.yield_core(id);
        }
    }

    fn hard_stop_atom(&mut self, atom: &Arc<Atom>) {
        let id = atom.connection_id();

        match self.instances.get_mut(&id) {
            Some(instance) => {
                instance.decoder.hard_stop(self.hw);
                instance.running = None;
            }
            None => {
                self.hw.stop_decoding();
                self.hw.power_off();
            }
        }
        if *self.current == Some(id) {
            *self.current = None;
        }

        self.record(id, atom.id(), ResultCode::HardStopped, None);
    }

    fn enter_protected_mode(&mut self) -> bool {
        self.release_core();
        match self.hw.set_protected_mode(true) {
            Ok(()) => {
                info!("core entered protected mode");
                *self.in_protected_mode = true;
                true
            }
            Err(e) => {
                error!("failed to enter protected mode: {:#}", e);
                false
            }
        }
    }

    fn exit_protected_mode(&mut self) -> bool {
        self.release_core();
        match self.hw.set_protected_mode(false) {
            Ok(()) => {
                info!("core left protected mode");
                *self.in_protected_mode = false;
                true
            }
            Err(e) => {
                error!("failed to leave protected mode: {:#}", e);
                false
            }
        }
    }

    fn is_in_protected_mode(&self) -> bool {
        *self.in_protected_mode
    }

    fn update_hardware_active(&mut self, active: bool) {
        trace!("core {}", if active { "busy" } else { "idle" });
    }
}

/// The decoder core and the streams sharing it.
pub struct VideoDevice {
    state: Mutex<DeviceState>,
}

impl VideoDevice {
    pub fn new(
        hw: Box<dyn Vp9Hardware>,
        allocator: Box<dyn BufferAllocator>,
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let scheduler = JobScheduler::new(config.scheduler).map_err(DeviceError::Scheduler)?;

        Ok(Self {
            state: Mutex::new(DeviceState {
                hw,
                allocator,
                scheduler,
                instances: HashMap::new(),
                current: None,
                in_protected_mode: false,
                next_atom_id: 1,
                default_priority: config.default_priority,
            }),
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .scheduler
            .set_clock(clock);
        self
    }

    /// Runs `f` with the device lock held. Nothing else touches the core meanwhile.
    pub fn with_hardware_lock<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Adds a decoder instance for `connection`. Its atoms get `priority`, or the device's default.
    pub fn create_instance(
        &self,
        connection: Arc<Connection>,
        config: Vp9DecoderConfig,
        callbacks: DecoderCallbacks,
        priority: Option<i32>,
    ) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            let id = connection.id();
            if state.instances.contains_key(&id) {
                return Err(DeviceError::DuplicateInstance(id));
            }

            let decoder =
                Vp9Decoder::new(config.clone(), state.allocator.as_mut(), callbacks, None)?;
            state.instances.insert(
                id,
                Instance {
                    connection,
                    decoder,
                    config,
                    priority: priority.unwrap_or(state.default_priority),
                    last_atom: None,
                    running: None,
                },
            );
            info!("created decoder instance {}", id);

            Ok(())
        })
    }

    /// Cancels the work of `id` and takes the core away from it.
    fn shut_down(state: &mut DeviceState, id: ConnectionId) -> Result<Instance, DeviceError> {
        if !state.instances.contains_key(&id) {
            return Err(DeviceError::UnknownInstance(id));
        }

        state.with_binding(|scheduler, binding| {
            scheduler.cancel_atoms_for_connection(binding, id);
            binding.unbind(id);
        });

        state
            .instances
            .remove(&id)
            .ok_or(DeviceError::UnknownInstance(id))
    }

    pub fn remove_instance(&self, id: ConnectionId) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            let instance = Self::shut_down(state, id)?;
            drop(instance.decoder.into_parts());
            info!("removed decoder instance {}", id);

            // Another instance may have been waiting for the core.
            state.with_binding(|scheduler, binding| scheduler.try_to_schedule(binding));
            Ok(())
        })
    }

    /// Replaces the decoder of `id` with a fresh one, handing over its internal buffers. Queued
    /// decode units are dropped.
    pub fn reset_instance(&self, id: ConnectionId) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            let instance = Self::shut_down(state, id)?;
            let (callbacks, buffers) = instance.decoder.into_parts();

            let decoder = Vp9Decoder::new(
                instance.config.clone(),
                state.allocator.as_mut(),
                callbacks,
                buffers,
            )?;
            state.instances.insert(
                id,
                Instance {
                    decoder,
                    last_atom: None,
                    running: None,
                    ..instance
                },
            );
            info!("reset decoder instance {}", id);

            state.with_binding(|scheduler, binding| scheduler.try_to_schedule(binding));
            Ok(())
        })
    }

    /// Writes a decode unit into the ring of `id` and schedules its decoding after the units
    /// already queued.
    pub fn queue_decode_unit(
        &self,
        id: ConnectionId,
        data: &[u8],
        mark: Option<PtsMark>,
    ) -> Result<Arc<Atom>, DeviceError> {
        self.with_hardware_lock(|state| {
            let bound = state.current == Some(id);
            let instance = state
                .instances
                .get_mut(&id)
                .ok_or(DeviceError::UnknownInstance(id))?;

            let hw: Option<&mut dyn Vp9Hardware> = if bound {
                Some(state.hw.as_mut())
            } else {
                None
            };
            let offset = instance.decoder.queue_input(hw, data, mark)?;

            let atom_id = state.next_atom_id;
            state.next_atom_id += 1;

            // Units are bounded by the ring size.
            let length = data.len() as u32;
            let mut builder = AtomBuilder::job(atom_id, &instance.connection, offset, length)
                .priority(instance.priority)
                .protected(instance.decoder.is_secure());
            if let Some(previous) = instance.last_atom.as_ref().and_then(Weak::upgrade) {
                builder = builder.depends_on(&previous, DependencyType::Order);
            }
            let atom = builder.build();
            instance.last_atom = Some(Arc::downgrade(&atom));
            trace!(
                "instance {} queued {} bytes at {} as atom {}",
                id,
                data.len(),
                offset,
                atom_id
            );

            state.scheduler.enqueue_atom(Arc::clone(&atom));
            state.with_binding(|scheduler, binding| scheduler.try_to_schedule(binding));

            Ok(atom)
        })
    }

    /// Adds an atom built by the caller, e.g. a semaphore operation.
    pub fn enqueue_atom(&self, atom: Arc<Atom>) {
        self.with_hardware_lock(|state| {
            state.scheduler.enqueue_atom(atom);
            state.with_binding(|scheduler, binding| scheduler.try_to_schedule(binding));
        })
    }

    /// Services an interrupt of the core.
    pub fn handle_interrupt(&self) {
        self.with_hardware_lock(|state| {
            let Some(id) = state.current else {
                warn!("interrupt with no instance bound, status {:?}", state.hw.read_status());
                return;
            };
            state.with_binding(|_, binding| binding.interrupt(id));
        })
    }

    pub fn return_frame(&self, id: ConnectionId, frame: &OutputFrame) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            state.with_binding(|_, binding| binding.return_frame(id, frame))
        })
    }

    pub fn initialized_frames(
        &self,
        id: ConnectionId,
        buffers: Vec<FrameBuffer>,
        coded: Resolution,
        stride: u32,
    ) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            state.with_binding(|_, binding| binding.initialized_frames(id, buffers, coded, stride))
        })
    }

    pub fn negotiation_failed(&self, id: ConnectionId) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            state.with_binding(|_, binding| binding.fail(id, Vp9Decoder::negotiation_failed))
        })
    }

    /// Fails the stream of `id` because of an error found outside of the decoder.
    pub fn fail_instance(&self, id: ConnectionId, error: DecoderError) -> Result<(), DeviceError> {
        self.with_hardware_lock(|state| {
            state.with_binding(|_, binding| {
                binding.fail(id, |decoder| decoder.report_error(error))
            })
        })
    }

    pub fn on_watchdog_fired(&self, id: ConnectionId) {
        self.with_hardware_lock(|state| {
            state.with_binding(|_, binding| binding.watchdog_fired(id))
        })
    }

    /// Creates a watchdog reporting to this device on behalf of `id`.
    pub fn watchdog_for(
        self: &Arc<Self>,
        id: ConnectionId,
        timeout: Duration,
    ) -> std::io::Result<ThreadWatchdog> {
        let device = Arc::downgrade(self);
        ThreadWatchdog::new(timeout, move || {
            if let Some(device) = device.upgrade() {
                device.on_watchdog_fired(id);
            }
        })
    }

    /// To be called when [`Self::current_timeout`] elapsed.
    pub fn handle_timeouts(&self) {
        self.with_hardware_lock(|state| {
            state.with_binding(|scheduler, binding| scheduler.handle_timed_out_atoms(binding))
        })
    }

    /// Time after which [`Self::handle_timeouts`] should be called.
    pub fn current_timeout(&self) -> Option<Duration> {
        self.with_hardware_lock(|state| state.scheduler.current_timeout_duration())
    }

    /// To be called when [`Self::wait_port_fd`] becomes readable.
    pub fn handle_port_signal(&self) {
        self.with_hardware_lock(|state| {
            state.with_binding(|scheduler, binding| scheduler.handle_port_signal(binding))
        })
    }

    pub fn wait_port_fd(&self) -> RawFd {
        self.with_hardware_lock(|state| state.scheduler.wait_port().raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummyHardware;
    use crate::backend::dummy::HwOp;
    use crate::backend::DmaBuffer;
    use crate::backend::Vp9Status;
    use crate::codec::vp9::header::tests::keyframe;
    use crate::codec::vp9::header::RenderParams;
    use crate::decoder::frame_pool::tests::buffers;
    use crate::decoder::frame_pool::MIN_FRAMES;
    use crate::decoder::tests::Recorder;
    use crate::scheduler::semaphore::Semaphore;
    use crate::scheduler::tests::FakeClock;

    /// Allocator whose counters stay visible to the test once the device owns it.
    #[derive(Clone, Default)]
    struct SharedAllocator(Arc<Mutex<DummyAllocator>>);

    impl SharedAllocator {
        fn allocations(&self) -> usize {
            self.0.lock().unwrap().allocations
        }
    }

    impl BufferAllocator for SharedAllocator {
        fn allocate(
            &mut self,
            name: &'static str,
            size: usize,
            secure: bool,
        ) -> anyhow::Result<DmaBuffer> {
            self.0.lock().unwrap().allocate(name, size, secure)
        }
    }

    struct Fixture {
        device: Arc<VideoDevice>,
        hw: DummyHardware,
        allocator: SharedAllocator,
        clock: FakeClock,
        connections: Vec<Arc<Connection>>,
    }

    fn fixture() -> Fixture {
        let hw = DummyHardware::new();
        let allocator = SharedAllocator::default();
        let clock = FakeClock::new();
        let device = VideoDevice::new(
            Box::new(hw.clone()),
            Box::new(allocator.clone()),
            Default::default(),
        )
        .unwrap()
        .with_clock(Box::new(clock.clone()));
        let device = Arc::new(device);

        Fixture {
            device,
            hw,
            allocator,
            clock,
            connections: Vec::new(),
        }
    }

    impl Fixture {
        fn add_instance(&mut self, id: ConnectionId, secure: bool) -> Recorder {
            let recorder = Recorder::default();
            self.add_instance_with(id, secure, recorder.callbacks());
            recorder
        }

        fn add_instance_with(
            &mut self,
            id: ConnectionId,
            secure: bool,
            callbacks: DecoderCallbacks,
        ) {
            let connection = Connection::new(id);
            let config = Vp9DecoderConfig {
                is_secure: secure,
                ..Default::default()
            };
            self.device
                .create_instance(connection.clone(), config, callbacks, None)
                .unwrap();
            self.connections.push(connection);
        }

        fn queue(&self, id: ConnectionId, timestamp: u64) -> Arc<Atom> {
            self.device
                .queue_decode_unit(id, &[0u8; 100], Some(PtsMark::Timestamp(timestamp)))
                .unwrap()
        }

        fn interrupt(&self, status: Vp9Status) {
            self.hw.raise(status);
            self.device.handle_interrupt();
        }

        fn header(&self, params: &RenderParams, stream_offset: u64) {
            self.hw.set_header(params);
            self.hw.set_stream_offset(stream_offset);
            self.interrupt(Vp9Status::ProcessedHeader);
        }

        fn provide_frames(&self, id: ConnectionId, recorder: &Recorder) {
            let change = *recorder.get().format_changes.last().unwrap();
            self.device
                .initialized_frames(id, buffers(change.count, 0), change.coded, change.stride)
                .unwrap();
        }

        fn current(&self) -> Option<ConnectionId> {
            self.device.with_hardware_lock(|state| state.current_instance())
        }

        fn decoder_state(&self, id: ConnectionId) -> DecoderState {
            self.device
                .with_hardware_lock(|state| state.decoder(id).unwrap().state())
        }
    }

    #[test]
    fn decodes_a_unit_end_to_end() {
        let mut f = fixture();
        let recorder = f.add_instance(1, false);

        let atom = f.queue(1, 7);
        assert_eq!(f.current(), Some(1));
        assert_eq!(f.decoder_state(1), DecoderState::Running);
        assert_eq!(f.hw.count(&HwOp::AddDecodeSize(100)), 1);

        f.header(&keyframe(320, 240), 10);
        assert_eq!(recorder.get().format_changes.len(), 1);
        assert_eq!(recorder.get().format_changes[0].count, MIN_FRAMES);

        f.provide_frames(1, &recorder);
        assert_eq!(f.hw.programmed_frames().len(), 1);

        f.interrupt(Vp9Status::DecodingDataDone);
        assert_eq!(f.decoder_state(1), DecoderState::Running, "continued");
        let frame = recorder.get().frames[0].clone();
        assert_eq!(frame.timestamp, Some(7));

        f.interrupt(Vp9Status::NalDecodeDone);
        assert_eq!(atom.result(), Some(ResultCode::Success));
        assert_eq!(recorder.get().input_requests, 1);
        assert_eq!(f.decoder_state(1), DecoderState::StoppedWaitingForInput);

        f.device.return_frame(1, &frame).unwrap();
        assert!(matches!(
            f.device.return_frame(1, &frame),
            Err(DeviceError::Decoder(DecoderError::FramePool(_)))
        ));
    }

    #[test]
    fn units_of_an_instance_run_in_order() {
        let mut f = fixture();
        f.add_instance(1, false);

        let first = f.queue(1, 0);
        let second = f.queue(1, 1);
        assert_eq!(second.result(), None);
        assert_eq!(f.hw.count(&HwOp::AddDecodeSize(100)), 1);

        f.interrupt(Vp9Status::NalDecodeDone);
        assert_eq!(first.result(), Some(ResultCode::Success));
        assert_eq!(f.hw.count(&HwOp::AddDecodeSize(100)), 2);
        assert_eq!(f.decoder_state(1), DecoderState::Running);
    }

    #[test]
    fn frame_boundary_yields_to_other_instance() {
        let mut f = fixture();
        let first = f.add_instance(1, false);
        f.add_instance(2, false);

        let atom = f.queue(1, 0);
        f.header(&keyframe(320, 240), 10);
        f.provide_frames(1, &first);

        let other = f.queue(2, 0);
        assert_eq!(f.current(), Some(1));

        f.clock.advance(Duration::from_millis(100));
        f.device.handle_timeouts();
        assert_eq!(f.current(), Some(1), "yields only at a frame boundary");

        f.interrupt(Vp9Status::DecodingDataDone);
        assert_eq!(f.current(), Some(2));
        assert_eq!(f.decoder_state(1), DecoderState::SwappedOut);
        assert!(atom.is_resumed());
        assert_eq!(f.hw.count(&HwOp::SaveContext), 1);
        assert_eq!(f.hw.count(&HwOp::InitCore { buffers: 16 }), 2);

        f.interrupt(Vp9Status::NalDecodeDone);
        assert_eq!(other.result(), Some(ResultCode::Success));

        // The first instance picks up right after its frame.
        assert_eq!(f.current(), Some(1));
        assert_eq!(f.hw.count(&HwOp::RestoreContext), 1);
        assert_eq!(f.decoder_state(1), DecoderState::Running);
        assert_eq!(first.get().frames.len(), 1);
    }

    #[test]
    fn instance_waiting_for_client_yields_right_away() {
        let mut f = fixture();
        let first = f.add_instance(1, false);
        f.add_instance(2, false);

        f.queue(1, 0);
        f.header(&keyframe(320, 240), 10);
        f.queue(2, 0);

        f.clock.advance(Duration::from_millis(100));
        f.device.handle_timeouts();
        assert_eq!(f.current(), Some(2));

        // Installed while unbound, used once bound again.
        f.provide_frames(1, &first);
        assert!(f.hw.programmed_frames().is_empty());

        f.interrupt(Vp9Status::NalDecodeDone);
        assert_eq!(f.current(), Some(1));
        assert_eq!(f.hw.programmed_frames().len(), 1);
        assert_eq!(f.decoder_state(1), DecoderState::Running);
    }

    #[test]
    fn protected_instance_switches_mode() {
        let mut f = fixture();
        f.add_instance(1, false);
        f.add_instance(2, true);

        f.queue(1, 0);
        f.queue(2, 0);
        assert_eq!(f.hw.count(&HwOp::SetProtected(true)), 0);

        f.interrupt(Vp9Status::NalDecodeDone);
        assert_eq!(f.hw.count(&HwOp::SetProtected(true)), 1);
        assert_eq!(f.current(), Some(2));
        assert_eq!(f.hw.count(&HwOp::LoadFirmware { secure: true }), 1);
        assert!(f.device.with_hardware_lock(|state| state.is_in_protected_mode()));
    }

    #[test]
    fn failed_mode_switch_fails_secure_units() {
        let mut f = fixture();
        f.add_instance(2, true);
        f.hw.state().fail_protected = true;

        let atom = f.queue(2, 0);
        assert_eq!(atom.result(), Some(ResultCode::Failed));
        assert_eq!(f.current(), None);
    }

    #[test]
    fn hung_unit_is_hard_stopped() {
        let mut f = fixture();
        let recorder = f.add_instance(1, false);

        let atom = f.queue(1, 0);
        f.clock.advance(Duration::from_secs(5));
        f.device.handle_timeouts();
        assert_eq!(atom.result(), None);

        f.clock.advance(Duration::from_millis(500));
        f.device.handle_timeouts();
        assert_eq!(atom.result(), Some(ResultCode::TimedOut));
        assert_eq!(f.hw.count(&HwOp::PowerOff), 1);
        assert_eq!(f.decoder_state(1), DecoderState::Failed);
        assert_eq!(recorder.get().resets, 1);
        assert_eq!(f.current(), None);
        assert_eq!(f.device.current_timeout(), None);
    }

    #[test]
    fn watchdog_expiry_fails_the_unit() {
        let mut f = fixture();
        let recorder = f.add_instance(1, false);

        let atom = f.queue(1, 0);
        // A stale expiry is ignored.
        f.device.on_watchdog_fired(1);
        assert_eq!(atom.result(), None);

        recorder.get().watchdog_expired = true;
        f.device.on_watchdog_fired(1);
        assert_eq!(atom.result(), Some(ResultCode::Failed));
        assert_eq!(f.decoder_state(1), DecoderState::Failed);
        assert_eq!(recorder.get().resets, 1);
    }

    #[test]
    fn thread_watchdog_fails_a_hung_unit() {
        let mut f = fixture();
        let recorder = Recorder::default();
        let watchdog = f.device.watchdog_for(1, Duration::from_millis(20)).unwrap();
        f.add_instance_with(
            1,
            false,
            DecoderCallbacks {
                watchdog: Box::new(watchdog),
                ..recorder.callbacks()
            },
        );

        let atom = f.queue(1, 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while atom.result().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(atom.result(), Some(ResultCode::Failed));
        assert!(f.hw.count(&HwOp::Stop) >= 1);
        assert!(!f.hw.state().running);
        assert_eq!(f.decoder_state(1), DecoderState::Failed);
        assert_eq!(recorder.get().resets, 1);
    }

    #[test]
    fn reset_instance_keeps_internal_buffers() {
        let mut f = fixture();
        let recorder = f.add_instance(1, false);

        let running = f.queue(1, 0);
        f.header(&keyframe(320, 240), 10);
        f.provide_frames(1, &recorder);
        f.interrupt(Vp9Status::DecodingDataDone);
        let queued = f.queue(1, 1);

        let working = f.hw.state().working_addrs.clone();
        let mpred = f.hw.programmed_frames()[0].mpred_current;
        let allocations = f.allocator.allocations();

        f.device.reset_instance(1).unwrap();
        assert_eq!(running.result(), Some(ResultCode::Canceled));
        assert!(queued.is_canceled());
        assert_eq!(f.allocator.allocations(), allocations + 1, "only the stream ring");
        assert_eq!(f.current(), None);
        assert_eq!(f.hw.count(&HwOp::PowerOff), 1);
        assert_eq!(f.decoder_state(1), DecoderState::InitialWaitingForInput);

        let atom = f.queue(1, 2);
        assert_eq!(atom.result(), None);
        assert_eq!(f.current(), Some(1));
        assert_eq!(f.decoder_state(1), DecoderState::Running);

        f.header(&keyframe(320, 240), 10);
        f.provide_frames(1, &recorder);
        assert_eq!(f.hw.state().working_addrs, working);
        assert_eq!(f.hw.programmed_frames().last().unwrap().mpred_current, mpred);
        assert_eq!(f.allocator.allocations(), allocations + 1);
    }

    #[test]
    fn removing_the_bound_instance_frees_the_core() {
        let mut f = fixture();
        f.add_instance(1, false);
        f.add_instance(2, false);

        f.queue(1, 0);
        let other = f.queue(2, 0);
        f.device.remove_instance(1).unwrap();

        assert_eq!(f.current(), Some(2));
        assert_eq!(other.result(), None);
        assert!(matches!(
            f.device.queue_decode_unit(1, &[0; 4], None),
            Err(DeviceError::UnknownInstance(1))
        ));
        assert!(matches!(
            f.device.remove_instance(1),
            Err(DeviceError::UnknownInstance(1))
        ));
    }

    #[test]
    fn duplicate_instance_is_rejected() {
        let mut f = fixture();
        f.add_instance(1, false);

        let result = f.device.create_instance(
            Connection::new(1),
            Default::default(),
            Recorder::default().callbacks(),
            None,
        );
        assert!(matches!(result, Err(DeviceError::DuplicateInstance(1))));
    }

    #[test]
    fn negotiation_failure_ends_the_unit() {
        let mut f = fixture();
        let recorder = f.add_instance(1, false);

        let atom = f.queue(1, 0);
        f.header(&keyframe(320, 240), 10);
        f.device.negotiation_failed(1).unwrap();

        assert_eq!(atom.result(), Some(ResultCode::Failed));
        assert_eq!(recorder.get().errors.len(), 1);
        assert_eq!(f.decoder_state(1), DecoderState::Failed);
    }

    #[test]
    fn semaphore_atoms_order_decode_units() {
        let mut f = fixture();
        f.add_instance(1, false);
        let connection = f.connections[0].clone();
        let semaphore = Semaphore::new(1).unwrap();

        let id = f.device.with_hardware_lock(|state| state.allocate_atom_id());
        let wait = AtomBuilder::new(id, &connection, AtomKind::SemaphoreWait(semaphore.clone()))
            .build();
        f.device.enqueue_atom(wait.clone());
        assert_eq!(wait.result(), None);

        semaphore.signal();
        f.device.handle_port_signal();
        assert_eq!(wait.result(), Some(ResultCode::Success));
        assert!(f.device.wait_port_fd() >= 0);
    }
}
