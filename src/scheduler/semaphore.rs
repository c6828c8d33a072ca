// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Semaphores shared between atoms, and the port waiting on them.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::error;
use log::trace;
use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

/// A binary semaphore that can be waited on through an [`EventFd`].
pub struct Semaphore {
    id: u64,
    signaled: AtomicBool,
    event: EventFd,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Semaphore {
    pub fn new(id: u64) -> Result<Arc<Self>, Errno> {
        Ok(Arc::new(Self {
            id,
            signaled: AtomicBool::new(false),
            event: EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        if let Err(e) = self.event.write(1) {
            error!("failed to signal semaphore {}: {}", self.id, e);
        }
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
        self.drain();
    }

    /// Consumes pending wakeups. Nothing pending is not an error.
    fn drain(&self) {
        match self.event.read() {
            Ok(_) | Err(Errno::EAGAIN) => (),
            Err(e) => error!("failed to drain semaphore {}: {}", self.id, e),
        }
    }
}

impl AsFd for Semaphore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.event.as_fd()
    }
}

/// Waits on the semaphores blocking atoms.
///
/// The port is polled without blocking; a caller wanting to sleep until a semaphore is signaled
/// can wait on [`WaitPort::raw_fd`] becoming readable.
pub struct WaitPort {
    epoll: Epoll,
    registered: HashMap<u64, Arc<Semaphore>>,
}

impl WaitPort {
    pub fn new() -> Result<Self, Errno> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            registered: HashMap::new(),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.registered.contains_key(&id)
    }

    /// Starts watching `semaphore`. Registering twice is harmless.
    pub fn register(&mut self, semaphore: &Arc<Semaphore>) -> Result<(), Errno> {
        if self.registered.contains_key(&semaphore.id()) {
            return Ok(());
        }

        self.epoll.add(
            semaphore.as_ref(),
            EpollEvent::new(EpollFlags::EPOLLIN, semaphore.id()),
        )?;
        self.registered.insert(semaphore.id(), Arc::clone(semaphore));

        Ok(())
    }

    pub fn unregister(&mut self, id: u64) {
        if let Some(semaphore) = self.registered.remove(&id) {
            if let Err(e) = self.epoll.delete(semaphore.as_ref()) {
                warn!("failed to stop watching semaphore {}: {}", id, e);
            }
        }
    }

    /// Keeps only the semaphores for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(u64) -> bool) {
        let stale: Vec<u64> = self
            .registered
            .keys()
            .copied()
            .filter(|&id| !keep(id))
            .collect();

        for id in stale {
            self.unregister(id);
        }
    }

    /// Returns the ids of the semaphores signaled since the last poll, without blocking.
    pub fn poll(&mut self) -> Result<Vec<u64>, Errno> {
        let mut events = vec![EpollEvent::empty(); self.registered.len().max(1)];
        let count = self.epoll.wait(&mut events, EpollTimeout::ZERO)?;

        let ids: Vec<u64> = events[..count].iter().map(|e| e.data()).collect();
        for id in &ids {
            if let Some(semaphore) = self.registered.get(id) {
                semaphore.drain();
            }
        }
        trace!("wait port signaled by {:?}", ids);

        Ok(ids)
    }
}
