// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A [`Watchdog`] backed by a timer thread.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::decoder::Watchdog;

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    fired: bool,
    shutdown: bool,
}

type Shared = Arc<(Mutex<Timer>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Timer> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Calls `on_fire` from its own thread when it is not canceled in time.
///
/// The callback runs without the timer lock held, so it may take the device lock, which is in turn
/// held by whoever starts and cancels the watchdog. The thread is not joined: it exits on its own
/// once the watchdog is dropped.
pub struct ThreadWatchdog {
    shared: Shared,
    timeout: Duration,
}

impl ThreadWatchdog {
    pub fn new<F>(timeout: Duration, mut on_fire: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared: Shared = Default::default();
        let thread_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name("vp9-watchdog".into())
            .spawn(move || {
                let mut timer = lock(&thread_shared);
                loop {
                    if timer.shutdown {
                        return;
                    }

                    match timer.deadline {
                        None => {
                            timer = thread_shared
                                .1
                                .wait(timer)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                timer.deadline = None;
                                timer.fired = true;
                                drop(timer);

                                debug!("watchdog expired");
                                on_fire();
                                timer = lock(&thread_shared);
                            } else {
                                timer = thread_shared
                                    .1
                                    .wait_timeout(timer, deadline - now)
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .0;
                            }
                        }
                    }
                }
            })?;

        Ok(Self { shared, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Watchdog for ThreadWatchdog {
    fn start(&mut self) {
        let mut timer = lock(&self.shared);
        timer.deadline = Some(Instant::now() + self.timeout);
        timer.fired = false;
        self.shared.1.notify_one();
    }

    fn cancel(&mut self) {
        let mut timer = lock(&self.shared);
        // An expiry racing with the cancellation is stale.
        timer.deadline = None;
        timer.fired = false;
        self.shared.1.notify_one();
    }

    fn is_running(&self) -> bool {
        lock(&self.shared).deadline.is_some()
    }

    fn check_and_reset_timeout(&mut self) -> bool {
        std::mem::take(&mut lock(&self.shared).fired)
    }
}

impl Drop for ThreadWatchdog {
    fn drop(&mut self) {
        lock(&self.shared).shutdown = true;
        self.shared.1.notify_one();
    }
}
