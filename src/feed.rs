// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns the client's input items into decode units.
//!
//! Each stream gets an [`InputFeed`]. Client items are queued under a lock that never waits on the
//! hardware, and a worker thread hands them to the [`VideoDevice`] one decode unit at a time: a
//! superframe is split into its sub-frames, and the next unit is only written once the decoder
//! asked for more input. End of stream is signaled in-band, by a tiny keyframe of an otherwise
//! impossible size followed by padding that pushes it through the core.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
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
use thiserror::Error;

use crate::codec::vp9::end_of_stream_frame;
use crate::codec::vp9::header::peek_keyframe_size;
use crate::codec::vp9::superframe::split_superframe;
use crate::decoder::pts::PtsMark;
use crate::decoder::vp9::Vp9DecoderConfig;
use crate::decoder::DecoderCallbacks;
use crate::decoder::DecoderClient;
use crate::decoder::DecoderError;
use crate::decoder::FrameDataProvider;
use crate::decoder::Watchdog;
use crate::device::DeviceError;
use crate::device::VideoDevice;
use crate::scheduler::atom::Connection;
use crate::scheduler::atom::ConnectionId;

/// Something the client wants decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputItem {
    /// Out-of-band codec configuration. VP9 carries everything in-band, so this is skipped.
    FormatDetails(Vec<u8>),
    Packet {
        data: Vec<u8>,
        timestamp: Option<u64>,
    },
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Running,
    /// The stream hit an error. Nothing more is fed until the feed is stopped.
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Zero bytes written after the end-of-stream frame to flush it through the core.
    pub eos_padding: usize,
    /// Drop packets after a stream reset until one starts with a keyframe.
    pub skip_to_keyframe_after_reset: bool,
    /// Priority of the stream's decode units, or the device default.
    pub priority: Option<i32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            eos_padding: 0x4000,
            skip_to_keyframe_after_reset: true,
            priority: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to create the feed event: {0}")]
    Event(Errno),
    #[error("failed to start the feed worker: {0}")]
    Thread(std::io::Error),
    #[error("feed is not running: {0:?}")]
    NotRunning(FeedState),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A decode unit ready to be written to the stream ring.
#[derive(Debug)]
struct Unit {
    data: Vec<u8>,
    mark: Option<PtsMark>,
}

/// Client-facing state. Never held while the device lock is taken.
#[derive(Debug)]
struct FeedShared {
    queue: VecDeque<InputItem>,
    /// Units left from the item being consumed.
    pending: VecDeque<Unit>,
    input_requested: bool,
    reset_requested: bool,
    awaiting_keyframe: bool,
    state: FeedState,
}

impl FeedShared {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pending: VecDeque::new(),
            // A new decoder waits for its first unit without asking.
            input_requested: true,
            reset_requested: false,
            awaiting_keyframe: false,
            state: FeedState::Running,
        }
    }
}

type Shared = Arc<Mutex<FeedShared>>;

fn lock(shared: &Shared) -> MutexGuard<'_, FeedShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify(event: &EventFd) {
    if let Err(e) = event.write(1) {
        error!("failed to wake up the feed worker: {}", e);
    }
}

/// The decoder's view of the feed. Only flips flags and wakes the worker, so it is safe to call
/// with the device lock held.
struct FeedProvider {
    shared: Shared,
    event: Arc<EventFd>,
}

impl FrameDataProvider for FeedProvider {
    fn read_more_input_data(&mut self) {
        lock(&self.shared).input_requested = true;
        notify(&self.event);
    }

    fn async_reset_stream_after_current_frame(&mut self) {
        lock(&self.shared).reset_requested = true;
        notify(&self.event);
    }
}

/// What the worker does next, decided under the feed lock and carried out without it.
enum Action {
    Idle,
    Reset,
    Queue(Unit),
    Fail(DecoderError),
}

/// Feeds one stream of a [`VideoDevice`].
pub struct InputFeed {
    device: Arc<VideoDevice>,
    id: ConnectionId,
    shared: Shared,
    event: Arc<EventFd>,
    worker: Option<JoinHandle<()>>,
    stopped: bool,
}

impl InputFeed {
    /// Creates the decoder instance of `connection` and starts feeding it.
    ///
    /// `watchdog` is normally the one [`VideoDevice::watchdog_for`] builds for `connection`.
    pub fn start(
        device: Arc<VideoDevice>,
        connection: Arc<Connection>,
        decoder_config: Vp9DecoderConfig,
        client: Box<dyn DecoderClient>,
        watchdog: Box<dyn Watchdog>,
        config: FeedConfig,
    ) -> Result<Self, FeedError> {
        let (mut feed, worker) =
            Self::create(device, connection, decoder_config, client, watchdog, config)?;

        let handle = thread::Builder::new()
            .name(format!("vp9-feed-{}", feed.id))
            .spawn(move || worker.run())
            .map_err(FeedError::Thread);
        match handle {
            Ok(handle) => feed.worker = Some(handle),
            Err(e) => {
                feed.stop();
                return Err(e);
            }
        }

        Ok(feed)
    }

    /// Creates the instance and the worker, without running the latter.
    fn create(
        device: Arc<VideoDevice>,
        connection: Arc<Connection>,
        decoder_config: Vp9DecoderConfig,
        client: Box<dyn DecoderClient>,
        watchdog: Box<dyn Watchdog>,
        config: FeedConfig,
    ) -> Result<(Self, FeedWorker), FeedError> {
        let event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                .map_err(FeedError::Event)?,
        );
        let shared: Shared = Arc::new(Mutex::new(FeedShared::new()));
        let id = connection.id();

        let callbacks = DecoderCallbacks {
            client,
            provider: Box::new(FeedProvider {
                shared: Arc::clone(&shared),
                event: Arc::clone(&event),
            }),
            watchdog,
        };
        device.create_instance(connection, decoder_config, callbacks, config.priority)?;

        let worker = FeedWorker {
            device: Arc::clone(&device),
            id,
            shared: Arc::clone(&shared),
            event: Arc::clone(&event),
            config,
        };
        let feed = Self {
            device,
            id,
            shared,
            event,
            worker: None,
            stopped: false,
        };

        Ok((feed, worker))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> FeedState {
        lock(&self.shared).state
    }

    pub fn queue_input(&self, item: InputItem) -> Result<(), FeedError> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != FeedState::Running {
                return Err(FeedError::NotRunning(shared.state));
            }
            shared.queue.push_back(item);
        }
        notify(&self.event);

        Ok(())
    }

    /// Stops the worker, removes the decoder instance and returns the items it did not get to.
    ///
    /// Blocks until the worker is done with the unit it may be writing.
    pub fn stop(&mut self) -> Vec<InputItem> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;

        lock(&self.shared).state = FeedState::Stopped;
        notify(&self.event);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("feed worker of instance {} panicked", self.id);
            }
        }

        if let Err(e) = self.device.remove_instance(self.id) {
            warn!("failed to remove decoder instance {}: {}", self.id, e);
        }

        let mut shared = lock(&self.shared);
        shared.pending.clear();
        let items: Vec<InputItem> = shared.queue.drain(..).collect();
        debug!("feed {} stopped with {} items left", self.id, items.len());

        items
    }
}

impl Drop for InputFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedWorker {
    device: Arc<VideoDevice>,
    id: ConnectionId,
    shared: Shared,
    event: Arc<EventFd>,
    config: FeedConfig,
}

impl FeedWorker {
    fn run(mut self) {
        let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
            Ok(epoll) => epoll,
            Err(e) => {
                error!("failed to create the feed epoll: {}", e);
                lock(&self.shared).state = FeedState::Failed;
                return;
            }
        };
        if let Err(e) = epoll.add(self.event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1)) {
            error!("failed to watch the feed event: {}", e);
            lock(&self.shared).state = FeedState::Failed;
            return;
        }

        loop {
            while self.run_once() {}

            if lock(&self.shared).state != FeedState::Running {
                break;
            }

            let mut events = [EpollEvent::empty()];
            match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(_) | Err(Errno::EINTR) => (),
                Err(e) => {
                    error!("feed {} failed to wait: {}", self.id, e);
                    lock(&self.shared).state = FeedState::Failed;
                    break;
                }
            }
            match self.event.read() {
                Ok(_) | Err(Errno::EAGAIN) => (),
                Err(e) => error!("failed to read the feed event: {}", e),
            }
        }

        debug!("feed worker {} exiting", self.id);
    }

    /// Does one step of work. Returns whether there may be more to do right away.
    fn run_once(&mut self) -> bool {
        match self.next_action() {
            Action::Idle => false,
            Action::Reset => {
                debug!("resetting stream {}", self.id);
                match self.device.reset_instance(self.id) {
                    Ok(()) => {
                        let mut shared = lock(&self.shared);
                        shared.pending.clear();
                        shared.input_requested = true;
                        shared.awaiting_keyframe = self.config.skip_to_keyframe_after_reset;
                        true
                    }
                    Err(e) => {
                        error!("failed to reset stream {}: {}", self.id, e);
                        lock(&self.shared).state = FeedState::Failed;
                        false
                    }
                }
            }
            Action::Queue(unit) => {
                trace!("feeding {} bytes to stream {}", unit.data.len(), self.id);
                match self.device.queue_decode_unit(self.id, &unit.data, unit.mark) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("failed to queue a unit on stream {}: {}", self.id, e);
                        lock(&self.shared).state = FeedState::Failed;
                        if let DeviceError::Decoder(e) = e {
                            self.fail(e);
                        }
                        false
                    }
                }
            }
            Action::Fail(e) => {
                lock(&self.shared).state = FeedState::Failed;
                self.fail(e);
                false
            }
        }
    }

    fn fail(&self, error: DecoderError) {
        if let Err(e) = self.device.fail_instance(self.id, error) {
            warn!("failed to report error on stream {}: {}", self.id, e);
        }
    }

    fn next_action(&self) -> Action {
        let mut shared = lock(&self.shared);
        if shared.state != FeedState::Running {
            return Action::Idle;
        }
        if std::mem::take(&mut shared.reset_requested) {
            return Action::Reset;
        }
        if !shared.input_requested {
            return Action::Idle;
        }

        loop {
            if let Some(unit) = shared.pending.pop_front() {
                shared.input_requested = false;
                return Action::Queue(unit);
            }

            let Some(item) = shared.queue.pop_front() else {
                return Action::Idle;
            };

            let units = match item {
                InputItem::FormatDetails(details) => {
                    debug!("skipping {} bytes of format details", details.len());
                    continue;
                }
                InputItem::Packet { data, timestamp } => {
                    if shared.awaiting_keyframe {
                        if peek_keyframe_size(&data).is_none() {
                            debug!("dropping packet {:?} until the next keyframe", timestamp);
                            continue;
                        }
                        shared.awaiting_keyframe = false;
                    }

                    split_units(&data, timestamp.map(PtsMark::Timestamp))
                }
                InputItem::EndOfStream => {
                    debug!("end of stream on {}", self.id);
                    split_units(end_of_stream_frame(), Some(PtsMark::EndOfStream)).map(
                        |mut units| {
                            if let Some(last) = units.last_mut() {
                                last.data.resize(last.data.len() + self.config.eos_padding, 0);
                            }
                            units
                        },
                    )
                }
            };

            match units {
                Ok(units) => shared.pending.extend(units),
                Err(e) => return Action::Fail(e),
            }
        }
    }
}

/// Splits `data` into decode units. Only the first one carries `mark`, the others belong to the
/// same packet.
fn split_units(data: &[u8], mark: Option<PtsMark>) -> Result<Vec<Unit>, DecoderError> {
    let mut output = Vec::new();
    let mut sizes = Vec::new();
    split_superframe(data, &mut output, Some(&mut sizes))?;

    let mut units = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for (i, size) in sizes.into_iter().enumerate() {
        let end = offset + size as usize;
        units.push(Unit {
            data: output[offset..end].to_vec(),
            mark: if i == 0 { mark } else { None },
        });
        offset = end;
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummyHardware;
    use crate::backend::dummy::HwOp;
    use crate::backend::Vp9Status;
    use crate::codec::vp9::superframe::SUBFRAME_HEADER_SIZE;
    use crate::decoder::tests::Recorder;

    struct Fixture {
        device: Arc<VideoDevice>,
        hw: DummyHardware,
        recorder: Recorder,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let hw = DummyHardware::new();
        let device = VideoDevice::new(
            Box::new(hw.clone()),
            Box::new(DummyAllocator::default()),
            Default::default(),
        )
        .unwrap();

        Fixture {
            device: Arc::new(device),
            hw,
            recorder: Recorder::default(),
        }
    }

    impl Fixture {
        fn feed(&self, config: FeedConfig) -> (InputFeed, FeedWorker) {
            InputFeed::create(
                Arc::clone(&self.device),
                Connection::new(1),
                Default::default(),
                Box::new(self.recorder.clone()),
                Box::new(self.recorder.clone()),
                config,
            )
            .unwrap()
        }

        fn fed(&self, len: usize) -> usize {
            self.hw
                .count(&HwOp::AddDecodeSize((len + SUBFRAME_HEADER_SIZE) as u32))
        }

        fn unit_consumed(&self) {
            self.hw.raise(Vp9Status::NalDecodeDone);
            self.device.handle_interrupt();
        }
    }

    fn packet(len: usize, timestamp: u64) -> InputItem {
        // An inter frame: frame marker, profile 0, not shown existing, non-key.
        let mut data = vec![0u8; len];
        data[0] = 0x84;
        InputItem::Packet {
            data,
            timestamp: Some(timestamp),
        }
    }

    fn superframe(sizes: &[u8]) -> Vec<u8> {
        let mut data: Vec<u8> = sizes
            .iter()
            .flat_map(|&size| {
                let mut frame = vec![0u8; size as usize];
                frame[0] = 0x84;
                frame
            })
            .collect();
        let marker = 0xc0 | (sizes.len() as u8 - 1);
        data.push(marker);
        data.extend_from_slice(sizes);
        data.push(marker);
        data
    }

    #[test]
    fn feeds_one_unit_per_request() {
        let f = fixture();
        let (feed, mut worker) = f.feed(Default::default());

        feed.queue_input(packet(100, 0)).unwrap();
        feed.queue_input(packet(120, 1)).unwrap();

        assert!(worker.run_once());
        assert!(!worker.run_once());
        assert_eq!(f.fed(100), 1);
        assert_eq!(f.fed(120), 0);

        f.unit_consumed();
        assert!(worker.run_once());
        assert_eq!(f.fed(120), 1);
        assert!(!worker.run_once());
    }

    #[test]
    fn superframe_is_drained_before_next_item() {
        let f = fixture();
        let (feed, mut worker) = f.feed(Default::default());

        feed.queue_input(InputItem::Packet {
            data: superframe(&[40, 30]),
            timestamp: Some(5),
        })
        .unwrap();
        feed.queue_input(packet(50, 6)).unwrap();

        assert!(worker.run_once());
        assert_eq!(f.fed(40), 1);
        assert_eq!(lock(&feed.shared).pending.len(), 1);
        assert_eq!(lock(&feed.shared).queue.len(), 1);

        f.unit_consumed();
        worker.run_once();
        assert_eq!(f.fed(30), 1);
        assert_eq!(f.fed(50), 0);

        f.unit_consumed();
        worker.run_once();
        assert_eq!(f.fed(50), 1);
        let shared = lock(&feed.shared);
        assert!(shared.pending.is_empty() && shared.queue.is_empty());
    }

    #[test]
    fn end_of_stream_is_sentinel_and_padding() {
        let f = fixture();
        let (feed, mut worker) = f.feed(FeedConfig {
            eos_padding: 64,
            ..Default::default()
        });

        feed.queue_input(InputItem::FormatDetails(vec![1, 2, 3]))
            .unwrap();
        feed.queue_input(InputItem::EndOfStream).unwrap();
        assert!(worker.run_once());

        assert_eq!(f.fed(end_of_stream_frame().len() + 64), 1);
    }

    #[test]
    fn malformed_superframe_fails_the_stream() {
        let f = fixture();
        let (feed, mut worker) = f.feed(Default::default());

        feed.queue_input(InputItem::Packet {
            data: vec![0xc1, 50, 50, 0xc1],
            timestamp: None,
        })
        .unwrap();
        assert!(!worker.run_once());

        assert_eq!(feed.state(), FeedState::Failed);
        assert_eq!(f.recorder.get().errors.len(), 1);
        assert!(matches!(
            feed.queue_input(packet(10, 0)),
            Err(FeedError::NotRunning(FeedState::Failed))
        ));
    }

    #[test]
    fn reset_skips_to_next_keyframe() {
        let f = fixture();
        let (feed, mut worker) = f.feed(Default::default());
        let mut provider = FeedProvider {
            shared: Arc::clone(&feed.shared),
            event: Arc::clone(&feed.event),
        };

        provider.async_reset_stream_after_current_frame();
        feed.queue_input(packet(20, 0)).unwrap();
        feed.queue_input(InputItem::Packet {
            data: end_of_stream_frame().to_vec(),
            timestamp: Some(1),
        })
        .unwrap();
        feed.queue_input(packet(24, 2)).unwrap();

        assert!(worker.run_once(), "reset");
        assert!(worker.run_once());
        assert_eq!(f.fed(20), 0);
        assert_eq!(f.fed(end_of_stream_frame().len()), 1);

        // Once a keyframe went through, inter frames are fed again.
        f.unit_consumed();
        worker.run_once();
        assert_eq!(f.fed(24), 1);
    }

    #[test]
    fn reset_without_skipping_keeps_packets() {
        let f = fixture();
        let (feed, mut worker) = f.feed(FeedConfig {
            skip_to_keyframe_after_reset: false,
            ..Default::default()
        });
        let mut provider = FeedProvider {
            shared: Arc::clone(&feed.shared),
            event: Arc::clone(&feed.event),
        };

        provider.async_reset_stream_after_current_frame();
        feed.queue_input(packet(20, 0)).unwrap();

        assert!(worker.run_once());
        assert!(worker.run_once());
        assert_eq!(f.fed(20), 1);
    }

    #[test]
    fn stop_returns_unconsumed_items() {
        let f = fixture();
        let mut feed = InputFeed::start(
            Arc::clone(&f.device),
            Connection::new(1),
            Default::default(),
            Box::new(f.recorder.clone()),
            Box::new(f.device.watchdog_for(1, Duration::from_secs(5)).unwrap()),
            Default::default(),
        )
        .unwrap();

        feed.queue_input(packet(100, 0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.fed(100) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.fed(100), 1);

        feed.queue_input(packet(10, 1)).unwrap();
        feed.queue_input(InputItem::EndOfStream).unwrap();

        let items = feed.stop();
        assert_eq!(items, vec![packet(10, 1), InputItem::EndOfStream]);
        assert_eq!(feed.state(), FeedState::Stopped);
        assert_eq!(
            f.device.with_hardware_lock(|state| state.instance_count()),
            0
        );
        assert!(feed.stop().is_empty());
    }
}
