use std::cmp;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, error, trace, warn};
use slab::Slab;

use crate::buffer::{BufferAllocator, HeapAllocator};
use crate::channel::{now_millis, Channel};
use crate::config::{Config, FlushMode, Protocol};
use crate::event::{ChannelEvent, Dispatcher};
use crate::executor::{Executor, ThreadExecutor};
use crate::idle::{IdleTimer, NoopIdleTimer};
use crate::ready::Ready;
use crate::sys::{Epoll, Events};
use crate::token::Token;
use crate::transport::{TcpTransport, TransportIo, UdpTransport};
use crate::waker::Waker;

const SELECT_TIMEOUT: Duration = Duration::from_millis(1000);
const FLUSH_SPIN_COUNT: usize = 256;
const SPURIOUS_SELECT_THRESHOLD: Duration = Duration::from_millis(100);
const EVENTS_CAPACITY: usize = 1024;

const WAKER_TOKEN: Token = Token(usize::MAX);

static TCP_IO: TcpTransport = TcpTransport;
static UDP_IO: UdpTransport = UdpTransport;

/// Snapshot of the submission queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStats {
    pub new_channels: usize,
    pub flushing_channels: usize,
    pub closing_channels: usize,
}

/// A single-threaded event-loop worker multiplexing many byte channels
/// over one selector.
///
/// Submitters interact with the worker only through three lock-free queues
/// and the selector's wakeup; all I/O, interest changes and channel
/// bookkeeping happen on the worker thread. The worker starts lazily on the
/// first [`add`] and runs until [`shutdown`].
///
/// # Examples
///
/// ```no_run
/// use std::net::TcpStream;
///
/// use reactor_io::{Channel, ChannelEvent, Config, Processor};
///
/// let config = Config::default();
/// let processor = Processor::new(config.clone(), Box::new(|event: ChannelEvent| {
///     if let ChannelEvent::Read(_, payload) = event {
///         println!("got {} bytes", payload.len());
///     }
/// })).unwrap();
///
/// let stream = TcpStream::connect("127.0.0.1:12345").unwrap();
/// let channel = Channel::tcp(stream, &config).unwrap();
///
/// processor.add(&channel).unwrap();
/// ```
///
/// [`add`]: Processor::add
/// [`shutdown`]: Processor::shutdown
pub struct Processor {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    new_channels: ConcurrentQueue<Arc<Channel>>,
    flushing_channels: ConcurrentQueue<Arc<Channel>>,
    closing_channels: ConcurrentQueue<Arc<Channel>>,
    wake_called: AtomicBool,
    shutdown: AtomicBool,
    worker_started: AtomicBool,
    waker: Waker,
    dispatcher: Box<dyn Dispatcher>,
    idle_timer: Box<dyn IdleTimer>,
    executor: Box<dyn Executor>,
}

impl Processor {
    pub fn new(config: Config, dispatcher: Box<dyn Dispatcher>) -> io::Result<Processor> {
        Processor::with_collaborators(
            config,
            dispatcher,
            Box::new(NoopIdleTimer),
            Box::new(ThreadExecutor),
        )
    }

    pub fn with_collaborators(
        config: Config,
        dispatcher: Box<dyn Dispatcher>,
        idle_timer: Box<dyn IdleTimer>,
        executor: Box<dyn Executor>,
    ) -> io::Result<Processor> {
        Ok(Processor {
            shared: Arc::new(Shared {
                config,
                new_channels: ConcurrentQueue::unbounded(),
                flushing_channels: ConcurrentQueue::unbounded(),
                closing_channels: ConcurrentQueue::unbounded(),
                wake_called: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                worker_started: AtomicBool::new(false),
                waker: Waker::new()?,
                dispatcher,
                idle_timer,
                executor,
            }),
        })
    }

    /// Submits a channel for registration with the selector.
    ///
    /// Lazily starts the worker on first use. Thread-safe.
    pub fn add(&self, channel: &Arc<Channel>) -> io::Result<()> {
        self.check_running()?;

        if channel.protocol() != self.shared.config.protocol {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel protocol does not match processor protocol",
            ));
        }

        let _ = self.shared.new_channels.push(channel.clone());
        self.start_worker()?;
        self.shared.wakeup();

        Ok(())
    }

    /// Submits a channel for a write drain of its queued buffers.
    pub fn flush(&self, channel: &Arc<Channel>) -> io::Result<()> {
        self.check_running()?;

        self.shared.schedule_flush(channel);
        self.shared.wakeup();

        Ok(())
    }

    /// Schedules a channel for close and release.
    pub fn remove(&self, channel: &Arc<Channel>) -> io::Result<()> {
        self.check_running()?;

        self.shared.schedule_close(channel);
        self.shared.wakeup();

        Ok(())
    }

    /// Stops the worker after its current iteration.
    ///
    /// Every pending and registered channel is drained through the close
    /// path, so each receives its `Closed` event before the selector is
    /// released. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup();
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            new_channels: self.shared.new_channels.len(),
            flushing_channels: self.shared.flushing_channels.len(),
            closing_channels: self.shared.closing_channels.len(),
        }
    }

    fn check_running(&self) -> io::Result<()> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "processor is shut down",
            ));
        }

        Ok(())
    }

    fn start_worker(&self) -> io::Result<()> {
        if self
            .shared
            .worker_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let shared = self.shared.clone();

        self.shared.executor.execute(Box::new(move || {
            match Worker::new(shared) {
                Ok(mut worker) => worker.run(),
                Err(e) => error!("failed to start event loop: {}", e),
            }
        }))
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn wakeup(&self) {
        self.wake_called.store(true, Ordering::SeqCst);

        if let Err(e) = self.waker.wakeup() {
            warn!("failed to wake selector: {}", e);
        }
    }

    fn schedule_flush(&self, channel: &Arc<Channel>) {
        if channel.try_schedule_flush() {
            let _ = self.flushing_channels.push(channel.clone());
        }
    }

    fn schedule_close(&self, channel: &Arc<Channel>) {
        if channel.is_closing_or_closed() {
            return;
        }

        if channel.try_schedule_close() {
            let _ = self.closing_channels.push(channel.clone());
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        self.dispatcher.dispatch(event);
    }
}

/// The event-loop state owned by the worker thread.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    epoll: Epoll,
    events: Events,
    channels: Slab<Arc<Channel>>,
    udp_peers: IndexMap<(SocketAddr, SocketAddr), Arc<Channel>>,
    allocator: Box<dyn BufferAllocator>,
    io: &'static dyn TransportIo,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> io::Result<Worker> {
        let epoll = Epoll::new()?;
        epoll.add(shared.waker.as_raw_fd(), WAKER_TOKEN, Ready::readable())?;

        let io: &'static dyn TransportIo = match shared.config.protocol {
            Protocol::Tcp => &TCP_IO,
            Protocol::Udp => &UDP_IO,
        };

        Ok(Worker {
            shared,
            epoll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            channels: Slab::new(),
            udp_peers: IndexMap::new(),
            allocator: Box::new(HeapAllocator),
            io,
        })
    }

    fn run(&mut self) {
        debug!("event loop started");

        while !self.shared.shutdown.load(Ordering::SeqCst) {
            let start = Instant::now();

            match self.epoll.wait(&mut self.events, Some(SELECT_TIMEOUT)) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("selector wait failed: {}", e);
                    continue;
                }
            }

            let selected = self.drain_waker_events();

            // A 0-selection return well before the timeout without a wakeup
            // smells like a degenerate selector. Cancel broken channels, and
            // failing that rebuild the selector outright.
            if selected == 0
                && !self.shared.wake_called.swap(false, Ordering::SeqCst)
                && start.elapsed() < SPURIOUS_SELECT_THRESHOLD
            {
                if !self.cancel_broken_channels() {
                    self.rebuild_selector();
                }
            }

            self.flush_queued();
            self.register_queued();

            if selected > 0 {
                self.process_ready();
            }

            self.close_queued();
        }

        self.teardown();
    }

    /// Counts channel events in the last poll, draining the waker's
    /// eventfd if it fired.
    fn drain_waker_events(&self) -> usize {
        let mut selected = 0;

        for i in 0..self.events.len() {
            match self.events.get(i) {
                Some(event) if event.token() == WAKER_TOKEN => {
                    if let Err(e) = self.shared.waker.drain() {
                        warn!("failed to drain waker: {}", e);
                    }
                }
                Some(_) => selected += 1,
                None => break,
            }
        }

        selected
    }

    fn process_ready(&mut self) {
        for i in 0..self.events.len() {
            let event = match self.events.get(i) {
                Some(event) => event,
                None => break,
            };

            if event.token() == WAKER_TOKEN {
                continue;
            }

            let channel = match self.channels.get(usize::from(event.token())) {
                Some(channel) => channel.clone(),
                None => continue,
            };

            if channel.is_closing_or_closed() {
                continue;
            }

            let kind = event.readiness();

            if kind.is_readable() || kind.is_error() || kind.is_hup() {
                let io = self.io;

                if let Err(e) = io.read(self, &channel) {
                    warn!("read failed on {:?}: {}", channel, e);
                    self.shared
                        .dispatch(ChannelEvent::Thrown(channel.clone(), e));
                    self.shared.schedule_close(&channel);
                }
            }

            if kind.is_writable() {
                self.shared.schedule_flush(&channel);
            }
        }
    }

    fn flush_queued(&mut self) {
        // Bound the drain to what was queued when the phase began; a drain
        // that reschedules itself runs again on the next iteration, not now.
        let budget = cmp::min(self.shared.flushing_channels.len(), FLUSH_SPIN_COUNT);

        for _ in 0..budget {
            let channel = match self.shared.flushing_channels.pop() {
                Ok(channel) => channel,
                Err(_) => break,
            };

            self.flush_channel(&channel);
        }
    }

    fn flush_channel(&self, channel: &Arc<Channel>) {
        channel.unschedule_flush();

        if channel.is_closing_or_closed() {
            return;
        }

        self.clear_write_interest(channel);

        let result = match self.shared.config.flush_mode {
            FlushMode::OneOff => drain_one_off(channel, self.io, &*self.shared.dispatcher),
            FlushMode::Fair => drain_fair(channel, self.io, &*self.shared.dispatcher),
        };

        match result {
            // Not done yet: ask for writable readiness and queue another
            // drain for the next iteration.
            Ok(true) => {
                self.enable_write_interest(channel);
                self.shared.schedule_flush(channel);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("write failed on {:?}: {}", channel, e);
                self.shared
                    .dispatch(ChannelEvent::Thrown(channel.clone(), e));
                self.shared.schedule_close(channel);
            }
        }
    }

    fn clear_write_interest(&self, channel: &Arc<Channel>) {
        if let Some(token) = channel.token() {
            let mut interest = channel.interest();

            if interest.is_writable() {
                interest.remove(Ready::writable());

                if let Err(e) = self.epoll.modify(channel.as_raw_fd(), token, interest) {
                    warn!("failed to clear write interest on {:?}: {}", channel, e);
                    return;
                }

                channel.set_interest(interest);
            }
        }
    }

    fn enable_write_interest(&self, channel: &Arc<Channel>) {
        if let Some(token) = channel.token() {
            let mut interest = channel.interest();

            if !interest.is_writable() {
                interest.insert(Ready::writable());

                if let Err(e) = self.epoll.modify(channel.as_raw_fd(), token, interest) {
                    warn!("failed to set write interest on {:?}: {}", channel, e);
                    return;
                }

                channel.set_interest(interest);
            }
        }
    }

    fn register_queued(&mut self) {
        while let Ok(channel) = self.shared.new_channels.pop() {
            self.register_channel(channel);
        }
    }

    fn register_channel(&mut self, channel: Arc<Channel>) {
        if channel.is_closing_or_closed() {
            return;
        }

        let fd = channel.as_raw_fd();
        let key = self.channels.insert(channel.clone());
        let token = Token(key);
        let interest = Ready::readable();

        trace!("registering {:?} as {:?}", channel, token);

        if let Err(e) = self.epoll.add(fd, token, interest) {
            self.channels.remove(key);
            warn!("failed to register {:?}: {}", channel, e);
            self.shared
                .dispatch(ChannelEvent::Thrown(channel.clone(), e));
            self.shared.schedule_close(&channel);
            return;
        }

        channel.set_token(Some(token));
        channel.set_interest(interest);
        channel.set_open();
        channel.touch(now_millis());

        let io = self.io;
        io.on_register(self, &channel);

        self.shared.dispatch(ChannelEvent::Opened(channel.clone()));
        self.shared.idle_timer.add(&channel);
    }

    fn close_queued(&mut self) {
        while let Ok(channel) = self.shared.closing_channels.pop() {
            self.close_channel(channel);
        }
    }

    fn close_channel(&mut self, channel: Arc<Channel>) {
        self.shared.idle_timer.remove(&channel);

        if channel.is_closed() {
            return;
        }

        channel.set_closing();

        if let Some(token) = channel.token() {
            let key = usize::from(token);

            if self.channels.contains(key) {
                self.channels.remove(key);
            }

            if let Err(e) = self.epoll.delete(channel.as_raw_fd()) {
                trace!("failed to deregister {:?}: {}", channel, e);
            }

            channel.set_token(None);
        }

        if let Err(e) = channel.close_socket() {
            warn!("failed to close {:?}: {}", channel, e);
            self.shared
                .dispatch(ChannelEvent::Thrown(channel.clone(), e));
        }

        let io = self.io;
        io.on_close(self, &channel);

        channel.set_closed();

        trace!("closed {:?}", channel);

        self.shared.dispatch(ChannelEvent::Closed(channel));
    }

    /// Deregisters channels whose socket is no longer connected. Returns
    /// whether any were found.
    fn cancel_broken_channels(&mut self) -> bool {
        let broken: Vec<usize> = self
            .channels
            .iter()
            .filter(|(_, channel)| !channel.is_connected())
            .map(|(key, _)| key)
            .collect();

        for &key in &broken {
            let channel = self.channels.remove(key);

            warn!("cancelling broken {:?}", channel);

            if let Err(e) = self.epoll.delete(channel.as_raw_fd()) {
                trace!("failed to deregister {:?}: {}", channel, e);
            }

            channel.set_token(None);
            self.shared.schedule_close(&channel);
        }

        !broken.is_empty()
    }

    /// Swaps in a fresh selector, carrying over every registration with
    /// its token and interest set.
    fn rebuild_selector(&mut self) {
        warn!("rebuilding selector after suspected spurious wakeups");

        let epoll = match Epoll::new() {
            Ok(epoll) => epoll,
            Err(e) => {
                error!("failed to open replacement selector: {}", e);
                return;
            }
        };

        if let Err(e) = epoll.add(self.shared.waker.as_raw_fd(), WAKER_TOKEN, Ready::readable()) {
            error!("failed to carry waker to replacement selector: {}", e);
            return;
        }

        let mut failed = Vec::new();

        for (key, channel) in self.channels.iter() {
            if let Err(e) = epoll.add(channel.as_raw_fd(), Token(key), channel.interest()) {
                warn!("failed to carry {:?} to replacement selector: {}", channel, e);
                failed.push(key);
            }
        }

        for key in failed {
            let channel = self.channels.remove(key);
            channel.set_token(None);
            self.shared.schedule_close(&channel);
        }

        self.epoll = epoll;
    }

    fn teardown(&mut self) {
        debug!("event loop shutting down");

        while let Ok(channel) = self.shared.new_channels.pop() {
            self.shared.schedule_close(&channel);
        }

        while let Ok(channel) = self.shared.flushing_channels.pop() {
            channel.unschedule_flush();
            self.shared.schedule_close(&channel);
        }

        let registered: Vec<Arc<Channel>> =
            self.channels.iter().map(|(_, ch)| ch.clone()).collect();

        for channel in registered {
            self.shared.schedule_close(&channel);
        }

        self.close_queued();
    }

    pub(crate) fn dispatch(&self, event: ChannelEvent) {
        self.shared.dispatch(event);
    }

    pub(crate) fn schedule_close(&self, channel: &Arc<Channel>) {
        self.shared.schedule_close(channel);
    }

    pub(crate) fn allocate(&self, cap: usize) -> Vec<u8> {
        self.allocator.allocate(cap)
    }

    pub(crate) fn record_udp_peer(&mut self, channel: &Arc<Channel>, source: SocketAddr) {
        let key = (channel.local_addr(), source);

        if !self.udp_peers.contains_key(&key) {
            channel.set_remote_addr(source);
            self.udp_peers.insert(key, channel.clone());
        }
    }

    pub(crate) fn remove_udp_peer(&mut self, channel: &Channel) {
        if let Some(remote) = channel.remote_addr() {
            self.udp_peers.swap_remove(&(channel.local_addr(), remote));
        }
    }
}

/// Attempt the head buffer once. Returns whether the drain must be
/// rescheduled with write interest enabled.
fn drain_one_off(
    channel: &Arc<Channel>,
    io: &dyn TransportIo,
    dispatcher: &dyn Dispatcher,
) -> io::Result<bool> {
    // Dispatch outside the queue lock; a handler may enqueue more writes.
    let preview = match channel.outbound().lock().unwrap().front() {
        Some(head) => head.chunk().to_vec(),
        None => return Ok(false),
    };

    dispatcher.dispatch(ChannelEvent::Flush(channel.clone(), preview));

    let written = {
        let mut queue = channel.outbound().lock().unwrap();
        let head = match queue.front_mut() {
            Some(head) => head,
            None => return Ok(false),
        };

        let n = io.write(channel, head.chunk())?;
        head.advance(n);

        if n > 0 {
            channel.touch(now_millis());
        }

        if head.has_remaining() {
            return Ok(true);
        }

        queue.pop_front()
    };

    if let Some(buf) = written {
        dispatcher.dispatch(ChannelEvent::Written(channel.clone(), buf.into_payload()));
    }

    Ok(false)
}

/// Drain successive buffers under the per-channel byte cap. Returns
/// whether the drain must be rescheduled with write interest enabled.
fn drain_fair(
    channel: &Arc<Channel>,
    io: &dyn TransportIo,
    dispatcher: &dyn Dispatcher,
) -> io::Result<bool> {
    let cap = channel.max_write_chunk();

    let preview = match channel.outbound().lock().unwrap().front() {
        Some(head) => head.chunk_up_to(cap).to_vec(),
        None => return Ok(false),
    };

    dispatcher.dispatch(ChannelEvent::Flush(channel.clone(), preview));

    let mut written = 0;

    loop {
        let (buf, more) = {
            let mut queue = channel.outbound().lock().unwrap();
            let head = match queue.front_mut() {
                Some(head) => head,
                None => return Ok(false),
            };

            let quota = cap - written;
            let n = io.write(channel, head.chunk_up_to(quota))?;
            head.advance(n);
            written += n;

            if n == 0 {
                // Kernel send buffer is saturated.
                return Ok(true);
            }

            channel.touch(now_millis());

            if head.has_remaining() {
                // Yield after partial head progress, whether the quota was
                // the limiter or the kernel took less than offered.
                return Ok(true);
            }

            let buf = queue.pop_front().unwrap();
            let more = !queue.is_empty();

            (buf, more)
        };

        dispatcher.dispatch(ChannelEvent::Written(channel.clone(), buf.into_payload()));

        if written >= cap {
            return Ok(more);
        }
    }
}
