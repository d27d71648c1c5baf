use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::buffer::WriteBuf;
use crate::config::{Config, Protocol};
use crate::predictor::SizePredictor;
use crate::ready::Ready;
use crate::token::Token;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

const NO_TOKEN: usize = usize::MAX;

const STATE_NEW: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Lifecycle of a channel. Transitions only move forward; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Socket {
    Tcp(net::TcpStream),
    Udp(net::UdpSocket),
}

/// A byte channel multiplexed by a [`Processor`].
///
/// Any thread may enqueue writes via [`write`] and submit the channel to
/// its processor; all I/O, interest changes and state bookkeeping happen on
/// the processor's worker thread.
///
/// # Examples
///
/// ```no_run
/// use std::net::TcpStream;
///
/// use reactor_io::{Channel, Config};
///
/// let config = Config::default();
/// let stream = TcpStream::connect("127.0.0.1:12345").unwrap();
/// let channel = Channel::tcp(stream, &config).unwrap();
///
/// channel.write(b"ping".to_vec()).unwrap();
/// ```
///
/// [`Processor`]: crate::Processor
/// [`write`]: Channel::write
pub struct Channel {
    id: usize,
    socket: Socket,
    token: AtomicUsize,
    interest: AtomicU8,
    state: AtomicU8,
    outbound: Mutex<VecDeque<WriteBuf>>,
    flush_scheduled: AtomicBool,
    close_scheduled: AtomicBool,
    predictor: Mutex<SizePredictor>,
    max_write_chunk: usize,
    last_io_ms: AtomicU64,
    local_addr: SocketAddr,
    remote_addr: Mutex<Option<SocketAddr>>,
}

impl Channel {
    /// Wraps a TCP stream, switching it to non-blocking mode.
    pub fn tcp(stream: net::TcpStream, config: &Config) -> io::Result<Arc<Channel>> {
        stream.set_nonblocking(true)?;

        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr().ok();

        Ok(Arc::new(Channel::new(
            Socket::Tcp(stream),
            local_addr,
            remote_addr,
            config,
        )))
    }

    /// Wraps a UDP socket, switching it to non-blocking mode.
    ///
    /// `remote` may be deferred: a server-side channel learns its remote
    /// from the first datagram it receives.
    pub fn udp(
        socket: net::UdpSocket,
        remote: Option<SocketAddr>,
        config: &Config,
    ) -> io::Result<Arc<Channel>> {
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Arc::new(Channel::new(
            Socket::Udp(socket),
            local_addr,
            remote,
            config,
        )))
    }

    fn new(
        socket: Socket,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        config: &Config,
    ) -> Channel {
        Channel {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            socket,
            token: AtomicUsize::new(NO_TOKEN),
            interest: AtomicU8::new(Ready::empty().bits()),
            state: AtomicU8::new(STATE_NEW),
            outbound: Mutex::new(VecDeque::new()),
            flush_scheduled: AtomicBool::new(false),
            close_scheduled: AtomicBool::new(false),
            predictor: Mutex::new(SizePredictor::new(
                config.min_read_buffer_size,
                config.read_buffer_size,
                config.max_read_buffer_size,
            )),
            max_write_chunk: config.max_write_chunk,
            last_io_ms: AtomicU64::new(now_millis()),
            local_addr,
            remote_addr: Mutex::new(remote_addr),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().unwrap()
    }

    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().unwrap() = Some(addr);
    }

    pub fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Acquire) {
            STATE_NEW => ChannelState::New,
            STATE_OPEN => ChannelState::Open,
            STATE_CLOSING => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSING
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    pub(crate) fn is_closing_or_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_CLOSING
    }

    pub(crate) fn set_open(&self) {
        self.state.fetch_max(STATE_OPEN, Ordering::AcqRel);
    }

    pub(crate) fn set_closing(&self) {
        self.state.fetch_max(STATE_CLOSING, Ordering::AcqRel);
    }

    pub(crate) fn set_closed(&self) {
        self.state.fetch_max(STATE_CLOSED, Ordering::AcqRel);
    }

    /// Appends a payload to the write queue.
    ///
    /// The bytes are not transmitted until the channel is flushed through
    /// its processor.
    pub fn write(&self, payload: Vec<u8>) -> io::Result<()> {
        if self.is_closing_or_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is closing or closed",
            ));
        }

        self.outbound
            .lock()
            .unwrap()
            .push_back(WriteBuf::new(payload));

        Ok(())
    }

    /// Number of buffers waiting for transmission.
    pub fn pending_writes(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub(crate) fn outbound(&self) -> &Mutex<VecDeque<WriteBuf>> {
        &self.outbound
    }

    /// Flip the flush ticket; the caller that wins enqueues the channel.
    pub(crate) fn try_schedule_flush(&self) -> bool {
        self.flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unschedule_flush(&self) {
        self.flush_scheduled.store(false, Ordering::Release);
    }

    /// Flip the close ticket; the caller that wins enqueues the channel.
    /// Never unset: close is terminal.
    pub(crate) fn try_schedule_close(&self) -> bool {
        self.close_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn token(&self) -> Option<Token> {
        match self.token.load(Ordering::Acquire) {
            NO_TOKEN => None,
            raw => Some(Token(raw)),
        }
    }

    pub(crate) fn set_token(&self, token: Option<Token>) {
        self.token
            .store(token.map(usize::from).unwrap_or(NO_TOKEN), Ordering::Release);
    }

    pub(crate) fn interest(&self) -> Ready {
        Ready::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_interest(&self, interest: Ready) {
        self.interest.store(interest.bits(), Ordering::Release);
    }

    pub(crate) fn predictor(&self) -> &Mutex<SizePredictor> {
        &self.predictor
    }

    pub(crate) fn max_write_chunk(&self) -> usize {
        self.max_write_chunk
    }

    /// Milliseconds since the Unix epoch of the last read or write.
    pub fn last_io_ms(&self) -> u64 {
        self.last_io_ms.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_io_ms.store(now_ms, Ordering::Release);
    }

    pub(crate) fn protocol(&self) -> Protocol {
        match self.socket {
            Socket::Tcp(_) => Protocol::Tcp,
            Socket::Udp(_) => Protocol::Udp,
        }
    }

    pub(crate) fn read_tcp(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.socket {
            Socket::Tcp(stream) => {
                let mut stream = stream;
                stream.read(buf)
            }
            Socket::Udp(_) => Err(not_a(Protocol::Tcp)),
        }
    }

    pub(crate) fn write_tcp(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.socket {
            Socket::Tcp(stream) => {
                let mut stream = stream;
                stream.write(buf)
            }
            Socket::Udp(_) => Err(not_a(Protocol::Tcp)),
        }
    }

    pub(crate) fn recv_udp(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &self.socket {
            Socket::Udp(socket) => socket.recv_from(buf),
            Socket::Tcp(_) => Err(not_a(Protocol::Udp)),
        }
    }

    pub(crate) fn send_udp(&self, buf: &[u8], remote: SocketAddr) -> io::Result<usize> {
        match &self.socket {
            Socket::Udp(socket) => socket.send_to(buf, remote),
            Socket::Tcp(_) => Err(not_a(Protocol::Udp)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        match &self.socket {
            Socket::Tcp(stream) => stream.peer_addr().is_ok(),
            Socket::Udp(_) => true,
        }
    }

    /// Release the transport. The fd itself is reclaimed when the last
    /// owner of the channel drops.
    pub(crate) fn close_socket(&self) -> io::Result<()> {
        match &self.socket {
            Socket::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Socket::Udp(_) => Ok(()),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        match &self.socket {
            Socket::Tcp(stream) => stream.as_raw_fd(),
            Socket::Udp(socket) => socket.as_raw_fd(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

fn not_a(protocol: Protocol) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("not a {:?} channel", protocol),
    )
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod test {
    use std::net;

    use super::{Channel, ChannelState};
    use crate::config::Config;

    fn udp_channel() -> std::sync::Arc<Channel> {
        let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
        Channel::udp(socket, None, &Config::default()).unwrap()
    }

    #[test]
    fn state_is_monotone() {
        let channel = udp_channel();
        assert_eq!(ChannelState::New, channel.state());

        channel.set_open();
        assert_eq!(ChannelState::Open, channel.state());

        channel.set_closed();
        channel.set_open();
        assert_eq!(ChannelState::Closed, channel.state());
    }

    #[test]
    fn flush_ticket_is_single_entry() {
        let channel = udp_channel();

        assert!(channel.try_schedule_flush());
        assert!(!channel.try_schedule_flush());

        channel.unschedule_flush();
        assert!(channel.try_schedule_flush());
    }

    #[test]
    fn close_ticket_is_single_entry() {
        let channel = udp_channel();

        assert!(channel.try_schedule_close());
        assert!(!channel.try_schedule_close());
    }

    #[test]
    fn write_after_close_is_rejected() {
        let channel = udp_channel();
        channel.set_closing();

        assert!(channel.write(vec![1, 2, 3]).is_err());
        assert_eq!(0, channel.pending_writes());
    }

    #[test]
    fn writes_queue_in_order() {
        let channel = udp_channel();

        channel.write(vec![1]).unwrap();
        channel.write(vec![2]).unwrap();

        let mut queue = channel.outbound().lock().unwrap();
        assert_eq!(&[1], queue.pop_front().unwrap().chunk());
        assert_eq!(&[2], queue.pop_front().unwrap().chunk());
    }
}
