use std::io;
use std::sync::Arc;

use crate::channel::{now_millis, Channel};
use crate::event::ChannelEvent;
use crate::processor::Worker;

/// Protocol-specific I/O, selected once when the processor is built.
///
/// The event loop never branches on protocol; it calls through whichever
/// strategy its configuration picked.
pub(crate) trait TransportIo: Send + Sync {
    /// Hook invoked right after a channel is registered for readiness.
    fn on_register(&self, _worker: &mut Worker, _channel: &Arc<Channel>) {}

    /// Drain readable bytes and dispatch them.
    fn read(&self, worker: &mut Worker, channel: &Arc<Channel>) -> io::Result<()>;

    /// Transmit as much of `chunk` as the kernel will take right now.
    /// Returns 0 when the send buffer is saturated.
    fn write(&self, channel: &Channel, chunk: &[u8]) -> io::Result<usize>;

    /// Hook invoked while a channel is being released.
    fn on_close(&self, _worker: &mut Worker, _channel: &Channel) {}
}

pub(crate) struct TcpTransport;

impl TransportIo for TcpTransport {
    fn read(&self, worker: &mut Worker, channel: &Arc<Channel>) -> io::Result<()> {
        channel.touch(now_millis());

        let cap = channel.predictor().lock().unwrap().next();
        let mut buf = worker.allocate(cap);

        let mut total = 0;
        let mut eof = false;

        loop {
            match channel.read_tcp(&mut buf[total..]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if total > 0 {
            channel.predictor().lock().unwrap().previous(total);

            // Hand user code its own copy; `buf` goes back to the allocator.
            worker.dispatch(ChannelEvent::Read(channel.clone(), buf[..total].to_vec()));
        }

        if eof {
            worker.schedule_close(channel);
        }

        Ok(())
    }

    fn write(&self, channel: &Channel, chunk: &[u8]) -> io::Result<usize> {
        match channel.write_tcp(chunk) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

pub(crate) struct UdpTransport;

impl TransportIo for UdpTransport {
    fn on_register(&self, worker: &mut Worker, channel: &Arc<Channel>) {
        if let Some(remote) = channel.remote_addr() {
            worker.record_udp_peer(channel, remote);
        }
    }

    fn read(&self, worker: &mut Worker, channel: &Arc<Channel>) -> io::Result<()> {
        channel.touch(now_millis());

        let cap = channel.predictor().lock().unwrap().next();
        let mut buf = worker.allocate(cap);

        match channel.recv_udp(&mut buf) {
            Ok((n, source)) => {
                worker.record_udp_peer(channel, source);
                worker.dispatch(ChannelEvent::Read(channel.clone(), buf[..n].to_vec()));

                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn write(&self, channel: &Channel, chunk: &[u8]) -> io::Result<usize> {
        let remote = channel.remote_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no remote address recorded")
        })?;

        match channel.send_udp(chunk, remote) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn on_close(&self, worker: &mut Worker, channel: &Channel) {
        worker.remove_udp_peer(channel);
    }
}
