use std::io;
use std::sync::Arc;

use crate::channel::Channel;

/// Events the processor emits about a channel's lifecycle and I/O.
///
/// `Read` payloads are copies of the received bytes; they never alias the
/// loop's internal read buffer, so handlers may keep or mutate them freely.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel was registered with the selector.
    Opened(Arc<Channel>),
    /// Bytes arrived on the channel.
    Read(Arc<Channel>, Vec<u8>),
    /// A flush attempt is starting on the head of the write queue.
    Flush(Arc<Channel>, Vec<u8>),
    /// A queued buffer was fully transmitted.
    Written(Arc<Channel>, Vec<u8>),
    /// An error surfaced while operating on the channel.
    Thrown(Arc<Channel>, io::Error),
    /// The channel was closed and released.
    Closed(Arc<Channel>),
}

/// Fans channel events out to user code.
///
/// Called on the worker thread; an implementation that must not block the
/// loop should hand events to its own executor. Implementations must not
/// panic, since a panic unwinds the worker.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, event: ChannelEvent);
}

impl<F> Dispatcher for F
where
    F: Fn(ChannelEvent) + Send + Sync,
{
    fn dispatch(&self, event: ChannelEvent) {
        self(event)
    }
}
