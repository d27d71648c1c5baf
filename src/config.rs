/// Transport protocol a processor instance is fixed to at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// How queued writes are drained on each flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Attempt only the head buffer, once per flush attempt.
    OneOff,
    /// Drain successive buffers under the per-channel byte cap, so one
    /// busy channel cannot monopolize the loop.
    Fair,
}

/// Processor configuration.
///
/// The protocol and flush mode are fixed for the processor's lifetime; the
/// buffer bounds seed every channel's read-size predictor.
#[derive(Debug, Clone)]
pub struct Config {
    pub protocol: Protocol,
    pub flush_mode: FlushMode,
    /// Lower bound for read allocations.
    pub min_read_buffer_size: usize,
    /// Initial read allocation.
    pub read_buffer_size: usize,
    /// Upper bound for read allocations.
    pub max_read_buffer_size: usize,
    /// Per-channel byte cap for one fair flush attempt.
    pub max_write_chunk: usize,
}

impl Config {
    pub fn new(protocol: Protocol) -> Config {
        Config {
            protocol,
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            protocol: Protocol::Tcp,
            flush_mode: FlushMode::Fair,
            min_read_buffer_size: 64,
            read_buffer_size: 2048,
            max_read_buffer_size: 65536,
            max_write_chunk: 32768,
        }
    }
}
