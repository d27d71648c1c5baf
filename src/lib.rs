//! A reactor-based non-blocking I/O engine.
//!
//! One worker thread owns one selector and multiplexes many TCP or UDP
//! byte channels over it: readiness polling, adaptive-size reads, fair
//! write draining with backpressure, and close reclamation all run on the
//! loop, while any thread may submit channels, flushes and removals.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reactor-io = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpListener;
//!
//! use reactor_io::{Channel, ChannelEvent, Config, Processor};
//!
//! let config = Config::default();
//!
//! // Events arrive on the worker thread.
//! let processor = Processor::new(config.clone(), Box::new(|event: ChannelEvent| {
//!     match event {
//!         ChannelEvent::Opened(channel) => println!("opened {:?}", channel),
//!         ChannelEvent::Read(channel, payload) => {
//!             println!("{:?}: {} bytes in", channel, payload.len());
//!         }
//!         ChannelEvent::Closed(channel) => println!("closed {:?}", channel),
//!         _ => {}
//!     }
//! })).unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:13265").unwrap();
//!
//! loop {
//!     let (stream, _) = listener.accept().unwrap();
//!     let channel = Channel::tcp(stream, &config).unwrap();
//!
//!     processor.add(&channel).unwrap();
//! }
//! ```

mod buffer;
mod channel;
mod config;
mod event;
mod executor;
mod idle;
mod predictor;
mod processor;
mod ready;
mod sys;
mod token;
mod transport;
mod waker;

pub use channel::{Channel, ChannelState};

pub use config::{Config, FlushMode, Protocol};

pub use event::{ChannelEvent, Dispatcher};

pub use executor::{Executor, ThreadExecutor};

pub use idle::{IdleTimer, NoopIdleTimer};

pub use predictor::SizePredictor;

pub use processor::{Processor, ProcessorStats};

pub use ready::Ready;

pub use token::Token;
