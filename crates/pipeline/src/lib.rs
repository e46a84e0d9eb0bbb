//! Consume pipe: the dispatch entry point for typed messages.
//!
//! Consumers are connected per message type and every message is delivered
//! to all of them in registration order. Pipe-wide [`Filter`]s wrap the
//! dispatch, and consumers can publish further messages through the
//! [`Publisher`] carried by their [`ConsumeContext`].

pub mod consumer;
pub mod context;
pub mod error;
pub mod filter;
pub mod message;
pub mod outbox;
pub mod pipe;
pub mod publisher;

pub use consumer::{BoxError, Consumer, HandlerConsumer};
pub use context::{ConsumeContext, ReceiveContext};
pub use error::{PipeError, Result};
pub use filter::{ConcurrencyLimitFilter, Filter, Next};
pub use message::{Headers, Message, Published};
pub use outbox::InMemoryOutbox;
pub use pipe::{ConnectHandle, ConsumePipe};
pub use publisher::{DiscardPublisher, LoopbackPublisher, Publisher, RecordingPublisher};
