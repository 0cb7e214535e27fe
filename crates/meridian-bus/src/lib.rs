//! Per-process message broker.
//!
//! Every process embeds one [`Bus`]: it serves request/response RPC for
//! local resources, fans published events out to remote subscribers, and
//! answers liveness pings, all over the pluggable transports of
//! `meridian-transport`. Destinations are meridian urls; the bus string
//! prefix decides whether a message stays local or crosses a transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use meridian_bus::{Bus, NullResolver};
//!
//! # async fn demo() -> Result<(), meridian_bus::BusError> {
//! let bus = Bus::bind("inproc://demo", Arc::new(NullResolver)).await?;
//! let runner = bus.clone();
//! tokio::spawn(async move { runner.run().await });
//! bus.wait_started().await;
//!
//! let pong = bus.ping("inproc://demo/Client/0", bus.url().url().as_str()).await?;
//! assert!(pong.ok);
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bus;
mod error;
mod resolver;
mod subscription;

pub use bus::{Bus, DEFAULT_PING_TIMEOUT};
pub use error::BusError;
pub use resolver::{MethodFn, NullResolver, Resolution, Resolver};
pub use subscription::{
    Callback, CallbackId, CallbackTable, EventCallback, EventId, Subscriber, SubscriberTable,
};

pub use meridian_protocol::{
    Args, Event, Kwargs, Message, MethodError, Ping, Pong, Protocol, Publish, Request, Response,
    Subscribe, Unsubscribe,
};
pub use meridian_url::{parse_url, Url, UrlError};
