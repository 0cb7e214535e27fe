//! Wire message variants and the derivation rules between them.
//!
//! The message set is a closed tagged union: request/response and
//! ping/pong are correlated pairs that flow backward along the original
//! path, publish fans out into one event per subscribing bus. Keeping
//! the union closed lets routing match exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use meridian_url::{parse_url, UrlError};

use crate::{MethodError, Protocol};

/// RPC argument list.
pub type Args = Vec<Value>;
/// RPC keyword arguments.
pub type Kwargs = Map<String, Value>;

/// Liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub id: u64,
    pub ts: u64,
    pub src: String,
    pub dst: String,
}

impl Ping {
    /// Derive the answer: addressing reversed, probe id preserved.
    pub fn pong(&self) -> Pong {
        Pong {
            id: self.id,
            ts: Protocol::timestamp(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            ok: true,
        }
    }

    /// Synthetic failed answer, used when the probe could not be satisfied
    /// (send failure, timeout). Built locally, never sent on the wire by
    /// the probed side.
    pub fn pong_failed(&self) -> Pong {
        Pong {
            ok: false,
            ..self.pong()
        }
    }
}

/// Liveness answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub id: u64,
    pub ts: u64,
    pub src: String,
    pub dst: String,
    pub ok: bool,
}

/// RPC call. `id` correlates with exactly one [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub ts: u64,
    pub src: String,
    pub dst: String,
    pub method: String,
    pub args: Args,
    pub kwargs: Kwargs,
}

impl Request {
    /// Successful answer carrying the method's return value.
    pub fn ok(&self, result: Value) -> Response {
        Response {
            id: self.id,
            ts: Protocol::timestamp(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            code: 200,
            result: Some(result),
            error: None,
        }
    }

    /// Answer for an unresolvable resource or method.
    pub fn not_found(&self, msg: impl Into<String>) -> Response {
        Response {
            id: self.id,
            ts: Protocol::timestamp(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            code: 404,
            result: None,
            error: Some(msg.into()),
        }
    }

    /// Answer for a method that failed. The error string embeds the error
    /// kind, message and captured trace; callers reconstruct remote
    /// failures from it.
    pub fn error(&self, error: &MethodError) -> Response {
        Response {
            id: self.id,
            ts: Protocol::timestamp(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            code: 500,
            result: None,
            error: Some(error.wire_format()),
        }
    }
}

/// RPC answer. `code` is HTTP-inspired: 200 ok, 404 not found, 500 error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ts: u64,
    pub src: String,
    pub dst: String,
    pub code: u16,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Registration of interest in an event. Routed to the publisher's bus.
///
/// `callback` is an opaque id distinguishing multiple subscriptions from
/// the same subscriber; the callable itself never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub ts: u64,
    #[serde(rename = "sub")]
    pub subscriber: String,
    #[serde(rename = "pub")]
    pub publisher: String,
    pub event: String,
    pub callback: u64,
}

/// Deregistration of interest. Same shape as [`Subscribe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub ts: u64,
    #[serde(rename = "sub")]
    pub subscriber: String,
    #[serde(rename = "pub")]
    pub publisher: String,
    pub event: String,
    pub callback: u64,
}

/// Fire-and-forget announcement, handled by the bus owning `publisher`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub ts: u64,
    #[serde(rename = "pub")]
    pub publisher: String,
    pub event: String,
    pub args: Args,
    pub kwargs: Kwargs,
}

impl Publish {
    /// Derive the per-subscriber-bus delivery. One event is produced per
    /// distinct destination bus that has at least one live subscriber.
    pub fn callback(&self, dst: impl Into<String>, event: impl Into<String>, args: Args, kwargs: Kwargs) -> Event {
        Event {
            ts: Protocol::timestamp(),
            src: self.publisher.clone(),
            dst: dst.into(),
            event: event.into(),
            args,
            kwargs,
        }
    }
}

/// Per-subscriber-bus delivery derived from a [`Publish`]. `src` is the
/// publisher's full address; `dst` is a bus string, not a full path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: u64,
    pub src: String,
    pub dst: String,
    pub event: String,
    pub args: Args,
    pub kwargs: Kwargs,
}

/// The closed set of wire messages, tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    Request(Request),
    Response(Response),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Publish(Publish),
    Event(Event),
}

impl Message {
    /// Canonical bus string of the destination, used as the routing key.
    ///
    /// Subscribe/unsubscribe route to the publisher's bus, where the
    /// publisher-side subscriber table lives. Publish is always handled by
    /// the bus owning the publisher. An event's `dst` is already a bus
    /// string and passes through unparsed.
    pub fn dst_bus(&self) -> Result<String, UrlError> {
        match self {
            Message::Ping(m) => Ok(parse_url(&m.dst)?.bus),
            Message::Pong(m) => Ok(parse_url(&m.dst)?.bus),
            Message::Request(m) => Ok(parse_url(&m.dst)?.bus),
            Message::Response(m) => Ok(parse_url(&m.dst)?.bus),
            Message::Subscribe(m) => Ok(parse_url(&m.publisher)?.bus),
            Message::Unsubscribe(m) => Ok(parse_url(&m.publisher)?.bus),
            Message::Publish(m) => Ok(parse_url(&m.publisher)?.bus),
            Message::Event(m) => Ok(m.dst.clone()),
        }
    }

    /// Variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Subscribe(_) => "subscribe",
            Message::Unsubscribe(_) => "unsubscribe",
            Message::Publish(_) => "publish",
            Message::Event(_) => "event",
        }
    }
}
