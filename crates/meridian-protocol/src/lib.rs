//! Wire protocol for the meridian bus.
//!
//! Defines the closed set of message variants, the factory functions that
//! construct them, and the derivation rules that build one message kind
//! from another (request to response, ping to pong, publish to event)
//! while preserving backward-flow addressing.

pub mod codec;
mod message;

use std::backtrace::Backtrace;
use std::time::Instant;

use once_cell::sync::Lazy;
use thiserror::Error;

pub use codec::CodecError;
pub use message::{
    Args, Event, Kwargs, Message, Ping, Pong, Publish, Request, Response, Subscribe, Unsubscribe,
};

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Failure of an invoked method, carried back to the caller inside a 500
/// [`Response`].
///
/// The trace is captured at construction so the caller can render remote
/// diagnostics; [`MethodError::wire_format`] is the string contract several
/// call sites rely on.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct MethodError {
    pub kind: String,
    pub message: String,
    trace: String,
}

impl MethodError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Backtrace::force_capture().to_string(),
        }
    }

    /// `"{kind}: {message} (traceback={trace})"`.
    pub fn wire_format(&self) -> String {
        format!("{}: {} (traceback={})", self.kind, self.message, self.trace)
    }
}

/// Message factory. Stateless; stamps fresh timestamps and correlation ids.
pub struct Protocol;

impl Protocol {
    /// Process-local random correlation id in `[0, 2^32)`. Collisions are
    /// accepted; this is best-effort correlation, not cryptography.
    pub fn id() -> u64 {
        u64::from(rand::random::<u32>())
    }

    /// Monotonically non-decreasing nanosecond timestamp.
    pub fn timestamp() -> u64 {
        START.elapsed().as_nanos() as u64
    }

    pub fn ping(src: impl Into<String>, dst: impl Into<String>) -> Ping {
        Ping {
            id: Self::id(),
            ts: Self::timestamp(),
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn request(
        src: impl Into<String>,
        dst: impl Into<String>,
        method: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Request {
        Request {
            id: Self::id(),
            ts: Self::timestamp(),
            src: src.into(),
            dst: dst.into(),
            method: method.into(),
            args,
            kwargs,
        }
    }

    pub fn subscribe(
        sub: impl Into<String>,
        publisher: impl Into<String>,
        event: impl Into<String>,
        callback: u64,
    ) -> Subscribe {
        Subscribe {
            ts: Self::timestamp(),
            subscriber: sub.into(),
            publisher: publisher.into(),
            event: event.into(),
            callback,
        }
    }

    pub fn unsubscribe(
        sub: impl Into<String>,
        publisher: impl Into<String>,
        event: impl Into<String>,
        callback: u64,
    ) -> Unsubscribe {
        Unsubscribe {
            ts: Self::timestamp(),
            subscriber: sub.into(),
            publisher: publisher.into(),
            event: event.into(),
            callback,
        }
    }

    pub fn publish(
        publisher: impl Into<String>,
        event: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Publish {
        Publish {
            ts: Self::timestamp(),
            publisher: publisher.into(),
            event: event.into(),
            args,
            kwargs,
        }
    }

    /// Standalone 500 response, used when the request itself could not be
    /// decoded or routed and no [`Request`] exists to derive from.
    pub fn error(src: impl Into<String>, dst: impl Into<String>, error: &MethodError) -> Response {
        Response {
            id: Self::id(),
            ts: Self::timestamp(),
            src: src.into(),
            dst: dst.into(),
            code: 500,
            result: None,
            error: Some(error.wire_format()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src() -> String {
        "tcp://host1:1234/Telescope/instance1".to_string()
    }

    fn dst() -> String {
        "tcp://host2:5678/Camera/instance2".to_string()
    }

    #[test]
    fn id_is_in_range_and_varies() {
        let id1 = Protocol::id();
        let id2 = Protocol::id();

        assert!(id1 < (1 << 32));
        assert!(id2 < (1 << 32));
        // collision is possible but astronomically unlikely
        assert_ne!(id1, id2);
    }

    #[test]
    fn timestamps_never_decrease() {
        let ts1 = Protocol::timestamp();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let ts2 = Protocol::timestamp();
        assert!(ts2 > ts1);
    }

    #[test]
    fn ping_pong_flows_backward() {
        let ping = Protocol::ping(src(), dst());
        let pong = ping.pong();

        assert_eq!(pong.src, ping.dst);
        assert_eq!(pong.dst, ping.src);
        assert_eq!(pong.id, ping.id);
        assert!(pong.ok);

        let failed = ping.pong_failed();
        assert_eq!(failed.id, ping.id);
        assert!(!failed.ok);
    }

    #[test]
    fn request_ok_flows_backward() {
        let request = Protocol::request(src(), dst(), "get_position", vec![], Kwargs::new());
        let result = json!({"ra": 10.5, "dec": -30.2});
        let response = request.ok(result.clone());

        assert_eq!(response.id, request.id);
        assert_eq!(response.src, request.dst);
        assert_eq!(response.dst, request.src);
        assert_eq!(response.code, 200);
        assert_eq!(response.result, Some(result));
        assert_eq!(response.error, None);
    }

    #[test]
    fn request_error_embeds_kind_message_and_traceback() {
        let request = Protocol::request(src(), dst(), "get_position", vec![], Kwargs::new());
        let error = MethodError::new("ValueError", "Position not available");
        let response = request.error(&error);

        assert_eq!(response.id, request.id);
        assert_eq!(response.src, request.dst);
        assert_eq!(response.dst, request.src);
        assert_eq!(response.code, 500);
        assert_eq!(response.result, None);

        let text = response.error.unwrap();
        assert!(text.contains("ValueError"));
        assert!(text.contains("Position not available"));
        assert!(text.contains("traceback="));
    }

    #[test]
    fn request_not_found_flows_backward() {
        let request = Protocol::request(src(), dst(), "get_nonexistent", vec![], Kwargs::new());
        let response = request.not_found("'Camera.get_nonexistent' not found");

        assert_eq!(response.id, request.id);
        assert_eq!(response.src, request.dst);
        assert_eq!(response.dst, request.src);
        assert_eq!(response.code, 404);
        assert_eq!(response.result, None);
        assert_eq!(
            response.error.as_deref(),
            Some("'Camera.get_nonexistent' not found")
        );
    }

    #[test]
    fn standalone_error_response() {
        let error = MethodError::new("RuntimeError", "Something went wrong");
        let response = Protocol::error(src(), dst(), &error);

        assert_eq!(response.src, src());
        assert_eq!(response.dst, dst());
        assert_eq!(response.code, 500);
        assert_eq!(response.result, None);

        let text = response.error.unwrap();
        assert!(text.contains("RuntimeError: Something went wrong"));
        assert!(text.contains("traceback="));
    }

    #[test]
    fn publish_derives_one_event_per_destination() {
        let publish = Protocol::publish(
            src(),
            "observation_complete",
            vec![json!("NGC1234")],
            Kwargs::new(),
        );

        let event = publish.callback(
            "tcp://host3:9012",
            &publish.event,
            publish.args.clone(),
            publish.kwargs.clone(),
        );

        assert_eq!(event.src, publish.publisher);
        assert_eq!(event.dst, "tcp://host3:9012");
        assert_eq!(event.event, publish.event);
        assert_eq!(event.args, publish.args);
        assert_eq!(event.kwargs, publish.kwargs);
    }

    #[test]
    fn subscribe_and_unsubscribe_share_identity_fields() {
        let subscribe = Protocol::subscribe(dst(), src(), "filter_changed", 99);
        let unsubscribe = Protocol::unsubscribe(dst(), src(), "filter_changed", 99);

        assert_eq!(subscribe.subscriber, dst());
        assert_eq!(subscribe.publisher, src());
        assert_eq!(subscribe.event, unsubscribe.event);
        assert_eq!(subscribe.callback, unsubscribe.callback);
    }

    #[test]
    fn routing_key_is_the_destination_bus() {
        let request = Protocol::request(src(), dst(), "m", vec![], Kwargs::new());
        assert_eq!(
            Message::Request(request).dst_bus().unwrap(),
            "tcp://host2:5678"
        );

        // subscriptions are routed to the publisher's bus
        let subscribe = Protocol::subscribe(dst(), src(), "done", 1);
        assert_eq!(
            Message::Subscribe(subscribe).dst_bus().unwrap(),
            "tcp://host1:1234"
        );

        // an event's dst is already a bus string
        let publish = Protocol::publish(src(), "done", vec![], Kwargs::new());
        let event = publish.callback("inproc://A", "done", vec![], Kwargs::new());
        assert_eq!(Message::Event(event).dst_bus().unwrap(), "inproc://A");
    }
}
