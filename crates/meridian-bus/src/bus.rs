//! The bus runtime: dispatch loop, queue processor and client surface.
//!
//! One [`Bus`] owns one inbound transport and a table of per-destination
//! reply queues. The dispatch loop decodes inbound frames and routes them
//! with [`Bus::push`]; a queue processor drains the bus's own queue and
//! hands each message to its handler. Callers block on their reply queue,
//! so shutdown must wake them: closing every queue's send side disconnects
//! all blocked readers deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use meridian_protocol::codec;
use meridian_protocol::{
    Args, Event, Kwargs, Message, MethodError, Ping, Pong, Protocol, Publish, Request, Response,
    Subscribe, Unsubscribe,
};
use meridian_transport::{create_transport, Transport};
use meridian_url::{parse_url, Url};

use crate::error::BusError;
use crate::resolver::{Resolution, Resolver};
use crate::subscription::{
    Callback, CallbackId, CallbackTable, EventCallback, EventId, Subscriber, SubscriberTable,
};

/// How long [`Bus::ping`] waits before reporting the peer unreachable.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

type ReplyQueue = (flume::Sender<Message>, flume::Receiver<Message>);

struct Inner {
    url: Url,
    resolver: Arc<dyn Resolver>,

    started: AtomicBool,
    running: AtomicBool,
    shutting_down: AtomicBool,
    started_tx: watch::Sender<bool>,
    cancel: CancellationToken,

    /// Reply queues keyed by destination url (the bus's own url for the
    /// dispatch queue, a caller's url for its responses). Clearing this
    /// map drops every send side, which disconnects all cloned readers.
    queues: dashmap::DashMap<String, ReplyQueue>,

    callbacks: CallbackTable,
    subscribers: SubscriberTable,

    /// Taken by the dispatch loop for its lifetime; `Some` only before
    /// `run` and after a shutdown that never ran.
    inbound: Mutex<Option<Box<dyn Transport>>>,
    /// Connected transports to remote buses, keyed by bus string. Grows
    /// with the set of peers and is only torn down at shutdown.
    outbound: Mutex<HashMap<String, Box<dyn Transport>>>,

    processor: StdMutex<Option<JoinHandle<()>>>,
}

/// A per-process message broker endpoint.
///
/// Cheaply cloneable handle; all clones share one underlying bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Bind a bus at `endpoint` (a bus string such as `tcp://host:port`
    /// or `inproc://name`). The bus claims a unique identity under the
    /// endpoint by appending a random `/Bus/<hex>` path.
    pub async fn bind(endpoint: &str, resolver: Arc<dyn Resolver>) -> Result<Self, BusError> {
        // names may not start with a digit, so anchor the random hex
        let url = parse_url(&format!("{endpoint}/Bus/b{}", Uuid::new_v4().simple()))?;

        let mut inbound = create_transport(&url.bus)?;
        inbound.bind().await?;
        info!("bus {url}: bound");

        let (started_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                resolver,
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                started_tx,
                cancel: CancellationToken::new(),
                queues: dashmap::DashMap::new(),
                callbacks: CallbackTable::default(),
                subscribers: SubscriberTable::default(),
                inbound: Mutex::new(Some(inbound)),
                outbound: Mutex::new(HashMap::new()),
                processor: StdMutex::new(None),
            }),
        })
    }

    /// The bus's own url, `<endpoint>/Bus/<hex>`.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// True once the bus has started and later stopped. A dead bus never
    /// comes back; bind a new one.
    pub fn is_dead(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.running.load(Ordering::SeqCst)
    }

    /// Resolves once the dispatch loop is accepting traffic. Call after
    /// spawning [`Bus::run`] to avoid racing the first push.
    pub async fn wait_started(&self) {
        let mut rx = self.inner.started_tx.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    // ------------------------------------------------------------------
    // dispatch loop

    /// Run the dispatch loop until shutdown. Decoded inbound frames are
    /// re-routed through [`Bus::push`]; frames that fail to decode are
    /// logged and dropped so one bad peer cannot take the loop down.
    pub async fn run(&self) -> Result<(), BusError> {
        let result = self.dispatch().await;
        if matches!(result, Err(BusError::AlreadyRunning)) {
            return result;
        }
        if let Err(e) = &result {
            error!("bus {}: dispatch loop failed: {e}", self.inner.url);
        }
        self.shutdown().await;
        result
    }

    /// [`Bus::run`], additionally shutting down on ctrl-c.
    pub async fn run_forever(&self) -> Result<(), BusError> {
        tokio::select! {
            result = self.run() => result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("bus {}: interrupt listener failed: {e}", self.inner.url);
                }
                info!("bus {}: interrupted", self.inner.url);
                self.shutdown().await;
                Ok(())
            }
        }
    }

    async fn dispatch(&self) -> Result<(), BusError> {
        let mut inbound = match self.inner.inbound.lock().await.take() {
            Some(transport) => transport,
            None => return Err(BusError::AlreadyRunning),
        };

        self.inner.running.store(true, Ordering::SeqCst);
        let processor = tokio::spawn(Self::process_queue(self.clone()));
        if let Ok(mut slot) = self.inner.processor.lock() {
            *slot = Some(processor);
        }
        self.inner.started.store(true, Ordering::SeqCst);
        let _ = self.inner.started_tx.send(true);
        debug!("bus {}: dispatch loop started", self.inner.url);

        let result = loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    debug!("bus {}: shutdown requested", self.inner.url);
                    break Ok(());
                }
                frame = inbound.recv() => match frame {
                    Ok(bytes) => match codec::decode(&bytes) {
                        Ok(message) => {
                            if let Err(e) = self.push(message).await {
                                warn!("bus {}: failed to route inbound message: {e}", self.inner.url);
                            }
                        }
                        Err(e) => {
                            error!("bus {}: dropping undecodable frame: {e}", self.inner.url);
                        }
                    },
                    Err(e) => {
                        if self.inner.running.load(Ordering::SeqCst) {
                            break Err(BusError::Transport(e));
                        }
                        break Ok(());
                    }
                },
            }
        };

        let _ = inbound.close().await;
        result
    }

    /// Drains the bus's own queue, handing each message to its handler.
    /// Request and ping handlers run on their own tasks so a slow method
    /// never stalls dispatch; subscription table updates stay inline to
    /// preserve subscribe-before-publish ordering.
    async fn process_queue(bus: Bus) {
        let rx = bus.queue(&bus.inner.url.url());
        while let Ok(message) = rx.recv_async().await {
            let worker = bus.clone();
            match message {
                Message::Ping(ping) => {
                    tokio::spawn(async move { worker.handle_ping(ping).await });
                }
                Message::Request(request) => {
                    tokio::spawn(async move { worker.handle_request(request).await });
                }
                Message::Publish(publish) => {
                    tokio::spawn(async move { worker.handle_publish(publish).await });
                }
                Message::Subscribe(subscribe) => worker.handle_subscribe(subscribe),
                Message::Unsubscribe(unsubscribe) => worker.handle_unsubscribe(unsubscribe),
                Message::Event(event) => worker.handle_event(event),
                other => {
                    warn!("bus {}: misrouted {} on the dispatch queue", bus.inner.url, other.kind());
                }
            }
        }
        debug!("bus {}: queue processor exiting", bus.inner.url);

        // the processor must not await a shutdown that joins the
        // processor's own task
        let trailing = bus.clone();
        tokio::spawn(async move { trailing.shutdown().await });
    }

    // ------------------------------------------------------------------
    // routing

    /// Route one message: to a local queue when its destination bus is
    /// this bus, over an outbound transport otherwise. Responses and
    /// pongs land on their caller's reply queue; everything else local
    /// lands on the dispatch queue.
    pub async fn push(&self, message: Message) -> Result<(), BusError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) || self.is_dead() {
            warn!("bus {}: dropping {} pushed after shutdown", self.inner.url, message.kind());
            return Err(BusError::BusDead);
        }

        let dst_bus = message.dst_bus()?;
        if dst_bus == self.inner.url.bus {
            let key = match &message {
                Message::Response(m) => m.dst.clone(),
                Message::Pong(m) => m.dst.clone(),
                _ => self.inner.url.url(),
            };
            self.enqueue(&key, message);
            Ok(())
        } else {
            match self.send_remote(&dst_bus, &message).await {
                Ok(()) => Ok(()),
                Err(e) => self.recover_remote_failure(message, e),
            }
        }
    }

    async fn send_remote(&self, dst_bus: &str, message: &Message) -> Result<(), BusError> {
        let bytes = codec::encode(message)?;

        let mut outbound = self.inner.outbound.lock().await;
        if let Some(transport) = outbound.get_mut(dst_bus) {
            transport.send(&bytes).await?;
            return Ok(());
        }

        let mut transport = create_transport(dst_bus)?;
        transport.connect().await?;
        transport.send(&bytes).await?;
        outbound.insert(dst_bus.to_string(), transport);
        debug!("bus {}: connected to {dst_bus}", self.inner.url);
        Ok(())
    }

    /// A failed remote send must not leave a caller blocked forever on
    /// its reply queue. Requests get a synthetic 500, pings a failed
    /// pong; fire-and-forget kinds surface the error to the pusher.
    fn recover_remote_failure(&self, message: Message, error: BusError) -> Result<(), BusError> {
        match message {
            Message::Request(request) => {
                warn!(
                    "bus {}: remote send of request {} failed, answering 500: {error}",
                    self.inner.url, request.id
                );
                let failure = MethodError::new("TransportError", error.to_string());
                let response = request.error(&failure);
                let key = response.dst.clone();
                self.enqueue(&key, Message::Response(response));
                Ok(())
            }
            Message::Ping(ping) => {
                warn!(
                    "bus {}: remote send of ping {} failed, answering failed pong: {error}",
                    self.inner.url, ping.id
                );
                let pong = ping.pong_failed();
                let key = pong.dst.clone();
                self.enqueue(&key, Message::Pong(pong));
                Ok(())
            }
            other => {
                warn!(
                    "bus {}: remote send of {} failed: {error}",
                    self.inner.url,
                    other.kind()
                );
                Err(error)
            }
        }
    }

    fn queue(&self, key: &str) -> flume::Receiver<Message> {
        let entry = self
            .inner
            .queues
            .entry(key.to_string())
            .or_insert_with(flume::unbounded);
        entry.1.clone()
    }

    fn enqueue(&self, key: &str, message: Message) {
        let tx = {
            let entry = self
                .inner
                .queues
                .entry(key.to_string())
                .or_insert_with(flume::unbounded);
            entry.0.clone()
        };
        if tx.send(message).is_err() {
            warn!("bus {}: reply queue '{key}' is closed, dropping message", self.inner.url);
        }
    }

    /// Wait for the next message addressed to `key`. Returns `None` once
    /// the bus shuts down, whether the queue was closed or never fed.
    async fn pop(&self, key: &str) -> Option<Message> {
        let rx = self.queue(key);
        tokio::select! {
            _ = self.inner.cancel.cancelled() => None,
            message = rx.recv_async() => message.ok(),
        }
    }

    // ------------------------------------------------------------------
    // client surface

    /// Probe `dst` for liveness on behalf of `src`, waiting up to
    /// [`DEFAULT_PING_TIMEOUT`]. An unreachable or silent peer yields
    /// `Pong { ok: false }`, not an error.
    pub async fn ping(&self, src: &str, dst: &str) -> Result<Pong, BusError> {
        self.ping_timeout(src, dst, DEFAULT_PING_TIMEOUT).await
    }

    pub async fn ping_timeout(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Pong, BusError> {
        let src = parse_url(src)?.url();
        let dst = parse_url(dst)?.url();
        let ping = Protocol::ping(src.clone(), dst);
        let probe = ping.clone();

        self.push(Message::Ping(ping)).await?;
        match tokio::time::timeout(timeout, self.pop(&src)).await {
            Err(_) => Ok(probe.pong_failed()),
            Ok(Some(Message::Pong(pong))) => Ok(pong),
            Ok(Some(other)) => Err(BusError::Unexpected(other.kind())),
            Ok(None) => Err(BusError::BusDead),
        }
    }

    /// Invoke `method` on the resource at `dst` on behalf of `src` and
    /// wait for the response. Blocks until the response arrives or the
    /// bus dies; use [`Bus::request_timeout`] for a bounded wait.
    pub async fn request(
        &self,
        src: &str,
        dst: &str,
        method: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<Response, BusError> {
        let (key, request) = self.build_request(src, dst, method, args, kwargs)?;
        self.push(Message::Request(request)).await?;
        match self.pop(&key).await {
            Some(Message::Response(response)) => Ok(response),
            Some(other) => Err(BusError::Unexpected(other.kind())),
            None => Err(BusError::BusDead),
        }
    }

    pub async fn request_timeout(
        &self,
        src: &str,
        dst: &str,
        method: &str,
        args: Args,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Response, BusError> {
        let (key, request) = self.build_request(src, dst, method, args, kwargs)?;
        self.push(Message::Request(request)).await?;
        match tokio::time::timeout(timeout, self.pop(&key)).await {
            Err(_) => Err(BusError::Timeout(timeout)),
            Ok(Some(Message::Response(response))) => Ok(response),
            Ok(Some(other)) => Err(BusError::Unexpected(other.kind())),
            Ok(None) => Err(BusError::BusDead),
        }
    }

    fn build_request(
        &self,
        src: &str,
        dst: &str,
        method: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<(String, Request), BusError> {
        let src = parse_url(src)?.url();
        let dst = parse_url(dst)?.url();
        let request = Protocol::request(src.clone(), dst, method, args, kwargs);
        Ok((src, request))
    }

    /// Subscribe `callback` to `event` published by the resource at
    /// `publisher`, on behalf of the local resource at `subscriber`. The
    /// callable is registered locally before the registration message is
    /// routed, so an event racing the subscription still finds it.
    pub async fn subscribe(
        &self,
        subscriber: &str,
        publisher: &str,
        event: &str,
        callback: EventCallback,
    ) -> Result<(), BusError> {
        let sub_url = parse_url(subscriber)?;
        let pub_url = parse_url(publisher)?.url();
        let id = CallbackId::of(&callback);

        self.inner.callbacks.insert(
            EventId::new(&pub_url, event),
            Subscriber { url: sub_url.clone(), callback: id },
            Callback { id, callable: callback },
        );
        self.push(Message::Subscribe(Protocol::subscribe(
            sub_url.url(),
            pub_url,
            event,
            id.as_u64(),
        )))
        .await
    }

    /// Remove a subscription previously made with the same callback
    /// `Arc`. A clone of the original `Arc` identifies the registration;
    /// a freshly built closure will not match.
    pub async fn unsubscribe(
        &self,
        subscriber: &str,
        publisher: &str,
        event: &str,
        callback: &EventCallback,
    ) -> Result<(), BusError> {
        let sub_url = parse_url(subscriber)?;
        let pub_url = parse_url(publisher)?.url();
        let id = CallbackId::of(callback);

        self.inner.callbacks.remove(
            &EventId::new(&pub_url, event),
            &Subscriber { url: sub_url.clone(), callback: id },
        );
        self.push(Message::Unsubscribe(Protocol::unsubscribe(
            sub_url.url(),
            pub_url,
            event,
            id.as_u64(),
        )))
        .await
    }

    /// Announce `event` from the resource at `publisher`. Fire and
    /// forget; delivery happens on the publisher's bus.
    pub async fn publish(
        &self,
        publisher: &str,
        event: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<(), BusError> {
        let pub_url = parse_url(publisher)?.url();
        self.push(Message::Publish(Protocol::publish(pub_url, event, args, kwargs)))
            .await
    }

    /// Locally registered callbacks for an event, for introspection.
    pub fn callbacks(&self, event: &EventId) -> Vec<Callback> {
        self.inner.callbacks.get(event)
    }

    /// Remote subscribers registered against a local publisher.
    pub fn subscribers(&self, event: &EventId) -> Vec<Subscriber> {
        self.inner.subscribers.get(event)
    }

    // ------------------------------------------------------------------
    // handlers

    async fn handle_ping(&self, ping: Ping) {
        let pong = ping.pong();
        if let Err(e) = self.push(Message::Pong(pong)).await {
            error!("bus {}: failed to answer ping {}: {e}", self.inner.url, ping.id);
        }
    }

    async fn handle_request(&self, request: Request) {
        if let Err(e) = self.answer_request(&request).await {
            error!("bus {}: failed to answer request {}: {e}", self.inner.url, request.id);
        }
    }

    async fn answer_request(&self, request: &Request) -> Result<(), BusError> {
        let dst = parse_url(&request.dst)?;
        let response = match self.inner.resolver.resolve(&dst.path, &request.method) {
            Resolution::ResourceNotFound => {
                request.not_found(format!("'{}' not found", dst.cls))
            }
            Resolution::MethodNotFound => {
                request.not_found(format!("'{}.{}' not found", dst.cls, request.method))
            }
            Resolution::Found(method) => {
                match method(request.args.clone(), request.kwargs.clone()) {
                    Ok(result) => request.ok(result),
                    Err(failure) => request.error(&failure),
                }
            }
        };
        self.push(Message::Response(response)).await
    }

    fn handle_subscribe(&self, message: Subscribe) {
        match parse_url(&message.subscriber) {
            Ok(url) => {
                debug!(
                    "bus {}: subscriber {} registered for {}#{}",
                    self.inner.url, message.subscriber, message.publisher, message.event
                );
                self.inner.subscribers.insert(
                    EventId::new(&message.publisher, &message.event),
                    Subscriber { url, callback: CallbackId::from_wire(message.callback) },
                );
            }
            Err(e) => {
                error!("bus {}: dropping subscribe with bad subscriber url: {e}", self.inner.url);
            }
        }
    }

    fn handle_unsubscribe(&self, message: Unsubscribe) {
        match parse_url(&message.subscriber) {
            Ok(url) => {
                self.inner.subscribers.remove(
                    &EventId::new(&message.publisher, &message.event),
                    &Subscriber { url, callback: CallbackId::from_wire(message.callback) },
                );
            }
            Err(e) => {
                error!("bus {}: dropping unsubscribe with bad subscriber url: {e}", self.inner.url);
            }
        }
    }

    /// Fan a publish out into one event per distinct subscriber bus.
    async fn handle_publish(&self, message: Publish) {
        let event_id = EventId::new(&message.publisher, &message.event);
        let subscribers = self.inner.subscribers.get(&event_id);
        if subscribers.is_empty() {
            return;
        }

        let buses: HashSet<String> =
            subscribers.iter().map(|s| s.url.bus.clone()).collect();
        for bus in buses {
            let event = message.callback(
                bus,
                &message.event,
                message.args.clone(),
                message.kwargs.clone(),
            );
            if let Err(e) = self.push(Message::Event(event)).await {
                error!("bus {}: failed to deliver {}: {e}", self.inner.url, event_id);
            }
        }
    }

    /// Run every matching local callback. Each runs on its own task, so
    /// a panicking callback cannot take the processor down.
    fn handle_event(&self, event: Event) {
        let event_id = EventId::new(&event.src, &event.event);
        for callback in self.inner.callbacks.get(&event_id) {
            let args = event.args.clone();
            let kwargs = event.kwargs.clone();
            let callable = callback.callable.clone();
            tokio::spawn(async move { (callable)(args, kwargs) });
        }
    }

    // ------------------------------------------------------------------
    // shutdown

    /// Stop the bus. Idempotent and safe to call from any task, the
    /// queue processor included. Order matters: mark dead, cancel the
    /// dispatch loop, close every reply queue to wake blocked callers,
    /// join the processor, then tear the transports down.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("bus {}: shutting down", self.inner.url);

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.inner.queues.clear();

        let processor = match self.inner.processor.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = processor {
            let _ = handle.await;
        }

        if let Some(mut inbound) = self.inner.inbound.lock().await.take() {
            let _ = inbound.close().await;
        }
        let mut outbound = self.inner.outbound.lock().await;
        for (peer, mut transport) in outbound.drain() {
            debug!("bus {}: disconnecting from {peer}", self.inner.url);
            let _ = transport.close().await;
        }

        info!("bus {}: shut down", self.inner.url);
    }
}
