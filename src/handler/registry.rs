//! Callback registry for inbound frames and connection events.
//!
//! Callbacks are tagged by event class and kept in registration order; the
//! receiver invokes every callback of a class, in order, for each event.
//!
//! # Example
//!
//! ```ignore
//! use qtp::handler::Callbacks;
//!
//! let mut callbacks = Callbacks::new();
//!
//! callbacks.on_sync_ack(|sender, frame| async move {
//!     sender.send_no_ack(frame.payload_bytes(), frame.encoding(), |_, _| {}).await;
//!     Ok(())
//! });
//! callbacks.on_conn_closed(|err| eprintln!("connection lost: {}", err));
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{QtpError, Result};
use crate::protocol::{AckMode, Frame};
use crate::sender::Sender;

/// Result type for frame handlers.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles one inbound DATA or RETRY frame.
pub trait FrameHandler: Send + Sync + 'static {
    fn call(&self, sender: Sender, frame: Frame) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> FrameHandler for F
where
    F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, sender: Sender, frame: Frame) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(sender, frame))
    }
}

/// Wrapper that deserializes a JSON payload before calling the handler.
pub struct JsonHandler<F, T, Fut>
where
    F: Fn(Sender, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> JsonHandler<F, T, Fut>
where
    F: Fn(Sender, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> FrameHandler for JsonHandler<F, T, Fut>
where
    F: Fn(Sender, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, sender: Sender, frame: Frame) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match frame.json() {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(sender, parsed))
    }
}

/// Runs once when a session starts, before any frame is dispatched.
pub trait InitHandler: Send + Sync + 'static {
    fn call(&self, sender: Sender) -> BoxFuture<'static, ()>;
}

impl<F, Fut> InitHandler for F
where
    F: Fn(Sender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, sender: Sender) -> BoxFuture<'static, ()> {
        Box::pin(self(sender))
    }
}

/// Runs once when a session's connection is lost.
pub type ClosedHandler = Arc<dyn Fn(&QtpError) + Send + Sync>;

/// A registered callback, tagged by the event it handles.
#[derive(Clone)]
pub enum Callback {
    /// DATA/RETRY frames sent without acknowledgment.
    NoAck(Arc<dyn FrameHandler>),
    /// Frames acknowledged after the callbacks finish, in order.
    SyncAck(Arc<dyn FrameHandler>),
    /// Frames acknowledged after the callbacks finish, concurrently.
    AsyncAck(Arc<dyn FrameHandler>),
    /// Session start.
    ConnInit(Arc<dyn InitHandler>),
    /// Session end.
    ConnClosed(ClosedHandler),
}

impl Callback {
    fn frame_handler(&self, mode: AckMode) -> Option<&Arc<dyn FrameHandler>> {
        match (self, mode) {
            (Callback::NoAck(h), AckMode::None)
            | (Callback::SyncAck(h), AckMode::Sync)
            | (Callback::AsyncAck(h), AckMode::Async) => Some(h),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Callback::NoAck(_) => "NoAck",
            Callback::SyncAck(_) => "SyncAck",
            Callback::AsyncAck(_) => "AsyncAck",
            Callback::ConnInit(_) => "ConnInit",
            Callback::ConnClosed(_) => "ConnClosed",
        };
        f.write_str(name)
    }
}

/// Ordered collection of callbacks.
#[derive(Clone, Default, Debug)]
pub struct Callbacks {
    entries: Vec<Callback>,
}

impl Callbacks {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback.
    pub fn register(&mut self, callback: Callback) -> &mut Self {
        self.entries.push(callback);
        self
    }

    pub fn on_no_ack<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Callback::NoAck(Arc::new(handler)))
    }

    pub fn on_sync_ack<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Callback::SyncAck(Arc::new(handler)))
    }

    pub fn on_async_ack<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Callback::AsyncAck(Arc::new(handler)))
    }

    /// Register a handler for JSON frames of the given ack mode.
    ///
    /// The payload is deserialized into `T`; a payload that does not decode
    /// is reported as a handler error.
    pub fn on_json<F, T, Fut>(&mut self, mode: AckMode, handler: F) -> &mut Self
    where
        F: Fn(Sender, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Arc<dyn FrameHandler> = Arc::new(JsonHandler::new(handler));
        let callback = match mode {
            AckMode::None => Callback::NoAck(handler),
            AckMode::Sync => Callback::SyncAck(handler),
            AckMode::Async => Callback::AsyncAck(handler),
        };
        self.register(callback)
    }

    pub fn on_conn_init<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Sender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Callback::ConnInit(Arc::new(handler)))
    }

    pub fn on_conn_closed<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&QtpError) + Send + Sync + 'static,
    {
        self.register(Callback::ConnClosed(Arc::new(handler)))
    }

    /// Frame handlers for an ack mode, in registration order.
    pub fn frame_handlers(&self, mode: AckMode) -> Vec<Arc<dyn FrameHandler>> {
        self.entries
            .iter()
            .filter_map(|c| c.frame_handler(mode))
            .cloned()
            .collect()
    }

    /// Session start handlers, in registration order.
    pub fn init_handlers(&self) -> Vec<Arc<dyn InitHandler>> {
        self.entries
            .iter()
            .filter_map(|c| match c {
                Callback::ConnInit(h) => Some(Arc::clone(h)),
                _ => None,
            })
            .collect()
    }

    /// Session end handlers, in registration order.
    pub fn closed_handlers(&self) -> Vec<ClosedHandler> {
        self.entries
            .iter()
            .filter_map(|c| match c {
                Callback::ConnClosed(h) => Some(Arc::clone(h)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
