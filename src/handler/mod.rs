//! Handler module - application callbacks.
//!
//! Provides:
//! - [`Callbacks`] - ordered registry of callbacks tagged by event class
//! - [`FrameHandler`] / [`InitHandler`] - async callback traits, implemented
//!   for plain closures
//! - [`JsonHandler`] - decodes JSON payloads before calling the handler

mod registry;

pub use registry::{
    BoxFuture, Callback, Callbacks, ClosedHandler, FrameHandler, HandlerResult, InitHandler,
    JsonHandler,
};
