//! Callback handling - handler registry and the event dispatch loop.

pub(crate) mod dispatch;
mod registry;

pub use registry::HandlerId;
pub(crate) use registry::CallbackRegistry;
