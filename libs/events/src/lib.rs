//! # eva-events
//!
//! Outward notifications for the EVA networking core.
//!
//! ## Design Principles
//!
//! - Every observable effect of the proxy and control channel is an event
//! - Listeners are notified in registration order, within the emitting call
//! - Emission can be muted before teardown so no listener hears a dying component
//!
//! Components own an [`EventHub`] inside their coordinating task and hand out
//! receivers through `subscribe`. Receivers are plain tokio unbounded channels,
//! so a UI thread, a supervisor task, or a test can consume them the same way.

mod hub;

pub use hub::EventHub;
