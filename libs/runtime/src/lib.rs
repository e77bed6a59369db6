//! Switchboard Runtime - event-driven dispatch for service components
//!
//! Every active entity owns a [`Dispatcher`]: a dedicated thread draining a
//! FIFO [`EventQueue`](queue::EventQueue) and handing each [`Event`] to the
//! [`EventConsumer`]s registered for its kind. Timers post into dispatchers
//! through the [`TimerManager`], and the [`ServiceRegistry`] tracks which
//! proxies are connected to which stubs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard_runtime::{
//!     ConsumerResult, CustomEvent, EventConsumer, EventKind, Runtime, RuntimeConfig,
//! };
//!
//! struct Greeting(&'static str);
//!
//! struct Printer;
//!
//! impl EventConsumer for Printer {
//!     fn on_custom(&self, event: &CustomEvent) -> ConsumerResult {
//!         if let Some(greeting) = event.downcast_ref::<Greeting>() {
//!             println!("{}", greeting.0);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let main = runtime.spawn_dispatcher("main")?;
//! main.register(EventKind::custom::<Greeting>(), Arc::new(Printer));
//! main.post_custom(Greeting("hello"));
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod queue;
pub mod registry;
pub mod service;
pub mod timer;

pub use config::RuntimeConfig;
pub use context::Runtime;
pub use dispatcher::{
    ConsumerFault, DiagnosticSink, Dispatcher, DispatcherBuilder, DispatcherHandle, EventConsumer,
    QueueListener, TracingDiagnostics,
};
pub use error::{ConsumerError, ConsumerResult, Error, Result};
pub use event::{
    CustomEvent, Event, EventKind, EventPayload, EventSink, NotificationEvent, RequestEvent,
    RequestResult, ResponseEvent, ServiceConnectEvent, TimerEvent,
};
pub use queue::ShutdownPolicy;
pub use registry::ServiceRegistry;
pub use service::{
    ConnectionStatus, ProxyAddress, ServiceAddress, ServiceProxy, StubAddress, Version,
};
pub use timer::{Repeat, Timer, TimerId, TimerManager};
