//! Process-wide runtime context.
//!
//! A [`Runtime`] bundles the timer service, the service registry and the
//! named dispatchers of one process. Construct exactly one at process start,
//! share it by reference or `Arc`, and drop it (or call
//! [`Runtime::shutdown`]) at process end.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::{Error, Result};
use crate::registry::ServiceRegistry;
use crate::timer::TimerManager;

pub struct Runtime {
    config: RuntimeConfig,
    timers: TimerManager,
    registry: Arc<ServiceRegistry>,
    dispatchers: Mutex<HashMap<String, Dispatcher>>,
}

impl Runtime {
    /// Start the timer service. Fails if its thread cannot be created.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let timers = TimerManager::start_named(config.timer_thread_name.clone())?;
        tracing::info!(timer_thread = %config.timer_thread_name, "runtime started");

        Ok(Self {
            config,
            timers,
            registry: Arc::new(ServiceRegistry::new()),
            dispatchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn a named dispatcher owned by this runtime
    pub fn spawn_dispatcher(&self, name: impl Into<String>) -> Result<DispatcherHandle> {
        let name = name.into();
        let mut dispatchers = self.dispatchers.lock();
        if dispatchers.contains_key(&name) {
            return Err(Error::DuplicateDispatcher(name));
        }

        let dispatcher = Dispatcher::builder(name.clone())
            .shutdown_policy(self.config.shutdown_policy)
            .spawn()?;
        let handle = dispatcher.handle();
        dispatchers.insert(name, dispatcher);
        Ok(handle)
    }

    pub fn dispatcher(&self, name: &str) -> Option<DispatcherHandle> {
        self.dispatchers.lock().get(name).map(Dispatcher::handle)
    }

    pub fn dispatcher_names(&self) -> Vec<String> {
        self.dispatchers.lock().keys().cloned().collect()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Stop every dispatcher, then the timer service
    pub fn shutdown(&self) {
        let dispatchers: Vec<Dispatcher> = self
            .dispatchers
            .lock()
            .drain()
            .map(|(_, dispatcher)| dispatcher)
            .collect();

        for dispatcher in &dispatchers {
            dispatcher.stop();
        }
        for dispatcher in dispatchers {
            tracing::debug!(dispatcher = dispatcher.name(), "joining dispatcher");
            dispatcher.join();
        }

        self.timers.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("dispatchers", &self.dispatcher_names())
            .field("timers", &self.timers)
            .field("registry", &self.registry)
            .finish()
    }
}
