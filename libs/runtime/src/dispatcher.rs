//! Dispatcher threads.
//!
//! A [`Dispatcher`] owns one OS thread and one [`EventQueue`]. The thread
//! blocks until an event is queued, pops it, reports the remaining queue size
//! to the registered [`QueueListener`]s and hands the event to every
//! [`EventConsumer`] registered for the event's [`EventKind`].
//!
//! Consumer registration travels through the same queue as events, so a
//! consumer that unregisters never races with an event already in flight.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::{ConsumerResult, Error, Result};
use crate::event::{
    CustomEvent, Event, EventKind, EventPayload, EventSink, NotificationEvent, RequestEvent,
    ResponseEvent, ServiceConnectEvent, TimerEvent,
};
use crate::queue::{EventQueue, ShutdownPolicy};

/// Receiver of dispatched events, one method per event category.
///
/// Every method defaults to doing nothing, so a consumer only implements
/// what it registered for.
pub trait EventConsumer: Send + Sync {
    fn on_service_connect(&self, _event: &ServiceConnectEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_request(&self, _event: &RequestEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_response(&self, _event: &ResponseEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_notification(&self, _event: &NotificationEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_timer(&self, _event: &TimerEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_custom(&self, _event: &CustomEvent) -> ConsumerResult {
        Ok(())
    }

    fn on_shutdown(&self) -> ConsumerResult {
        Ok(())
    }
}

/// Observer of the queue size after every pop.
///
/// A listener can use `remaining == 0` to park work until new events arrive.
pub trait QueueListener: Send + Sync {
    fn on_queue_count(&self, dispatcher: &str, remaining: usize);
}

/// A consumer failed while handling one event
#[derive(Debug, Clone)]
pub struct ConsumerFault {
    pub dispatcher: String,
    pub kind: EventKind,
    pub message: String,
    pub panicked: bool,
}

/// Where isolated consumer failures are reported
pub trait DiagnosticSink: Send + Sync {
    fn consumer_fault(&self, fault: &ConsumerFault);
}

/// Reports consumer faults through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn consumer_fault(&self, fault: &ConsumerFault) {
        tracing::error!(
            dispatcher = %fault.dispatcher,
            kind = ?fault.kind,
            panicked = fault.panicked,
            "consumer failed: {}",
            fault.message
        );
    }
}

enum Entry {
    Event(Event),
    Register(EventKind, Arc<dyn EventConsumer>),
    Unregister(EventKind, Arc<dyn EventConsumer>),
}

impl Entry {
    fn is_event(&self) -> bool {
        matches!(self, Entry::Event(_))
    }
}

struct Shared {
    name: String,
    queue: EventQueue<Entry>,
    policy: ShutdownPolicy,
    thread_id: OnceLock<ThreadId>,
}

/// Cloneable posting handle to a dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue an event, `false` once the dispatcher is stopped
    pub fn post(&self, event: Event) -> bool {
        self.shared.queue.post(Entry::Event(event))
    }

    pub fn post_custom<T: std::any::Any + Send + Sync>(&self, value: T) -> bool {
        self.post(Event::custom(value))
    }

    /// Register `consumer` for events of `kind`.
    ///
    /// Applied on the dispatcher thread in queue order.
    pub fn register(&self, kind: EventKind, consumer: Arc<dyn EventConsumer>) -> bool {
        self.shared.queue.post(Entry::Register(kind, consumer))
    }

    pub fn unregister(&self, kind: EventKind, consumer: &Arc<dyn EventConsumer>) -> bool {
        self.shared
            .queue
            .post(Entry::Unregister(kind, consumer.clone()))
    }

    /// Ask the dispatcher to exit once the current event completes.
    ///
    /// Cooperative and idempotent; under [`ShutdownPolicy::Drain`] every
    /// already-queued event is still delivered.
    pub fn stop(&self) {
        if let Some(discarded) = self
            .shared
            .queue
            .close(self.shared.policy, Some(Entry::Event(Event::shutdown())))
        {
            tracing::debug!(dispatcher = %self.shared.name, discarded, "dispatcher stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Events still queued; registrations are not counted
    pub fn queue_len(&self) -> usize {
        self.shared.queue.pending()
    }

    /// True when called from this dispatcher's own thread
    pub fn is_dispatcher_thread(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// This handle as a shareable sink
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(self.clone())
    }
}

impl EventSink for DispatcherHandle {
    fn post(&self, event: Event) -> bool {
        DispatcherHandle::post(self, event)
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("name", &self.shared.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Builder for a dispatcher thread
pub struct DispatcherBuilder {
    name: String,
    policy: ShutdownPolicy,
    diagnostics: Arc<dyn DiagnosticSink>,
    listeners: Vec<Arc<dyn QueueListener>>,
}

impl DispatcherBuilder {
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn queue_listener(mut self, listener: Arc<dyn QueueListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Start the dispatcher thread
    pub fn spawn(self) -> Result<Dispatcher> {
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            queue: EventQueue::counting(Entry::is_event),
            policy: self.policy,
            thread_id: OnceLock::new(),
        });

        let worker = Worker {
            shared: shared.clone(),
            consumers: HashMap::new(),
            listeners: self.listeners,
            diagnostics: self.diagnostics,
        };

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())
            .map_err(|source| Error::Spawn {
                name: self.name,
                source,
            })?;

        Ok(Dispatcher {
            handle: DispatcherHandle { shared },
            thread: Some(thread),
        })
    }
}

/// Owner of a dispatcher thread; stops and joins it on drop
pub struct Dispatcher {
    handle: DispatcherHandle,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn builder(name: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder {
            name: name.into(),
            policy: ShutdownPolicy::default(),
            diagnostics: Arc::new(TracingDiagnostics),
            listeners: Vec::new(),
        }
    }

    /// Spawn with default settings
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        Self::builder(name).spawn()
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stop and wait for the thread to exit
    pub fn join(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            // A dispatcher dropped from its own thread cannot join itself.
            if self.handle.is_dispatcher_thread() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(dispatcher = %self.handle.name(), "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

struct Worker {
    shared: Arc<Shared>,
    consumers: HashMap<EventKind, Vec<Arc<dyn EventConsumer>>>,
    listeners: Vec<Arc<dyn QueueListener>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl Worker {
    fn run(mut self) {
        let _ = self.shared.thread_id.set(thread::current().id());
        tracing::debug!(dispatcher = %self.shared.name, "dispatcher started");

        while let Some((entry, remaining)) = self.shared.queue.wait_pop() {
            match entry {
                Entry::Register(kind, consumer) => {
                    self.consumers.entry(kind).or_default().push(consumer);
                }
                Entry::Unregister(kind, consumer) => {
                    if let Some(list) = self.consumers.get_mut(&kind) {
                        list.retain(|c| !same_consumer(c, &consumer));
                    }
                }
                Entry::Event(event) => {
                    for listener in &self.listeners {
                        listener.on_queue_count(&self.shared.name, remaining);
                    }
                    self.deliver(&event);
                    if matches!(event.payload, EventPayload::Shutdown) {
                        // A shutdown posted directly closes the queue too.
                        self.shared.queue.close(self.shared.policy, None);
                    }
                }
            }
        }

        tracing::debug!(dispatcher = %self.shared.name, "dispatcher exited");
    }

    fn deliver(&self, event: &Event) {
        let kind = event.kind();
        let Some(consumers) = self.consumers.get(&kind) else {
            tracing::trace!(dispatcher = %self.shared.name, ?kind, "no consumer registered");
            return;
        };

        for consumer in consumers {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| dispatch_to(consumer.as_ref(), event)));

            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => (err.0, false),
                Err(panic) => (panic_message(panic.as_ref()), true),
            };

            self.diagnostics.consumer_fault(&ConsumerFault {
                dispatcher: self.shared.name.clone(),
                kind,
                message: fault.0,
                panicked: fault.1,
            });
        }
    }
}

fn dispatch_to(consumer: &dyn EventConsumer, event: &Event) -> ConsumerResult {
    match &event.payload {
        EventPayload::ServiceConnect(e) => consumer.on_service_connect(e),
        EventPayload::Request(e) => consumer.on_request(e),
        EventPayload::Response(e) => consumer.on_response(e),
        EventPayload::Notification(e) => consumer.on_notification(e),
        EventPayload::Timer(e) => consumer.on_timer(e),
        EventPayload::Custom(e) => consumer.on_custom(e),
        EventPayload::Shutdown => consumer.on_shutdown(),
    }
}

fn same_consumer(a: &Arc<dyn EventConsumer>, b: &Arc<dyn EventConsumer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "consumer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Seq(u32);

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl EventConsumer for Recorder {
        fn on_custom(&self, event: &CustomEvent) -> ConsumerResult {
            if let Some(seq) = event.downcast_ref::<Seq>() {
                self.seen.lock().push(seq.0);
            }
            Ok(())
        }
    }

    struct Faulty;

    impl EventConsumer for Faulty {
        fn on_custom(&self, event: &CustomEvent) -> ConsumerResult {
            match event.downcast_ref::<Seq>() {
                Some(Seq(1)) => Err("refusing one".into()),
                Some(Seq(2)) => panic!("boom on two"),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Faults(Mutex<Vec<ConsumerFault>>);

    impl DiagnosticSink for Faults {
        fn consumer_fault(&self, fault: &ConsumerFault) {
            self.0.lock().push(fault.clone());
        }
    }

    struct CountListener(Mutex<Vec<usize>>);

    impl QueueListener for CountListener {
        fn on_queue_count(&self, _dispatcher: &str, remaining: usize) {
            self.0.lock().push(remaining);
        }
    }

    #[test]
    fn delivers_in_post_order() {
        let dispatcher = Dispatcher::spawn("fifo").unwrap();
        let handle = dispatcher.handle();
        let recorder = Arc::new(Recorder::default());
        assert!(handle.register(EventKind::custom::<Seq>(), recorder.clone()));

        for i in 0..200 {
            assert!(handle.post_custom(Seq(i)));
        }
        dispatcher.join();

        assert_eq!(*recorder.seen.lock(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn fans_out_to_every_registered_consumer() {
        let dispatcher = Dispatcher::spawn("fanout").unwrap();
        let handle = dispatcher.handle();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        handle.register(EventKind::custom::<Seq>(), a.clone());
        handle.register(EventKind::custom::<Seq>(), b.clone());

        handle.post_custom(Seq(5));
        handle.post_custom(17u64);
        dispatcher.join();

        assert_eq!(*a.seen.lock(), vec![5]);
        assert_eq!(*b.seen.lock(), vec![5]);
    }

    #[test]
    fn unregister_takes_effect_in_queue_order() {
        let dispatcher = Dispatcher::spawn("unregister").unwrap();
        let handle = dispatcher.handle();
        let recorder = Arc::new(Recorder::default());
        let consumer: Arc<dyn EventConsumer> = recorder.clone();

        handle.register(EventKind::custom::<Seq>(), consumer.clone());
        handle.post_custom(Seq(1));
        handle.unregister(EventKind::custom::<Seq>(), &consumer);
        handle.post_custom(Seq(2));
        dispatcher.join();

        assert_eq!(*recorder.seen.lock(), vec![1]);
    }

    #[test]
    fn consumer_faults_are_isolated() {
        let faults = Arc::new(Faults::default());
        let dispatcher = Dispatcher::builder("faulty")
            .diagnostics(faults.clone())
            .spawn()
            .unwrap();
        let handle = dispatcher.handle();
        let recorder = Arc::new(Recorder::default());
        handle.register(EventKind::custom::<Seq>(), Arc::new(Faulty));
        handle.register(EventKind::custom::<Seq>(), recorder.clone());

        for i in 0..4 {
            handle.post_custom(Seq(i));
        }
        dispatcher.join();

        assert_eq!(*recorder.seen.lock(), vec![0, 1, 2, 3]);
        let faults = faults.0.lock();
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].message, "refusing one");
        assert!(!faults[0].panicked);
        assert!(faults[1].panicked);
        assert!(faults[1].message.contains("boom on two"));
    }

    #[test]
    fn stop_drains_queued_events_by_default() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        struct Gate(Mutex<mpsc::Receiver<()>>, Recorder);
        impl EventConsumer for Gate {
            fn on_custom(&self, event: &CustomEvent) -> ConsumerResult {
                if let Some(Seq(0)) = event.downcast_ref::<Seq>() {
                    let _ = self.0.lock().recv_timeout(Duration::from_secs(5));
                }
                self.1.on_custom(event)
            }
        }

        let dispatcher = Dispatcher::spawn("drain").unwrap();
        let handle = dispatcher.handle();
        let gate = Arc::new(Gate(release_rx, Recorder::default()));
        handle.register(EventKind::custom::<Seq>(), gate.clone());

        for i in 0..3 {
            handle.post_custom(Seq(i));
        }
        handle.stop();
        assert!(!handle.post_custom(Seq(99)));
        release_tx.send(()).unwrap();
        dispatcher.join();

        assert_eq!(*gate.1.seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn discard_policy_drops_pending_events() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        struct Blocker {
            entered: Mutex<mpsc::Sender<()>>,
            release: Mutex<mpsc::Receiver<()>>,
            seen: Recorder,
        }
        impl EventConsumer for Blocker {
            fn on_custom(&self, event: &CustomEvent) -> ConsumerResult {
                if let Some(Seq(0)) = event.downcast_ref::<Seq>() {
                    let _ = self.entered.lock().send(());
                    let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
                }
                self.seen.on_custom(event)
            }
        }

        let dispatcher = Dispatcher::builder("discard")
            .shutdown_policy(ShutdownPolicy::Discard)
            .spawn()
            .unwrap();
        let handle = dispatcher.handle();
        let blocker = Arc::new(Blocker {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            seen: Recorder::default(),
        });
        handle.register(EventKind::custom::<Seq>(), blocker.clone());

        for i in 0..3 {
            handle.post_custom(Seq(i));
        }
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.stop();
        release_tx.send(()).unwrap();
        dispatcher.join();

        assert_eq!(*blocker.seen.lock_seen(), vec![0]);
    }

    impl Recorder {
        fn lock_seen(&self) -> parking_lot::MutexGuard<'_, Vec<u32>> {
            self.seen.lock()
        }
    }

    #[test]
    fn shutdown_is_delivered_last() {
        struct OnShutdown(Mutex<Vec<&'static str>>);
        impl EventConsumer for OnShutdown {
            fn on_custom(&self, _event: &CustomEvent) -> ConsumerResult {
                self.0.lock().push("custom");
                Ok(())
            }
            fn on_shutdown(&self) -> ConsumerResult {
                self.0.lock().push("shutdown");
                Ok(())
            }
        }

        let dispatcher = Dispatcher::spawn("shutdown").unwrap();
        let handle = dispatcher.handle();
        let consumer = Arc::new(OnShutdown(Mutex::new(Vec::new())));
        handle.register(EventKind::Shutdown, consumer.clone());
        handle.register(EventKind::custom::<Seq>(), consumer.clone());
        handle.post_custom(Seq(0));
        dispatcher.join();

        assert_eq!(*consumer.0.lock(), vec!["custom", "shutdown"]);
    }

    #[test]
    fn queue_listener_sees_remaining_counts() {
        let listener = Arc::new(CountListener(Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::builder("listener")
            .queue_listener(listener.clone())
            .spawn()
            .unwrap();
        let handle = dispatcher.handle();
        handle.post_custom(Seq(0));
        dispatcher.join();

        let counts = listener.0.lock();
        // custom event and the trailing shutdown
        assert_eq!(counts.len(), 2);
        assert_eq!(*counts.last().unwrap(), 0);
    }

    #[test]
    fn queue_listener_ignores_registrations() {
        let listener = Arc::new(CountListener(Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::builder("registrations")
            .queue_listener(listener.clone())
            .spawn()
            .unwrap();
        let handle = dispatcher.handle();
        let recorder = Arc::new(Recorder::default());
        handle.post_custom(Seq(0));
        for _ in 0..3 {
            handle.register(EventKind::custom::<Seq>(), recorder.clone());
        }
        handle.post_custom(Seq(1));
        dispatcher.join();

        let counts = listener.0.lock();
        // two customs and the shutdown, never a registration
        assert_eq!(counts.len(), 3);
        assert!(counts.iter().all(|remaining| *remaining <= 2));
        assert_eq!(*counts.last().unwrap(), 0);
        assert_eq!(*recorder.seen.lock(), vec![1, 1, 1]);
        assert_eq!(handle.queue_len(), 0);
    }

    #[test]
    fn knows_its_own_thread() {
        struct ThreadCheck(DispatcherHandle, mpsc::SyncSender<bool>);
        impl EventConsumer for ThreadCheck {
            fn on_custom(&self, _event: &CustomEvent) -> ConsumerResult {
                let _ = self.1.send(self.0.is_dispatcher_thread());
                Ok(())
            }
        }

        let dispatcher = Dispatcher::spawn("own-thread").unwrap();
        let handle = dispatcher.handle();
        let (tx, rx) = mpsc::sync_channel(1);
        handle.register(EventKind::custom::<Seq>(), Arc::new(ThreadCheck(handle.clone(), tx)));
        handle.post_custom(Seq(0));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!handle.is_dispatcher_thread());
    }
}
