//! Service registry.
//!
//! The only place where proxy connection state changes. Proxies and stubs
//! register together with the sink their events go to; every status change is
//! reported to both sides as a [`ServiceConnectEvent`], posted after the
//! registry lock is released.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use switchboard_core::{Address, Timeout};

use crate::error::{Error, Result};
use crate::event::{Event, EventSink, NotificationEvent, RequestEvent, ServiceConnectEvent};
use crate::service::{ConnectionStatus, ProxyAddress, ServiceProxy, StubAddress};

struct ProxyEntry {
    proxy: ServiceProxy,
    sink: Arc<dyn EventSink>,
}

struct StubEntry {
    address: StubAddress,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct Inner {
    proxies: Vec<ProxyEntry>,
    stubs: Vec<StubEntry>,
}

impl Inner {
    fn proxy(&self, proxy: &ProxyAddress) -> Option<&ProxyEntry> {
        self.proxies
            .iter()
            .find(|entry| same_proxy(entry.proxy.address(), proxy))
    }

    /// Stub a connected proxy is bound to
    fn bound_stub(&self, proxy: &ProxyAddress) -> Option<&StubEntry> {
        self.stubs
            .iter()
            .find(|stub| {
                stub.address.channel.source == proxy.channel.target && proxy.matches(&stub.address)
            })
    }
}

type Outbox = Vec<(Arc<dyn EventSink>, Event)>;

/// Registry of local proxies and of every stub known to this process
#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proxy, binding it at once if a matching stub is available.
    ///
    /// Registering the same proxy again replaces the previous registration.
    pub fn request_connect(
        &self,
        proxy: ProxyAddress,
        sink: Arc<dyn EventSink>,
    ) -> ConnectionStatus {
        let mut outbox = Outbox::new();
        let mut state = ServiceProxy::new(proxy);
        {
            let mut inner = self.inner.lock();
            inner
                .proxies
                .retain(|entry| !same_proxy(entry.proxy.address(), state.address()));

            if state.is_unknown() {
                outbox.push((sink, connect_event(&state, None)));
            } else {
                let stub = inner
                    .stubs
                    .iter()
                    .find(|stub| state.address().matches(&stub.address));

                match stub {
                    Some(stub) => {
                        state.stub_available(&stub.address);
                        let stub_address = Some(stub.address.clone());
                        outbox.push((stub.sink.clone(), connect_event(&state, stub_address.clone())));
                        outbox.push((sink.clone(), connect_event(&state, stub_address)));
                    }
                    None => outbox.push((sink.clone(), connect_event(&state, None))),
                }

                inner.proxies.push(ProxyEntry {
                    proxy: state.clone(),
                    sink,
                });
            }
        }

        let status = state.status();
        tracing::debug!(?status, "proxy registered");
        self.publish(outbox);
        status
    }

    /// Remove a proxy; a bound stub is told the proxy is gone
    pub fn request_disconnect(&self, proxy: &ProxyAddress) -> bool {
        let mut outbox = Outbox::new();
        {
            let mut inner = self.inner.lock();
            let Some(index) = inner
                .proxies
                .iter()
                .position(|entry| same_proxy(entry.proxy.address(), proxy))
            else {
                return false;
            };
            let entry = inner.proxies.remove(index);
            let event = ServiceConnectEvent {
                proxy: entry.proxy.address().clone(),
                stub: None,
                status: ConnectionStatus::Unknown,
            };

            if entry.proxy.is_connected() {
                if let Some(stub) = inner.bound_stub(entry.proxy.address()) {
                    outbox.push((stub.sink.clone(), event.clone().into()));
                }
            }
            outbox.push((entry.sink, event.into()));
        }

        self.publish(outbox);
        true
    }

    /// Announce a stub; returns how many proxies it connected
    pub fn stub_available(&self, stub: StubAddress, sink: Arc<dyn EventSink>) -> usize {
        if !stub.is_valid() {
            tracing::warn!(%stub, "ignoring invalid stub");
            return 0;
        }

        let mut outbox = Outbox::new();
        let mut connected = 0;
        {
            let mut inner = self.inner.lock();
            inner.stubs.retain(|entry| entry.address != stub);

            for entry in inner.proxies.iter_mut() {
                if entry.proxy.is_connected() || !entry.proxy.address().matches(&stub) {
                    continue;
                }
                if entry.proxy.stub_available(&stub) {
                    connected += 1;
                    let event = ServiceConnectEvent {
                        proxy: entry.proxy.address().clone(),
                        stub: Some(stub.clone()),
                        status: ConnectionStatus::Connected,
                    };
                    outbox.push((sink.clone(), event.clone().into()));
                    outbox.push((entry.sink.clone(), event.into()));
                }
            }

            inner.stubs.push(StubEntry {
                address: stub.clone(),
                sink,
            });
        }

        tracing::debug!(%stub, connected, "stub available");
        self.publish(outbox);
        connected
    }

    /// Withdraw a stub; returns how many proxies went back to pending
    pub fn stub_unavailable(&self, stub: &StubAddress) -> usize {
        let mut outbox = Outbox::new();
        let mut waiting = 0;
        {
            let mut inner = self.inner.lock();
            let before = inner.stubs.len();
            inner.stubs.retain(|entry| entry.address != *stub);
            if inner.stubs.len() == before {
                return 0;
            }

            for entry in inner.proxies.iter_mut() {
                let bound = entry.proxy.is_connected()
                    && entry.proxy.address().channel.target == stub.channel.source
                    && entry.proxy.address().matches(stub);
                if bound && entry.proxy.stub_unavailable() {
                    waiting += 1;
                    outbox.push((
                        entry.sink.clone(),
                        ServiceConnectEvent {
                            proxy: entry.proxy.address().clone(),
                            stub: Some(stub.clone()),
                            status: ConnectionStatus::Pending,
                        }
                        .into(),
                    ));
                }
            }
        }

        tracing::debug!(%stub, waiting, "stub unavailable");
        self.publish(outbox);
        waiting
    }

    /// Post a request from `proxy` to the stub it is bound to.
    ///
    /// Rejected locally with [`Error::NotConnected`] unless connected.
    pub fn send_request(
        &self,
        proxy: &ProxyAddress,
        request_id: u32,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let (sink, event, stub) = {
            let inner = self.inner.lock();
            let entry = inner
                .proxy(proxy)
                .filter(|entry| entry.proxy.is_connected())
                .ok_or(Error::NotConnected)?;
            let stub = inner
                .bound_stub(entry.proxy.address())
                .ok_or(Error::NotConnected)?;

            let event = RequestEvent {
                request_id,
                proxy: entry.proxy.address().channel,
                stub: stub.address.channel,
                data: data.into(),
                reply: Some(entry.sink.clone()),
            };
            (stub.sink.clone(), event, stub.address.clone())
        };

        if sink.post(event.into()) {
            Ok(())
        } else {
            Err(Error::Stopped(stub.to_string()))
        }
    }

    /// Deliver a notification to every proxy connected to `stub`
    pub fn broadcast(&self, stub: &StubAddress, notify_id: u32, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let sinks: Vec<Arc<dyn EventSink>> = {
            let inner = self.inner.lock();
            inner
                .proxies
                .iter()
                .filter(|entry| {
                    entry.proxy.is_connected()
                        && entry.proxy.address().channel.target == stub.channel.source
                        && entry.proxy.address().matches(stub)
                })
                .map(|entry| entry.sink.clone())
                .collect()
        };

        sinks
            .into_iter()
            .filter(|sink| {
                sink.post(
                    NotificationEvent {
                        notify_id,
                        source: stub.channel,
                        data: data.clone(),
                    }
                    .into(),
                )
            })
            .count()
    }

    pub fn status(&self, proxy: &ProxyAddress) -> ConnectionStatus {
        self.inner
            .lock()
            .proxy(proxy)
            .map(|entry| entry.proxy.status())
            .unwrap_or_default()
    }

    /// Current address of a registered proxy, with its bound target
    pub fn proxy_address(&self, proxy: &ProxyAddress) -> Option<ProxyAddress> {
        self.inner
            .lock()
            .proxy(proxy)
            .map(|entry| entry.proxy.address().clone())
    }

    /// Block until `proxy` is connected or `timeout` elapses
    pub fn wait_connected(&self, proxy: &ProxyAddress, timeout: Timeout) -> ConnectionStatus {
        let deadline = timeout.as_duration().map(|wait| Instant::now() + wait);
        let mut inner = self.inner.lock();

        loop {
            let status = inner
                .proxy(proxy)
                .map(|entry| entry.proxy.status())
                .unwrap_or_default();
            if status == ConnectionStatus::Connected {
                return status;
            }

            match deadline {
                None => self.changed.wait(&mut inner),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.changed.wait_until(&mut inner, deadline).timed_out()
                    {
                        return inner
                            .proxy(proxy)
                            .map(|entry| entry.proxy.status())
                            .unwrap_or_default();
                    }
                }
            }
        }
    }

    /// Sink of the stub whose channel source is `channel.source`
    pub fn stub_sink(&self, channel: &Address) -> Option<Arc<dyn EventSink>> {
        self.inner
            .lock()
            .stubs
            .iter()
            .find(|stub| stub.address.channel.source == channel.source)
            .map(|stub| stub.sink.clone())
    }

    /// Sink of the proxy whose channel source is `channel.source`
    pub fn proxy_sink(&self, channel: &Address) -> Option<Arc<dyn EventSink>> {
        self.inner
            .lock()
            .proxies
            .iter()
            .find(|entry| entry.proxy.address().channel.source == channel.source)
            .map(|entry| entry.sink.clone())
    }

    pub fn stubs(&self) -> Vec<StubAddress> {
        self.inner
            .lock()
            .stubs
            .iter()
            .map(|stub| stub.address.clone())
            .collect()
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.lock().proxies.len()
    }

    fn publish(&self, outbox: Outbox) {
        self.changed.notify_all();
        for (sink, event) in outbox {
            if !sink.post(event) {
                tracing::debug!("service event dropped, sink closed");
            }
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServiceRegistry")
            .field("proxies", &inner.proxies.len())
            .field("stubs", &inner.stubs.len())
            .finish()
    }
}

/// A proxy is identified by everything but its bound target
fn same_proxy(a: &ProxyAddress, b: &ProxyAddress) -> bool {
    a.service == b.service
        && a.thread == b.thread
        && a.channel.source == b.channel.source
        && a.channel.cookie == b.channel.cookie
}

fn connect_event(proxy: &ServiceProxy, stub: Option<StubAddress>) -> Event {
    ServiceConnectEvent {
        proxy: proxy.address().clone(),
        stub,
        status: proxy.status(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::service::{ServiceAddress, Version};
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    impl EventSink for Collect {
        fn post(&self, event: Event) -> bool {
            self.0.lock().push(event);
            true
        }
    }

    impl Collect {
        fn statuses(&self) -> Vec<ConnectionStatus> {
            self.0
                .lock()
                .iter()
                .filter_map(|event| match &event.payload {
                    EventPayload::ServiceConnect(e) => Some(e.status),
                    _ => None,
                })
                .collect()
        }
    }

    fn echo() -> ServiceAddress {
        ServiceAddress::new("echo", "Echo", Version::new(1, 2, 0))
    }

    fn proxy(source: u64) -> ProxyAddress {
        ProxyAddress::new(echo(), "main", Address::new(source, 0, 7))
    }

    fn stub() -> StubAddress {
        StubAddress::new(echo(), "main", Address::new(900, 0, 7))
    }

    #[test]
    fn proxy_connects_when_stub_appears() {
        let registry = ServiceRegistry::new();
        let proxy_sink = Arc::new(Collect::default());
        let stub_sink = Arc::new(Collect::default());

        assert_eq!(
            registry.request_connect(proxy(1), proxy_sink.clone()),
            ConnectionStatus::Pending
        );
        assert_eq!(registry.stub_available(stub(), stub_sink.clone()), 1);

        assert_eq!(registry.status(&proxy(1)), ConnectionStatus::Connected);
        assert_eq!(
            registry.proxy_address(&proxy(1)).unwrap().channel.target,
            900
        );
        assert_eq!(
            proxy_sink.statuses(),
            vec![ConnectionStatus::Pending, ConnectionStatus::Connected]
        );
        assert_eq!(stub_sink.statuses(), vec![ConnectionStatus::Connected]);
    }

    #[test]
    fn late_proxy_binds_to_existing_stub() {
        let registry = ServiceRegistry::new();
        registry.stub_available(stub(), Arc::new(Collect::default()));

        let sink = Arc::new(Collect::default());
        assert_eq!(
            registry.request_connect(proxy(1), sink.clone()),
            ConnectionStatus::Connected
        );
        assert_eq!(sink.statuses(), vec![ConnectionStatus::Connected]);
    }

    #[test]
    fn invalid_proxy_stays_unknown() {
        let registry = ServiceRegistry::new();
        let status = registry.request_connect(ProxyAddress::default(), Arc::new(Collect::default()));
        assert_eq!(status, ConnectionStatus::Unknown);
        assert_eq!(registry.proxy_count(), 0);
    }

    #[test]
    fn withdrawn_stub_leaves_proxies_pending() {
        let registry = ServiceRegistry::new();
        let sink = Arc::new(Collect::default());
        registry.request_connect(proxy(1), sink.clone());
        registry.request_connect(proxy(2), sink.clone());
        registry.stub_available(stub(), Arc::new(Collect::default()));

        assert_eq!(registry.stub_unavailable(&stub()), 2);
        assert_eq!(registry.status(&proxy(1)), ConnectionStatus::Pending);
        assert_eq!(registry.stub_unavailable(&stub()), 0);
    }

    #[test]
    fn requests_need_a_connection() {
        let registry = ServiceRegistry::new();
        let proxy_sink = Arc::new(Collect::default());
        registry.request_connect(proxy(1), proxy_sink.clone());

        assert!(matches!(
            registry.send_request(&proxy(1), 1, Bytes::new()),
            Err(Error::NotConnected)
        ));

        let stub_sink = Arc::new(Collect::default());
        registry.stub_available(stub(), stub_sink.clone());
        registry.send_request(&proxy(1), 5, &b"ping"[..]).unwrap();

        let events = stub_sink.0.lock();
        let EventPayload::Request(request) = &events.last().unwrap().payload else {
            panic!("expected a request");
        };
        assert_eq!(request.request_id, 5);
        assert_eq!(request.stub, stub().channel);
        assert_eq!(request.proxy.target, 900);

        assert!(request.respond(crate::event::RequestResult::Ok, &b"pong"[..]));
        assert!(matches!(
            proxy_sink.0.lock().last().unwrap().payload,
            EventPayload::Response(_)
        ));
    }

    #[test]
    fn broadcast_reaches_connected_proxies_only() {
        let registry = ServiceRegistry::new();
        let connected = Arc::new(Collect::default());
        let stranger = Arc::new(Collect::default());
        registry.request_connect(proxy(1), connected.clone());
        registry.request_connect(
            ProxyAddress::new(echo(), "other", Address::new(2, 0, 7)),
            stranger.clone(),
        );
        registry.stub_available(stub(), Arc::new(Collect::default()));

        assert_eq!(registry.broadcast(&stub(), 3, &b"news"[..]), 1);
        assert!(matches!(
            connected.0.lock().last().unwrap().payload,
            EventPayload::Notification(_)
        ));
        assert!(stranger
            .0
            .lock()
            .iter()
            .all(|e| !matches!(e.payload, EventPayload::Notification(_))));
    }

    #[test]
    fn disconnect_notifies_bound_stub() {
        let registry = ServiceRegistry::new();
        let stub_sink = Arc::new(Collect::default());
        registry.stub_available(stub(), stub_sink.clone());
        registry.request_connect(proxy(1), Arc::new(Collect::default()));

        assert!(registry.request_disconnect(&proxy(1)));
        assert!(!registry.request_disconnect(&proxy(1)));
        assert_eq!(
            stub_sink.statuses(),
            vec![ConnectionStatus::Connected, ConnectionStatus::Unknown]
        );
    }

    #[test]
    fn wait_connected_honours_timeout() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.request_connect(proxy(1), Arc::new(Collect::default()));

        assert_eq!(
            registry.wait_connected(&proxy(1), Timeout::DoNotWait),
            ConnectionStatus::Pending
        );
        assert_eq!(
            registry.wait_connected(&proxy(1), Timeout::from_millis(20)),
            ConnectionStatus::Pending
        );

        let announcer = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.stub_available(stub(), Arc::new(Collect::default()));
            })
        };
        assert_eq!(
            registry.wait_connected(&proxy(1), Timeout::Infinite),
            ConnectionStatus::Connected
        );
        announcer.join().unwrap();
    }
}
