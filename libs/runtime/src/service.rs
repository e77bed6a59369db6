//! Service addressing and the proxy connection state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use switchboard_core::{Address, UNKNOWN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of a service interface: `(role, name, version)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub role: String,
    pub name: String,
    pub version: Version,
}

impl ServiceAddress {
    pub fn new(role: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            version,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.role.is_empty() && !self.name.is_empty()
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.role, self.name, self.version)
    }
}

/// Where a proxy lives and which stub it expects.
///
/// `thread` names the dispatcher expected to own the stub and
/// `channel.cookie` the session scope; both take part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProxyAddress {
    pub service: ServiceAddress,
    pub thread: String,
    pub channel: Address,
}

impl ProxyAddress {
    pub fn new(service: ServiceAddress, thread: impl Into<String>, channel: Address) -> Self {
        Self {
            service,
            thread: thread.into(),
            channel,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid() && self.service.is_valid()
    }

    /// Same interface, same owning thread, same cookie scope
    pub fn matches(&self, stub: &StubAddress) -> bool {
        self.service == stub.service
            && self.thread == stub.thread
            && self.channel.cookie == stub.channel.cookie
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy {} on {} [{}]", self.service, self.thread, self.channel)
    }
}

/// Where a stub lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StubAddress {
    pub service: ServiceAddress,
    pub thread: String,
    pub channel: Address,
}

impl StubAddress {
    pub fn new(service: ServiceAddress, thread: impl Into<String>, channel: Address) -> Self {
        Self {
            service,
            thread: thread.into(),
            channel,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid() && self.service.is_valid()
    }
}

impl fmt::Display for StubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub {} on {} [{}]", self.service, self.thread, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Never registered, or registered with an invalid address.
    #[default]
    Unknown,
    /// Registered and waiting for a matching stub.
    Pending,
    Connected,
}

/// Connection state of one proxy.
///
/// Every transition is a total function of the current state and the input;
/// `Unknown` and `Pending` differ in that only `Pending` is worth waiting on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceProxy {
    address: ProxyAddress,
    status: ConnectionStatus,
}

impl ServiceProxy {
    pub fn new(address: ProxyAddress) -> Self {
        let mut proxy = Self::default();
        proxy.register(address);
        proxy
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Overwrite address and status without any checks
    pub fn set_service(&mut self, address: ProxyAddress, status: ConnectionStatus) {
        self.address = address;
        self.status = status;
        self.check_invariant();
    }

    pub fn register(&mut self, address: ProxyAddress) -> ConnectionStatus {
        self.status = if address.is_valid() {
            ConnectionStatus::Pending
        } else {
            ConnectionStatus::Unknown
        };
        self.address = address;
        self.status
    }

    /// Returns whether the proxy is connected afterwards.
    ///
    /// A valid stub that does not match this proxy leaves the state as is.
    pub fn stub_available(&mut self, stub: &StubAddress) -> bool {
        if !self.address.is_valid() {
            self.status = ConnectionStatus::Unknown;
        } else if !stub.is_valid() {
            self.status = ConnectionStatus::Pending;
        } else if self.address.matches(stub) {
            self.address.channel.target = stub.channel.source;
            self.status = ConnectionStatus::Connected;
        }

        self.check_invariant();
        self.is_connected()
    }

    /// Returns whether the proxy is waiting for a stub afterwards
    pub fn stub_unavailable(&mut self) -> bool {
        if self.address.is_valid() {
            self.address.channel.target = UNKNOWN_ID;
            self.status = ConnectionStatus::Pending;
        } else {
            self.status = ConnectionStatus::Unknown;
        }
        self.is_waiting()
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ConnectionStatus::Pending
    }

    pub fn is_unknown(&self) -> bool {
        self.status == ConnectionStatus::Unknown
    }

    fn check_invariant(&self) {
        debug_assert!(
            self.status != ConnectionStatus::Connected || self.address.channel.has_target(),
            "connected proxy without a target"
        );
    }
}
