//! Deployment hooks: who may connect, and what happens to undeliverable
//! messages.

use switchboard_fabric::{Message, PeerInfo};

use crate::error::Error;

/// Accept/reject rules for incoming connections.
///
/// A rejected peer sees nothing but a closed socket.
pub trait AcceptPolicy: Send + Sync {
    /// `active` is the number of connections currently in the table.
    fn can_accept_connection(&self, peer: &PeerInfo, active: usize) -> bool;

    fn connection_lost(&self, _peer: &PeerInfo) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn can_accept_connection(&self, _peer: &PeerInfo, _active: usize) -> bool {
        true
    }
}

/// Caps the number of simultaneous connections
#[derive(Debug, Clone, Copy)]
pub struct MaxConnections(pub usize);

impl AcceptPolicy for MaxConnections {
    fn can_accept_connection(&self, _peer: &PeerInfo, active: usize) -> bool {
        active < self.0
    }
}

/// Accepts peers whose label starts with one of the listed prefixes
#[derive(Debug, Clone, Default)]
pub struct AllowList(pub Vec<String>);

impl AllowList {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(prefixes.into_iter().map(Into::into).collect())
    }
}

impl AcceptPolicy for AllowList {
    fn can_accept_connection(&self, peer: &PeerInfo, _active: usize) -> bool {
        self.0.iter().any(|prefix| peer.label.starts_with(prefix))
    }
}

/// Owner of routing failures. The router reports and never retries.
pub trait RemoteServiceHandler: Send + Sync {
    fn failed_send_message(&self, message: &Message, error: &Error);
}

/// Logs and drops undeliverable messages
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl RemoteServiceHandler for LoggingHandler {
    fn failed_send_message(&self, message: &Message, error: &Error) {
        tracing::warn!(
            id = ?message.id,
            source = message.source,
            target = message.target,
            len = message.payload_len(),
            "dropping message: {error}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_connections_counts_active_peers() {
        let policy = MaxConnections(2);
        let peer = PeerInfo::new("127.0.0.1:4000");
        assert!(policy.can_accept_connection(&peer, 1));
        assert!(!policy.can_accept_connection(&peer, 2));
    }

    #[test]
    fn allow_list_matches_prefixes() {
        let policy = AllowList::new(["127.0.0.1:", "unix:"]);
        assert!(policy.can_accept_connection(&PeerInfo::new("127.0.0.1:5555"), 0));
        assert!(policy.can_accept_connection(&PeerInfo::new("unix:/tmp/r.sock#0"), 0));
        assert!(!policy.can_accept_connection(&PeerInfo::new("10.0.0.8:5555"), 0));
    }

    #[test]
    fn empty_allow_list_rejects_everyone() {
        assert!(!AllowList::default().can_accept_connection(&PeerInfo::new("127.0.0.1:1"), 0));
    }
}
