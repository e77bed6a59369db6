//! Switchboard Core - identifiers and addressing shared by every layer
//!
//! Holds the `(source, target, cookie)` [`Address`], the reserved cookie
//! values, and the [`Timeout`] tri-state used by sockets and waits alike.

pub mod address;
pub mod ids;
pub mod timeout;

pub use address::Address;
pub use ids::{cookie, Id, UNKNOWN_ID};
pub use timeout::Timeout;
