//! Switchboard Router - message routing between processes
//!
//! The [`Router`] accepts socket connections, mints a cookie for each peer
//! and forwards every frame to the connection named by its target cookie.
//! Requests and responses that cannot be delivered come back to their
//! sender as `TargetNotFound`; notifications addressed to the broadcast
//! cookie are copied to every other active peer.
//!
//! A process joins through a [`RouterClient`], which performs the
//! `RouterConnect` handshake and bridges remote traffic into the local
//! [`Runtime`](switchboard_runtime::Runtime).
//!
//! # Example
//!
//! ```no_run
//! use switchboard_fabric::transport::TcpTransport;
//! use switchboard_router::{ClientConfig, Router, RouterClient, RouterConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new(RouterConfig::default()).serve_tcp().await?;
//! let addr = router.local_addr().ok_or("not a tcp router")?;
//!
//! let transport = TcpTransport::connect(addr).await?;
//! let client = RouterClient::connect(transport, "calculator", ClientConfig::default()).await?;
//! println!("connected as {}", client.cookie());
//!
//! client.disconnect().await;
//! router.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod server;
pub mod table;

pub use client::{RemoteSink, RouterClient};
pub use config::{ClientConfig, RouterConfig};
pub use error::{Error, Result};
pub use policy::{AcceptAll, AcceptPolicy, AllowList, LoggingHandler, MaxConnections, RemoteServiceHandler};
pub use server::{Router, RouterBuilder, RouterHandle};
pub use table::{ConnectionRecord, ConnectionState, ConnectionTable};
