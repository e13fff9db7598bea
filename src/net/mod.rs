//! Connection layer: address handling, sockets, readiness polling, TLS,
//! asynchronous name resolution and the [Network] tying them together.

pub mod addr;
pub mod arena;
pub mod buffer;
pub mod connection;
pub mod listener;
pub mod network;
pub mod poller;
pub mod resolver;
pub mod socket;
pub mod tls;

pub use addr::{Address, Family, is_ipv4, is_ipv6};
pub use arena::ConnectionId;
pub use connection::{Callbacks, Context, OpenOptions, State, Terminal};
pub use listener::Accept;
pub use network::Network;
pub use resolver::{Answer, Lookup, ResolveError, ResolveHandle, ResolveStatus, Resolver, SystemLookup};
