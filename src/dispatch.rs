use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

mod direct;
pub use direct::DirectConnect;

/// What became of a client connection once [`Dispatch::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The connection was relayed to its destination and the relay has ended.
    Relayed,
    /// Ownership moved to another component, which will close the connection.
    HandedOff,
}

/// The `Dispatch` trait decides where a parsed SOCKS5 request goes.
///
/// Dispatch happens in two steps so the client only sees a success reply once the
/// destination is reachable:
///
/// 1. [`Dispatch::establish`] prepares a route for the destination key. An error here
///    is reported to the client as a failure reply and the connection is closed.
/// 2. After the success reply, [`Dispatch::serve`] receives the client connection
///    together with the route and drives it.
pub trait Dispatch: Send + Sync {
    /// Whatever `establish` prepared, e.g. a dialed upstream connection.
    type Route: Send;

    /// Prepares a route to `destination` (`"<address-or-domain>:<port>"`).
    fn establish(
        &self,
        destination: &str,
    ) -> impl Future<Output = crate::Result<Self::Route>> + Send;

    /// Drives `client` over `route`. Returns once the relay has ended or the connection
    /// has been handed to another owner.
    fn serve<T>(
        &self,
        destination: String,
        client: T,
        route: Self::Route,
    ) -> impl Future<Output = crate::Result<Handoff>> + Send
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}
