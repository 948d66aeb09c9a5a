//! # wdebugger
//!
//! An intercepting SOCKS5 proxy for debugging web traffic.
//! Every client connection is routed either straight to its destination or, when the
//! destination matches a configured host rule, through a decoder (TLS termination) into
//! an in-process HTTP server that reverse-proxies the plaintext requests to a forward
//! target of your choice.
//!
//! ## Overview
//!
//! The crate is made of a few cooperating pieces:
//!
//! 1. **SOCKS5 gateway** ([`Socks5Server`], [`Socks5Socket`]): negotiates the "no
//!    authentication" method, parses the CONNECT request (IPv4, IPv6 or domain
//!    destination) and hands the connection to a [`Dispatch`] implementation.
//! 2. **Host router** ([`router::Router`]): the [`Dispatch`] implementation used by the
//!    proxy. Destinations without a host rule are dialed and relayed byte for byte.
//!    Destinations with a rule are decoded and queued on the bridge.
//! 3. **Listener bridge** ([`bridge::Bridge`]): a bounded queue that behaves like a
//!    listener. Its accept loop serves each decoded stream with hyper, and every request
//!    goes through [`forward::Forwarder`] to reach the rule's forward target.
//! 4. **Decoders** ([`decoder`]): stream transforms selected by a type tag. The built-in
//!    [`decoder::tls::TlsDecoder`] terminates TLS with a certificate read from disk or
//!    fetched from a certificate center.
//! 5. **Certificate center** ([`certs::CertCenter`]): an HTTP endpoint handing out
//!    certificate/key pairs per host, guarded by basic authentication.
//!
//! ### Connection Flow
//!
//! ```text
//! client --SOCKS5--> Socks5Server --establish/serve--> Router
//!                                                        |-- no rule --> TCP dial + relay
//!                                                        `-- rule ----> decode --> Bridge queue
//!                                                                                     |
//!                                        forward target <-- Forwarder <-- hyper <-----'
//! ```
//!
//! ## Examples
//!
//! Running the proxy from an already parsed configuration:
//!
//! ```rust,no_run
//! use wdebugger::{config::Config, Debugger};
//!
//! #[tokio::main]
//! async fn main() -> wdebugger::Result<()> {
//!     let config: Config = serde_json::from_str(
//!         r#"{
//!             "hosts": [{"host": "example.com", "decoder": "tls1", "forward": "http://127.0.0.1:8080"}],
//!             "decoder": [{"name": "tls1", "type": "TlsDecoder", "cert": "example.pem", "key": "example.key"}]
//!         }"#,
//!     )?;
//!     let debugger = Debugger::bind(config, "127.0.0.1:1080").await?;
//!     debugger.run().await
//! }
//! ```
//!
//! The [`Debugger`] value is the only handle to the running proxy: call
//! [`Debugger::close`] from wherever shutdown is decided.

use std::io;

use thiserror::Error;

pub mod bridge;
pub mod certs;
pub mod config;
mod context;
pub mod decoder;
pub mod dispatch;
pub mod forward;
pub mod framed;
pub mod http;
pub mod protocol;
pub mod router;
mod server;
mod socks5_socket;

pub use context::Debugger;
pub use dispatch::{Dispatch, Handoff};
pub use protocol::Reply;
pub use server::Socks5Server;
pub use socks5_socket::{ProxySession, Socks5Socket};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported socks version {0:#04x}")]
    ProtocolVersion(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("stream ended before the frame was complete")]
    IncompleteRead(#[source] io::Error),
    #[error("dial to {destination} failed")]
    DialFailure {
        destination: String,
        #[source]
        source: io::Error,
    },
    #[error("no decoder is set for host {0}")]
    DecoderNotFound(String),
    #[error("decoder type {0} is not supported")]
    UnknownDecoderType(String),
    #[error("the {0} decoder config is not set")]
    MissingConfig(String),
    #[error("loading certificate failed: {0}")]
    CertificateLoad(String),
    #[error("fetching certificate failed: {0}")]
    CertificateFetch(String),
    #[error("authentication failed")]
    AuthFailure,
    #[error("{0} is not configured")]
    RouteNotFound(String),
    #[error("forward target {0} is invalid")]
    ForwardTargetInvalid(String),
    #[error("socks error: {0}")]
    Reply(#[from] Reply),
    #[error("debugger is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("error in network operation")]
    Io(#[from] io::Error),
}

impl Error {
    /// Turns a failed read into the error the handshake reports: a stream that ends early
    /// is an incomplete read, anything else stays an I/O error.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::IncompleteRead(err)
        } else {
            Error::Io(err)
        }
    }

    /// Status byte sent to the SOCKS5 client when dispatch fails with `self`.
    pub fn reply(&self) -> Reply {
        match self {
            Error::Reply(reply) => *reply,
            Error::DialFailure { source, .. } => source.kind().into(),
            _ => Reply::GeneralFailure,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Config(value.to_string())
    }
}

impl From<Error> for Reply {
    fn from(value: Error) -> Self {
        value.reply()
    }
}
