//! Stream decoders applied to intercepted connections before they reach the HTTP stack.
//!
//! A decoder is picked by the `type` field of its configuration block. The
//! [`DecoderRegistry`] maps type tags to constructors, so new decoder kinds plug in
//! without touching the router.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config::DecoderConfig, Error};

pub mod tls;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Decoder: Send + Sync {
    fn name(&self) -> &str;

    /// Loads whatever `decode` needs for `host`. Called before the client is told the
    /// connection succeeded, so failures here still reach the client as a SOCKS5 status.
    async fn prepare(&self, _host: &str) -> crate::Result<()> {
        Ok(())
    }

    /// Wraps `raw` into the decoded stream. Must not wait for the peer.
    async fn decode(&self, host: &str, raw: BoxedStream) -> crate::Result<BoxedStream>;
}

pub trait DecoderFactory: Send + Sync {
    /// Builds the decoder called `name`. `config` is the block declared under that name,
    /// if any.
    fn create(&self, name: &str, config: Option<&DecoderConfig>)
        -> crate::Result<Arc<dyn Decoder>>;
}

pub type Constructor = fn(&DecoderConfig) -> crate::Result<Arc<dyn Decoder>>;

/// Type tag to constructor table.
pub struct DecoderRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) -> &mut Self {
        self.constructors.insert(kind.into(), constructor);
        self
    }
}

impl Default for DecoderRegistry {
    /// Registers the TLS decoder under `TlsDecoder` and its historical spelling.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(tls::KIND, tls::TlsDecoder::construct)
            .register(tls::LEGACY_KIND, tls::TlsDecoder::construct);
        registry
    }
}

impl DecoderFactory for DecoderRegistry {
    fn create(
        &self,
        name: &str,
        config: Option<&DecoderConfig>,
    ) -> crate::Result<Arc<dyn Decoder>> {
        let config = config.ok_or_else(|| Error::MissingConfig(name.to_owned()))?;
        let constructor = self
            .constructors
            .get(&config.kind)
            .ok_or_else(|| Error::UnknownDecoderType(config.kind.clone()))?;
        constructor(config)
    }
}
