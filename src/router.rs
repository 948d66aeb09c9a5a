//! Host router: the [`Dispatch`] implementation behind the proxy.
//!
//! Destinations without a host rule are dialed and relayed. Destinations with a rule
//! are decoded and queued on the [`Bridge`] for the HTTP stack.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Mutex, RwLock},
};
use tracing::{debug, info};

use crate::{
    bridge::{Bridge, PendingConnection},
    config::{Config, DecoderConfig, HostRule},
    decoder::{Decoder, DecoderFactory, DecoderRegistry},
    dispatch::{DirectConnect, Dispatch, Handoff},
    Error,
};

/// Ordered host rules, shared by the router and the forwarder. First match wins.
#[derive(Debug, Default)]
pub struct HostTable {
    rules: RwLock<Vec<HostRule>>,
}

impl HostTable {
    pub fn new(rules: Vec<HostRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn find(&self, destination: &str) -> Option<HostRule> {
        self.rules
            .read()
            .await
            .iter()
            .find(|rule| rule.matches(destination))
            .cloned()
    }
}

/// Outcome of [`Router::establish`].
pub enum Route {
    Direct(TcpStream),
    Decode {
        decoder: Arc<dyn Decoder>,
        host: String,
    },
}

pub struct Router {
    hosts: Arc<HostTable>,
    decoders: Vec<DecoderConfig>,
    factory: Arc<dyn DecoderFactory>,
    instances: Mutex<HashMap<String, Arc<dyn Decoder>>>,
    bridge: Arc<Bridge>,
    direct: DirectConnect,
}

impl Router {
    pub fn new(config: Config, bridge: Arc<Bridge>) -> Self {
        Self::with_factory(config, bridge, Arc::new(DecoderRegistry::default()))
    }

    pub fn with_factory(config: Config, bridge: Arc<Bridge>, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            hosts: Arc::new(HostTable::new(config.hosts)),
            decoders: config.decoder,
            factory,
            instances: Mutex::new(HashMap::new()),
            bridge,
            direct: DirectConnect,
        }
    }

    pub fn hosts(&self) -> Arc<HostTable> {
        Arc::clone(&self.hosts)
    }

    /// Decoder instance called `name`, created through the factory on first use.
    pub async fn decoder(&self, name: &str) -> crate::Result<Arc<dyn Decoder>> {
        let mut instances = self.instances.lock().await;
        if let Some(decoder) = instances.get(name) {
            return Ok(Arc::clone(decoder));
        }

        let config = self.decoders.iter().find(|decoder| decoder.name == name);
        let decoder = self.factory.create(name, config)?;
        debug!("Created decoder {}", name);
        instances.insert(name.to_owned(), Arc::clone(&decoder));
        Ok(decoder)
    }
}

impl Dispatch for Router {
    type Route = Route;

    async fn establish(&self, destination: &str) -> crate::Result<Route> {
        if self.bridge.is_closed() {
            return Err(Error::Closed);
        }

        let Some(rule) = self.hosts.find(destination).await else {
            debug!("Proxying {} directly", destination);
            return self.direct.dial(destination).await.map(Route::Direct);
        };
        if rule.decoder.is_empty() {
            return Err(Error::DecoderNotFound(destination.to_owned()));
        }

        info!("Proxying {} by forwarding to {}", destination, rule.forward);
        let decoder = self.decoder(&rule.decoder).await?;
        let host = rule.match_key().to_owned();
        decoder.prepare(&host).await?;
        Ok(Route::Decode { decoder, host })
    }

    async fn serve<T>(&self, destination: String, client: T, route: Route) -> crate::Result<Handoff>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match route {
            Route::Direct(server) => {
                self.direct.relay(client, server).await?;
                Ok(Handoff::Relayed)
            }
            Route::Decode { decoder, host } => {
                let stream = decoder.decode(&host, Box::new(client)).await?;
                self.bridge
                    .push(PendingConnection {
                        stream,
                        remote: destination,
                    })
                    .await?;
                Ok(Handoff::HandedOff)
            }
        }
    }
}
