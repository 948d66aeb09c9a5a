use std::{net::SocketAddr, sync::Arc};

use tokio::net::ToSocketAddrs;
use tracing::info;

use crate::{
    bridge::Bridge, config::Config, forward::Forwarder, http, router::Router, Socks5Server,
};

/// A running proxy: the SOCKS5 listener, the host router and the bridge feeding the
/// reverse proxy. Whoever owns the value decides when to [`Debugger::close`] it.
pub struct Debugger {
    socks: Socks5Server<Router>,
    bridge: Arc<Bridge>,
    forwarder: Arc<Forwarder>,
}

impl Debugger {
    pub async fn bind(config: Config, addr: impl ToSocketAddrs) -> crate::Result<Self> {
        let bridge = Arc::new(Bridge::new());
        let router = Arc::new(Router::new(config, Arc::clone(&bridge)));
        let forwarder = Arc::new(Forwarder::new(router.hosts(), http::client()?));
        let socks = Socks5Server::listen(addr, router).await?;
        Ok(Self {
            socks,
            bridge,
            forwarder,
        })
    }

    pub fn socks_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socks.local_addr()?)
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Runs the SOCKS5 accept loop and the bridge's HTTP loop until [`Debugger::close`].
    pub async fn run(&self) -> crate::Result<()> {
        let (socks, bridge) = tokio::join!(
            self.socks.run(),
            self.bridge.serve(Arc::clone(&self.forwarder))
        );
        socks?;
        bridge?;
        info!("Debugger stopped");
        Ok(())
    }

    /// Stops both accept loops. Connections already being served run to completion.
    pub fn close(&self) {
        self.socks.close();
        self.bridge.close();
    }

    pub fn is_closed(&self) -> bool {
        self.socks.is_closed() && self.bridge.is_closed()
    }
}
