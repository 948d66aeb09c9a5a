use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::{dispatch::Dispatch, Socks5Socket};

/// SOCKS5 listener that runs every accepted connection on its own task.
pub struct Socks5Server<D> {
    listener: TcpListener,
    dispatcher: Arc<D>,
    shutdown: CancellationToken,
}

impl<D> Socks5Server<D>
where
    D: Dispatch + 'static,
{
    pub async fn listen(addr: impl ToSocketAddrs, dispatcher: Arc<D>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until [`Socks5Server::close`] is called.
    ///
    /// Connections already being served keep running after `run` returns.
    pub async fn run(&self) -> crate::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (client, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Accept error: {}", err);
                    continue;
                }
            };
            debug!("Received connection from: {}", addr);

            let dispatcher = Arc::clone(&self.dispatcher);
            let closed = self.shutdown.clone();
            let connection = span!(Level::INFO, "connection", %addr);
            tokio::spawn(
                async move {
                    let socket = Socks5Socket::new(client).with_shutdown(closed);
                    match socket.run(dispatcher.as_ref()).await {
                        Ok(handoff) => debug!("Connection finished: {:?}", handoff),
                        Err(err) => debug!("Connection failed: {}", err),
                    }
                }
                .instrument(connection),
            );
        }
        info!("SOCKS5 server stopped");
        Ok(())
    }

    /// Stops accepting. Safe to call more than once and from any task.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
