//! Listener bridge: decoded connections reach the HTTP server through a bounded queue
//! that behaves like a listener.

use std::{convert::Infallible, sync::Arc};

use http_body_util::BodyExt;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, span, Instrument, Level};

use crate::{decoder::BoxedStream, forward::Forwarder, Error};

pub const QUEUE_CAPACITY: usize = 1000;

/// Fixed identity reported by [`Bridge::local_addr`].
pub const LOCAL_ADDR: &str = "debugger";

/// A decoded stream waiting to be served, labelled with the SOCKS5 destination key it
/// was requested for.
pub struct PendingConnection {
    pub stream: BoxedStream,
    pub remote: String,
}

pub struct Bridge {
    sender: mpsc::Sender<PendingConnection>,
    receiver: Mutex<mpsc::Receiver<PendingConnection>>,
    closed: CancellationToken,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }

    /// Queues a decoded connection, waiting for room when the queue is full.
    pub async fn push(&self, connection: PendingConnection) -> crate::Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            sent = self.sender.send(connection) => sent.map_err(|_| Error::Closed),
        }
    }

    /// Next queued connection. Returns [`Error::Closed`] once the bridge is closed, even
    /// if connections are still queued.
    pub async fn accept(&self) -> crate::Result<PendingConnection> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            connection = receiver.recv() => connection.ok_or(Error::Closed),
        }
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!("Bridge closed");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn local_addr(&self) -> &'static str {
        LOCAL_ADDR
    }

    /// Accept loop: serves HTTP/1.1 on every dequeued connection and routes its requests
    /// through `forwarder`. Returns when the bridge is closed.
    pub async fn serve(&self, forwarder: Arc<Forwarder>) -> crate::Result<()> {
        loop {
            let PendingConnection { stream, remote } = match self.accept().await {
                Ok(connection) => connection,
                Err(Error::Closed) => break,
                Err(err) => return Err(err),
            };
            debug!("Serving decoded connection for {}", remote);

            let forwarder = Arc::clone(&forwarder);
            let connection = span!(Level::INFO, "decoded", %remote);
            tokio::spawn(
                async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let forwarder = Arc::clone(&forwarder);
                        let remote = remote.clone();
                        async move {
                            let req = req.map(|body| body.boxed());
                            Ok::<_, Infallible>(forwarder.handle(&remote, req).await)
                        }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Decoded connection failed: {}", err);
                    }
                }
                .instrument(connection),
            );
        }
        info!("Bridge stopped serving");
        Ok(())
    }
}
