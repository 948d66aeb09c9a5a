use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    dispatch::{Dispatch, Handoff},
    framed::read_full,
    protocol::{AuthMethod, Command, Reply, SocksSocketAddr, RESERVED, VERSION},
    Error,
};

/// State gathered while parsing one connection's greeting and request.
#[derive(Debug, Clone)]
pub struct ProxySession {
    /// Raw command byte. Anything other than CONNECT is routed like CONNECT.
    pub command: u8,
    pub destination: SocksSocketAddr,
}

impl ProxySession {
    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }
}

/// One accepted SOCKS5 client connection.
pub struct Socks5Socket<T> {
    inner: T,
    closed: Option<CancellationToken>,
}

impl<T> Socks5Socket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            closed: None,
        }
    }

    /// Refuses dispatch with [`Error::Closed`] once `closed` is cancelled.
    pub fn with_shutdown(mut self, closed: CancellationToken) -> Self {
        self.closed = Some(closed);
        self
    }

    /// Runs the whole exchange: greeting, request, dispatch and reply.
    ///
    /// Parse failures close the connection without a reply. Dispatch failures send a
    /// failure reply first. On success the connection belongs to `dispatcher`.
    #[instrument(skip_all)]
    pub async fn run<D>(mut self, dispatcher: &D) -> crate::Result<Handoff>
    where
        D: Dispatch,
    {
        let session = match self.socks_request().await {
            Ok(session) => session,
            Err(err) => {
                debug!("Dropping connection before dispatch: {}", err);
                return Err(err);
            }
        };
        match session.command() {
            Some(Command::Connect) => {}
            Some(command) => debug!("{} is handled as CONNECT", command),
            None => debug!("Unknown command {:#04x} is handled as CONNECT", session.command),
        }

        let destination = session.destination.to_string();
        let established = if self.is_closed() {
            Err(Error::Closed)
        } else {
            dispatcher.establish(&destination).await
        };
        let route = match established {
            Ok(route) => route,
            Err(err) => {
                warn!("Dispatch to {} failed: {}", destination, err);
                self.reply(err.reply(), SocksSocketAddr::default()).await?;
                let _ = self.shutdown().await;
                return Err(err);
            }
        };

        self.reply(Reply::Success, SocksSocketAddr::default())
            .await?;
        debug!("Connection to {} established", destination);

        dispatcher.serve(destination, self.inner, route).await
    }

    fn is_closed(&self) -> bool {
        self.closed.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Performs the greeting and reads the request, leaving the stream positioned at
    /// the first byte of client payload.
    pub async fn socks_request(&mut self) -> crate::Result<ProxySession> {
        let methods = self.parse_methods().await?;
        trace!("Client offered methods: {:?}", methods);

        let negotiated_method = AuthMethod::NoAuthRequired;
        self.write_auth_method(negotiated_method).await?;

        let (command, address_type) = self.parse_request().await?;
        let destination = SocksSocketAddr::read(&mut self.inner, address_type).await?;

        Ok(ProxySession {
            command,
            destination,
        })
    }
}

impl<T> Socks5Socket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn reply(&mut self, reply: Reply, bnd_address: SocksSocketAddr) -> crate::Result<()> {
        let mut frame = Vec::with_capacity(10);
        frame.push(VERSION);
        frame.push(reply.to_u8());
        frame.push(RESERVED);
        frame.extend(bnd_address.to_bytes());

        self.write_all(&frame).await?;
        self.flush().await?;

        Ok(())
    }

    async fn write_auth_method(&mut self, auth_method: AuthMethod) -> crate::Result<()> {
        self.write_all(&[VERSION, auth_method.to_u8()]).await?;
        self.flush().await?;
        Ok(())
    }

    async fn parse_methods(&mut self) -> crate::Result<Vec<AuthMethod>> {
        let mut buf = [0u8; u8::MAX as usize];

        let header = read_full(&mut *self, &mut buf, 2)
            .await
            .map_err(Error::from_read)?;
        let (version, count) = (header[0], header[1] as usize);
        if version != VERSION {
            return Err(Error::ProtocolVersion(version));
        }

        let methods = read_full(&mut *self, &mut buf, count)
            .await
            .map_err(Error::from_read)?;
        Ok(methods.iter().copied().map(AuthMethod::from_u8).collect())
    }

    /// Reads VER CMD RSV ATYP and returns the command and address type bytes.
    async fn parse_request(&mut self) -> crate::Result<(u8, u8)> {
        let mut buf = [0u8; 4];
        let request = read_full(&mut *self, &mut buf, 4)
            .await
            .map_err(Error::from_read)?;
        if request[0] != VERSION {
            return Err(Error::ProtocolVersion(request[0]));
        }
        Ok((request[1], request[3]))
    }
}

impl<T> AsyncRead for Socks5Socket<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for Socks5Socket<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
