use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::Error;

use super::{Dispatch, Handoff};

/// Dials the destination over TCP and relays bytes until the destination side closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConnect;

impl DirectConnect {
    pub async fn dial(&self, destination: &str) -> crate::Result<TcpStream> {
        TcpStream::connect(destination)
            .await
            .map_err(|source| Error::DialFailure {
                destination: destination.to_owned(),
                source,
            })
    }

    /// Copies client to destination on a background task and destination to client in
    /// the foreground. Returns once the destination stops sending; the background copy
    /// is then cancelled so both sockets are released.
    pub async fn relay<T>(&self, client: T, server: TcpStream) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = server.into_split();

        let upload = tokio::spawn(async move {
            let sent = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            sent
        });

        let received = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        upload.abort();

        match received {
            Ok(received) => {
                debug!("Relay finished, {} bytes received", received);
                Ok(())
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::NotConnected) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Dispatch for DirectConnect {
    type Route = TcpStream;

    async fn establish(&self, destination: &str) -> crate::Result<TcpStream> {
        self.dial(destination).await
    }

    async fn serve<T>(
        &self,
        _destination: String,
        client: T,
        server: TcpStream,
    ) -> crate::Result<Handoff>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.relay(client, server).await?;
        Ok(Handoff::Relayed)
    }
}
