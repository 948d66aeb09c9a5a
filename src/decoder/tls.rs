//! TLS termination decoder.
//!
//! The certificate comes either from local PEM files (`cert` + `key` settings) or from a
//! certificate center (`server` URL template plus optional `username`/`password`). It is
//! loaded once per decoder and reused for every later connection.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use http_body_util::BodyExt;
use hyper::{header::AUTHORIZATION, Request};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::Mutex,
};
use tokio_rustls::{server, Accept, TlsAcceptor};
use tracing::{debug, info};

use super::{BoxedStream, Decoder};
use crate::{
    certs::CertResponse,
    config::DecoderConfig,
    http::{self, HttpClient},
    Error,
};

pub const KIND: &str = "TlsDecoder";
pub const LEGACY_KIND: &str = "TlsDecorder";

type KeyPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    Files {
        cert: PathBuf,
        key: PathBuf,
    },
    Remote {
        server: String,
        username: Option<String>,
        password: Option<String>,
    },
}

pub struct TlsDecoder {
    name: String,
    source: CertSource,
    client: HttpClient,
    loaded: Mutex<Option<Arc<ServerConfig>>>,
}

impl TlsDecoder {
    pub fn new(name: impl Into<String>, source: CertSource) -> crate::Result<Self> {
        Ok(Self {
            name: name.into(),
            source,
            client: http::client()?,
            loaded: Mutex::new(None),
        })
    }

    pub fn from_config(config: &DecoderConfig) -> crate::Result<Self> {
        let source = match (config.get("cert"), config.get("key"), config.get("server")) {
            (Some(cert), Some(key), _) => CertSource::Files {
                cert: cert.into(),
                key: key.into(),
            },
            (_, _, Some(server)) => CertSource::Remote {
                server: server.to_owned(),
                username: config.get("username").map(str::to_owned),
                password: config.get("password").map(str::to_owned),
            },
            _ => {
                return Err(Error::Config(format!(
                    "decoder {} needs cert and key files or a server",
                    config.name
                )))
            }
        };
        Self::new(config.name.clone(), source)
    }

    pub(super) fn construct(config: &DecoderConfig) -> crate::Result<Arc<dyn Decoder>> {
        Ok(Arc::new(Self::from_config(config)?))
    }

    pub fn source(&self) -> &CertSource {
        &self.source
    }

    /// Server configuration for this decoder, built on first use.
    ///
    /// The lock is held across the load so concurrent first connections wait for a
    /// single load. A failed load is not remembered.
    pub async fn tls_config(&self, host: &str) -> crate::Result<Arc<ServerConfig>> {
        let mut loaded = self.loaded.lock().await;
        if let Some(config) = loaded.as_ref() {
            return Ok(Arc::clone(config));
        }

        let config = match &self.source {
            CertSource::Files { cert, key } => {
                let (certs, key) = load_files(cert, key).await?;
                server_config(certs, key).map_err(|err| Error::CertificateLoad(err.to_string()))?
            }
            CertSource::Remote {
                server,
                username,
                password,
            } => {
                let (certs, key) =
                    self.fetch(server, host, username.as_deref(), password.as_deref())
                        .await?;
                server_config(certs, key).map_err(|err| Error::CertificateFetch(err.to_string()))?
            }
        };
        info!("Decoder {} loaded certificate for {}", self.name, host);

        let config = Arc::new(config);
        *loaded = Some(Arc::clone(&config));
        Ok(config)
    }

    async fn fetch(
        &self,
        server: &str,
        host: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> crate::Result<KeyPair> {
        let fetch_error = |err: &dyn std::fmt::Display| Error::CertificateFetch(err.to_string());

        let url = render_url(server, host);
        debug!("Fetching certificate from {}", url);
        let mut request = Request::get(url.as_str());
        if let Some(username) = username {
            let credentials = http::basic_auth(username, password.unwrap_or_default())
                .map_err(|err| fetch_error(&err))?;
            request = request.header(AUTHORIZATION, credentials);
        }
        let request = request.body(http::empty()).map_err(|err| fetch_error(&err))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| fetch_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::CertificateFetch(format!("{} answered {}", url, status)));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| fetch_error(&err))?
            .to_bytes();

        let payload: CertResponse = serde_json::from_slice(&body).map_err(|err| fetch_error(&err))?;
        let cert = STANDARD
            .decode(payload.cert)
            .map_err(|err| fetch_error(&err))?;
        let key = STANDARD.decode(payload.key).map_err(|err| fetch_error(&err))?;
        parse_pem(&cert, &key).map_err(Error::CertificateFetch)
    }
}

#[async_trait]
impl Decoder for TlsDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, host: &str) -> crate::Result<()> {
        self.tls_config(host).await.map(|_| ())
    }

    async fn decode(&self, host: &str, raw: BoxedStream) -> crate::Result<BoxedStream> {
        let acceptor = TlsAcceptor::from(self.tls_config(host).await?);
        Ok(Box::new(TlsServerStream::new(acceptor.accept(raw))))
    }
}

/// Replaces `{host}`, or else the first `%v`/`%s`, in a certificate server URL.
pub fn render_url(template: &str, host: &str) -> String {
    if template.contains("{host}") {
        template.replace("{host}", host)
    } else if template.contains("%v") {
        template.replacen("%v", host, 1)
    } else {
        template.replacen("%s", host, 1)
    }
}

async fn load_files(cert: &Path, key: &Path) -> crate::Result<KeyPair> {
    let read = |path: &Path, err: io::Error| {
        Error::CertificateLoad(format!("reading {}: {}", path.display(), err))
    };
    let cert_pem = tokio::fs::read(cert).await.map_err(|err| read(cert, err))?;
    let key_pem = tokio::fs::read(key).await.map_err(|err| read(key, err))?;
    parse_pem(&cert_pem, &key_pem).map_err(Error::CertificateLoad)
}

fn parse_pem(cert: &[u8], key: &[u8]) -> Result<KeyPair, String> {
    let certs = rustls_pemfile::certs(&mut &cert[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("parsing certificate: {}", err))?;
    if certs.is_empty() {
        return Err("no certificate in PEM data".into());
    }
    let key = rustls_pemfile::private_key(&mut &key[..])
        .map_err(|err| format!("parsing private key: {}", err))?
        .ok_or_else(|| "no private key in PEM data".to_owned())?;
    Ok((certs, key))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(http::crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

enum State<IO> {
    Handshaking(Accept<IO>),
    Streaming(server::TlsStream<IO>),
    Failed,
}

/// Server side of a TLS session whose handshake runs on the first read or write.
pub struct TlsServerStream<IO> {
    state: State<IO>,
}

impl<IO> TlsServerStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(accept: Accept<IO>) -> Self {
        Self {
            state: State::Handshaking(accept),
        }
    }

    #[cfg(test)]
    fn is_handshaking(&self) -> bool {
        matches!(self.state, State::Handshaking(_))
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut server::TlsStream<IO>>> {
        if let State::Handshaking(accept) = &mut self.state {
            match ready!(Pin::new(accept).poll(cx)) {
                Ok(stream) => self.state = State::Streaming(stream),
                Err(err) => {
                    debug!("TLS handshake failed: {}", err);
                    self.state = State::Failed;
                    return Poll::Ready(Err(err));
                }
            }
        }
        match &mut self.state {
            State::Streaming(stream) => Poll::Ready(Ok(stream)),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tls handshake failed",
            ))),
        }
    }
}

impl<IO> AsyncRead for TlsServerStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for TlsServerStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_shutdown(cx)
    }
}
