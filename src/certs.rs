//! Certificate center: hands out certificate/key pairs per host over HTTP.
//!
//! `GET /cert?host=<host>` answers `{"host", "cert", "key"}` with the PEM file contents
//! base64 encoded. Records that name a `username` require basic authentication.

use std::{convert::Infallible, io, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::CertEntry,
    http::{full, parse_basic_auth, text_response, Body},
    Error,
};

/// Body of a successful `cert` call. `cert` and `key` are base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertResponse {
    #[serde(default)]
    pub host: String,
    pub cert: String,
    pub key: String,
}

/// Lowercase hex SHA-256 of `salt + password`, the form stored in [`CertEntry::password`].
pub fn password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fixed table of certificate records, looked up by host.
pub struct CertCenter {
    entries: Vec<CertEntry>,
}

impl CertCenter {
    pub fn new(entries: Vec<CertEntry>) -> Self {
        Self { entries }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body> {
        let entry = match self.authorize(&req).await {
            Ok(entry) => entry,
            Err(response) => return response,
        };

        let call = req.uri().path().rsplit('/').next().unwrap_or_default();
        match call {
            "cert" => self.cert(entry).await,
            _ => text_response(StatusCode::NOT_FOUND, format!("{} is not supported", call)),
        }
    }

    /// Finds the record for the `host` query parameter and checks credentials against it.
    async fn authorize<B>(&self, req: &Request<B>) -> Result<CertEntry, Response<Body>> {
        let host = req
            .uri()
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "host")
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|host| !host.is_empty())
            .ok_or_else(|| text_response(StatusCode::BAD_REQUEST, "host parameter is required"))?;

        let entry = self
            .entries
            .iter()
            .find(|entry| entry.host == host)
            .cloned()
            .ok_or_else(|| text_response(StatusCode::NOT_FOUND, "host config is not exists"))?;

        if let Some(username) = entry.username.as_deref().filter(|name| !name.is_empty()) {
            if let Err(err) = check_credentials(req, username, &entry) {
                debug!("Rejecting certificate request for {}: {}", host, err);
                let mut response = text_response(StatusCode::UNAUTHORIZED, "auth fail");
                response.headers_mut().insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"wdebugger\""),
                );
                return Err(response);
            }
        }
        Ok(entry)
    }

    async fn cert(&self, entry: CertEntry) -> Response<Body> {
        let invalid = || text_response(StatusCode::INTERNAL_SERVER_ERROR, "host config is invalid");
        if entry.cert.is_empty() || entry.key.is_empty() {
            warn!("Certificate config for {} is missing cert/key", entry.host);
            return invalid();
        }
        let cert = match read_pem(&entry.host, &entry.cert).await {
            Ok(cert) => cert,
            Err(_) => return invalid(),
        };
        let key = match read_pem(&entry.host, &entry.key).await {
            Ok(key) => key,
            Err(_) => return invalid(),
        };

        let body = CertResponse {
            host: entry.host,
            cert: STANDARD.encode(cert),
            key: STANDARD.encode(key),
        };
        match serde_json::to_vec(&body) {
            Ok(body) => {
                let mut response = Response::new(full(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(err) => {
                warn!("Encoding certificate response failed: {}", err);
                invalid()
            }
        }
    }

    /// Serves HTTP/1.1 on `listener` until `shutdown` is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> crate::Result<()> {
        info!("Certificate center listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Accept error: {}", err);
                        continue;
                    }
                },
            };

            let center = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let center = Arc::clone(&center);
                    async move { Ok::<_, Infallible>(center.handle(req).await) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Certificate connection from {} failed: {}", addr, err);
                }
            });
        }
        info!("Certificate center stopped");
        Ok(())
    }
}

fn check_credentials<B>(req: &Request<B>, username: &str, entry: &CertEntry) -> crate::Result<()> {
    let (user, password) = parse_basic_auth(req.headers()).ok_or(Error::AuthFailure)?;
    if user != username {
        return Err(Error::AuthFailure);
    }
    if !password_hash(&entry.salt, &password).eq_ignore_ascii_case(&entry.password) {
        return Err(Error::AuthFailure);
    }
    Ok(())
}

async fn read_pem(host: &str, path: &str) -> io::Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|err| {
        warn!("Certificate config for {} reading {} failed: {}", host, path, err);
        err
    })
}
