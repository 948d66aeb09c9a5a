//! Body helpers and the outbound HTTP client shared by the bridge, the forwarder, the
//! certificate center and the TLS decoder.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Response, StatusCode,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use rustls::crypto::CryptoProvider;

use crate::Error;

pub type Body = BoxBody<Bytes, hyper::Error>;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Header added to every request that goes through the reverse proxy.
pub const PROXY_HEADER: &str = "WebDebuggerProxy";

pub fn proxy_header_value() -> HeaderValue {
    HeaderValue::from_static(concat!("v", env!("CARGO_PKG_VERSION")))
}

pub fn full<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    let mut msg = msg.into();
    msg.push('\n');
    let mut response = Response::new(full(msg));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client that speaks plain http and https (webpki roots), HTTP/1.1 only.
pub fn client() -> crate::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(crypto_provider())
        .map_err(|err| Error::Config(format!("building https connector: {}", err)))?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

pub fn basic_auth(username: &str, password: &str) -> crate::Result<HeaderValue> {
    let token = STANDARD.encode(format!("{}:{}", username, password));
    HeaderValue::from_str(&format!("Basic {}", token))
        .map_err(|err| Error::Config(format!("invalid credentials: {}", err)))
}

/// Username and password from an `Authorization: Basic` header.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}
