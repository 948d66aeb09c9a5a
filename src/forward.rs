//! Reverse-proxy handler for requests arriving over decoded connections.

use std::{fmt::Write as _, sync::Arc};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    http::request::Parts,
    Request, Response, StatusCode, Uri,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    http::{full, proxy_header_value, text_response, Body, HttpClient, PROXY_HEADER},
    router::HostTable,
    Error,
};

/// Headers that only make sense for a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Forwarder {
    hosts: Arc<HostTable>,
    client: HttpClient,
}

impl Forwarder {
    pub fn new(hosts: Arc<HostTable>, client: HttpClient) -> Self {
        Self { hosts, client }
    }

    /// Handles one request received on a decoded connection labelled `remote`.
    pub async fn handle(&self, remote: &str, req: Request<Body>) -> Response<Body> {
        let Some(rule) = self.hosts.find(remote).await else {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|host| host.to_str().ok())
                .unwrap_or(remote);
            let err = Error::RouteNotFound(host.to_owned());
            debug!("{}", err);
            return text_response(StatusCode::NOT_FOUND, err.to_string());
        };

        let target = match parse_target(&rule.forward) {
            Ok(target) => target,
            Err(err) => {
                warn!("{}", err);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        let req = if rule.dump_request {
            match dump(req).await {
                Ok(req) => req,
                Err(err) => {
                    debug!("Reading request body failed: {}", err);
                    return text_response(StatusCode::BAD_REQUEST, "reading request body failed");
                }
            }
        } else {
            req
        };

        let req = match rewrite(req, &target) {
            Ok(req) => req,
            Err(err) => {
                warn!("{}", err);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        debug!("Forwarding {} {} for {}", req.method(), req.uri(), remote);
        match self.client.request(req).await {
            Ok(response) => {
                let mut response = response.map(|body| body.boxed());
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(err) => {
                warn!("Forwarding to {} failed: {}", target, err);
                text_response(StatusCode::BAD_GATEWAY, "forward target is unavailable")
            }
        }
    }
}

/// Parses a rule's forward target. Only absolute http(s) URLs with a host are accepted.
pub fn parse_target(forward: &str) -> crate::Result<Url> {
    let invalid = || Error::ForwardTargetInvalid(forward.to_owned());
    let target = Url::parse(forward).map_err(|_| invalid())?;
    if !matches!(target.scheme(), "http" | "https") || target.host_str().is_none() {
        return Err(invalid());
    }
    Ok(target)
}

/// Points `req` at `target`: scheme and authority from the target, target path joined
/// with the request path, both queries kept. Also rewrites Host and adds the proxy tag.
fn rewrite(mut req: Request<Body>, target: &Url) -> crate::Result<Request<Body>> {
    let invalid = || Error::ForwardTargetInvalid(target.to_string());

    let authority = authority(target).ok_or_else(invalid)?;
    let path = join_path(target.path(), req.uri().path());
    let query = match (target.query(), req.uri().query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
        (Some(a), Some(b)) => Some(format!("{}{}", a, b)),
        (Some(a), None) => Some(a.to_owned()),
        (None, Some(b)) => Some(b.to_owned()),
        (None, None) => None,
    };

    let mut uri = format!("{}://{}{}", target.scheme(), authority, path);
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        uri.push('?');
        uri.push_str(&query);
    }
    *req.uri_mut() = uri.parse::<Uri>().map_err(|_| invalid())?;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    headers.insert(
        header::HOST,
        HeaderValue::from_str(&authority).map_err(|_| invalid())?,
    );
    headers.append(PROXY_HEADER, proxy_header_value());
    Ok(req)
}

fn authority(target: &Url) -> Option<String> {
    let host = target.host_str()?;
    Some(match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_owned(),
    })
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Logs the request at info level and hands it back with its body re-attached.
async fn dump(req: Request<Body>) -> Result<Request<Body>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body: Bytes = body.collect().await?.to_bytes();
    info!(
        "Dump request {} {}:\n{}",
        parts.method,
        parts.uri,
        dump_text(&parts, &body)
    );
    Ok(Request::from_parts(parts, full(body)))
}

/// Renders the URL, Header, Form and PostForm sections of a request dump. PostForm is
/// only filled for urlencoded bodies.
fn dump_text(parts: &Parts, body: &[u8]) -> String {
    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

    let mut out = String::new();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default();
    let _ = writeln!(out, "---URL---");
    let _ = writeln!(out, "Host\t {}", host);
    let _ = writeln!(out, "Path\t {}", parts.uri.path());
    let _ = writeln!(out, "RawQuery\t {}", parts.uri.query().unwrap_or_default());
    let user = parts
        .uri
        .authority()
        .and_then(|authority| authority.as_str().rsplit_once('@'))
        .map(|(user, _)| user)
        .unwrap_or_default();
    let _ = writeln!(out, "User\t {}", user);

    let _ = writeln!(out, "\n---Header---");
    for (name, value) in parts.headers.iter() {
        let _ = writeln!(out, "{}\t {}", name, String::from_utf8_lossy(value.as_bytes()));
    }

    let _ = writeln!(out, "\n---Form---");
    let query = parts.uri.query().unwrap_or_default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let _ = writeln!(out, "{}\t {}", key, value);
    }

    let _ = writeln!(out, "---PostForm---");
    if is_form {
        for (key, value) in url::form_urlencoded::parse(body) {
            let _ = writeln!(out, "{}\t {}", key, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use hyper::{body::Incoming, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{config::HostRule, http};

    /// Upstream that answers with what it received: `host|path?query|proxy tag|body`.
    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let host = req.headers()[header::HOST].to_str().unwrap().to_owned();
                        let tag = req
                            .headers()
                            .get(PROXY_HEADER)
                            .map(|value| value.to_str().unwrap().to_owned())
                            .unwrap_or_default();
                        let hop = req.headers().contains_key("x-hop");
                        let path = req.uri().path_and_query().unwrap().to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let text = format!(
                            "{}|{}|{}|{}|{}",
                            host,
                            path,
                            tag,
                            hop,
                            String::from_utf8_lossy(&body)
                        );
                        Ok::<_, Infallible>(Response::new(http::full(text)))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn forwarder(forward: &str, dump_request: bool) -> Forwarder {
        Forwarder::new(
            Arc::new(HostTable::new(vec![HostRule {
                host: "localhost".into(),
                decoder: "tls1".into(),
                forward: forward.into(),
                dump_request,
                ..Default::default()
            }])),
            http::client().unwrap(),
        )
    }

    async fn text(response: Response<Body>) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn request(uri: &str, body: &'static str) -> Request<Body> {
        Request::post(uri)
            .header(header::HOST, "localhost")
            .header(header::CONNECTION, "x-hop")
            .header("x-hop", "1")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(http::full(body))
            .unwrap()
    }

    #[test]
    fn forward_targets() {
        assert!(parse_target("http://127.0.0.1:10021").is_ok());
        assert!(parse_target("https://example.com/base?x=1").is_ok());
        assert!(parse_target("not a url").is_err());
        assert!(parse_target("ftp://example.com").is_err());
        assert!(parse_target("").is_err());
    }

    #[test]
    fn paths_are_joined_with_one_slash() {
        assert_eq!(join_path("/", "/a"), "/a");
        assert_eq!(join_path("/base/", "/a"), "/base/a");
        assert_eq!(join_path("/base", "/a"), "/base/a");
        assert_eq!(join_path("/base", "a"), "/base/a");
    }

    #[test]
    fn dump_lists_every_section() {
        let (parts, _) = Request::post("/login?user=a&lang=en")
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("x-trace", "7")
            .body(())
            .unwrap()
            .into_parts();
        let out = dump_text(&parts, b"name=x&pass=y%21");

        let url = out.find("---URL---").unwrap();
        let headers = out.find("---Header---").unwrap();
        let form = out.find("---Form---").unwrap();
        let post_form = out.find("---PostForm---").unwrap();
        assert!(url < headers && headers < form && form < post_form);

        assert!(out[url..headers].contains("Host\t localhost\n"));
        assert!(out[url..headers].contains("Path\t /login\n"));
        assert!(out[url..headers].contains("RawQuery\t user=a&lang=en\n"));
        assert!(out[headers..form].contains("x-trace\t 7\n"));
        assert!(out[form..post_form].contains("user\t a\n"));
        assert!(out[form..post_form].contains("lang\t en\n"));
        assert!(out[post_form..].contains("name\t x\n"));
        assert!(out[post_form..].contains("pass\t y!\n"));
    }

    #[test]
    fn dump_skips_post_form_for_other_bodies() {
        let (parts, _) = Request::post("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(())
            .unwrap()
            .into_parts();
        let out = dump_text(&parts, b"name=x");
        assert!(out.ends_with("---PostForm---\n"), "{}", out);
        assert!(out.contains("Host\t \n"));
    }

    #[tokio::test]
    async fn unknown_remote_is_not_found() {
        let response = forwarder("http://127.0.0.1:1", false)
            .handle("example.com:443", request("/", ""))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(text(response).await, "localhost is not configured\n");
    }

    #[tokio::test]
    async fn invalid_target_is_server_error() {
        let response = forwarder("::not a url::", false)
            .handle("localhost:443", request("/", ""))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_is_rewritten_for_the_target() {
        let upstream = echo_upstream().await;
        let authority = upstream.trim_start_matches("http://").to_owned();
        let forward = format!("{}/base?fixed=1", upstream);

        for dump_request in [false, true] {
            let response = forwarder(&forward, dump_request)
                .handle("localhost:443", request("/login?user=a", "name=x&pass=y"))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                text(response).await,
                format!(
                    "{}|/base/login?fixed=1&user=a|v{}|false|name=x&pass=y",
                    authority,
                    env!("CARGO_PKG_VERSION")
                )
            );
        }
    }

    #[tokio::test]
    async fn unreachable_target_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forward = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let response = forwarder(&forward, false)
            .handle("localhost:443", request("/", ""))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
