mod common;

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use common::TestCert;
use http_body_util::BodyExt;
use hyper::{body::Incoming, header, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wdebugger::{
    bridge::Bridge,
    certs::{password_hash, CertCenter, CertResponse},
    config::{CertEntry, Config, DecoderConfig, HostRule},
    decoder::{
        tls::{CertSource, TlsDecoder},
        Decoder,
    },
    http,
    router::Router,
    Dispatch, Error,
};

async fn start_center(cert: &TestCert) -> (SocketAddr, CancellationToken) {
    common::init_tracing();
    let center = Arc::new(CertCenter::new(vec![CertEntry {
        host: "localhost".into(),
        username: Some("abc".into()),
        password: password_hash("s4lt", "123"),
        salt: "s4lt".into(),
        cert: cert.cert.display().to_string(),
        key: cert.key.display().to_string(),
    }]));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(center.serve(listener, shutdown.clone()));
    (addr, shutdown)
}

fn remote_decoder(center: SocketAddr, password: &str) -> TlsDecoder {
    TlsDecoder::new(
        "tls1",
        CertSource::Remote {
            server: format!("http://{}/cert?host={{host}}", center),
            username: Some("abc".into()),
            password: Some(password.into()),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn cert_call_over_the_wire() {
    let cert = TestCert::new();
    let (center, shutdown) = start_center(&cert).await;
    let client = http::client().unwrap();

    let request = Request::get(format!("http://{}/cert?host=localhost", center))
        .header(header::AUTHORIZATION, http::basic_auth("abc", "123").unwrap())
        .body(http::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let payload: CertResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload.host, "localhost");
    assert_eq!(STANDARD.decode(payload.cert).unwrap(), cert.cert_pem.as_bytes());
    assert_eq!(STANDARD.decode(payload.key).unwrap(), cert.key_pem.as_bytes());

    let request = Request::get(format!("http://{}/cert?host=localhost", center))
        .body(http::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get(format!("http://{}/cert", center))
        .body(http::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    shutdown.cancel();
}

#[tokio::test]
async fn decoder_loads_certificate_from_center() {
    let cert = TestCert::new();
    let (center, shutdown) = start_center(&cert).await;

    let decoder = remote_decoder(center, "123");
    decoder.prepare("localhost").await.unwrap();

    let wrong = remote_decoder(center, "124");
    let err = wrong.prepare("localhost").await.unwrap_err();
    assert!(matches!(err, Error::CertificateFetch(_)), "{:?}", err);

    shutdown.cancel();
}

/// Certificate server that counts requests and answers slowly.
async fn counting_center(cert: &TestCert, hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = serde_json::to_vec(&CertResponse {
        host: "localhost".into(),
        cert: STANDARD.encode(&cert.cert_pem),
        key: STANDARD.encode(&cert.key_pem),
    })
    .unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::clone(&hits);
            let payload = payload.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    let payload = payload.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, Infallible>(Response::new(http::full(payload)))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn concurrent_first_use_fetches_once() {
    let cert = TestCert::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let center = counting_center(&cert, Arc::clone(&hits)).await;

    let decoder: DecoderConfig = serde_json::from_value(serde_json::json!({
        "name": "tls1",
        "type": "TlsDecorder",
        "server": format!("http://{}/cert?host=%v", center),
    }))
    .unwrap();
    let config = Config {
        hosts: vec![HostRule {
            host: "localhost".into(),
            decoder: "tls1".into(),
            forward: "http://127.0.0.1:10021".into(),
            ..Default::default()
        }],
        decoder: vec![decoder],
    };
    let router = Router::new(config, Arc::new(Bridge::new()));

    let (first, second) = tokio::join!(
        router.establish("localhost:443"),
        router.establish("localhost:443")
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(router.establish("localhost:8443").await.is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
