//! mTLS echo server: greets the request path and reports who the peer is.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use sidecar_rotation::TlsHooks;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::*;

/// Subject common name and serial of a presented certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub common_name: String,
    pub serial: String,
}

impl PeerIdentity {
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der).ok()?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        Some(Self {
            common_name,
            serial: format_serial(cert.raw_serial()),
        })
    }
}

/// Colon-separated lowercase hex, e.g. `1a:2b:3c`.
pub fn format_serial(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn greeting(path: &str, peers: &[PeerIdentity]) -> String {
    let mut body = format!("Hello, {:?}\n", path);
    for peer in peers {
        body.push_str(&format!(
            "I see you are: {:?} with serial {:?}\n",
            peer.common_name, peer.serial
        ));
    }
    body
}

/// Accept mTLS connections on `0.0.0.0:{port}` until `shutdown` resolves.
pub async fn run<F>(port: u16, hooks: &TlsHooks, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let acceptor = TlsAcceptor::from(Arc::new(hooks.server_config()?));
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(bind_addr).await?;
    info!("mTLS echo server listening on {}", bind_addr);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        tokio::spawn(serve_connection(acceptor.clone(), stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", bind_addr, e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Echo server on {} received shutdown signal", bind_addr);
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(acceptor: TlsAcceptor, stream: TcpStream, peer_addr: SocketAddr) {
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!("TLS handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let peers: Arc<Vec<PeerIdentity>> = Arc::new(
        tls.get_ref()
            .1
            .peer_certificates()
            .unwrap_or_default()
            .iter()
            .filter_map(|cert| PeerIdentity::from_der(cert))
            .collect(),
    );

    let service = service_fn(move |req: Request<Incoming>| {
        let peers = Arc::clone(&peers);
        async move {
            let body = greeting(req.uri().path(), &peers);
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
        }
    });

    // Each response ends the connection so every request costs a fresh handshake.
    if let Err(e) = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        debug!("Connection error from {}: {}", peer_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecar_pki::testing::TestCa;

    #[test]
    fn test_format_serial() {
        assert_eq!(format_serial(&[0x1a, 0x2b, 0x03]), "1a:2b:03");
        assert_eq!(format_serial(&[0xff]), "ff");
        assert_eq!(format_serial(&[]), "");
    }

    #[test]
    fn test_greeting_lists_peers() {
        let peers = vec![PeerIdentity {
            common_name: "outproxy".to_string(),
            serial: "53:31".to_string(),
        }];

        assert_eq!(
            greeting("/status", &peers),
            "Hello, \"/status\"\nI see you are: \"outproxy\" with serial \"53:31\"\n"
        );
        assert_eq!(greeting("/", &[]), "Hello, \"/\"\n");
    }

    #[test]
    fn test_peer_identity_from_certificate() {
        let ca = TestCa::new("Echo CA");
        let bundle = ca.issue_bundle("outproxy", &["localhost"], "S1");

        let peer = PeerIdentity::from_der(bundle.keypair.leaf()).unwrap();
        assert_eq!(peer.common_name, "outproxy");
        // "S1" as serial bytes
        assert_eq!(peer.serial, "53:31");
    }
}
