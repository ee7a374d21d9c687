//! Plain-HTTP listener that forwards every request to the target over mTLS.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use reqwest::tls::TlsInfo;
use sidecar_rotation::TlsHooks;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ProxyTarget;
use crate::server::PeerIdentity;

// Headers that describe the hop rather than the message.
const HOP_HEADERS: [header::HeaderName; 4] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

struct ProxyState {
    client: reqwest::Client,
    target: ProxyTarget,
    context_root: String,
}

/// Client presenting the rotating certificate. Idle connections are never
/// reused, so every request handshakes with whatever is current.
pub fn build_client(hooks: &TlsHooks, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .use_preconfigured_tls(hooks.client_config()?)
        .pool_max_idle_per_host(0)
        .tls_info(true)
        .timeout(timeout)
        .build()?;

    Ok(client)
}

/// Upstream URL for `uri`, with `context_root` stripped from the front of the path.
pub fn upstream_url(target: &ProxyTarget, context_root: &str, uri: &Uri) -> String {
    let path = uri.path();
    let stripped = if context_root.is_empty() {
        path
    } else {
        path.strip_prefix(context_root).unwrap_or(path)
    };

    let mut url = format!("{}://{}", target.scheme, target.host);
    if !stripped.starts_with('/') {
        url.push('/');
    }
    url.push_str(stripped);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Listen on `0.0.0.0:{port}` until `shutdown` resolves.
pub async fn run<F>(
    port: u16,
    client: reqwest::Client,
    target: ProxyTarget,
    context_root: String,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(ProxyState {
        client,
        target,
        context_root,
    });
    let app = Router::new().fallback(forward).with_state(state);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Forwarding proxy listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Forwarding proxy on {} stopped", bind_addr);
    Ok(())
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = upstream_url(&state.target, &state.context_root, &uri);
    debug!("Forwarding {} {} to {}", method, uri, url);

    let mut upstream_headers = headers;
    for name in HOP_HEADERS.iter() {
        upstream_headers.remove(name);
    }
    if let Ok(host) = HeaderValue::from_str(&state.target.host) {
        upstream_headers.insert(header::HOST, host);
    }

    let upstream = match state
        .client
        .request(method, &url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Upstream request to {} failed: {}", url, e);
            return (StatusCode::BAD_GATEWAY, format!("Upstream request failed: {}", e))
                .into_response();
        }
    };

    if let Some(peer) = upstream
        .extensions()
        .get::<TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .and_then(PeerIdentity::from_der)
    {
        info!(
            "Upstream {} presented {:?} with serial {}",
            state.target.host, peer.common_name, peer.serial
        );
    }

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    for name in HOP_HEADERS.iter() {
        response_headers.remove(name);
    }

    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Reading upstream response from {} failed: {}", url, e);
            return (StatusCode::BAD_GATEWAY, format!("Upstream response failed: {}", e))
                .into_response();
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ProxyTarget {
        ProxyTarget {
            scheme: "https".to_string(),
            host: "localhost:8443".to_string(),
        }
    }

    #[test]
    fn test_upstream_url_without_context_root() {
        let uri: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(
            upstream_url(&target(), "", &uri),
            "https://localhost:8443/api/items?page=2"
        );
    }

    #[test]
    fn test_upstream_url_strips_context_root() {
        let uri: Uri = "/outproxy/api/items".parse().unwrap();
        assert_eq!(
            upstream_url(&target(), "/outproxy", &uri),
            "https://localhost:8443/api/items"
        );

        let uri: Uri = "/outproxy".parse().unwrap();
        assert_eq!(
            upstream_url(&target(), "/outproxy", &uri),
            "https://localhost:8443/"
        );
    }

    #[test]
    fn test_upstream_url_keeps_unmatched_path() {
        let uri: Uri = "/other/path".parse().unwrap();
        assert_eq!(
            upstream_url(&target(), "/outproxy", &uri),
            "https://localhost:8443/other/path"
        );
    }

    #[test]
    fn test_client_builds_from_hooks() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let hooks = TlsHooks::new(Arc::new(sidecar_rotation::RotationState::new()));
        assert!(build_client(&hooks, Duration::from_secs(5)).is_ok());
    }
}
