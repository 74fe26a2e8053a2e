// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP/HTTPS-Reverse-Proxy: der Host-Header wird wie ein SOCKS-Ziel
//! interpretiert, die Anfrage über einen Port-Stream zum Gerät getunnelt.
//! CONNECT wird per Upgrade gespleißt, Upstream-TLS bleibt Ende-zu-Ende.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::port::{bridge, BridgeOpts};
use crate::socks::{parse_destination, Destination};
use crate::{template, Dialer, DialStream, EdgeError, PortMode};

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub httpd_host: String,
    pub httpd_port: u16,
    pub httpsd_host: String,
    pub httpsd_port: u16,
    pub certpath: String,
    pub privpath: String,
    /// HTTPS-Listener aktivieren.
    pub secure: bool,
    /// 301 von HTTP auf HTTPS.
    pub allow_redirect: bool,
    pub mode: PortMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            httpd_host: "127.0.0.1".to_string(),
            httpd_port: 80,
            httpsd_host: "127.0.0.1".to_string(),
            httpsd_port: 443,
            certpath: "./priv/cert.pem".to_string(),
            privpath: "./priv/priv.pem".to_string(),
            secure: false,
            allow_redirect: false,
            mode: PortMode::Public,
        }
    }
}

pub struct HttpProxy {
    dialer: Arc<dyn Dialer>,
    cfg: ProxyConfig,
    opts: BridgeOpts,
}

impl HttpProxy {
    pub fn new(dialer: Arc<dyn Dialer>, cfg: ProxyConfig, opts: BridgeOpts) -> Arc<Self> {
        Arc::new(Self { dialer, cfg, opts })
    }

    /// Plain-HTTP-Listener mit Graceful-Shutdown.
    pub async fn run_http(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EdgeError> {
        let addr: std::net::SocketAddr = format!("{}:{}", self.cfg.httpd_host, self.cfg.httpd_port)
            .parse()
            .map_err(|e| EdgeError::Config(format!("httpd addr: {e}")))?;
        let proxy = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let proxy = proxy.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(proxy.handle(req, false).await) }
                }))
            }
        });
        let server = Server::try_bind(&addr)
            .map_err(|e| EdgeError::Config(format!("httpd bind {addr}: {e}")))?
            .serve(make_svc);
        info!(addr = %addr, "http proxy listening");
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown.changed().await;
        });
        graceful
            .await
            .map_err(|e| EdgeError::Connect(format!("httpd: {e}")))
    }

    /// HTTPS-Listener: lokale TLS-Termination, dann derselbe Handler.
    pub async fn run_https(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EdgeError> {
        let addr = format!("{}:{}", self.cfg.httpsd_host, self.cfg.httpsd_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| EdgeError::Config(format!("httpsd bind {addr}: {e}")))?;
        let tls_cfg = build_tls_config(&self.cfg.certpath, &self.cfg.privpath)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_cfg));
        info!(addr = %addr, "https proxy listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "https accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(conn).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "tls handshake failed");
                                return;
                            }
                        };
                        let service = service_fn(move |req: Request<Body>| {
                            let proxy = proxy.clone();
                            async move { Ok::<_, Infallible>(proxy.handle(req, true).await) }
                        });
                        if let Err(e) = hyper::server::conn::Http::new()
                            .serve_connection(tls, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(peer = %peer, error = %e, "https connection ended");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("https proxy stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, req: Request<Body>, tls: bool) -> Response<Body> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        let Some((host, port)) = host_of(&req) else {
            return error_page(StatusCode::BAD_REQUEST, "missing Host header");
        };
        if !tls && self.cfg.allow_redirect && self.cfg.secure {
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let location = format!("https://{host}{path}");
            return Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(hyper::header::LOCATION, location)
                .body(Body::empty())
                .unwrap_or_else(|_| error_page(StatusCode::INTERNAL_SERVER_ERROR, "redirect"));
        }
        match self.forward(req, &host, port).await {
            Ok(resp) => resp,
            Err(e) => {
                info!(host = %host, error = %e, "proxy request failed");
                proxy_error(&e)
            }
        }
    }

    /// Tunnelt die Anfrage über hyper-Client-Conn durch den Port-Stream.
    async fn forward(
        &self,
        req: Request<Body>,
        host: &str,
        port: u16,
    ) -> Result<Response<Body>, EdgeError> {
        let stream = self.dial(host, port).await?;
        let (mut sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| EdgeError::Connect(format!("upstream handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "upstream connection ended");
            }
        });
        let (parts, body) = req.into_parts();
        let mut upstream = Request::builder().method(parts.method).uri(
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
        );
        for (name, value) in parts.headers.iter() {
            upstream = upstream.header(name, value);
        }
        let upstream = upstream
            .body(body)
            .map_err(|e| EdgeError::Protocol(format!("rebuild request: {e}")))?;
        sender
            .send_request(upstream)
            .await
            .map_err(|e| EdgeError::Connect(format!("upstream request: {e}")))
    }

    /// CONNECT: 200 liefern, dann Rohbytes spleißen (Ende-zu-Ende-TLS).
    async fn handle_connect(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let Some((host, port)) = host_of(&req) else {
            return error_page(StatusCode::BAD_REQUEST, "CONNECT without authority");
        };
        let opts = self.opts;
        let proxy = self.clone();
        tokio::spawn(async move {
            match proxy.dial(&host, port).await {
                Ok(stream) => match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(e) = bridge(upgraded, stream, opts).await {
                            debug!(error = %e, "connect tunnel ended");
                        }
                    }
                    Err(e) => debug!(error = %e, "upgrade failed"),
                },
                Err(e) => info!(host = %host, error = %e, "connect dial failed"),
            }
        });
        Response::new(Body::empty())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<DialStream, EdgeError> {
        match parse_destination(host) {
            Destination::Device(addr) => self.dialer.open_device(addr, port, self.cfg.mode).await,
            Destination::Name(name) => {
                let addr = self.dialer.resolve_name(&name).await?;
                self.dialer.open_device(addr, port, self.cfg.mode).await
            }
            Destination::Other(original) => {
                Err(EdgeError::Client(format!("not an overlay host: {original}")))
            }
        }
    }
}

fn host_of(req: &Request<Body>) -> Option<(String, u16)> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;
    let default_port = if req.method() == Method::CONNECT { 443 } else { 80 };
    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().unwrap_or(default_port);
            Some((host.to_string(), port))
        }
        None => Some((raw, default_port)),
    }
}

fn error_page(status: StatusCode, more: &str) -> Response<Body> {
    let html = template::page(
        "Diode Proxy",
        status.as_u16(),
        status.canonical_reason().unwrap_or("error"),
        more,
    );
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(html))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn proxy_error(err: &EdgeError) -> Response<Body> {
    let status = match err {
        EdgeError::Client(_) => StatusCode::NOT_FOUND,
        EdgeError::AccessDenied(_) => StatusCode::FORBIDDEN,
        EdgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_page(status, &err.to_string())
}

fn build_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig, EdgeError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EdgeError::Config(format!("tls single_cert: {e}")))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, EdgeError> {
    let file = std::fs::File::open(path)
        .map_err(|e| EdgeError::Config(format!("open certs {path}: {e}")))?;
    let mut rd = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Config(format!("parse certs {path}: {e}")))?;
    if certs.is_empty() {
        return Err(EdgeError::Config(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, EdgeError> {
    let open = |p: &str| {
        std::fs::File::open(p).map_err(|e| EdgeError::Config(format!("open key {p}: {e}")))
    };
    let mut rd = std::io::BufReader::new(open(path)?);
    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::pkcs8_private_keys(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Config(format!("parse key {path}: {e}")))?
        .into_iter()
        .map(Into::into)
        .collect();
    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }
    let mut rd = std::io::BufReader::new(open(path)?);
    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::rsa_private_keys(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Config(format!("parse key {path}: {e}")))?
        .into_iter()
        .map(Into::into)
        .collect();
    keys.into_iter()
        .next()
        .ok_or_else(|| EdgeError::Config(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_types::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct StaticHttpDialer;

    #[async_trait::async_trait]
    impl Dialer for StaticHttpDialer {
        async fn open_device(
            &self,
            _device: Address,
            _port: u16,
            _mode: PortMode,
        ) -> Result<DialStream, EdgeError> {
            let (near, mut far) = tokio::io::duplex(8192);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                // Request-Kopf konsumieren, dann feste Antwort liefern
                let _ = far.read(&mut buf).await;
                let body = b"device says hi";
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = far.write_all(head.as_bytes()).await;
                let _ = far.write_all(body).await;
            });
            Ok(Box::new(near))
        }

        async fn open_host(&self, _host: &str, _port: u16) -> Result<DialStream, EdgeError> {
            Err(EdgeError::Client("no fallback".to_string()))
        }

        async fn resolve_name(&self, name: &str) -> Result<Address, EdgeError> {
            if name == "pi-taipei" {
                Ok(Address([0xaa; 20]))
            } else {
                Err(EdgeError::Client(format!("unknown name {name}")))
            }
        }
    }

    fn proxy(cfg: ProxyConfig) -> Arc<HttpProxy> {
        HttpProxy::new(Arc::new(StaticHttpDialer), cfg, BridgeOpts::default())
    }

    fn get_request(host: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri("/index.html")
            .header(hyper::header::HOST, host)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn forwards_to_resolved_device() {
        let proxy = proxy(ProxyConfig::default());
        let resp = proxy.handle(get_request("pi-taipei.diode"), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.expect("body");
        assert_eq!(&body[..], b"device says hi");
    }

    #[tokio::test]
    async fn unknown_host_renders_error_page() {
        let proxy = proxy(ProxyConfig::default());
        let resp = proxy.handle(get_request("example.com"), false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = hyper::body::to_bytes(resp.into_body()).await.expect("body");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("404"));
        assert!(text.contains("<svg"));
    }

    #[tokio::test]
    async fn redirect_mode_sends_301() {
        let proxy = proxy(ProxyConfig {
            secure: true,
            allow_redirect: true,
            ..ProxyConfig::default()
        });
        let resp = proxy.handle(get_request("pi-taipei.diode"), false).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers()
                .get(hyper::header::LOCATION)
                .and_then(|v| v.to_str().ok()),
            Some("https://pi-taipei.diode/index.html")
        );
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let proxy = proxy(ProxyConfig::default());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .expect("request");
        let resp = proxy.handle(req, false).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
