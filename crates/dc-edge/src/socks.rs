// SPDX-License-Identifier: AGPL-3.0-only

//! SOCKS5-Frontend: CONNECT mit IPv4/IPv6/Domain, Methodenliste 0x00.
//! Ziele werden nach den Overlay-Regeln aufgelöst (Hex-Adresse, BNS,
//! reservierte TLDs) und über den [`Dialer`] in Port-Streams gewandelt.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use dc_types::Address;

use crate::port::{bridge, BridgeOpts};
use crate::{contract, Dialer, EdgeError, PortMode};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// Reply-Codes
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_UNSUPPORTED: u8 = 0x07;

#[derive(Clone, Debug)]
pub struct SocksConfig {
    pub host: String,
    pub port: u16,
    /// Web2-Auflösung: `localhost` tunnelt zum Gateway-Loopback, andere
    /// Werte zu genau diesem Host, leer deaktiviert den Fallback.
    pub fallback: String,
    pub mode: PortMode,
    /// Leere Liste: alle Ziele erlaubt.
    pub allow_list: Vec<Address>,
    pub deny_list: Vec<Address>,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1080,
            fallback: "localhost".to_string(),
            mode: PortMode::Private,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
        }
    }
}

/// Zielklassen nach dem Parsen des SOCKS-Hostnamens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Device(Address),
    Name(String),
    Other(String),
}

/// Zielauflösung: reservierte TLDs strippen, 20-Byte-Hex direkt,
/// BNS-Muster auflösen, Rest fällt auf den Fallback zurück.
pub fn parse_destination(host: &str) -> Destination {
    let base = host
        .strip_suffix(".diode.link")
        .or_else(|| host.strip_suffix(".diode"))
        .unwrap_or(host);
    if let Ok(addr) = Address::parse_hex(base) {
        return Destination::Device(addr);
    }
    if contract::is_valid_bns(base) {
        return Destination::Name(base.to_string());
    }
    Destination::Other(host.to_string())
}

pub struct SocksServer {
    dialer: Arc<dyn Dialer>,
    cfg: SocksConfig,
    opts: BridgeOpts,
}

impl SocksServer {
    pub fn new(dialer: Arc<dyn Dialer>, cfg: SocksConfig, opts: BridgeOpts) -> Arc<Self> {
        Arc::new(Self { dialer, cfg, opts })
    }

    pub async fn bind(&self) -> Result<TcpListener, EdgeError> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| EdgeError::Config(format!("socks bind {addr}: {e}")))
    }

    /// Accept-Schleife bis zum Shutdown-Signal.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EdgeError> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "socks server listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!(peer = %peer, "socks connection");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(conn).await {
                                debug!(error = %e, "socks connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "socks accept failed"),
                },
                _ = shutdown.changed() => {
                    info!("socks server stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, mut conn: TcpStream) -> Result<(), EdgeError> {
        let io_err = |e: std::io::Error| EdgeError::Connect(e.to_string());

        // Methoden-Negotiation
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await.map_err(io_err)?;
        if head[0] != SOCKS_VERSION {
            return Err(EdgeError::Protocol(format!("socks version {}", head[0])));
        }
        let mut methods = vec![0u8; head[1] as usize];
        conn.read_exact(&mut methods).await.map_err(io_err)?;
        if !methods.contains(&0x00) {
            conn.write_all(&[SOCKS_VERSION, 0xff]).await.map_err(io_err)?;
            return Err(EdgeError::Protocol("no acceptable auth method".to_string()));
        }
        conn.write_all(&[SOCKS_VERSION, 0x00]).await.map_err(io_err)?;

        // Request
        let mut req = [0u8; 4];
        conn.read_exact(&mut req).await.map_err(io_err)?;
        let host = match req[3] {
            ATYP_IPV4 => {
                let mut raw = [0u8; 4];
                conn.read_exact(&mut raw).await.map_err(io_err)?;
                std::net::Ipv4Addr::from(raw).to_string()
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 16];
                conn.read_exact(&mut raw).await.map_err(io_err)?;
                std::net::Ipv6Addr::from(raw).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await.map_err(io_err)?;
                let mut raw = vec![0u8; len[0] as usize];
                conn.read_exact(&mut raw).await.map_err(io_err)?;
                String::from_utf8_lossy(&raw).to_string()
            }
            other => {
                reply(&mut conn, REP_GENERAL_FAILURE).await;
                return Err(EdgeError::Protocol(format!("socks atyp {other}")));
            }
        };
        let mut port_raw = [0u8; 2];
        conn.read_exact(&mut port_raw).await.map_err(io_err)?;
        let port = u16::from_be_bytes(port_raw);

        if req[1] != CMD_CONNECT {
            reply(&mut conn, REP_CMD_UNSUPPORTED).await;
            return Err(EdgeError::Protocol(format!("socks cmd {}", req[1])));
        }

        match self.dial(&host, port).await {
            Ok(stream) => {
                reply(&mut conn, REP_SUCCESS).await;
                info!(host = %host, port, "socks tunnel up");
                let _ = bridge(conn, stream, self.opts).await;
                Ok(())
            }
            Err(e) => {
                reply(&mut conn, reply_code(&e)).await;
                info!(host = %host, port, error = %e, "socks dial failed");
                Err(e)
            }
        }
    }

    fn check_access(&self, device: &Address) -> Result<(), EdgeError> {
        if self.cfg.deny_list.contains(device) {
            return Err(EdgeError::AccessDenied(format!("{device} deny-listed")));
        }
        if !self.cfg.allow_list.is_empty() && !self.cfg.allow_list.contains(device) {
            return Err(EdgeError::AccessDenied(format!("{device} not allow-listed")));
        }
        Ok(())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<crate::DialStream, EdgeError> {
        match parse_destination(host) {
            Destination::Device(addr) => {
                self.check_access(&addr)?;
                self.dialer.open_device(addr, port, self.cfg.mode).await
            }
            Destination::Name(name) => {
                let addr = self.dialer.resolve_name(&name).await?;
                self.check_access(&addr)?;
                self.dialer.open_device(addr, port, self.cfg.mode).await
            }
            Destination::Other(original) => {
                if self.cfg.fallback.is_empty() {
                    return Err(EdgeError::Client(format!("no route to {original}")));
                }
                let target = if self.cfg.fallback == "localhost" {
                    "localhost"
                } else {
                    self.cfg.fallback.as_str()
                };
                self.dialer.open_host(target, port).await
            }
        }
    }
}

/// Antwort mit leerer Bind-Adresse (0.0.0.0:0).
async fn reply(conn: &mut TcpStream, code: u8) {
    let _ = conn
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await;
}

fn reply_code(err: &EdgeError) -> u8 {
    match err {
        EdgeError::Client(_) => REP_HOST_UNREACHABLE,
        EdgeError::AccessDenied(_) => REP_NOT_ALLOWED,
        _ => REP_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DialStream;

    const DEVICE: Address = Address([0xaa; 20]);

    struct EchoDialer;

    #[async_trait::async_trait]
    impl Dialer for EchoDialer {
        async fn open_device(
            &self,
            device: Address,
            _port: u16,
            _mode: PortMode,
        ) -> Result<DialStream, EdgeError> {
            if device != DEVICE {
                return Err(EdgeError::Rpc("unknown device".to_string()));
            }
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match far.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if far.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(near))
        }

        async fn open_host(&self, _host: &str, _port: u16) -> Result<DialStream, EdgeError> {
            Err(EdgeError::Client("fallback disabled in test".to_string()))
        }

        async fn resolve_name(&self, name: &str) -> Result<Address, EdgeError> {
            if name == "pi-taipei" {
                Ok(DEVICE)
            } else {
                Err(EdgeError::Client(format!("unknown name {name}")))
            }
        }
    }

    fn test_server(cfg: SocksConfig) -> Arc<SocksServer> {
        SocksServer::new(
            Arc::new(EchoDialer),
            cfg,
            BridgeOpts {
                chunk_size: 1024,
                idle_timeout: std::time::Duration::from_secs(5),
            },
        )
    }

    async fn start(cfg: SocksConfig) -> (std::net::SocketAddr, watch::Sender<bool>) {
        let server = test_server(cfg);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(listener, rx));
        (addr, tx)
    }

    async fn connect_request(addr: std::net::SocketAddr, name: &[u8]) -> (TcpStream, [u8; 10]) {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        conn.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0u8; 2];
        conn.read_exact(&mut method).await.expect("method");
        assert_eq!(method, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
        req.extend_from_slice(name);
        req.extend_from_slice(&80u16.to_be_bytes());
        conn.write_all(&req).await.expect("request");
        let mut rep = [0u8; 10];
        conn.read_exact(&mut rep).await.expect("reply");
        (conn, rep)
    }

    #[test]
    fn destination_rules() {
        assert_eq!(
            parse_destination("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            Destination::Device(DEVICE)
        );
        assert_eq!(
            parse_destination("pi-taipei.diode"),
            Destination::Name("pi-taipei".to_string())
        );
        assert_eq!(
            parse_destination("pi-taipei.diode.link"),
            Destination::Name("pi-taipei".to_string())
        );
        // zu kurz für BNS → Fallback-Pfad
        assert_eq!(
            parse_destination("short"),
            Destination::Other("short".to_string())
        );
        assert_eq!(
            parse_destination("example.com"),
            Destination::Other("example.com".to_string())
        );
    }

    #[tokio::test]
    async fn connect_and_relay() {
        let (addr, _stop) = start(SocksConfig::default()).await;
        let (mut conn, rep) = connect_request(addr, b"pi-taipei").await;
        assert_eq!(&rep[..4], &[0x05, 0x00, 0x00, 0x01]);

        conn.write_all(b"ping").await.expect("send");
        let mut echo = [0u8; 4];
        conn.read_exact(&mut echo).await.expect("echo");
        assert_eq!(&echo, b"ping");
    }

    #[tokio::test]
    async fn unknown_name_is_host_unreachable() {
        let (addr, _stop) = start(SocksConfig {
            fallback: String::new(),
            ..SocksConfig::default()
        })
        .await;
        let (_conn, rep) = connect_request(addr, b"does-not-exist").await;
        assert_eq!(rep[1], REP_HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn deny_list_is_not_allowed() {
        let (addr, _stop) = start(SocksConfig {
            deny_list: vec![DEVICE],
            ..SocksConfig::default()
        })
        .await;
        let (_conn, rep) = connect_request(addr, b"pi-taipei").await;
        assert_eq!(rep[1], REP_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (addr, stop) = start(SocksConfig::default()).await;
        stop.send(true).expect("signal");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Verbindung wird nicht mehr bedient
        let conn = TcpStream::connect(addr).await;
        if let Ok(mut conn) = conn {
            conn.write_all(&[0x05, 0x01, 0x00]).await.ok();
            let mut buf = [0u8; 2];
            assert!(conn.read_exact(&mut buf).await.is_err());
        }
    }
}
