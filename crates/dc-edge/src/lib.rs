// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::todo,
    clippy::unimplemented
)]

pub mod client;
pub mod contract;
pub mod httpd;
pub mod pool;
pub mod port;
pub mod protocol;
pub mod socks;
pub mod template;
pub mod ticket;
pub mod transaction;
pub mod watcher;

use std::time::Duration;

use dc_blockquick::ConsensusError;
use dc_codec::CodecError;
use dc_store::StoreError;
use dc_types::Address;

pub use client::RpcClient;
pub use pool::DataPool;
pub use port::{bridge, BridgeOpts, PortChannel, PortStream};

/// Produktionsseitige Gateways; der Supervisor rennt alle Kandidaten.
pub const DEFAULT_GATEWAYS: &[&str] = &[
    "as1.prenet.diode.io:41046",
    "as2.prenet.diode.io:41046",
    "eu1.prenet.diode.io:41046",
    "eu2.prenet.diode.io:41046",
    "us1.prenet.diode.io:41046",
    "us2.prenet.diode.io:41046",
];

#[derive(Debug)]
pub enum EdgeError {
    /// Fehlkonfiguration (Flag oder persistierter Wert); fatal beim Start.
    Config(String),
    Store(StoreError),
    /// TLS/DNS-Fehler zu einem einzelnen Gateway; Supervisor probiert weiter.
    Connect(String),
    Consensus(ConsensusError),
    /// Kaputter Frame oder unerwartetes Atom; beendet die Session.
    Protocol(String),
    AccessDenied(String),
    Timeout,
    ConnectionClosed,
    /// Fehler-Frame des Gateways zu einem Request.
    Rpc(String),
    /// Nutzereingabe (BNS-Name, Adresse).
    Client(String),
}

impl core::fmt::Display for EdgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "config error: {s}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Connect(s) => write!(f, "connect failed: {s}"),
            Self::Consensus(e) => write!(f, "consensus: {e}"),
            Self::Protocol(s) => write!(f, "protocol error: {s}"),
            Self::AccessDenied(s) => write!(f, "access denied: {s}"),
            Self::Timeout => f.write_str("request timed out"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Rpc(s) => write!(f, "rpc error: {s}"),
            Self::Client(s) => write!(f, "client error: {s}"),
        }
    }
}

impl std::error::Error for EdgeError {}

impl From<StoreError> for EdgeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
impl From<ConsensusError> for EdgeError {
    fn from(e: ConsensusError) -> Self {
        Self::Consensus(e)
    }
}
impl From<CodecError> for EdgeError {
    fn from(e: CodecError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl EdgeError {
    /// Fehler, die beim Start nicht behebbar sind (Exit-Code 129).
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Store(_))
    }
}

/// Sichtbarkeit eines Port-Streams bzw. einer Veröffentlichung.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortMode {
    Public,
    Protected,
    Private,
}

impl PortMode {
    pub fn as_atom(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::Private => "private",
        }
    }
}

impl core::str::FromStr for PortMode {
    type Err = EdgeError;
    fn from_str(s: &str) -> Result<Self, EdgeError> {
        match s {
            "public" => Ok(Self::Public),
            "protected" => Ok(Self::Protected),
            "private" => Ok(Self::Private),
            other => Err(EdgeError::Config(format!("unknown port mode: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Tls,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Session-Parameter; Defaults entsprechen dem Produktionsprofil.
#[derive(Clone, Debug)]
pub struct EdgeConfig {
    pub gateways: Vec<String>,
    pub fleet: Address,
    /// Deadline je `call` (Ticket-Verkehr zählt nicht dagegen).
    pub call_timeout: Duration,
    /// Ticket-Schwelle T in Bytes.
    pub ticket_threshold: u64,
    /// Fenstergröße W des Verifiers.
    pub window_size: usize,
    /// Leerlauf-Timeout I einer Bridge.
    pub idle_timeout: Duration,
    /// Chunk-Größe B für Port-Daten.
    pub chunk_size: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            gateways: DEFAULT_GATEWAYS.iter().map(|s| s.to_string()).collect(),
            fleet: contract::default_fleet(),
            call_timeout: Duration::from_secs(10),
            ticket_threshold: 4 * 1024 * 1024,
            window_size: dc_blockquick::DEFAULT_WINDOW,
            idle_timeout: Duration::from_secs(300),
            chunk_size: 16 * 1024,
        }
    }
}

/// Persistiert das Verifier-Fenster unter dem Store-Schlüssel `window`.
pub struct StoreWindowSink(pub std::sync::Arc<dc_store::ClientStore>);

impl dc_blockquick::WindowSink for StoreWindowSink {
    fn persist_window(&self, encoded: &[u8]) -> Result<(), String> {
        self.0
            .put(dc_store::KEY_WINDOW, encoded)
            .map_err(|e| e.to_string())
    }
}

/// Stream-Objekt, das SOCKS/HTTP-Bridges bewegen; Produktion liefert
/// [`PortChannel`], Tests beliebige Duplex-Streams.
pub trait AsyncSocket: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncSocket for T {}

pub type DialStream = Box<dyn AsyncSocket>;

/// Wählbare Ziele im Overlay. Die Proxy-Frontends (SOCKS5, HTTP) sprechen
/// nur über diese Schnittstelle mit der RPC-Session.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn open_device(
        &self,
        device: Address,
        port: u16,
        mode: PortMode,
    ) -> Result<DialStream, EdgeError>;
    /// Fallback: Tunnel zum Loopback des Gateways.
    async fn open_host(&self, host: &str, port: u16) -> Result<DialStream, EdgeError>;
    async fn resolve_name(&self, name: &str) -> Result<Address, EdgeError>;
}
