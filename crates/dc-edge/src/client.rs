// SPDX-License-Identifier: AGPL-3.0-only

//! Eine RPC-Session besitzt genau eine TLS-Verbindung zu einem Gateway:
//! ein Reader-Task (Frames dispatchen), ein Writer-Task (Frames seriell
//! schreiben), Pending-Tabelle für korrelierte Antworten, Ticket-Zähler.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use dc_blockquick::{BlockQuick, ConsensusError};
use dc_codec::Term;
use dc_store::{ClientStore, KEY_WINDOW};
use dc_types::{Account, Address, BlockHeader};

use crate::pool::DataPool;
use crate::port::{bridge, BridgeOpts, PortChannel, PortStream};
use crate::protocol::{self, Inbound};
use crate::ticket::Ticket;
use crate::watcher::ChainView;
use crate::{contract, Dialer, DialStream, Direction, EdgeConfig, EdgeError, PortMode, PortProtocol};

/// Session-Zustand; Übergänge sind einbahnig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SessionState {
    Connecting,
    Handshaking,
    Validating,
    Ready,
    Closing,
    Closed,
}

mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Gateways sind per Design unvertraut: ihre Antworten werden durch
    /// BlockQuick validiert, nicht durch WebPKI. Die Zertifikatsprüfung
    /// ist daher eine Formalie.
    #[derive(Debug)]
    pub struct ConsensusVerified;

    impl ServerCertVerifier for ConsensusVerified {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

fn tls_connector() -> TlsConnector {
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::ConsensusVerified))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(cfg))
}

struct Inner {
    host: String,
    cfg: EdgeConfig,
    pool: Arc<DataPool>,
    verifier: Arc<BlockQuick>,
    store: Arc<ClientStore>,
    secret: [u8; 32],
    address: Address,
    fleet: Address,
    /// Vorserialisierte Frames an den Writer-Task; leerer Frame = Shutdown.
    out: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Term, EdgeError>>>>,
    next_id: AtomicU64,
    state: Mutex<SessionState>,
    /// Inbound-Bytes seit dem letzten Ticket (Schwellenrest).
    unticketed: AtomicU64,
    total_bytes: AtomicU64,
    total_connections: AtomicU64,
    bns_cache: Mutex<LruCache<String, Address>>,
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Verbindet, validiert das Netz, prüft die Fleet-Mitgliedschaft und
    /// meldet sich mit einem initialen Ticket an.
    pub async fn connect(
        host: &str,
        cfg: EdgeConfig,
        pool: Arc<DataPool>,
        verifier: Arc<BlockQuick>,
        store: Arc<ClientStore>,
    ) -> Result<Self, EdgeError> {
        let secret = store.ensure_private_key()?;
        let address = Address(
            dc_crypto::secret_to_address(&secret)
                .map_err(|e| EdgeError::Config(e.to_string()))?,
        );
        let fleet = cfg.fleet;

        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:41046")
        };
        let sni = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| EdgeError::Connect(format!("{addr}: {e}")))?;
        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|e| EdgeError::Connect(format!("{sni}: {e}")))?;
        let tls = tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| EdgeError::Connect(format!("tls {addr}: {e}")))?;
        let (read_half, write_half) = tokio::io::split(tls);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            host: host.to_string(),
            cfg,
            pool,
            verifier,
            store,
            secret,
            address,
            fleet,
            out: out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: Mutex::new(SessionState::Connecting),
            unticketed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            bns_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(128).unwrap_or(NonZeroUsize::MIN),
            )),
        });
        tokio::spawn(writer_task(out_rx, write_half));
        tokio::spawn(reader_task(inner.clone(), read_half));

        let client = Self { inner };
        match client.handshake().await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.close();
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(), EdgeError> {
        self.inner.advance(SessionState::Handshaking);
        self.inner.advance(SessionState::Validating);
        self.validate_network().await?;
        if !self.is_device_whitelisted(self.inner.address).await? {
            // nicht retry-fähig: die Fleet kennt dieses Gerät nicht
            return Err(EdgeError::AccessDenied(format!(
                "device {} not whitelisted in fleet {}",
                self.inner.address, self.inner.fleet
            )));
        }
        self.greet().await?;
        self.inner.advance(SessionState::Ready);
        info!(host = %self.inner.host, address = %self.inner.address, "gateway session ready");
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Lokale Identität (aus dem gespeicherten Schlüssel abgeleitet).
    pub fn client_address(&self) -> Address {
        self.inner.address
    }

    pub fn fleet(&self) -> Address {
        self.inner.fleet
    }

    pub fn is_closed(&self) -> bool {
        self.inner.current_state() >= SessionState::Closing
    }

    /// Synchroner RPC über den multiplexten Stream.
    pub async fn call(&self, method: &str, args: Vec<Term>) -> Result<Term, EdgeError> {
        self.inner.call(method, args).await
    }

    /// Aktuelle Blockspitze des Gateways (unvalidiert).
    pub async fn block_peak(&self) -> Result<u64, EdgeError> {
        self.inner.call_int("getblockpeak", vec![]).await
    }

    pub async fn block_header(&self, number: u64) -> Result<BlockHeader, EdgeError> {
        let payload = self
            .inner
            .call("getblockheader", vec![Term::Int(number)])
            .await?;
        BlockHeader::from_term(&payload)
            .map_err(|_| EdgeError::Consensus(ConsensusError::GatewayLied("block header")))
    }

    /// Zeitstempel der validierten Spitze.
    pub async fn chain_time(&self) -> Result<u64, EdgeError> {
        let (number, _) = self.inner.verifier.last_valid();
        let header = self.block_header(number).await?;
        if header.number() != number {
            return Err(EdgeError::Consensus(ConsensusError::GatewayLied(
                "header number mismatch",
            )));
        }
        Ok(header.timestamp())
    }

    /// Kopf holen und den Verifier bis zur Spitze ziehen.
    async fn validate_network(&self) -> Result<(), EdgeError> {
        let inner = &self.inner;
        let peak = inner.call_int("getblockpeak", vec![]).await?;
        let window = inner.cfg.window_size;

        if !inner.verifier.is_seeded() {
            if let Some(raw) = inner.store.get(KEY_WINDOW)? {
                if let Err(e) = inner.verifier.restore(&raw) {
                    warn!(error = %e, "stored window unusable, bootstrapping");
                }
            }
        }
        if !inner.verifier.is_seeded() {
            // Erstinstallation: Trust-on-first-use auf die Bootstrap-Folge
            let from = peak.saturating_sub(window as u64);
            let headers = self.block_quick(from, window).await?;
            inner.verifier.seed(headers)?;
        }

        let mut rounds = 0usize;
        loop {
            let (number, _) = inner.verifier.last_valid();
            if number >= peak {
                break;
            }
            let headers = self.block_quick(number, window).await?;
            if headers.is_empty() {
                return Err(EdgeError::Protocol(format!(
                    "gateway stalled at block {number} (peak {peak})"
                )));
            }
            for header in headers {
                inner.verifier.add_header(header)?;
            }
            rounds += 1;
            if rounds > 10_000 {
                return Err(EdgeError::Protocol("blockquick sync diverges".to_string()));
            }
        }
        debug!(peak, "network validated");
        Ok(())
    }

    /// Header-Folge ab `from` (exklusiv), höchstens `limit` Stück.
    async fn block_quick(&self, from: u64, limit: usize) -> Result<Vec<BlockHeader>, EdgeError> {
        let payload = self
            .inner
            .call(
                "getblockquick",
                vec![Term::Int(from), Term::Int(limit as u64)],
            )
            .await?;
        let items = payload
            .as_list()
            .ok_or_else(|| EdgeError::Protocol("getblockquick: not a list".to_string()))?;
        let mut headers = Vec::with_capacity(items.len());
        for item in items {
            let header = BlockHeader::from_term(item)
                .map_err(|_| EdgeError::Consensus(ConsensusError::GatewayLied("bad header")))?;
            headers.push(header);
        }
        Ok(headers)
    }

    /// Konto bei Block `number`, gegen den state_hash bewiesen.
    pub async fn get_valid_account(
        &self,
        number: u64,
        addr: Address,
    ) -> Result<Account, EdgeError> {
        let payload = self
            .inner
            .call(
                "getaccount",
                vec![Term::Int(number), Term::bin(addr.0.to_vec())],
            )
            .await?;
        let items = payload
            .as_tuple()
            .ok_or_else(|| EdgeError::Protocol("getaccount: not a tuple".to_string()))?;
        if items.len() != 2 {
            return Err(EdgeError::Protocol("getaccount: arity != 2".to_string()));
        }
        let account = items
            .first()
            .and_then(|t| Account::from_term(t).ok())
            .ok_or_else(|| EdgeError::Protocol("getaccount: account".to_string()))?;
        let proof = items
            .get(1)
            .and_then(|t| dc_blockquick::proof_from_term(t).ok())
            .ok_or_else(|| EdgeError::Protocol("getaccount: proof".to_string()))?;
        self.inner
            .verifier
            .validate_account(number, &addr, &proof, &account)?;
        Ok(account)
    }

    /// Storage-Wert eines Vertrags, vollständig bewiesen (Konto gegen den
    /// state_hash, Wert gegen die storage_root des Kontos).
    pub async fn get_account_value(
        &self,
        addr: Address,
        key: &dc_crypto::Hash32,
    ) -> Result<Vec<u8>, EdgeError> {
        let (number, _) = self.inner.verifier.last_valid();
        let account = self.get_valid_account(number, addr).await?;
        let payload = self
            .inner
            .call(
                "getaccountvalue",
                vec![
                    Term::Int(number),
                    Term::bin(addr.0.to_vec()),
                    Term::bin(key.to_vec()),
                ],
            )
            .await?;
        let items = payload
            .as_tuple()
            .ok_or_else(|| EdgeError::Protocol("getaccountvalue: not a tuple".to_string()))?;
        if items.len() != 2 {
            return Err(EdgeError::Protocol("getaccountvalue: arity != 2".to_string()));
        }
        let value = items
            .first()
            .and_then(Term::as_binary)
            .ok_or_else(|| EdgeError::Protocol("getaccountvalue: value".to_string()))?
            .to_vec();
        let proof = items
            .get(1)
            .and_then(|t| dc_blockquick::proof_from_term(t).ok())
            .ok_or_else(|| EdgeError::Protocol("getaccountvalue: proof".to_string()))?;
        BlockQuick::validate_value(&account.storage_root, key, &value, &proof)?;
        Ok(value)
    }

    /// BNS-Auflösung über den DNS-Vertrag; Treffer wandern in den
    /// LRU-Cache und (advisorisch) in den Store.
    pub async fn resolve_bns(&self, name: &str) -> Result<Address, EdgeError> {
        if !contract::is_valid_bns(name) {
            return Err(EdgeError::Client(format!("invalid BNS name: {name}")));
        }
        if let Ok(mut cache) = self.inner.bns_cache.lock() {
            if let Some(addr) = cache.get(name) {
                return Ok(*addr);
            }
        }
        let key = contract::bns_entry_key(name);
        let value = self
            .get_account_value(contract::dns_contract(), &key)
            .await?;
        if value.len() < 20 {
            return Err(EdgeError::Client(format!("name not registered: {name}")));
        }
        let tail = value.len() - 20;
        let addr = Address::from_slice(&value[tail..])
            .map_err(|e| EdgeError::Protocol(e.to_string()))?;
        if addr.is_zero() {
            return Err(EdgeError::Client(format!("name not registered: {name}")));
        }
        if let Ok(mut cache) = self.inner.bns_cache.lock() {
            cache.put(name.to_string(), addr);
        }
        let store_key = format!("bns:{name}");
        if let Err(e) = self.inner.store.put(store_key.as_bytes(), &addr.0) {
            debug!(error = %e, "bns cache write skipped");
        }
        Ok(addr)
    }

    /// Fleet-Allowlist-Abfrage für eine Geräteadresse.
    pub async fn is_device_whitelisted(&self, device: Address) -> Result<bool, EdgeError> {
        let key = contract::allowlist_key(&device);
        let value = self.get_account_value(self.inner.fleet, &key).await?;
        Ok(value.iter().any(|b| *b != 0))
    }

    /// Erstes Ticket der Session; meldet den zahlenden Account an.
    pub async fn greet(&self) -> Result<(), EdgeError> {
        let total = self.inner.total_bytes.load(Ordering::Relaxed);
        self.inner.submit_ticket(total, true).await
    }

    /// Öffnet einen Port-Stream zu einem Gerät.
    pub async fn open_port(
        &self,
        device: Address,
        port: u16,
        mode: PortMode,
    ) -> Result<PortChannel, EdgeError> {
        self.inner
            .open_raw(device.0.to_vec(), port, mode, device)
            .await
    }

    /// Signierte Transaktion einreichen. Bestätigung ist Sache des
    /// Watchers; hier wird nicht erneut gesendet.
    pub async fn send_transaction(
        &self,
        tx: &crate::transaction::Transaction,
    ) -> Result<(), EdgeError> {
        let raw = tx
            .to_rlp()
            .map_err(|e| EdgeError::Client(e.to_string()))?;
        let payload = self
            .inner
            .call("sendtransaction", vec![Term::bin(raw)])
            .await?;
        match payload.as_atom() {
            Some(protocol::ATOM_OK) => Ok(()),
            _ => Err(EdgeError::Protocol("sendtransaction: unexpected reply".to_string())),
        }
    }

    /// Nonce des eigenen Kontos an der validierten Spitze.
    pub async fn account_nonce(&self) -> Result<u64, EdgeError> {
        let (number, _) = self.inner.verifier.last_valid();
        let account = self.get_valid_account(number, self.inner.address).await?;
        Ok(account.nonce)
    }

    pub fn sign_transaction(
        &self,
        tx: &mut crate::transaction::Transaction,
    ) -> Result<(), EdgeError> {
        tx.sign(&self.inner.secret)
            .map_err(|e| EdgeError::Client(e.to_string()))
    }

    /// Beendet die Session: Pending-Calls scheitern mit
    /// `ConnectionClosed`, alle Port-Streams sehen EOF. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[async_trait::async_trait]
impl Dialer for RpcClient {
    async fn open_device(
        &self,
        device: Address,
        port: u16,
        mode: PortMode,
    ) -> Result<DialStream, EdgeError> {
        let channel = self.open_port(device, port, mode).await?;
        Ok(Box::new(channel))
    }

    async fn open_host(&self, host: &str, port: u16) -> Result<DialStream, EdgeError> {
        let channel = self
            .inner
            .open_raw(
                host.as_bytes().to_vec(),
                port,
                PortMode::Public,
                Address::default(),
            )
            .await?;
        Ok(Box::new(channel))
    }

    async fn resolve_name(&self, name: &str) -> Result<Address, EdgeError> {
        self.resolve_bns(name).await
    }
}

#[async_trait::async_trait]
impl ChainView for RpcClient {
    async fn last_valid(&self) -> (u64, dc_crypto::Hash32) {
        self.inner.verifier.last_valid()
    }

    async fn account(&self, number: u64, addr: Address) -> Result<Account, EdgeError> {
        self.get_valid_account(number, addr).await
    }
}

impl Inner {
    fn current_state(&self) -> SessionState {
        self.state
            .lock()
            .map(|g| *g)
            .unwrap_or(SessionState::Closed)
    }

    /// Einbahn-Übergang; Rückwärtsbewegungen werden ignoriert.
    fn advance(&self, next: SessionState) {
        if let Ok(mut guard) = self.state.lock() {
            if *guard < next {
                *guard = next;
            }
        }
    }

    fn close(&self) {
        {
            let Ok(mut guard) = self.state.lock() else {
                return;
            };
            if *guard >= SessionState::Closing {
                return;
            }
            *guard = SessionState::Closing;
        }
        let drained: Vec<oneshot::Sender<Result<Term, EdgeError>>> = match self.pending.lock() {
            Ok(mut guard) => guard.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        for tx in drained {
            let _ = tx.send(Err(EdgeError::ConnectionClosed));
        }
        self.pool.close_all();
        // leerer Frame = Shutdown-Sentinel für den Writer-Task
        let _ = self.out.send(Vec::new());
        self.advance(SessionState::Closed);
        debug!(host = %self.host, "session closed");
    }

    fn send_term(&self, term: &Term) -> Result<(), EdgeError> {
        let frame = dc_codec::encode_frame(term)?;
        self.out
            .send(frame)
            .map_err(|_| EdgeError::ConnectionClosed)
    }

    async fn call(&self, method: &str, args: Vec<Term>) -> Result<Term, EdgeError> {
        if self.current_state() >= SessionState::Closing {
            return Err(EdgeError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self
                .pending
                .lock()
                .map_err(|_| EdgeError::ConnectionClosed)?;
            guard.insert(id, tx);
        }
        if let Err(e) = self.send_term(&protocol::request(method, id, args)) {
            if let Ok(mut guard) = self.pending.lock() {
                guard.remove(&id);
            }
            return Err(e);
        }
        match tokio::time::timeout(self.cfg.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EdgeError::ConnectionClosed),
            Err(_) => {
                // Slot entfernen; eine späte Antwort wird verworfen
                if let Ok(mut guard) = self.pending.lock() {
                    guard.remove(&id);
                }
                Err(EdgeError::Timeout)
            }
        }
    }

    async fn call_int(&self, method: &str, args: Vec<Term>) -> Result<u64, EdgeError> {
        let payload = self.call(method, args).await?;
        payload
            .as_int()
            .ok_or_else(|| EdgeError::Protocol(format!("{method}: integer expected")))
    }

    async fn open_raw(
        &self,
        target: Vec<u8>,
        port: u16,
        mode: PortMode,
        peer: Address,
    ) -> Result<PortChannel, EdgeError> {
        let payload = self
            .call(
                "portopen",
                vec![
                    Term::bin(target),
                    Term::Int(u64::from(port)),
                    Term::atom(mode.as_atom()),
                ],
            )
            .await?;
        let items = payload
            .as_tuple()
            .ok_or_else(|| EdgeError::Protocol("portopen: not a tuple".to_string()))?;
        let port_id = match (items.first().and_then(Term::as_atom), items.get(1)) {
            (Some(protocol::ATOM_OK), Some(id)) => id
                .as_int()
                .ok_or_else(|| EdgeError::Protocol("portopen: port id".to_string()))?,
            _ => return Err(EdgeError::Rpc("portopen refused".to_string())),
        };
        let (stream, rx) = PortStream::new(
            port_id,
            peer,
            Direction::Outbound,
            PortProtocol::Tcp,
            mode,
        );
        self.pool.insert_port(stream.clone());
        self.pool.record_connection(peer);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        Ok(PortChannel::new(
            stream,
            rx,
            self.out.clone(),
            self.cfg.chunk_size,
            Some(self.pool.clone()),
        ))
    }

    /// Ticket mit Zählerstand `total_bytes` signieren und senden.
    /// Bei `too_low` übernimmt der Client den Gateway-Zähler und sendet
    /// genau einmal nach.
    async fn submit_ticket(&self, total_bytes: u64, retry: bool) -> Result<(), EdgeError> {
        let (block_number, block_hash) = self.verifier.last_valid();
        let ticket = Ticket {
            block_number,
            block_hash,
            fleet: self.fleet,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_bytes,
            local_addr: self.address,
        };
        let sig = ticket
            .sign(&self.secret)
            .map_err(|e| EdgeError::Config(e.to_string()))?;
        let payload = self.call("ticket", ticket.to_args(&sig)).await?;
        if payload.as_atom() == Some(protocol::ATOM_THANKS) {
            return Ok(());
        }
        if let Some(items) = payload.as_tuple() {
            if items.first().and_then(Term::as_atom) == Some(protocol::ATOM_TOO_LOW) {
                let server_total = items.get(1).and_then(Term::as_int).unwrap_or(0);
                let adopted = server_total.max(total_bytes);
                self.total_bytes.fetch_max(adopted, Ordering::Relaxed);
                if retry {
                    return Box::pin(self.submit_ticket(adopted, false)).await;
                }
                return Ok(());
            }
        }
        Err(EdgeError::Protocol("ticket: unexpected reply".to_string()))
    }

    /// Serverseitiges portopen für veröffentlichte Ports.
    async fn handle_portopen(self: Arc<Self>, port_ref: u64, port: u16, from: Address) {
        let Some(policy) = self.pool.published_for(port) else {
            let _ = self.send_term(&protocol::portopen_deny(port_ref, "not_published"));
            return;
        };
        let allowed = match policy.mode {
            PortMode::Public => true,
            PortMode::Private => policy.access_list.contains(&from),
            PortMode::Protected => {
                let client = RpcClient {
                    inner: self.clone(),
                };
                client.is_device_whitelisted(from).await.unwrap_or(false)
            }
        };
        if !allowed {
            info!(port, peer = %from, "inbound port open denied");
            let _ = self.send_term(&protocol::portopen_deny(port_ref, "forbidden"));
            return;
        }
        let local = match TcpStream::connect(("127.0.0.1", policy.local_port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(port = policy.local_port, error = %e, "local service unreachable");
                let _ = self.send_term(&protocol::portopen_deny(port_ref, "unreachable"));
                return;
            }
        };
        let (stream, rx) = PortStream::new(
            port_ref,
            from,
            Direction::Inbound,
            PortProtocol::Tcp,
            policy.mode,
        );
        self.pool.insert_port(stream.clone());
        self.pool.record_connection(from);
        if self.send_term(&protocol::portopen_ack(port_ref)).is_err() {
            return;
        }
        let channel = PortChannel::new(
            stream,
            rx,
            self.out.clone(),
            self.cfg.chunk_size,
            Some(self.pool.clone()),
        );
        let opts = BridgeOpts {
            chunk_size: self.cfg.chunk_size,
            idle_timeout: self.cfg.idle_timeout,
        };
        info!(port, peer = %from, "inbound port open accepted");
        if let Err(e) = bridge(local, channel, opts).await {
            debug!(error = %e, "published bridge ended");
        }
    }
}

/// Zählt Inbound-Bytes; jedes Überschreiten der Schwelle T zieht T ab und
/// stößt eine Ticket-Einreichung mit dem Stand zum Zeitpunkt des
/// Überschreitens an.
fn account_inbound(inner: &Arc<Inner>, n: u64) {
    let total_after = inner.total_bytes.fetch_add(n, Ordering::Relaxed) + n;
    let mut un = inner.unticketed.fetch_add(n, Ordering::Relaxed) + n;
    let threshold = inner.cfg.ticket_threshold;
    while un >= threshold {
        inner.unticketed.fetch_sub(threshold, Ordering::Relaxed);
        un -= threshold;
        if inner.current_state() == SessionState::Ready {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.submit_ticket(total_after, true).await {
                    warn!(error = %e, "ticket submission failed");
                }
            });
        }
    }
}

/// Routing eines eingehenden Frames; `false` beendet die Session.
async fn dispatch(inner: &Arc<Inner>, frame: Inbound) -> bool {
    match frame {
        Inbound::Response { id, payload } => {
            let slot = inner.pending.lock().ok().and_then(|mut g| g.remove(&id));
            match slot {
                Some(tx) => {
                    let _ = tx.send(Ok(payload));
                }
                // Deadline war schneller; Antwort verwerfen
                None => debug!(id, "late response dropped"),
            }
            true
        }
        Inbound::Error { id, reason } => {
            let slot = inner.pending.lock().ok().and_then(|mut g| g.remove(&id));
            if let Some(tx) = slot {
                let _ = tx.send(Err(EdgeError::Rpc(reason)));
            }
            true
        }
        Inbound::PortSend { port_id, data } => {
            match inner.pool.get_port(port_id) {
                Some(stream) => {
                    if !stream.push(data).await {
                        inner.pool.remove_port(port_id);
                        let _ = inner.send_term(&protocol::portclose(port_id));
                    }
                }
                None => {
                    // unbekannter Port: Gegenseite aufräumen lassen
                    let _ = inner.send_term(&protocol::portclose(port_id));
                }
            }
            true
        }
        Inbound::PortClose { port_id } => {
            inner.pool.remove_port(port_id);
            true
        }
        Inbound::PortOpen {
            port_ref,
            port,
            from,
        } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                inner.handle_portopen(port_ref, port, from).await;
            });
            true
        }
        Inbound::Goodbye { reason, details } => {
            info!(reason = %reason, details = %details, "gateway said goodbye");
            false
        }
    }
}

async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut write_half: WriteHalf<TlsStream<TcpStream>>,
) {
    while let Some(frame) = rx.recv().await {
        if frame.is_empty() {
            break;
        }
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_task(inner: Arc<Inner>, mut read_half: ReadHalf<TlsStream<TcpStream>>) {
    loop {
        match dc_codec::read_frame(&mut read_half).await {
            Ok(Some((term, n))) => {
                account_inbound(&inner, n as u64);
                match protocol::parse_inbound(term) {
                    Ok(frame) => {
                        if !dispatch(&inner, frame).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // Protokollfehler sind session-fatal
                        warn!(error = %e, "malformed frame");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "read side ended");
                break;
            }
        }
    }
    inner.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_client(
        ticket_threshold: u64,
        call_timeout: Duration,
    ) -> (RpcClient, mpsc::UnboundedReceiver<Vec<u8>>, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ClientStore::open(dir.path(), false).expect("store"));
        let secret = store.ensure_private_key().expect("key");
        let address = Address(dc_crypto::secret_to_address(&secret).expect("addr"));
        let cfg = EdgeConfig {
            ticket_threshold,
            call_timeout,
            ..EdgeConfig::default()
        };
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            host: "test.gateway".to_string(),
            fleet: cfg.fleet,
            cfg,
            pool: DataPool::new(),
            verifier: Arc::new(BlockQuick::new(10, None)),
            store,
            secret,
            address,
            out: out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: Mutex::new(SessionState::Ready),
            unticketed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            bns_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            )),
        });
        (RpcClient { inner }, out_rx, dir)
    }

    fn decode_written(raw: &[u8]) -> Term {
        dc_codec::decode(&raw[2..]).expect("bert")
    }

    async fn collect_tickets(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        quiet: Duration,
    ) -> Vec<u64> {
        let mut totals = Vec::new();
        loop {
            match tokio::time::timeout(quiet, rx.recv()).await {
                Ok(Some(frame)) => {
                    let term = decode_written(&frame);
                    let items = term.as_tuple().expect("tuple");
                    if items.first().and_then(Term::as_atom) == Some("ticket") {
                        // {ticket, id, bn, hash, fleet, conns, bytes, local, sig}
                        totals.push(items.get(6).and_then(Term::as_int).expect("bytes"));
                    }
                }
                _ => break,
            }
        }
        totals
    }

    #[tokio::test]
    async fn ticket_threshold_emits_exactly_two_tickets() {
        let (client, mut out_rx, _dir) = test_client(1024, Duration::from_secs(5));
        // 2500 Inbound-Bytes über drei Frames
        account_inbound(&client.inner, 833);
        account_inbound(&client.inner, 833);
        account_inbound(&client.inner, 834);

        let mut totals = collect_tickets(&mut out_rx, Duration::from_millis(300)).await;
        assert_eq!(totals.len(), 2, "exactly two tickets for 2500/1024 bytes");
        totals.sort_unstable();
        assert_eq!(totals, vec![1666, 2500]);
    }

    #[tokio::test]
    async fn below_threshold_emits_nothing() {
        let (client, mut out_rx, _dir) = test_client(4096, Duration::from_secs(5));
        account_inbound(&client.inner, 4095);
        let totals = collect_tickets(&mut out_rx, Duration::from_millis(200)).await;
        assert!(totals.is_empty());
    }

    #[tokio::test]
    async fn call_times_out_and_clears_slot() {
        let (client, mut out_rx, _dir) = test_client(1 << 30, Duration::from_millis(50));
        let err = client
            .call("getblockpeak", vec![])
            .await
            .expect_err("no responder");
        assert!(matches!(err, EdgeError::Timeout));
        assert!(client.inner.pending.lock().expect("lock").is_empty());
        // Request wurde trotzdem geschrieben
        let frame = out_rx.recv().await.expect("frame");
        let term = decode_written(&frame);
        assert_eq!(
            term.as_tuple()
                .and_then(|t| t.first())
                .and_then(Term::as_atom),
            Some("getblockpeak")
        );
    }

    #[tokio::test]
    async fn response_completes_pending_call() {
        let (client, mut out_rx, _dir) = test_client(1 << 30, Duration::from_secs(5));
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call("getblockpeak", vec![]).await })
        };
        let frame = out_rx.recv().await.expect("request written");
        let term = decode_written(&frame);
        let id = term
            .as_tuple()
            .and_then(|t| t.get(1))
            .and_then(Term::as_int)
            .expect("request id");

        assert!(
            dispatch(
                &client.inner,
                Inbound::Response {
                    id,
                    payload: Term::Int(777),
                })
                .await
        );
        let result = caller.await.expect("join").expect("call");
        assert_eq!(result, Term::Int(777));
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let (client, _out_rx, _dir) = test_client(1 << 30, Duration::from_secs(5));
        assert!(
            dispatch(
                &client.inner,
                Inbound::Response {
                    id: 999,
                    payload: Term::Int(1),
                })
                .await
        );
    }

    #[tokio::test]
    async fn portsend_for_unknown_port_answers_portclose() {
        let (client, mut out_rx, _dir) = test_client(1 << 30, Duration::from_secs(5));
        dispatch(
            &client.inner,
            Inbound::PortSend {
                port_id: 42,
                data: b"data".to_vec(),
            })
            .await;
        let frame = out_rx.recv().await.expect("frame");
        assert_eq!(decode_written(&frame), protocol::portclose(42));
    }

    #[tokio::test]
    async fn close_fails_pending_and_ports() {
        let (client, _out_rx, _dir) = test_client(1 << 30, Duration::from_secs(30));
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("getblockpeak", vec![]).await })
        };
        // warten bis der Slot angelegt ist
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (stream, _rx) = PortStream::new(
            3,
            Address([2u8; 20]),
            Direction::Outbound,
            PortProtocol::Tcp,
            PortMode::Public,
        );
        client.inner.pool.insert_port(stream.clone());

        client.close();
        client.close(); // idempotent

        let err = pending.await.expect("join").expect_err("drained");
        assert!(matches!(err, EdgeError::ConnectionClosed));
        assert!(stream.is_closed());
        assert!(client.is_closed());
        // Folgecalls scheitern sofort
        let err = client.call("getblockpeak", vec![]).await.expect_err("closed");
        assert!(matches!(err, EdgeError::ConnectionClosed));
    }

    #[tokio::test]
    async fn goodbye_ends_dispatch() {
        let (client, _out_rx, _dir) = test_client(1 << 30, Duration::from_secs(5));
        let keep_going = dispatch(
            &client.inner,
            Inbound::Goodbye {
                reason: "bye".to_string(),
                details: String::new(),
            })
            .await;
        assert!(!keep_going);
    }
}
