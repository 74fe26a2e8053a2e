// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

//! BlockQuick: die letzten `W` Miner bilden ein rollierendes Komitee.
//! Ein Nachfolge-Header wird akzeptiert, wenn sein Parent das Fensterende
//! trifft und sein Miner im Fenster eine strikte Mehrheit der Plätze hält.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use dc_codec::Term;
use dc_crypto::{AuditPath, Hash32};
use dc_types::{Account, Address, BlockHeader};

/// Standard-Fenstergröße W.
pub const DEFAULT_WINDOW: usize = 100;

#[derive(Debug)]
pub enum ConsensusError {
    NotAChild { expected: Hash32, got: Hash32 },
    InsufficientWeight { weight: usize, required: usize },
    UnknownBlock(u64),
    InvalidProof,
    InvalidWindow(&'static str),
    GatewayLied(&'static str),
    Persist(String),
}

impl core::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotAChild { expected, got } => write!(
                f,
                "header is not a child of the tip (expected parent {}, got {})",
                hex_prefix(expected),
                hex_prefix(got)
            ),
            Self::InsufficientWeight { weight, required } => {
                write!(f, "miner weight {weight} below quorum {required}")
            }
            Self::UnknownBlock(n) => write!(f, "block {n} outside the validated window"),
            Self::InvalidProof => f.write_str("merkle proof does not verify"),
            Self::InvalidWindow(what) => write!(f, "invalid window: {what}"),
            Self::GatewayLied(what) => write!(f, "gateway served invalid data: {what}"),
            Self::Persist(what) => write!(f, "window persist failed: {what}"),
        }
    }
}

impl std::error::Error for ConsensusError {}

fn hex_prefix(h: &Hash32) -> String {
    let mut s = String::with_capacity(10);
    for b in h.iter().take(4) {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Senke für das persistierte Fenster (Schlüssel `window` im Store).
pub trait WindowSink: Send + Sync {
    fn persist_window(&self, encoded: &[u8]) -> Result<(), String>;
}

/// Geordnete Folge validierter Header, neuestes Element zuletzt.
/// Invariante: `recent[i+1].parent() == recent[i].hash()`, Länge <= cap.
pub struct Window {
    recent: VecDeque<Arc<BlockHeader>>,
    miners: HashMap<Address, usize>,
    cap: usize,
}

impl Window {
    pub fn new(cap: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(cap),
            miners: HashMap::new(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.recent.len() == self.cap
    }

    pub fn tip(&self) -> Option<&Arc<BlockHeader>> {
        self.recent.back()
    }

    pub fn header_at(&self, number: u64) -> Option<&Arc<BlockHeader>> {
        self.recent.iter().find(|h| h.number() == number)
    }

    /// Anzahl der Fensterplätze des Miners.
    pub fn miner_weight(&self, miner: &Address) -> usize {
        self.miners.get(miner).copied().unwrap_or(0)
    }

    pub fn distinct_miners(&self) -> usize {
        self.miners.len()
    }

    fn push(&mut self, header: Arc<BlockHeader>) {
        *self.miners.entry(header.miner()).or_insert(0) += 1;
        self.recent.push_back(header);
        while self.recent.len() > self.cap {
            if let Some(old) = self.recent.pop_front() {
                let miner = old.miner();
                if let Some(count) = self.miners.get_mut(&miner) {
                    *count -= 1;
                    if *count == 0 {
                        self.miners.remove(&miner);
                    }
                }
            }
        }
    }

    /// Serialisiert das Fenster als BERT-Liste von Header-8-Tupeln.
    pub fn encode(&self) -> Vec<u8> {
        let items = self.recent.iter().map(|h| h.to_term()).collect();
        dc_codec::encode(&Term::List(items))
    }

    /// Parst ein persistiertes Fenster; prüft Signaturen und Verkettung.
    pub fn decode(raw: &[u8], cap: usize) -> Result<Self, ConsensusError> {
        let term = dc_codec::decode(raw).map_err(|_| ConsensusError::InvalidWindow("bert"))?;
        let items = term
            .as_list()
            .ok_or(ConsensusError::InvalidWindow("not a list"))?;
        let mut window = Self::new(cap);
        for item in items {
            let header = BlockHeader::from_term(item)
                .map_err(|_| ConsensusError::InvalidWindow("bad header"))?;
            if let Some(tip) = window.tip() {
                if header.parent() != tip.hash() {
                    return Err(ConsensusError::InvalidWindow("broken chain"));
                }
            }
            window.push(Arc::new(header));
        }
        Ok(window)
    }
}

/// Der Verifier. Besitzt das Fenster exklusiv; Leser bekommen nur den
/// billigen `last_valid()`-Schnappschuss unter dem Read-Lock.
pub struct BlockQuick {
    window: RwLock<Window>,
    cap: usize,
    /// Mindestplätze für Akzeptanz; Default strikte Mehrheit von W.
    min_weight: usize,
    sink: Option<Arc<dyn WindowSink>>,
}

impl BlockQuick {
    pub fn new(cap: usize, sink: Option<Arc<dyn WindowSink>>) -> Self {
        Self {
            window: RwLock::new(Window::new(cap)),
            cap,
            min_weight: cap / 2 + 1,
            sink,
        }
    }

    /// Testbarer Quorum-Parameter.
    pub fn with_threshold(mut self, min_weight: usize) -> Self {
        self.min_weight = min_weight;
        self
    }

    pub fn window_size(&self) -> usize {
        self.cap
    }

    pub fn is_seeded(&self) -> bool {
        match self.window.read() {
            Ok(w) => !w.is_empty(),
            Err(_) => false,
        }
    }

    /// Lädt ein früher persistiertes Fenster.
    pub fn restore(&self, encoded: &[u8]) -> Result<(), ConsensusError> {
        let window = Window::decode(encoded, self.cap)?;
        if window.is_empty() {
            return Err(ConsensusError::InvalidWindow("empty"));
        }
        let mut guard = self
            .window
            .write()
            .map_err(|_| ConsensusError::InvalidWindow("poisoned"))?;
        *guard = window;
        Ok(())
    }

    /// Erstinstallation: übernimmt eine Bootstrap-Folge als vertrauten
    /// Checkpoint. Signaturen sind beim Parsen bereits geprüft; hier wird
    /// nur noch die Verkettung erzwungen.
    pub fn seed(&self, headers: Vec<BlockHeader>) -> Result<(), ConsensusError> {
        if headers.is_empty() {
            return Err(ConsensusError::InvalidWindow("empty seed"));
        }
        let mut window = Window::new(self.cap);
        for header in headers {
            if let Some(tip) = window.tip() {
                if header.parent() != tip.hash() {
                    return Err(ConsensusError::GatewayLied("seed chain broken"));
                }
            }
            window.push(Arc::new(header));
        }
        let encoded = window.encode();
        {
            let mut guard = self
                .window
                .write()
                .map_err(|_| ConsensusError::InvalidWindow("poisoned"))?;
            *guard = window;
        }
        self.persist(&encoded)
    }

    /// Spitze des validierten Fensters: (Nummer, Header-Hash).
    /// Leeres Fenster liefert (0, 0x00..00).
    pub fn last_valid(&self) -> (u64, Hash32) {
        match self.window.read() {
            Ok(w) => match w.tip() {
                Some(tip) => (tip.number(), tip.hash()),
                None => (0, [0u8; 32]),
            },
            Err(_) => (0, [0u8; 32]),
        }
    }

    /// Validiert und übernimmt einen Nachfolge-Header.
    pub fn add_header(&self, header: BlockHeader) -> Result<(), ConsensusError> {
        let encoded = {
            let mut guard = self
                .window
                .write()
                .map_err(|_| ConsensusError::InvalidWindow("poisoned"))?;
            let tip_hash = guard
                .tip()
                .map(|t| t.hash())
                .ok_or(ConsensusError::InvalidWindow("not seeded"))?;
            if header.parent() != tip_hash {
                return Err(ConsensusError::NotAChild {
                    expected: tip_hash,
                    got: header.parent(),
                });
            }
            let weight = guard.miner_weight(&header.miner());
            if weight < self.min_weight {
                return Err(ConsensusError::InsufficientWeight {
                    weight,
                    required: self.min_weight,
                });
            }
            guard.push(Arc::new(header));
            guard.encode()
        };
        self.persist(&encoded)
    }

    fn persist(&self, encoded: &[u8]) -> Result<(), ConsensusError> {
        if let Some(sink) = &self.sink {
            sink.persist_window(encoded).map_err(ConsensusError::Persist)?;
        }
        Ok(())
    }

    /// Prüft ein Konto gegen den state_hash des Headers `number`.
    pub fn validate_account(
        &self,
        number: u64,
        addr: &Address,
        proof: &AuditPath,
        account: &Account,
    ) -> Result<(), ConsensusError> {
        let state_hash = self.state_hash_at(number)?;
        let leaf = account_leaf_hash(addr, account);
        if !dc_crypto::merkle_verify_proof(&state_hash, &leaf, proof) {
            return Err(ConsensusError::InvalidProof);
        }
        Ok(())
    }

    /// Prüft einen Storage-Wert gegen die storage_root eines (bereits
    /// validierten) Kontos.
    pub fn validate_value(
        root: &Hash32,
        key: &Hash32,
        value: &[u8],
        proof: &AuditPath,
    ) -> Result<(), ConsensusError> {
        let leaf = value_leaf_hash(key, value);
        if !dc_crypto::merkle_verify_proof(root, &leaf, proof) {
            return Err(ConsensusError::InvalidProof);
        }
        Ok(())
    }

    fn state_hash_at(&self, number: u64) -> Result<Hash32, ConsensusError> {
        let guard = self
            .window
            .read()
            .map_err(|_| ConsensusError::InvalidWindow("poisoned"))?;
        guard
            .header_at(number)
            .map(|h| h.state_hash())
            .ok_or(ConsensusError::UnknownBlock(number))
    }
}

/// Account-Leaf: H(leaf_domain || bert({addr, account}))
pub fn account_leaf_hash(addr: &Address, account: &Account) -> Hash32 {
    let term = Term::Tuple(vec![Term::bin(addr.0.to_vec()), account.to_term()]);
    dc_crypto::merkle_leaf_hash(&dc_codec::encode(&term))
}

/// Storage-Leaf: H(leaf_domain || bert({key, value}))
pub fn value_leaf_hash(key: &Hash32, value: &[u8]) -> Hash32 {
    let term = Term::Tuple(vec![Term::bin(key.to_vec()), Term::bin(value.to_vec())]);
    dc_crypto::merkle_leaf_hash(&dc_codec::encode(&term))
}

/// Audit-Pfad ↔ BERT: Liste von {hash, 0|1}.
pub fn proof_to_term(proof: &AuditPath) -> Term {
    Term::List(
        proof
            .iter()
            .map(|(hash, on_left)| {
                Term::Tuple(vec![Term::bin(hash.to_vec()), Term::Int(u64::from(*on_left))])
            })
            .collect(),
    )
}

pub fn proof_from_term(term: &Term) -> Result<AuditPath, ConsensusError> {
    let items = term.as_list().ok_or(ConsensusError::InvalidProof)?;
    let mut path = AuditPath::with_capacity(items.len());
    for item in items {
        let pair = item.as_tuple().ok_or(ConsensusError::InvalidProof)?;
        if pair.len() != 2 {
            return Err(ConsensusError::InvalidProof);
        }
        let raw = pair
            .first()
            .and_then(Term::as_binary)
            .ok_or(ConsensusError::InvalidProof)?;
        if raw.len() != 32 {
            return Err(ConsensusError::InvalidProof);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(raw);
        let flag = pair
            .get(1)
            .and_then(Term::as_int)
            .ok_or(ConsensusError::InvalidProof)?;
        path.push((hash, flag != 0));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_types::testing::signed_header;

    struct CaptureSink(std::sync::Mutex<Vec<Vec<u8>>>);
    impl WindowSink for CaptureSink {
        fn persist_window(&self, encoded: &[u8]) -> Result<(), String> {
            self.0
                .lock()
                .map_err(|_| "poisoned".to_string())?
                .push(encoded.to_vec());
            Ok(())
        }
    }

    /// Baut eine Kette aus `n` Headern; `secrets[i % secrets.len()]` signiert
    /// Header i.
    fn chain(secrets: &[[u8; 32]], n: usize) -> Vec<BlockHeader> {
        let mut out = Vec::with_capacity(n);
        let mut parent = [0u8; 32];
        for i in 0..n {
            let secret = secrets.get(i % secrets.len()).expect("secret");
            let h = signed_header(secret, parent, i as u64 + 1, 1_700_000_000 + i as u64);
            parent = h.hash();
            out.push(h);
        }
        out
    }

    #[test]
    fn accepts_majority_miner_rejects_minority() {
        // Fenster mit 10 Headern: Miner A hält 6 Plätze, Miner B 4.
        let a = dc_crypto::generate_secret();
        let b = dc_crypto::generate_secret();
        let secrets = [a, a, a, b, a, b, a, b, a, b];
        let headers = chain(&secrets, 10);
        let tip_hash = headers.last().expect("tip").hash();

        let bq = BlockQuick::new(10, None);
        bq.seed(headers).expect("seed");
        assert_eq!(bq.last_valid().0, 10);

        // B (4 Plätze, Quorum 6) wird abgewiesen
        let from_b = signed_header(&b, tip_hash, 11, 2_000);
        assert!(matches!(
            bq.add_header(from_b),
            Err(ConsensusError::InsufficientWeight {
                weight: 4,
                required: 6
            })
        ));

        // A (6 Plätze) wird akzeptiert
        let from_a = signed_header(&a, tip_hash, 11, 2_000);
        bq.add_header(from_a).expect("majority accepted");
        assert_eq!(bq.last_valid().0, 11);
    }

    #[test]
    fn rejects_fork_parent() {
        let a = dc_crypto::generate_secret();
        let headers = chain(&[a], 5);
        let forked_parent = headers.get(3).expect("recent[-2]").hash();
        let bq = BlockQuick::new(5, None);
        bq.seed(headers).expect("seed");

        let fork = signed_header(&a, forked_parent, 6, 9_000);
        assert!(matches!(
            bq.add_header(fork),
            Err(ConsensusError::NotAChild { .. })
        ));
        // Abweisung ändert die Spitze nicht
        assert_eq!(bq.last_valid().0, 5);
    }

    #[test]
    fn window_never_exceeds_cap() {
        let a = dc_crypto::generate_secret();
        let headers = chain(&[a], 6);
        let mut tip = headers.last().expect("tip").hash();
        let bq = BlockQuick::new(6, None).with_threshold(1);
        bq.seed(headers).expect("seed");

        for i in 0..4u64 {
            let h = signed_header(&a, tip, 7 + i, 10_000 + i);
            tip = h.hash();
            bq.add_header(h).expect("accept");
        }
        assert_eq!(bq.last_valid().0, 10);
        let guard = bq.window.read().expect("read");
        assert_eq!(guard.len(), 6);
        assert!(guard.is_full());
        assert_eq!(guard.header_at(4).map(|h| h.number()), None);
        assert_eq!(guard.header_at(5).map(|h| h.number()), Some(5));
    }

    #[test]
    fn persists_on_seed_and_add() {
        let a = dc_crypto::generate_secret();
        let sink = Arc::new(CaptureSink(std::sync::Mutex::new(Vec::new())));
        let headers = chain(&[a], 3);
        let tip = headers.last().expect("tip").hash();
        let bq = BlockQuick::new(3, Some(sink.clone())).with_threshold(1);
        bq.seed(headers).expect("seed");
        bq.add_header(signed_header(&a, tip, 4, 50)).expect("add");

        let captured = sink.0.lock().expect("lock");
        assert_eq!(captured.len(), 2);
        // Letztes Persistat lässt sich wieder laden
        let last = captured.last().expect("last");
        let restored = Window::decode(last, 3).expect("decode window");
        assert_eq!(restored.tip().map(|t| t.number()), Some(4));
    }

    #[test]
    fn restore_rejects_broken_chain() {
        let a = dc_crypto::generate_secret();
        let h1 = signed_header(&a, [0u8; 32], 1, 1);
        let h2 = signed_header(&a, [0xff; 32], 2, 2);
        let raw = dc_codec::encode(&Term::List(vec![h1.to_term(), h2.to_term()]));
        let bq = BlockQuick::new(10, None);
        assert!(matches!(
            bq.restore(&raw),
            Err(ConsensusError::InvalidWindow("broken chain"))
        ));
    }

    #[test]
    fn last_valid_is_idempotent() {
        let a = dc_crypto::generate_secret();
        let bq = BlockQuick::new(4, None);
        bq.seed(chain(&[a], 4)).expect("seed");
        let first = bq.last_valid();
        assert_eq!(first, bq.last_valid());
    }

    #[test]
    fn account_proof_roundtrip() {
        let a = dc_crypto::generate_secret();
        let addr = Address([0x42; 20]);
        let account = Account {
            nonce: 1,
            balance: 500,
            storage_root: [3u8; 32],
            code_hash: [4u8; 32],
        };

        // State-Baum: unser Konto plus Rauschen
        let leaf = account_leaf_hash(&addr, &account);
        let mut leaves = vec![leaf];
        for i in 0u8..4 {
            leaves.push(dc_crypto::sha256(&[i]));
        }
        let state_hash = dc_crypto::merkle_root_hashes(&leaves);
        let proof = dc_crypto::merkle_build_proof(&leaves, 0).expect("path");

        // Header-Kette, deren Spitze genau diesen state_hash trägt
        let h1 = signed_header(&a, [0u8; 32], 1, 1);
        let h2 = dc_types::testing::build_header(&a, h1.hash(), state_hash, [0u8; 32], 2, 2, 0);
        let bq = BlockQuick::new(10, None).with_threshold(1);
        bq.seed(vec![h1, h2]).expect("seed");

        bq.validate_account(2, &addr, &proof, &account)
            .expect("proof verifies");
        let mut wrong = account.clone();
        wrong.balance += 1;
        assert!(matches!(
            bq.validate_account(2, &addr, &proof, &wrong),
            Err(ConsensusError::InvalidProof)
        ));
        assert!(matches!(
            bq.validate_account(9, &addr, &proof, &account),
            Err(ConsensusError::UnknownBlock(9))
        ));
    }

    #[test]
    fn proof_term_roundtrip() {
        let path: AuditPath = vec![([1u8; 32], true), ([2u8; 32], false)];
        let got = proof_from_term(&proof_to_term(&path)).expect("roundtrip");
        assert_eq!(path, got);
    }
}
