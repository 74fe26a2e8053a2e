// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

use dc_codec::Term;
use dc_crypto::Hash32;

#[derive(Debug)]
pub enum TypeError {
    InvalidAddress(String),
    InvalidSignature,
    InvalidTerm(&'static str),
    BadMinerSignature,
}

impl core::fmt::Display for TypeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidAddress(s) => write!(f, "invalid address: {s}"),
            Self::InvalidSignature => f.write_str("invalid signature bytes"),
            Self::InvalidTerm(what) => write!(f, "malformed term: {what}"),
            Self::BadMinerSignature => f.write_str("miner signature does not verify"),
        }
    }
}

impl std::error::Error for TypeError {}

/// 20-Byte-Kontoadresse (rechte 160 Bit von keccak256 des Pubkeys).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn from_slice(raw: &[u8]) -> Result<Self, TypeError> {
        if raw.len() != Self::LEN {
            return Err(TypeError::InvalidAddress(format!("{} bytes", raw.len())));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(raw);
        Ok(Self(out))
    }

    /// Parst `0x…`-Hex (40 Nibbles, Präfix optional).
    pub fn parse_hex(s: &str) -> Result<Self, TypeError> {
        let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        if stripped.len() != 40 {
            return Err(TypeError::InvalidAddress(s.to_string()));
        }
        let raw = hex::decode(stripped).map_err(|_| TypeError::InvalidAddress(s.to_string()))?;
        Self::from_slice(&raw)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl core::fmt::Debug for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

/// 65-Byte-Signatur, Layout `v ‖ r ‖ s` (v = rohe Recovery-Id).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub fn from_slice(raw: &[u8]) -> Result<Self, TypeError> {
        if raw.len() != 65 {
            return Err(TypeError::InvalidSignature);
        }
        let mut out = [0u8; 65];
        out.copy_from_slice(raw);
        Ok(Self(out))
    }

    /// `r ‖ s` ohne Recovery-Byte.
    pub fn rs(&self) -> &[u8] {
        self.0.get(1..65).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl core::fmt::Debug for Signature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(self.0))
    }
}

/// Modifizierter Ethereum-Blockheader mit Miner-Signatur. Nach der
/// Konstruktion unveränderlich; die Signatur ist dann bereits geprüft.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    prev_block: Hash32,
    state_hash: Hash32,
    tx_hash: Hash32,
    miner_pubkey: [u8; 64],
    miner_sig: Signature,
    timestamp: u64,
    number: u64,
    nonce: u64,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prev_block: Hash32,
        state_hash: Hash32,
        tx_hash: Hash32,
        miner_pubkey: [u8; 64],
        miner_sig: Signature,
        timestamp: u64,
        number: u64,
        nonce: u64,
    ) -> Result<Self, TypeError> {
        let header = Self {
            prev_block,
            state_hash,
            tx_hash,
            miner_pubkey,
            miner_sig,
            timestamp,
            number,
            nonce,
        };
        if !header.validate_sig() {
            return Err(TypeError::BadMinerSignature);
        }
        Ok(header)
    }

    fn bare_term(&self) -> Vec<Term> {
        vec![
            Term::bin(self.prev_block.to_vec()),
            Term::bin(self.state_hash.to_vec()),
            Term::bin(self.tx_hash.to_vec()),
            Term::Int(self.timestamp),
            Term::Int(self.number),
            Term::Int(self.nonce),
        ]
    }

    /// SHA-256 der BERT-Kodierung des 6-Tupels ohne Signatur.
    pub fn hash_without_sig(&self) -> Hash32 {
        dc_crypto::sha256(&dc_codec::encode(&Term::Tuple(self.bare_term())))
    }

    /// Kanonischer Header-Hash: 6-Tupel plus Signatur an Position 7.
    pub fn hash(&self) -> Hash32 {
        let mut items = self.bare_term();
        items.push(Term::bin(self.miner_sig.0.to_vec()));
        dc_crypto::sha256(&dc_codec::encode(&Term::Tuple(items)))
    }

    fn validate_sig(&self) -> bool {
        let digest = self.hash_without_sig();
        dc_crypto::verify(&self.miner_pubkey, &digest, self.miner_sig.rs())
    }

    pub fn miner(&self) -> Address {
        match dc_crypto::pubkey_to_address(&self.miner_pubkey) {
            Ok(raw) => Address(raw),
            // Pubkey war bei der Konstruktion gültig
            Err(_) => Address::default(),
        }
    }

    pub fn parent(&self) -> Hash32 {
        self.prev_block
    }
    pub fn state_hash(&self) -> Hash32 {
        self.state_hash
    }
    pub fn tx_hash(&self) -> Hash32 {
        self.tx_hash
    }
    pub fn number(&self) -> u64 {
        self.number
    }
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
    pub fn miner_pubkey(&self) -> &[u8; 64] {
        &self.miner_pubkey
    }
    pub fn miner_sig(&self) -> &Signature {
        &self.miner_sig
    }

    /// 8-Tupel für Draht und Persistenz:
    /// {prev, state, tx, pubkey, sig, timestamp, number, nonce}
    pub fn to_term(&self) -> Term {
        Term::Tuple(vec![
            Term::bin(self.prev_block.to_vec()),
            Term::bin(self.state_hash.to_vec()),
            Term::bin(self.tx_hash.to_vec()),
            Term::bin(self.miner_pubkey.to_vec()),
            Term::bin(self.miner_sig.0.to_vec()),
            Term::Int(self.timestamp),
            Term::Int(self.number),
            Term::Int(self.nonce),
        ])
    }

    /// Parst das 8-Tupel; validiert die Miner-Signatur erneut.
    pub fn from_term(term: &Term) -> Result<Self, TypeError> {
        let items = term
            .as_tuple()
            .ok_or(TypeError::InvalidTerm("header: not a tuple"))?;
        if items.len() != 8 {
            return Err(TypeError::InvalidTerm("header: arity != 8"));
        }
        let bin32 = |idx: usize, what: &'static str| -> Result<Hash32, TypeError> {
            let raw = items
                .get(idx)
                .and_then(Term::as_binary)
                .ok_or(TypeError::InvalidTerm(what))?;
            if raw.len() != 32 {
                return Err(TypeError::InvalidTerm(what));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(raw);
            Ok(out)
        };
        let int = |idx: usize, what: &'static str| -> Result<u64, TypeError> {
            items
                .get(idx)
                .and_then(Term::as_int)
                .ok_or(TypeError::InvalidTerm(what))
        };
        let prev_block = bin32(0, "header: prev_block")?;
        let state_hash = bin32(1, "header: state_hash")?;
        let tx_hash = bin32(2, "header: tx_hash")?;
        let pubkey_raw = items
            .get(3)
            .and_then(Term::as_binary)
            .ok_or(TypeError::InvalidTerm("header: miner_pubkey"))?;
        if pubkey_raw.len() != 64 && pubkey_raw.len() != 65 {
            return Err(TypeError::InvalidTerm("header: miner_pubkey"));
        }
        let mut miner_pubkey = [0u8; 64];
        let body = if pubkey_raw.len() == 65 {
            pubkey_raw
                .get(1..)
                .ok_or(TypeError::InvalidTerm("header: miner_pubkey"))?
        } else {
            pubkey_raw
        };
        miner_pubkey.copy_from_slice(body);
        let sig_raw = items
            .get(4)
            .and_then(Term::as_binary)
            .ok_or(TypeError::InvalidTerm("header: miner_sig"))?;
        let miner_sig = Signature::from_slice(sig_raw)?;
        Self::new(
            prev_block,
            state_hash,
            tx_hash,
            miner_pubkey,
            miner_sig,
            int(5, "header: timestamp")?,
            int(6, "header: number")?,
            int(7, "header: nonce")?,
        )
    }
}

/// On-Chain-Konto, für den Client nur bis auf `storage_root` opak.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: u64,
    pub storage_root: Hash32,
    pub code_hash: Hash32,
}

impl Account {
    /// Das Feld, das der Bestätigungs-Watcher beobachtet.
    pub fn state_root(&self) -> Hash32 {
        self.storage_root
    }

    /// 4-Tupel {nonce, balance, storage_root, code_hash}
    pub fn to_term(&self) -> Term {
        Term::Tuple(vec![
            Term::Int(self.nonce),
            Term::Int(self.balance),
            Term::bin(self.storage_root.to_vec()),
            Term::bin(self.code_hash.to_vec()),
        ])
    }

    pub fn from_term(term: &Term) -> Result<Self, TypeError> {
        let items = term
            .as_tuple()
            .ok_or(TypeError::InvalidTerm("account: not a tuple"))?;
        if items.len() != 4 {
            return Err(TypeError::InvalidTerm("account: arity != 4"));
        }
        let nonce = items
            .get(0)
            .and_then(Term::as_int)
            .ok_or(TypeError::InvalidTerm("account: nonce"))?;
        let balance = items
            .get(1)
            .and_then(Term::as_int)
            .ok_or(TypeError::InvalidTerm("account: balance"))?;
        let root_raw = items
            .get(2)
            .and_then(Term::as_binary)
            .ok_or(TypeError::InvalidTerm("account: storage_root"))?;
        let code_raw = items
            .get(3)
            .and_then(Term::as_binary)
            .ok_or(TypeError::InvalidTerm("account: code_hash"))?;
        if root_raw.len() != 32 || code_raw.len() != 32 {
            return Err(TypeError::InvalidTerm("account: hash length"));
        }
        let mut storage_root = [0u8; 32];
        storage_root.copy_from_slice(root_raw);
        let mut code_hash = [0u8; 32];
        code_hash.copy_from_slice(code_raw);
        Ok(Self {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }
}

pub mod testing {
    //! Hilfen zum Bau signierter Header in Tests (auch anderer Crates).
    #![allow(clippy::expect_used)]
    use super::*;

    pub fn signed_header(
        secret: &[u8; 32],
        prev_block: Hash32,
        number: u64,
        timestamp: u64,
    ) -> BlockHeader {
        build_header(secret, prev_block, [0x11; 32], [0x22; 32], number, timestamp, 0)
    }

    pub fn build_header(
        secret: &[u8; 32],
        prev_block: Hash32,
        state_hash: Hash32,
        tx_hash: Hash32,
        number: u64,
        timestamp: u64,
        nonce: u64,
    ) -> BlockHeader {
        let bare = Term::Tuple(vec![
            Term::bin(prev_block.to_vec()),
            Term::bin(state_hash.to_vec()),
            Term::bin(tx_hash.to_vec()),
            Term::Int(timestamp),
            Term::Int(number),
            Term::Int(nonce),
        ]);
        let digest = dc_crypto::sha256(&dc_codec::encode(&bare));
        let sig = dc_crypto::sign_recoverable(secret, &digest).expect("sign header");
        let pubkey = dc_crypto::public_key(secret).expect("pubkey");
        BlockHeader::new(
            prev_block,
            state_hash,
            tx_hash,
            pubkey,
            Signature(sig),
            timestamp,
            number,
            nonce,
        )
        .expect("valid header")
    }
}
