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

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};

pub type Hash32 = [u8; 32];

#[derive(Debug)]
pub enum CryptoError {
    InvalidPrivateKey,
    InvalidPublicKey,
    InvalidSignature,
    InvalidRecoveryId(u8),
}

impl core::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidPrivateKey => f.write_str("invalid private key"),
            Self::InvalidPublicKey => f.write_str("invalid public key"),
            Self::InvalidSignature => f.write_str("invalid signature"),
            Self::InvalidRecoveryId(v) => write!(f, "invalid recovery id: {v}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// SHA-256 (32 Bytes)
pub fn sha256(data: &[u8]) -> Hash32 {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Keccak-256 (32 Bytes) — Ethereum-Variante, nicht NIST SHA-3
pub fn keccak256(data: &[u8]) -> Hash32 {
    use sha3::Digest;
    let mut hasher = sha3::Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Adresse = letzte 20 Bytes von keccak256 über den 64-Byte-Pubkey-Körper.
/// Akzeptiert 64 Bytes oder 65 Bytes mit 0x04-Präfix.
pub fn pubkey_to_address(pubkey: &[u8]) -> Result<[u8; 20], CryptoError> {
    let body: &[u8] = match pubkey.len() {
        64 => pubkey,
        65 => pubkey.get(1..).ok_or(CryptoError::InvalidPublicKey)?,
        _ => return Err(CryptoError::InvalidPublicKey),
    };
    let digest = keccak256(body);
    let mut addr = [0u8; 20];
    let tail = digest.get(12..).ok_or(CryptoError::InvalidPublicKey)?;
    addr.copy_from_slice(tail);
    Ok(addr)
}

/// Erzeugt ein frisches secp256k1-Secret (32 Bytes).
pub fn generate_secret() -> [u8; 32] {
    let key = SigningKey::random(&mut rand::rngs::OsRng);
    key.to_bytes().into()
}

/// Unkomprimierter Pubkey-Körper (64 Bytes, ohne 0x04) zum Secret.
pub fn public_key(secret: &[u8; 32]) -> Result<[u8; 64], CryptoError> {
    let key = SigningKey::from_bytes(secret.into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
    let point = key.verifying_key().to_encoded_point(false);
    let raw = point.as_bytes();
    let body = raw.get(1..65).ok_or(CryptoError::InvalidPublicKey)?;
    let mut out = [0u8; 64];
    out.copy_from_slice(body);
    Ok(out)
}

pub fn secret_to_address(secret: &[u8; 32]) -> Result<[u8; 20], CryptoError> {
    pubkey_to_address(&public_key(secret)?)
}

/// Signiert einen 32-Byte-Digest. Layout: `v(1) ‖ r(32) ‖ s(32)`,
/// v ist die rohe Recovery-Id (0..=1).
pub fn sign_recoverable(secret: &[u8; 32], digest: &Hash32) -> Result<[u8; 65], CryptoError> {
    let key = SigningKey::from_bytes(secret.into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
    let (sig, recid) = key
        .sign_prehash_recoverable(digest)
        .map_err(|_| CryptoError::InvalidPrivateKey)?;
    let mut out = [0u8; 65];
    out[0] = recid.to_byte();
    let rs: [u8; 64] = sig.to_bytes().into();
    out.get_mut(1..65)
        .ok_or(CryptoError::InvalidSignature)?
        .copy_from_slice(&rs);
    Ok(out)
}

/// Prüft `r ‖ s` (64 Bytes) über einem Digest gegen einen Pubkey-Körper.
pub fn verify(pubkey: &[u8], digest: &Hash32, rs: &[u8]) -> bool {
    let key = match parse_pubkey(pubkey) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = match EcdsaSignature::from_slice(rs) {
        Ok(s) => s,
        Err(_) => return false,
    };
    key.verify_prehash(digest, &sig).is_ok()
}

/// Rekonstruiert den 64-Byte-Pubkey-Körper aus Digest und 65-Byte-Signatur.
pub fn recover(digest: &Hash32, sig: &[u8; 65]) -> Result<[u8; 64], CryptoError> {
    let v = sig[0];
    let recid = match v {
        0 | 27 => RecoveryId::try_from(0u8),
        1 | 28 => RecoveryId::try_from(1u8),
        _ => return Err(CryptoError::InvalidRecoveryId(v)),
    }
    .map_err(|_| CryptoError::InvalidRecoveryId(v))?;
    let rs = sig.get(1..65).ok_or(CryptoError::InvalidSignature)?;
    let parsed = EcdsaSignature::from_slice(rs).map_err(|_| CryptoError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest, &parsed, recid)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let point = key.to_encoded_point(false);
    let body = point
        .as_bytes()
        .get(1..65)
        .ok_or(CryptoError::InvalidPublicKey)?;
    let mut out = [0u8; 64];
    out.copy_from_slice(body);
    Ok(out)
}

fn parse_pubkey(pubkey: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    let body: &[u8] = match pubkey.len() {
        64 => pubkey,
        65 => pubkey.get(1..).ok_or(CryptoError::InvalidPublicKey)?,
        _ => return Err(CryptoError::InvalidPublicKey),
    };
    sec1.get_mut(1..65)
        .ok_or(CryptoError::InvalidPublicKey)?
        .copy_from_slice(body);
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

// ============================
// Merkle-Audit-Pfade
// ============================
// Domain-Trennung zwischen Leaf- und Pair-Hashes, damit kein Leaf als
// innerer Knoten ausgegeben werden kann.

const MRKL_PAIR_DOMAIN: &[u8] = b"dc:mrkl:pair:v1\x01";
pub const MRKL_LEAF_DOMAIN: &[u8] = b"dc:mrkl:leaf:v1\x01";

/// Leaf-Hash: H(domain || payload)
pub fn merkle_leaf_hash(payload: &[u8]) -> Hash32 {
    let mut data = Vec::with_capacity(MRKL_LEAF_DOMAIN.len() + payload.len());
    data.extend_from_slice(MRKL_LEAF_DOMAIN);
    data.extend_from_slice(payload);
    sha256(&data)
}

fn pair_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut data = [0u8; 16 + 64];
    for (dst, src) in data.iter_mut().zip(MRKL_PAIR_DOMAIN.iter()) {
        *dst = *src;
    }
    for (dst, src) in data.iter_mut().skip(MRKL_PAIR_DOMAIN.len()).take(32).zip(left.iter()) {
        *dst = *src;
    }
    for (dst, src) in data.iter_mut().skip(MRKL_PAIR_DOMAIN.len() + 32).zip(right.iter()) {
        *dst = *src;
    }
    sha256(&data)
}

/// Merkle-Root über 32-Byte-Leaves (dupliziere letztes Leaf bei ungerader
/// Anzahl). Leerer Baum → 0x00..00.
pub fn merkle_root_hashes(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    if leaves.len() == 1 {
        if let Some(&first) = leaves.first() {
            return first;
        }
    }
    let mut level: Vec<Hash32> = leaves.to_vec();
    while level.len() > 1 {
        let mut next: Vec<Hash32> = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.iter();
        while let Some(left_ref) = it.next() {
            let left = *left_ref;
            let right = match it.next() {
                Some(r) => *r,
                None => left,
            };
            next.push(pair_hash(&left, &right));
        }
        level = next;
    }
    level.pop().unwrap_or_default()
}

/// Audit-Pfad: Geschwister-Hash plus Flag, ob das Geschwister links steht.
pub type AuditPath = Vec<(Hash32, bool)>;

/// Baut den Audit-Pfad für `index` über den gegebenen Leaves.
pub fn merkle_build_proof(leaves: &[Hash32], index: usize) -> Option<AuditPath> {
    if index >= leaves.len() {
        return None;
    }
    let mut path = AuditPath::new();
    let mut level: Vec<Hash32> = leaves.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        let sibling_pos = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
        let sibling = *level.get(sibling_pos).or_else(|| level.get(pos))?;
        path.push((sibling, pos % 2 == 1));
        let mut next: Vec<Hash32> = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.iter();
        while let Some(left_ref) = it.next() {
            let left = *left_ref;
            let right = match it.next() {
                Some(r) => *r,
                None => left,
            };
            next.push(pair_hash(&left, &right));
        }
        level = next;
        pos /= 2;
    }
    Some(path)
}

/// Verifiziert einen Audit-Pfad vom Leaf bis zur Root.
pub fn merkle_verify_proof(root: &Hash32, leaf: &Hash32, path: &AuditPath) -> bool {
    let mut acc = *leaf;
    for (sibling, sibling_on_left) in path {
        acc = if *sibling_on_left {
            pair_hash(sibling, &acc)
        } else {
            pair_hash(&acc, sibling)
        };
    }
    acc == *root
}
