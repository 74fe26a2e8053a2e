// SPDX-License-Identifier: AGPL-3.0-only

//! EIP-155-Transaktionen. `to` ist bei Contract-Deployments leer.

use dc_crypto::{CryptoError, Hash32};
use dc_types::{Address, Signature};

/// Diode-Chain-Id.
pub const CHAIN_ID: u64 = 41043;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: u64,
    pub data: Vec<u8>,
    chain_id: u64,
    v: u64,
    r: [u8; 32],
    s: [u8; 32],
    sig: Option<Signature>,
}

impl Transaction {
    pub fn new(
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        to: Address,
        value: u64,
        data: Vec<u8>,
        chain_id: u64,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas_limit,
            to: Some(to),
            value,
            data,
            chain_id: if chain_id == 0 { CHAIN_ID } else { chain_id },
            v: 0,
            r: [0u8; 32],
            s: [0u8; 32],
            sig: None,
        }
    }

    pub fn deploy(
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        value: u64,
        data: Vec<u8>,
        chain_id: u64,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas_limit,
            to: None,
            value,
            data,
            chain_id: if chain_id == 0 { CHAIN_ID } else { chain_id },
            v: 0,
            r: [0u8; 32],
            s: [0u8; 32],
            sig: None,
        }
    }

    fn append_common(&self, stream: &mut rlp::RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        match &self.to {
            Some(addr) => stream.append(&addr.0.to_vec()),
            None => stream.append_empty_data(),
        };
        stream.append(&self.value);
        stream.append(&self.data);
    }

    /// Signier-Digest nach EIP-155: keccak256 der 9-Felder-RLP mit
    /// `{chain_id, "", ""}` am Ende.
    pub fn signing_hash(&self) -> Hash32 {
        let mut stream = rlp::RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&self.chain_id);
        stream.append_empty_data();
        stream.append_empty_data();
        dc_crypto::keccak256(&stream.out())
    }

    pub fn sign(&mut self, secret: &[u8; 32]) -> Result<(), CryptoError> {
        let digest = self.signing_hash();
        let sig = dc_crypto::sign_recoverable(secret, &digest)?;
        let recid = u64::from(sig[0]);
        self.v = recid + 35 + self.chain_id * 2;
        self.r.copy_from_slice(&sig[1..33]);
        self.s.copy_from_slice(&sig[33..65]);
        self.sig = Some(Signature(sig));
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.sig.is_some()
    }

    /// Absender aus der Signatur.
    pub fn from(&self) -> Result<Address, CryptoError> {
        let sig = self.sig.as_ref().ok_or(CryptoError::InvalidSignature)?;
        let pubkey = dc_crypto::recover(&self.signing_hash(), sig.as_bytes())?;
        Ok(Address(dc_crypto::pubkey_to_address(&pubkey)?))
    }

    /// Signierte RLP für `sendtransaction`.
    pub fn to_rlp(&self) -> Result<Vec<u8>, CryptoError> {
        if self.sig.is_none() {
            return Err(CryptoError::InvalidSignature);
        }
        let mut stream = rlp::RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&self.v);
        stream.append(&self.r.to_vec());
        stream.append(&self.s.to_vec());
        Ok(stream.out().to_vec())
    }

    pub fn transaction_hash(&self) -> Result<Hash32, CryptoError> {
        Ok(dc_crypto::keccak256(&self.to_rlp()?))
    }
}
