// SPDX-License-Identifier: AGPL-3.0-only

//! Tickets: signierte Abrechnungsbelege für vom Gateway bewegte Bytes.
//! Die Zähler sind pro Session monoton; das Gateway bindet das Ticket an
//! die laufende Verbindung.

use dc_codec::Term;
use dc_crypto::{CryptoError, Hash32};
use dc_types::{Address, Signature};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub block_number: u64,
    pub block_hash: Hash32,
    pub fleet: Address,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub local_addr: Address,
}

impl Ticket {
    fn bare_term(&self) -> Term {
        Term::Tuple(vec![
            Term::Int(self.block_number),
            Term::bin(self.block_hash.to_vec()),
            Term::bin(self.fleet.0.to_vec()),
            Term::Int(self.total_connections),
            Term::Int(self.total_bytes),
            Term::bin(self.local_addr.0.to_vec()),
        ])
    }

    /// SHA-256 über die BERT-Kodierung des 6-Tupels.
    pub fn digest(&self) -> Hash32 {
        dc_crypto::sha256(&dc_codec::encode(&self.bare_term()))
    }

    pub fn sign(&self, secret: &[u8; 32]) -> Result<Signature, CryptoError> {
        Ok(Signature(dc_crypto::sign_recoverable(secret, &self.digest())?))
    }

    pub fn verify(&self, signer: &Address, sig: &Signature) -> bool {
        let digest = self.digest();
        match dc_crypto::recover(&digest, sig.as_bytes()) {
            Ok(pubkey) => match dc_crypto::pubkey_to_address(&pubkey) {
                Ok(raw) => Address(raw) == *signer,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Argumente des `ticket`-Requests.
    pub fn to_args(&self, sig: &Signature) -> Vec<Term> {
        vec![
            Term::Int(self.block_number),
            Term::bin(self.block_hash.to_vec()),
            Term::bin(self.fleet.0.to_vec()),
            Term::Int(self.total_connections),
            Term::Int(self.total_bytes),
            Term::bin(self.local_addr.0.to_vec()),
            Term::bin(sig.0.to_vec()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total_bytes: u64) -> Ticket {
        Ticket {
            block_number: 77,
            block_hash: [5u8; 32],
            fleet: Address([6u8; 20]),
            total_connections: 2,
            total_bytes,
            local_addr: Address([7u8; 20]),
        }
    }

    #[test]
    fn sign_and_verify() {
        let secret = dc_crypto::generate_secret();
        let signer = Address(dc_crypto::secret_to_address(&secret).expect("addr"));
        let ticket = sample(4096);
        let sig = ticket.sign(&secret).expect("sign");
        assert!(ticket.verify(&signer, &sig));
        assert!(!ticket.verify(&Address([1u8; 20]), &sig));
        // anderer Zählerstand, andere Signatur
        let other = sample(8192);
        assert!(!other.verify(&signer, &sig));
    }

    #[test]
    fn args_carry_signature_last() {
        let secret = dc_crypto::generate_secret();
        let ticket = sample(1);
        let sig = ticket.sign(&secret).expect("sign");
        let args = ticket.to_args(&sig);
        assert_eq!(args.len(), 7);
        assert_eq!(
            args.last().and_then(Term::as_binary).map(<[u8]>::len),
            Some(65)
        );
    }
}
