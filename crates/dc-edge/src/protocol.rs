// SPDX-License-Identifier: AGPL-3.0-only

//! Frame-Formen des Edge-Protokolls. Requests sind
//! `{atom(method), request_id, args…}`; Datenframes (portsend/portclose)
//! tragen keine Request-Id. Eingehende Frames werden am führenden Atom
//! dispatcht.

use dc_codec::Term;
use dc_types::Address;

use crate::EdgeError;

pub const ATOM_RESPONSE: &str = "response";
pub const ATOM_ERROR: &str = "error";
pub const ATOM_PORTOPEN: &str = "portopen";
pub const ATOM_PORTSEND: &str = "portsend";
pub const ATOM_PORTCLOSE: &str = "portclose";
pub const ATOM_GOODBYE: &str = "goodbye";
pub const ATOM_OK: &str = "ok";
pub const ATOM_THANKS: &str = "thanks";
pub const ATOM_TOO_LOW: &str = "too_low";

/// Gateway→Client-Frames nach dem Dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Response { id: u64, payload: Term },
    Error { id: u64, reason: String },
    PortOpen { port_ref: u64, port: u16, from: Address },
    PortSend { port_id: u64, data: Vec<u8> },
    PortClose { port_id: u64 },
    Goodbye { reason: String, details: String },
}

pub fn request(method: &str, id: u64, args: Vec<Term>) -> Term {
    let mut items = Vec::with_capacity(2 + args.len());
    items.push(Term::atom(method));
    items.push(Term::Int(id));
    items.extend(args);
    Term::Tuple(items)
}

pub fn portsend(port_id: u64, data: &[u8]) -> Term {
    Term::Tuple(vec![
        Term::atom(ATOM_PORTSEND),
        Term::Int(port_id),
        Term::bin(data.to_vec()),
    ])
}

pub fn portclose(port_id: u64) -> Term {
    Term::Tuple(vec![Term::atom(ATOM_PORTCLOSE), Term::Int(port_id)])
}

/// Antwort auf ein serverseitiges portopen (Published Ports).
pub fn portopen_ack(port_ref: u64) -> Term {
    Term::Tuple(vec![
        Term::atom(ATOM_RESPONSE),
        Term::Int(port_ref),
        Term::atom(ATOM_OK),
    ])
}

pub fn portopen_deny(port_ref: u64, reason: &str) -> Term {
    Term::Tuple(vec![
        Term::atom(ATOM_ERROR),
        Term::Int(port_ref),
        Term::atom(reason),
    ])
}

fn reason_text(term: &Term) -> String {
    match term {
        Term::Atom(a) => a.clone(),
        Term::Binary(b) => String::from_utf8_lossy(b).to_string(),
        other => format!("{other:?}"),
    }
}

/// Ordnet einen eingehenden Frame zu. Unbekannte Atome und falsche
/// Aritäten sind Protokollfehler und beenden die Session.
pub fn parse_inbound(term: Term) -> Result<Inbound, EdgeError> {
    let items = term
        .as_tuple()
        .ok_or_else(|| EdgeError::Protocol("frame is not a tuple".to_string()))?;
    let head = items
        .first()
        .and_then(Term::as_atom)
        .ok_or_else(|| EdgeError::Protocol("frame without leading atom".to_string()))?;
    let int_at = |idx: usize| -> Result<u64, EdgeError> {
        items
            .get(idx)
            .and_then(Term::as_int)
            .ok_or_else(|| EdgeError::Protocol(format!("{head}: integer expected at {idx}")))
    };
    match head {
        ATOM_RESPONSE => {
            if items.len() != 3 {
                return Err(EdgeError::Protocol("response: arity != 3".to_string()));
            }
            let payload = items
                .get(2)
                .cloned()
                .ok_or_else(|| EdgeError::Protocol("response: payload".to_string()))?;
            Ok(Inbound::Response {
                id: int_at(1)?,
                payload,
            })
        }
        ATOM_ERROR => {
            if items.len() != 3 {
                return Err(EdgeError::Protocol("error: arity != 3".to_string()));
            }
            let reason = items
                .get(2)
                .map(reason_text)
                .unwrap_or_else(|| "unknown".to_string());
            Ok(Inbound::Error {
                id: int_at(1)?,
                reason,
            })
        }
        ATOM_PORTOPEN => {
            if items.len() != 4 {
                return Err(EdgeError::Protocol("portopen: arity != 4".to_string()));
            }
            let raw = items
                .get(3)
                .and_then(Term::as_binary)
                .ok_or_else(|| EdgeError::Protocol("portopen: from address".to_string()))?;
            let from = Address::from_slice(raw)
                .map_err(|e| EdgeError::Protocol(format!("portopen: {e}")))?;
            let port = int_at(2)?;
            let port = u16::try_from(port)
                .map_err(|_| EdgeError::Protocol(format!("portopen: port {port}")))?;
            Ok(Inbound::PortOpen {
                port_ref: int_at(1)?,
                port,
                from,
            })
        }
        ATOM_PORTSEND => {
            if items.len() != 3 {
                return Err(EdgeError::Protocol("portsend: arity != 3".to_string()));
            }
            let data = items
                .get(2)
                .and_then(Term::as_binary)
                .ok_or_else(|| EdgeError::Protocol("portsend: data".to_string()))?;
            Ok(Inbound::PortSend {
                port_id: int_at(1)?,
                data: data.to_vec(),
            })
        }
        ATOM_PORTCLOSE => {
            if items.len() != 2 {
                return Err(EdgeError::Protocol("portclose: arity != 2".to_string()));
            }
            Ok(Inbound::PortClose { port_id: int_at(1)? })
        }
        ATOM_GOODBYE => {
            let reason = items.get(1).map(reason_text).unwrap_or_default();
            let details = items.get(2).map(reason_text).unwrap_or_default();
            Ok(Inbound::Goodbye { reason, details })
        }
        other => Err(EdgeError::Protocol(format!("unexpected atom: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let t = request("getblockpeak", 7, vec![]);
        assert_eq!(
            t,
            Term::Tuple(vec![Term::atom("getblockpeak"), Term::Int(7)])
        );
    }

    #[test]
    fn parse_response() {
        let t = Term::Tuple(vec![
            Term::atom("response"),
            Term::Int(3),
            Term::atom("thanks"),
        ]);
        assert_eq!(
            parse_inbound(t).expect("parse"),
            Inbound::Response {
                id: 3,
                payload: Term::atom("thanks")
            }
        );
    }

    #[test]
    fn parse_portsend_roundtrip() {
        let t = portsend(9, b"abc");
        assert_eq!(
            parse_inbound(t).expect("parse"),
            Inbound::PortSend {
                port_id: 9,
                data: b"abc".to_vec()
            }
        );
    }

    #[test]
    fn parse_portopen() {
        let t = Term::Tuple(vec![
            Term::atom("portopen"),
            Term::Int(12),
            Term::Int(8080),
            Term::bin(vec![0x11; 20]),
        ]);
        assert_eq!(
            parse_inbound(t).expect("parse"),
            Inbound::PortOpen {
                port_ref: 12,
                port: 8080,
                from: Address([0x11; 20])
            }
        );
    }

    #[test]
    fn parse_goodbye_binary_reason() {
        let t = Term::Tuple(vec![
            Term::atom("goodbye"),
            Term::bin(b"ticket_expired".to_vec()),
            Term::bin(b"resubmit".to_vec()),
        ]);
        assert_eq!(
            parse_inbound(t).expect("parse"),
            Inbound::Goodbye {
                reason: "ticket_expired".to_string(),
                details: "resubmit".to_string()
            }
        );
    }

    #[test]
    fn unknown_atom_is_protocol_error() {
        let t = Term::Tuple(vec![Term::atom("gossip"), Term::Int(0)]);
        assert!(matches!(parse_inbound(t), Err(EdgeError::Protocol(_))));
    }

    #[test]
    fn bad_arity_is_protocol_error() {
        let t = Term::Tuple(vec![Term::atom("portclose")]);
        assert!(matches!(parse_inbound(t), Err(EdgeError::Protocol(_))));
    }
}
