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

use core::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Erlang External Term Format (Subset). Versionsbyte + Tags wie vom
// Gateway-Protokoll verwendet; alles andere wird abgelehnt.
const VERSION: u8 = 131;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Maximale Framegröße: len-Präfix ist u16 big-endian.
pub const MAX_FRAME: usize = u16::MAX as usize;

#[derive(Debug)]
pub enum CodecError {
    Truncated,
    InvalidTag(u8),
    InvalidLength(usize),
    IntOutOfRange,
    InvalidAtom,
    ImproperList,
    TrailingBytes(usize),
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated input"),
            Self::InvalidTag(t) => write!(f, "invalid tag: {t}"),
            Self::InvalidLength(n) => write!(f, "invalid length: {n}"),
            Self::IntOutOfRange => write!(f, "integer out of range"),
            Self::InvalidAtom => write!(f, "atom is not valid utf-8"),
            Self::ImproperList => write!(f, "improper list tail"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after term"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}
impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// BERT-Term, wie er auf dem Draht erscheint. Integers sind im Protokoll
/// durchweg vorzeichenlos; negative Werte werden beim Dekodieren abgelehnt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    Int(u64),
    Atom(String),
    Binary(Vec<u8>),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

impl Term {
    pub fn atom(name: &str) -> Self {
        Self::Atom(name.to_string())
    }
    pub fn bin(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }
    pub fn int(v: u64) -> Self {
        Self::Int(v)
    }
    pub fn tuple(items: Vec<Term>) -> Self {
        Self::Tuple(items)
    }
    pub fn list(items: Vec<Term>) -> Self {
        Self::List(items)
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(a) => Some(a.as_str()),
            _ => None,
        }
    }
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b.as_slice()),
            _ => None,
        }
    }
    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Self::Tuple(items) => Some(items.as_slice()),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

/// Kodiert einen Term inklusive Versionsbyte.
pub fn encode(term: &Term) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(term) + 1);
    out.push(VERSION);
    encode_term(term, &mut out);
    out
}

fn encoded_len(term: &Term) -> usize {
    match term {
        Term::Int(v) => match v {
            0..=255 => 2,
            v if *v <= i32::MAX as u64 => 5,
            v => 3 + big_digits(*v),
        },
        Term::Atom(a) => 3 + a.len(),
        Term::Binary(b) => 5 + b.len(),
        Term::List(items) => {
            if items.is_empty() {
                1
            } else {
                // LIST_EXT + count + Elemente + NIL-Tail
                6 + items.iter().map(encoded_len).sum::<usize>()
            }
        }
        Term::Tuple(items) => {
            let header = if items.len() <= 255 { 2 } else { 5 };
            header + items.iter().map(encoded_len).sum::<usize>()
        }
    }
}

fn big_digits(mut v: u64) -> usize {
    let mut n = 0;
    while v > 0 {
        v >>= 8;
        n += 1;
    }
    n.max(1)
}

fn encode_term(term: &Term, out: &mut Vec<u8>) {
    match term {
        Term::Int(v) => {
            if *v <= 255 {
                out.push(SMALL_INTEGER_EXT);
                out.push(*v as u8);
            } else if *v <= i32::MAX as u64 {
                out.push(INTEGER_EXT);
                out.extend_from_slice(&(*v as i32).to_be_bytes());
            } else {
                // positives SMALL_BIG, Digits little-endian, minimal
                out.push(SMALL_BIG_EXT);
                out.push(big_digits(*v) as u8);
                out.push(0);
                let mut v = *v;
                while v > 0 {
                    out.push((v & 0xff) as u8);
                    v >>= 8;
                }
            }
        }
        Term::Atom(a) => {
            out.push(ATOM_EXT);
            out.extend_from_slice(&(a.len() as u16).to_be_bytes());
            out.extend_from_slice(a.as_bytes());
        }
        Term::Binary(b) => {
            out.push(BINARY_EXT);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Term::List(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
            } else {
                out.push(LIST_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    encode_term(item, out);
                }
                out.push(NIL_EXT);
            }
        }
        Term::Tuple(items) => {
            if items.len() <= 255 {
                out.push(SMALL_TUPLE_EXT);
                out.push(items.len() as u8);
            } else {
                out.push(LARGE_TUPLE_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            }
            for item in items {
                encode_term(item, out);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::InvalidLength(n))?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
    fn byte(&mut self) -> Result<u8, CodecError> {
        let s = self.take(1)?;
        s.first().copied().ok_or(CodecError::Truncated)
    }
    fn u16_be(&mut self) -> Result<u16, CodecError> {
        let s = self.take(2)?;
        let mut b = [0u8; 2];
        b.copy_from_slice(s);
        Ok(u16::from_be_bytes(b))
    }
    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let s = self.take(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(s);
        Ok(u32::from_be_bytes(b))
    }
}

/// Dekodiert genau einen Term; Reste hinter dem Term sind ein Fehler.
pub fn decode(buf: &[u8]) -> Result<Term, CodecError> {
    let mut r = Reader { buf, pos: 0 };
    let version = r.byte()?;
    if version != VERSION {
        return Err(CodecError::InvalidTag(version));
    }
    let term = decode_term(&mut r)?;
    if r.pos != buf.len() {
        return Err(CodecError::TrailingBytes(buf.len() - r.pos));
    }
    Ok(term)
}

fn decode_term(r: &mut Reader<'_>) -> Result<Term, CodecError> {
    let tag = r.byte()?;
    match tag {
        SMALL_INTEGER_EXT => Ok(Term::Int(r.byte()? as u64)),
        INTEGER_EXT => {
            let raw = r.u32_be()? as i32;
            if raw < 0 {
                return Err(CodecError::IntOutOfRange);
            }
            Ok(Term::Int(raw as u64))
        }
        SMALL_BIG_EXT => {
            let n = r.byte()? as usize;
            let sign = r.byte()?;
            if sign != 0 {
                return Err(CodecError::IntOutOfRange);
            }
            let digits = r.take(n)?;
            let mut v: u64 = 0;
            for (i, d) in digits.iter().enumerate() {
                if *d != 0 && i >= 8 {
                    return Err(CodecError::IntOutOfRange);
                }
                if i < 8 {
                    v |= (*d as u64) << (8 * i);
                }
            }
            Ok(Term::Int(v))
        }
        ATOM_EXT | ATOM_UTF8_EXT => {
            let len = r.u16_be()? as usize;
            let raw = r.take(len)?;
            let name = String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidAtom)?;
            Ok(Term::Atom(name))
        }
        SMALL_ATOM_UTF8_EXT => {
            let len = r.byte()? as usize;
            let raw = r.take(len)?;
            let name = String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidAtom)?;
            Ok(Term::Atom(name))
        }
        BINARY_EXT => {
            let len = r.u32_be()? as usize;
            Ok(Term::Binary(r.take(len)?.to_vec()))
        }
        NIL_EXT => Ok(Term::List(Vec::new())),
        // Erlang-Strings sind Listen kleiner Integer
        STRING_EXT => {
            let len = r.u16_be()? as usize;
            let raw = r.take(len)?;
            Ok(Term::List(raw.iter().map(|b| Term::Int(*b as u64)).collect()))
        }
        LIST_EXT => {
            let count = r.u32_be()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_term(r)?);
            }
            if r.byte()? != NIL_EXT {
                return Err(CodecError::ImproperList);
            }
            Ok(Term::List(items))
        }
        SMALL_TUPLE_EXT => {
            let arity = r.byte()? as usize;
            let mut items = Vec::with_capacity(arity);
            for _ in 0..arity {
                items.push(decode_term(r)?);
            }
            Ok(Term::Tuple(items))
        }
        LARGE_TUPLE_EXT => {
            let arity = r.u32_be()? as usize;
            let mut items = Vec::with_capacity(arity.min(4096));
            for _ in 0..arity {
                items.push(decode_term(r)?);
            }
            Ok(Term::Tuple(items))
        }
        other => Err(CodecError::InvalidTag(other)),
    }
}

/// Rahmt einen Term: `len:u16 BE ‖ payload`.
pub fn encode_frame(term: &Term) -> Result<Vec<u8>, CodecError> {
    let payload = encode(term);
    if payload.len() > MAX_FRAME {
        return Err(CodecError::InvalidLength(payload.len()));
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Liest einen Frame vom Stream. `Ok(None)` bei sauberem EOF zwischen
/// Frames; EOF mitten im Frame ist `Truncated`.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<(Term, usize)>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CodecError::Io(e)),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::Truncated,
            _ => CodecError::Io(e),
        })?;
    let term = decode(&payload)?;
    Ok(Some((term, 2 + len)))
}

pub async fn write_frame<W>(stream: &mut W, term: &Term) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(term)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(t: &Term) {
        let enc = encode(t);
        let got = decode(&enc).expect("decode");
        assert_eq!(*t, got);
    }

    #[test]
    fn int_roundtrip() {
        for v in [0u64, 1, 127, 255, 256, 65535, i32::MAX as u64, 1 << 40, u64::MAX] {
            roundtrip(&Term::Int(v));
        }
    }

    #[test]
    fn atom_golden() {
        let enc = encode(&Term::atom("ok"));
        assert_eq!(enc, vec![131, 100, 0, 2, b'o', b'k']);
    }

    #[test]
    fn small_int_golden() {
        assert_eq!(encode(&Term::Int(42)), vec![131, 97, 42]);
    }

    #[test]
    fn nested_roundtrip() {
        let t = Term::tuple(vec![
            Term::atom("response"),
            Term::Int(7),
            Term::list(vec![Term::bin(vec![1, 2, 3]), Term::Int(1 << 50)]),
        ]);
        roundtrip(&t);
    }

    #[test]
    fn empty_list_is_nil() {
        assert_eq!(encode(&Term::List(vec![])), vec![131, 106]);
        roundtrip(&Term::List(vec![]));
    }

    #[test]
    fn string_ext_decodes_to_int_list() {
        // 131, STRING_EXT, len=2, "hi"
        let buf = vec![131, 107, 0, 2, b'h', b'i'];
        let t = decode(&buf).expect("decode string");
        assert_eq!(
            t,
            Term::List(vec![Term::Int(b'h' as u64), Term::Int(b'i' as u64)])
        );
    }

    #[test]
    fn negative_int_rejected() {
        let buf = vec![131, 98, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(decode(&buf), Err(CodecError::IntOutOfRange)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut enc = encode(&Term::Int(1));
        enc.push(0);
        assert!(matches!(decode(&enc), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn truncated_rejected() {
        let enc = encode(&Term::bin(vec![0u8; 16]));
        let cut = enc.get(..enc.len() - 1).expect("slice");
        assert!(matches!(decode(cut), Err(CodecError::Truncated)));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let t = Term::tuple(vec![Term::atom("portsend"), Term::Int(3), Term::bin(b"xyz".to_vec())]);
        write_frame(&mut a, &t).await.expect("write");
        let (got, n) = read_frame(&mut b).await.expect("read").expect("some frame");
        assert_eq!(got, t);
        assert_eq!(n, encode(&t).len() + 2);
    }

    #[tokio::test]
    async fn frame_eof_between_frames() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.expect("clean eof").is_none());
    }

    #[tokio::test]
    async fn frame_eof_mid_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 10, 1, 2]).await.expect("partial");
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(CodecError::Truncated)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let t = Term::bin(vec![0u8; MAX_FRAME + 1]);
        assert!(matches!(
            encode_frame(&t),
            Err(CodecError::InvalidLength(_))
        ));
    }
}
