// SPDX-License-Identifier: AGPL-3.0-only

//! Port-Streams und die Bridge. Drei Parteien sehen einen Stream: die
//! Pool-Registry, der Session-Reader (schiebt Inbound-Bytes) und genau
//! eine Bridge (konsumiert). Der Kanal zerfällt in Reader-/Writer-Seite,
//! damit keine Zyklen entstehen.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use dc_types::Address;

use crate::pool::DataPool;
use crate::{protocol, Direction, EdgeError, PortMode, PortProtocol};

/// Inbound-Puffer je Stream (Frames); begrenzt und damit Backpressure
/// auf den Session-Reader.
const INBOUND_BUFFER: usize = 64;

pub struct PortStream {
    port_id: u64,
    peer: Address,
    direction: Direction,
    protocol: PortProtocol,
    mode: PortMode,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    closed: AtomicBool,
    last_activity: AtomicU64,
}

impl PortStream {
    pub fn new(
        port_id: u64,
        peer: Address,
        direction: Direction,
        protocol: PortProtocol,
        mode: PortMode,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let stream = Arc::new(Self {
            port_id,
            peer,
            direction,
            protocol,
            mode,
            tx: Mutex::new(Some(tx)),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            last_activity: AtomicU64::new(now_secs()),
        });
        (stream, rx)
    }

    pub fn port_id(&self) -> u64 {
        self.port_id
    }
    pub fn peer(&self) -> Address {
        self.peer
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn protocol(&self) -> PortProtocol {
        self.protocol
    }
    pub fn mode(&self) -> PortMode {
        self.mode
    }
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
    pub fn last_activity_secs(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    pub(crate) fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    /// Session-Reader liefert Inbound-Daten an. `false`, wenn der Stream
    /// bereits geschlossen ist (Frame wird verworfen).
    pub async fn push(&self, data: Vec<u8>) -> bool {
        let sender = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return false;
        };
        let n = data.len() as u64;
        if sender.send(data).await.is_err() {
            return false;
        }
        self.add_down(n);
        true
    }

    /// EOF Richtung Bridge; idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// AsyncRead/AsyncWrite-Sicht auf einen Port-Stream. Writes werden zu
/// `portsend`-Frames (≤ chunk), Shutdown zu `portclose`.
pub struct PortChannel {
    stream: Arc<PortStream>,
    rx: mpsc::Receiver<Vec<u8>>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    chunk: usize,
    pool: Option<Arc<DataPool>>,
    leftover: Option<(Vec<u8>, usize)>,
    sent_close: bool,
}

impl PortChannel {
    pub fn new(
        stream: Arc<PortStream>,
        rx: mpsc::Receiver<Vec<u8>>,
        out: mpsc::UnboundedSender<Vec<u8>>,
        chunk: usize,
        pool: Option<Arc<DataPool>>,
    ) -> Self {
        Self {
            stream,
            rx,
            out,
            chunk: chunk.max(1),
            pool,
            leftover: None,
            sent_close: false,
        }
    }

    pub fn stream(&self) -> &Arc<PortStream> {
        &self.stream
    }

    fn send_close(&mut self) {
        if self.sent_close {
            return;
        }
        self.sent_close = true;
        if let Ok(frame) = dc_codec::encode_frame(&protocol::portclose(self.stream.port_id())) {
            let _ = self.out.send(frame);
        }
        self.stream.close();
        if let Some(pool) = &self.pool {
            pool.remove_port(self.stream.port_id());
        }
    }
}

impl Drop for PortChannel {
    fn drop(&mut self) {
        self.send_close();
    }
}

impl AsyncRead for PortChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some((data, offset)) = self.leftover.take() {
                let remaining = data.len() - offset;
                let take = remaining.min(buf.remaining());
                buf.put_slice(&data[offset..offset + take]);
                if take < remaining {
                    self.leftover = Some((data, offset + take));
                }
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    if let Some(pool) = &self.pool {
                        pool.record_down(self.stream.peer(), data.len() as u64);
                    }
                    self.leftover = Some((data, 0));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for PortChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.sent_close || this.stream.is_closed() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "port stream closed",
            )));
        }
        let take = data.len().min(this.chunk);
        let chunk = &data[..take];
        let frame = dc_codec::encode_frame(&protocol::portsend(this.stream.port_id(), chunk))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        this.out
            .send(frame)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed"))?;
        this.stream.add_up(take as u64);
        if let Some(pool) = &this.pool {
            pool.record_up(this.stream.peer(), take as u64);
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().send_close();
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BridgeOpts {
    /// Lesepuffer B je Richtung.
    pub chunk_size: usize,
    /// Leerlauf-Timeout I; beendet beide Richtungen.
    pub idle_timeout: Duration,
}

impl Default for BridgeOpts {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Kopiert eine Richtung; bei EOF wird die Schreibseite sauber
/// heruntergefahren (Half-Close-Propagation).
async fn pump<R, W>(mut r: R, mut w: W, chunk: usize, idle: Duration) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk.max(1)];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, r.read(&mut buf)).await {
            Ok(res) => res?,
            // Leerlauf: wie EOF behandeln
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        total += n as u64;
    }
    let _ = w.shutdown().await;
    Ok(total)
}

/// Bidirektionale Brücke zwischen lokalem Socket und Port-Stream.
/// Liefert (bytes lokal→remote, bytes remote→lokal). Ein Fehler auf einer
/// Seite reißt beide Richtungen ab.
pub async fn bridge<L, R>(local: L, remote: R, opts: BridgeOpts) -> Result<(u64, u64), EdgeError>
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (lr, lw) = tokio::io::split(local);
    let (rr, rw) = tokio::io::split(remote);
    let mut up = Box::pin(pump(lr, rw, opts.chunk_size, opts.idle_timeout));
    let mut down = Box::pin(pump(rr, lw, opts.chunk_size, opts.idle_timeout));

    let mut up_total: Option<u64> = None;
    let mut down_total: Option<u64> = None;
    loop {
        tokio::select! {
            res = &mut up, if up_total.is_none() => match res {
                Ok(n) => up_total = Some(n),
                Err(e) => {
                    debug!(error = %e, "bridge up half failed");
                    return Err(EdgeError::ConnectionClosed);
                }
            },
            res = &mut down, if down_total.is_none() => match res {
                Ok(n) => down_total = Some(n),
                Err(e) => {
                    debug!(error = %e, "bridge down half failed");
                    return Err(EdgeError::ConnectionClosed);
                }
            },
        }
        if let (Some(u), Some(d)) = (up_total, down_total) {
            return Ok((u, d));
        }
    }
}
