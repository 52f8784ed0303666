//! Carrier engine
//!
//! Pairs sub-stream frames on one carrier connection with per-session byte
//! streams. The engine runs as two tasks (carrier reader, carrier writer);
//! each sub-stream surfaces as a [`MuxStream`] implementing
//! `AsyncRead + AsyncWrite` so the session relay code stays transport
//! agnostic.

use super::{MuxError, MuxFrame, MuxFrameType, SubStream};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

/// Live mux parameters, snapshotted at carrier creation
#[derive(Debug, Clone, Copy)]
pub struct MuxParams {
    /// Largest DATA payload per frame
    pub max_frame_size: usize,
    /// Carrier-wide budget for buffered outbound frames
    pub max_receive_buffer: usize,
    /// Per-sub-stream inbound buffer
    pub max_stream_buffer: usize,
    /// Concurrent sub-stream cap
    pub mux_con: usize,
}

impl MuxParams {
    fn carrier_queue_len(&self) -> usize {
        (self.max_receive_buffer / self.max_frame_size.max(1)).max(1)
    }

    fn stream_queue_len(&self) -> usize {
        (self.max_stream_buffer / self.max_frame_size.max(1)).max(1)
    }
}

struct StreamEntry {
    /// Inbound data channel; `None` once the remote sent FIN
    data_tx: Option<mpsc::Sender<Bytes>>,
    state: SubStream,
}

type StreamMap = Arc<Mutex<HashMap<u32, StreamEntry>>>;

/// Handle to one mux carrier
pub struct MuxSession {
    frame_tx: mpsc::Sender<MuxFrame>,
    streams: StreamMap,
    params: MuxParams,
    shutdown: CancellationToken,
}

impl MuxSession {
    /// Take ownership of a carrier connection and spawn its engine tasks.
    ///
    /// Returns the session handle and the receiver surfacing sub-streams
    /// opened by the remote peer.
    pub fn spawn<S>(carrier: S, params: MuxParams) -> (Self, mpsc::Receiver<(u32, MuxStream)>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel(params.carrier_queue_len());
        let (incoming_tx, incoming_rx) = mpsc::channel(params.mux_con.max(1));
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let (rd, wr) = tokio::io::split(carrier);

        tokio::spawn(write_loop(wr, frame_rx, Arc::clone(&streams), shutdown.clone()));
        tokio::spawn(read_loop(
            rd,
            Arc::clone(&streams),
            incoming_tx,
            frame_tx.clone(),
            params,
            shutdown.clone(),
        ));

        (Self { frame_tx, streams, params, shutdown }, incoming_rx)
    }

    /// Open a new sub-stream carrying session `sid` (front-peer side).
    pub async fn open_stream(&self, sid: u32) -> Result<MuxStream, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::CarrierClosed);
        }

        let data_rx = {
            let mut streams = self.streams.lock().unwrap();
            if streams.len() >= self.params.mux_con {
                return Err(MuxError::CarrierFull(self.params.mux_con));
            }
            let (data_tx, data_rx) = mpsc::channel(self.params.stream_queue_len());
            streams.insert(sid, StreamEntry { data_tx: Some(data_tx), state: SubStream::new(sid) });
            data_rx
        };

        if self.frame_tx.send(MuxFrame::syn(sid)).await.is_err() {
            self.streams.lock().unwrap().remove(&sid);
            return Err(MuxError::CarrierClosed);
        }

        Ok(MuxStream::new(sid, data_rx, self.frame_tx.clone(), self.params.max_frame_size))
    }

    /// Number of currently open sub-streams
    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Remaining sub-stream capacity
    pub fn free_slots(&self) -> usize {
        self.params.mux_con.saturating_sub(self.active_streams())
    }

    /// Whether the carrier connection has died
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolve when the carrier connection dies
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Carrier-level keepalive probe
    pub async fn send_ping(&self) -> Result<(), MuxError> {
        self.frame_tx.send(MuxFrame::ping()).await.map_err(|_| MuxError::CarrierClosed)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W>(
    mut wr: W,
    mut frame_rx: mpsc::Receiver<MuxFrame>,
    streams: StreamMap,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = frame_rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
        };

        if frame.frame_type == MuxFrameType::Fin {
            let mut streams = streams.lock().unwrap();
            if let Some(entry) = streams.get_mut(&frame.stream_id) {
                entry.state.close_local();
                if entry.state.is_closed() {
                    streams.remove(&frame.stream_id);
                }
            }
        }

        if let Err(e) = wr.write_all(&frame.encode()).await {
            debug!(error = %e, "carrier write failed");
            break;
        }
    }

    let _ = wr.shutdown().await;
    shutdown.cancel();
}

async fn read_loop<R>(
    mut rd: R,
    streams: StreamMap,
    incoming_tx: mpsc::Sender<(u32, MuxStream)>,
    frame_tx: mpsc::Sender<MuxFrame>,
    params: MuxParams,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(params.max_frame_size + super::MUX_HEADER_SIZE);

    'carrier: loop {
        loop {
            match MuxFrame::decode(&mut buf, params.max_frame_size) {
                Ok(Some(frame)) => {
                    if handle_frame(frame, &streams, &incoming_tx, &frame_tx, &params)
                        .await
                        .is_err()
                    {
                        break 'carrier;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "carrier framing error, dropping connection");
                    break 'carrier;
                }
            }
        }

        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = rd.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("carrier EOF");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "carrier read failed");
                break;
            }
        }
    }

    // Dropping the entries drops their data senders, which surfaces EOF on
    // every open MuxStream once buffered chunks are drained.
    streams.lock().unwrap().clear();
    shutdown.cancel();
}

async fn handle_frame(
    frame: MuxFrame,
    streams: &StreamMap,
    incoming_tx: &mpsc::Sender<(u32, MuxStream)>,
    frame_tx: &mpsc::Sender<MuxFrame>,
    params: &MuxParams,
) -> Result<(), MuxError> {
    match frame.frame_type {
        MuxFrameType::Syn => {
            let sid = frame.stream_id;
            let data_rx = {
                let mut streams = streams.lock().unwrap();
                if streams.len() >= params.mux_con {
                    drop(streams);
                    warn!(sid, cap = params.mux_con, "rejecting sub-stream, carrier full");
                    // try_send: the reader must never block on the outbound
                    // queue or saturated carriers can deadlock
                    let _ = frame_tx.try_send(MuxFrame::fin(sid));
                    return Ok(());
                }
                let (data_tx, data_rx) = mpsc::channel(params.stream_queue_len());
                streams
                    .insert(sid, StreamEntry { data_tx: Some(data_tx), state: SubStream::new(sid) });
                data_rx
            };

            let stream = MuxStream::new(sid, data_rx, frame_tx.clone(), params.max_frame_size);
            if incoming_tx.send((sid, stream)).await.is_err() {
                streams.lock().unwrap().remove(&sid);
                return Err(MuxError::CarrierClosed);
            }
        }
        MuxFrameType::Data => {
            let sid = frame.stream_id;
            let tx = {
                let mut streams = streams.lock().unwrap();
                match streams.get_mut(&sid) {
                    Some(entry) if entry.state.can_recv() => {
                        entry.state.record_recv(frame.payload.len());
                        entry.data_tx.clone()
                    }
                    _ => {
                        trace!(sid, "data for unknown or closed sub-stream");
                        None
                    }
                }
            };
            if let Some(tx) = tx {
                if tx.send(frame.payload).await.is_err() {
                    // Local reader is gone; reclaim the slot and tell the peer.
                    streams.lock().unwrap().remove(&sid);
                    let _ = frame_tx.try_send(MuxFrame::fin(sid));
                }
            }
        }
        MuxFrameType::Fin => {
            let sid = frame.stream_id;
            let mut streams = streams.lock().unwrap();
            if let Some(entry) = streams.get_mut(&sid) {
                entry.state.close_remote();
                entry.data_tx = None;
                if entry.state.is_closed() {
                    streams.remove(&sid);
                }
            }
        }
        MuxFrameType::Ping => {
            let _ = frame_tx.try_send(MuxFrame::pong());
        }
        MuxFrameType::Pong => {
            trace!("carrier pong");
        }
    }
    Ok(())
}

/// One sub-stream, readable and writable like any socket
pub struct MuxStream {
    sid: u32,
    recv: mpsc::Receiver<Bytes>,
    pending: Bytes,
    sender: PollSender<MuxFrame>,
    raw_tx: mpsc::Sender<MuxFrame>,
    max_frame_size: usize,
    fin_sent: bool,
}

impl MuxStream {
    fn new(
        sid: u32,
        recv: mpsc::Receiver<Bytes>,
        frame_tx: mpsc::Sender<MuxFrame>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            sid,
            recv,
            pending: Bytes::new(),
            sender: PollSender::new(frame_tx.clone()),
            raw_tx: frame_tx,
            max_frame_size,
            fin_sent: false,
        }
    }

    /// Session sid this sub-stream carries
    pub fn sid(&self) -> u32 {
        self.sid
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.recv.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(this.max_frame_size);
                let frame = MuxFrame::data(this.sid, Bytes::copy_from_slice(&buf[..n]));
                match this.sender.send_item(frame) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                this.fin_sent = true;
                let _ = this.sender.send_item(MuxFrame::fin(this.sid));
                Poll::Ready(Ok(()))
            }
            // Carrier already gone; nothing left to half-close.
            Poll::Ready(Err(_)) => {
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let _ = self.raw_tx.try_send(MuxFrame::fin(self.sid));
        }
    }
}
