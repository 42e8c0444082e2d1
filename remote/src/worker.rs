//! One worker per dataport.
//!
//! A worker owns both halves of its socket for its whole life. Outbound
//! frames come from a private FIFO; inbound frames are read one at a time
//! on request, so the crew decides which worker serves which slot of the
//! receive pipeline.

use futures::StreamExt;
use tracing::Instrument;

use crate::crew::Shared;
use crate::error::{Error, Result};
use crate::streams;

/// Payload of one inbound frame; empty marks the end of a transfer.
pub type Frame = bytes::BytesMut;

/// Buffer queued for transmission. Empty means "send the sentinel".
#[derive(Debug)]
pub(crate) struct SendItem {
    pub(crate) buf: Vec<u8>,
}

/// Request for the next frame arriving on this worker's dataport.
#[derive(Debug)]
pub(crate) struct RecvItem {
    pub(crate) done: tokio::sync::oneshot::Sender<Result<Frame>>,
}

pub(crate) struct WorkerChannels {
    pub(crate) send_rx: async_channel::Receiver<SendItem>,
    pub(crate) recv_rx: async_channel::Receiver<RecvItem>,
}

pub(crate) fn spawn(
    seq: usize,
    stream: tokio::net::TcpStream,
    channels: WorkerChannels,
    shared: std::sync::Arc<Shared>,
    span: &tracing::Span,
) -> tokio::task::JoinHandle<()> {
    let worker_span = tracing::debug_span!(parent: span, "worker", seq);
    tokio::spawn(run(seq, stream, channels, shared).instrument(worker_span))
}

async fn run(
    seq: usize,
    stream: tokio::net::TcpStream,
    channels: WorkerChannels,
    shared: std::sync::Arc<Shared>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {e}");
    }
    crate::dataport::configure_tcp_buffers(&stream, shared.config.tcp_window);
    let (read_half, write_half) = stream.into_split();
    // room for the length prefix plus one full block
    let writer = tokio::io::BufWriter::with_capacity(shared.config.blksize + 4, write_half);
    let reader = streams::frame_reader(read_half, shared.config.blksize);
    tracing::debug!("Worker started");
    tokio::join!(
        send_loop(writer, channels.send_rx, &shared),
        recv_loop(reader, channels.recv_rx, &shared),
    );
    tracing::debug!("Worker {seq} exited");
}

async fn send_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: W,
    send_rx: async_channel::Receiver<SendItem>,
    shared: &Shared,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            item = send_rx.recv() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
        };
        // once the crew failed nothing more goes on the wire, but the
        // buffer still has to be returned and accounted for
        if shared.failure.get().is_none() {
            let res = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "crew cancelled",
                )),
                res = streams::write_frame(&mut writer, &item.buf) => res,
            };
            match res {
                Ok(()) => tracing::trace!("Sent frame of {} bytes", item.buf.len()),
                Err(e) => {
                    tracing::warn!("Dataport write failed: {e}");
                    shared.failure.set(crate::error::errno_of(&e));
                }
            }
        }
        shared.pool.put(item.buf);
        shared.active.done();
    }
}

async fn recv_loop<R: tokio::io::AsyncRead + Unpin>(
    mut reader: streams::FrameReader<R>,
    recv_rx: async_channel::Receiver<RecvItem>,
    shared: &Shared,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            item = recv_rx.recv() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
        };
        let res = read_frame(&mut reader, shared).await;
        if let Err(e) = &res {
            tracing::warn!("Dataport read failed: {e}");
            shared.failure.set(e.errno());
        }
        // the requester may have given up; the frame is consumed either way
        let _ = item.done.send(res);
    }
}

/// Read the next frame. An idle socket is polled again after every read
/// timeout; only a sentinel frame ends a transfer and only EOF or an error
/// aborts it.
async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut streams::FrameReader<R>,
    shared: &Shared,
) -> Result<Frame> {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "crew cancelled",
                )));
            }
            next = tokio::time::timeout(shared.config.read_timeout, reader.next()) => next,
        };
        match next {
            Err(_) => {
                tracing::trace!("Dataport idle for {:?}, retrying", shared.config.read_timeout);
                continue;
            }
            Ok(None) => {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "dataport closed by peer",
                )));
            }
            Ok(Some(Err(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(Error::protocol(format!("bad data frame: {e}")));
            }
            Ok(Some(Err(e))) => return Err(Error::Transport(e)),
            Ok(Some(Ok(frame))) => {
                tracing::trace!("Received frame of {} bytes", frame.len());
                return Ok(frame);
            }
        }
    }
}
