//! The crew: a session's set of dataport workers plus the state they share.
//!
//! Outbound data is cut into chunks of at most `blksize` bytes; chunk `k`
//! of a transfer goes to worker `k mod dataports`, and every transfer ends
//! with one empty frame on every dataport. Inbound data is reassembled by a
//! single pipeline that requests frames from the workers in the same
//! rotation and hands them out strictly in request order.

use crate::error::{Error, Result};
use crate::worker::{self, Frame, RecvItem, SendItem};

/// Buffers per worker in the outbound pool.
const BUFFERS_PER_WORKER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrewConfig {
    pub dataports: usize,
    /// Largest payload of a single frame.
    pub blksize: usize,
    /// Socket buffer size for the dataports, 0 = OS default.
    pub tcp_window: usize,
    /// How long a worker waits on an idle dataport before polling again.
    pub read_timeout: std::time::Duration,
}

/// Fixed set of block buffers recycled between producers and workers.
#[derive(Debug)]
pub(crate) struct BufferPool {
    tx: async_channel::Sender<Vec<u8>>,
    rx: async_channel::Receiver<Vec<u8>>,
}

impl BufferPool {
    fn new(count: usize, blksize: usize) -> Result<Self> {
        let (tx, rx) = async_channel::bounded(count);
        for _ in 0..count {
            let mut buf = Vec::new();
            buf.try_reserve_exact(blksize).map_err(|e| {
                Error::Allocation(format!("dataport buffer of {blksize} bytes: {e}"))
            })?;
            tx.try_send(buf)
                .map_err(|_| Error::Allocation("buffer pool overflow".to_string()))?;
        }
        Ok(Self { tx, rx })
    }

    async fn get(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<Vec<u8>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            buf = self.rx.recv() => buf.map_err(|_| cancelled()),
        }
    }

    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        // sentinel items carry no pooled buffer
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        let _ = self.tx.try_send(buf);
    }
}

/// Count of queued send items; waiters wake when it drops to zero.
#[derive(Debug, Default)]
pub(crate) struct Active {
    count: std::sync::atomic::AtomicUsize,
    idle: tokio::sync::Notify,
}

impl Active {
    fn add(&self) {
        self.count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        if self.count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// First errno observed on any dataport. Sticky for the crew's lifetime.
#[derive(Debug, Default)]
pub(crate) struct Failure(std::sync::atomic::AtomicI32);

impl Failure {
    pub(crate) fn set(&self, errno: i32) {
        let errno = if errno == 0 { libc::EIO } else { errno };
        let _ = self.0.compare_exchange(
            0,
            errno,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        );
    }

    pub(crate) fn get(&self) -> Option<i32> {
        match self.0.load(std::sync::atomic::Ordering::Acquire) {
            0 => None,
            errno => Some(errno),
        }
    }

    fn check(&self) -> Result<()> {
        match self.get() {
            None => Ok(()),
            Some(errno) => Err(Error::Transport(std::io::Error::from_raw_os_error(errno))),
        }
    }
}

fn cancelled() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        "crew shut down",
    ))
}

/// State shared by the crew handle, its transfers and its workers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: CrewConfig,
    pub(crate) pool: BufferPool,
    pub(crate) active: Active,
    pub(crate) failure: Failure,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
    senders: Vec<async_channel::Sender<SendItem>>,
    readers: Vec<async_channel::Sender<RecvItem>>,
}

impl Shared {
    async fn enqueue_send(&self, port: usize, buf: Vec<u8>) -> Result<()> {
        self.active.add();
        if self.senders[port].send(SendItem { buf }).await.is_err() {
            self.active.done();
            return Err(cancelled());
        }
        Ok(())
    }

    fn request_frame(&self, port: usize) -> Result<tokio::sync::oneshot::Receiver<Result<Frame>>> {
        let (done, rx) = tokio::sync::oneshot::channel();
        // capacity of one outstanding request per worker
        self.readers[port]
            .try_send(RecvItem { done })
            .map_err(|_| Error::protocol(format!("dataport {port} already has a read pending")))?;
        Ok(rx)
    }
}

/// The data transfer unit of one session.
#[derive(Debug)]
pub struct Crew {
    shared: std::sync::Arc<Shared>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    span: tracing::Span,
}

impl Crew {
    /// Start one worker per connected dataport, in dataport order. Worker
    /// events are recorded under `span`.
    pub fn new(
        config: CrewConfig,
        sockets: Vec<tokio::net::TcpStream>,
        span: tracing::Span,
    ) -> Result<Self> {
        if config.dataports == 0 || config.blksize == 0 {
            return Err(Error::protocol(format!(
                "unusable crew of {} dataport(s) with {} byte blocks",
                config.dataports, config.blksize
            )));
        }
        if sockets.len() != config.dataports {
            return Err(Error::protocol(format!(
                "crew configured for {} dataport(s) but {} connected",
                config.dataports,
                sockets.len()
            )));
        }
        let pool = BufferPool::new(config.dataports * BUFFERS_PER_WORKER, config.blksize)?;
        let mut senders = Vec::with_capacity(config.dataports);
        let mut readers = Vec::with_capacity(config.dataports);
        let mut channels = Vec::with_capacity(config.dataports);
        for _ in 0..config.dataports {
            let (send_tx, send_rx) = async_channel::bounded(BUFFERS_PER_WORKER + 1);
            let (recv_tx, recv_rx) = async_channel::bounded(1);
            senders.push(send_tx);
            readers.push(recv_tx);
            channels.push(worker::WorkerChannels { send_rx, recv_rx });
        }
        let shared = std::sync::Arc::new(Shared {
            config,
            pool,
            active: Active::default(),
            failure: Failure::default(),
            cancel: tokio_util::sync::CancellationToken::new(),
            senders,
            readers,
        });
        let tasks = sockets
            .into_iter()
            .zip(channels)
            .enumerate()
            .map(|(seq, (stream, channels))| {
                worker::spawn(seq, stream, channels, shared.clone(), &span)
            })
            .collect();
        span.in_scope(|| {
            tracing::info!(
                "Crew started with {} dataport(s), {} byte blocks",
                config.dataports,
                config.blksize
            )
        });
        Ok(Self {
            shared,
            tasks,
            span,
        })
    }

    pub fn config(&self) -> &CrewConfig {
        &self.shared.config
    }

    /// Errno of the first dataport failure, if any.
    pub fn failure(&self) -> Option<i32> {
        self.shared.failure.get()
    }

    pub fn outbound(&self) -> Outbound {
        Outbound {
            shared: self.shared.clone(),
            next: 0,
            bytes: 0,
        }
    }

    pub fn inbound(&self) -> Result<Inbound> {
        Inbound::new(self.shared.clone())
    }

    /// Send `data` as one complete transfer.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        let mut outbound = self.outbound();
        outbound.write(data).await?;
        outbound.finish().await
    }

    /// Receive one complete transfer of at most `limit` bytes.
    pub async fn receive_data(&self, limit: usize) -> Result<Vec<u8>> {
        let mut inbound = self.inbound()?;
        let mut data = Vec::new();
        let mut overflow = false;
        while let Some(frame) = inbound.next_frame().await? {
            if data.len() + frame.len() > limit {
                overflow = true;
                continue;
            }
            data.extend_from_slice(&frame);
        }
        if overflow {
            return Err(Error::protocol(format!(
                "peer sent more than the {limit} bytes requested"
            )));
        }
        Ok(data)
    }

    /// Wait until every queued send item has been written and its buffer
    /// released.
    pub async fn wait_idle(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(cancelled()),
            _ = self.shared.active.wait_idle() => Ok(()),
        }
    }

    /// Stop all workers and close the dataports. Workers still running once
    /// one read timeout has passed are aborted.
    pub async fn shutdown(mut self) {
        self.shared.cancel.cancel();
        let limit = self.shared.config.read_timeout;
        let mut tasks = std::mem::take(&mut self.tasks);
        let joined =
            tokio::time::timeout(limit, futures::future::join_all(tasks.iter_mut())).await;
        if joined.is_err() {
            let stuck = tasks.iter().filter(|task| !task.is_finished()).count();
            self.span.in_scope(|| {
                tracing::warn!("{stuck} worker(s) did not exit within {limit:?}, aborting")
            });
            for task in &tasks {
                task.abort();
            }
        }
        self.span.in_scope(|| tracing::debug!("Crew shut down"));
    }
}

impl Drop for Crew {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Producer side of one outbound transfer.
#[derive(Debug)]
pub struct Outbound {
    shared: std::sync::Arc<Shared>,
    next: usize,
    bytes: u64,
}

impl Outbound {
    /// Queue `data`; returns once every chunk is handed to a worker. Stops
    /// early when a dataport has failed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let dataports = self.shared.config.dataports;
        for chunk in data.chunks(self.shared.config.blksize) {
            self.shared.failure.check()?;
            let mut buf = self.shared.pool.get(&self.shared.cancel).await?;
            buf.extend_from_slice(chunk);
            self.shared.enqueue_send(self.next % dataports, buf).await?;
            self.next += 1;
            self.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Terminate the transfer on every dataport and wait for the workers to
    /// drain.
    pub async fn finish(self) -> Result<()> {
        for port in 0..self.shared.config.dataports {
            self.shared.enqueue_send(port, Vec::new()).await?;
        }
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(cancelled()),
            _ = self.shared.active.wait_idle() => {}
        }
        self.shared.failure.check()?;
        tracing::trace!("Outbound transfer of {} bytes complete", self.bytes);
        Ok(())
    }
}

/// Consumer side of one inbound transfer.
///
/// One frame request is outstanding per dataport. Requests are queued in
/// the order the sender striped its chunks and completed strictly from the
/// head, so frames come out in the original order whichever worker finishes
/// first. An inbound transfer must be read to its end (`None`) before the
/// next one starts.
#[derive(Debug)]
pub struct Inbound {
    shared: std::sync::Arc<Shared>,
    pending: std::collections::VecDeque<(usize, tokio::sync::oneshot::Receiver<Result<Frame>>)>,
    done: bool,
}

impl Inbound {
    fn new(shared: std::sync::Arc<Shared>) -> Result<Self> {
        shared.failure.check()?;
        let mut pending = std::collections::VecDeque::with_capacity(shared.config.dataports);
        for port in 0..shared.config.dataports {
            pending.push_back((port, shared.request_frame(port)?));
        }
        Ok(Self {
            shared,
            pending,
            done: false,
        })
    }

    async fn complete(
        rx: tokio::sync::oneshot::Receiver<Result<Frame>>,
    ) -> Result<Frame> {
        rx.await.map_err(|_| cancelled())?
    }

    /// Next payload in transfer order, `None` once the transfer ended.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        let Some((port, rx)) = self.pending.pop_front() else {
            return Ok(None);
        };
        let frame = Self::complete(rx).await?;
        if frame.is_empty() {
            // the stripe rotation ended here, every other dataport must
            // deliver exactly its sentinel
            while let Some((other, rx)) = self.pending.pop_front() {
                let frame = Self::complete(rx).await?;
                if !frame.is_empty() {
                    return Err(Error::protocol(format!(
                        "data on dataport {other} after end of transfer on dataport {port}"
                    )));
                }
            }
            self.done = true;
            return Ok(None);
        }
        self.pending.push_back((port, self.shared.request_frame(port)?));
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    async fn socket_pairs(n: usize) -> (Vec<tokio::net::TcpStream>, Vec<tokio::net::TcpStream>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for _ in 0..n {
            let (connected, accepted) =
                tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
            local.push(connected.unwrap());
            remote.push(accepted.unwrap().0);
        }
        (local, remote)
    }

    fn config(dataports: usize, blksize: usize) -> CrewConfig {
        CrewConfig {
            dataports,
            blksize,
            tcp_window: 0,
            read_timeout: std::time::Duration::from_millis(200),
        }
    }

    async fn crew_pair(dataports: usize, blksize: usize) -> (Crew, Crew) {
        let (local, remote) = socket_pairs(dataports).await;
        let cfg = config(dataports, blksize);
        (
            Crew::new(cfg, local, tracing::Span::none()).unwrap(),
            Crew::new(cfg, remote, tracing::Span::none()).unwrap(),
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Collect raw frames from one dataport until its sentinel.
    async fn raw_frames(stream: tokio::net::TcpStream, max: usize) -> Vec<Vec<u8>> {
        let mut reader = crate::streams::frame_reader(stream, max);
        let mut frames = Vec::new();
        loop {
            let frame = reader.next().await.unwrap().unwrap();
            if frame.is_empty() {
                return frames;
            }
            frames.push(frame.to_vec());
        }
    }

    #[tokio::test]
    async fn framing_reconstructs_every_length() {
        for blksize in [1usize, 17, 65536] {
            let lengths = [0, 1, blksize - 1, blksize, blksize + 1, 10 * blksize];
            let (sender, receiver) = crew_pair(1, blksize).await;
            for len in lengths {
                let data = pattern(len);
                let (sent, received) =
                    tokio::join!(sender.send_data(&data), receiver.receive_data(len));
                sent.unwrap();
                assert_eq!(received.unwrap(), data, "blksize {blksize} length {len}");
            }
            sender.shutdown().await;
            receiver.shutdown().await;
        }
    }

    #[tokio::test]
    async fn striped_transfers_reassemble_in_order() {
        let (sender, receiver) = crew_pair(3, 17).await;
        for len in [0usize, 5, 17, 18, 51, 52, 1000] {
            let data = pattern(len);
            let (sent, received) =
                tokio::join!(sender.send_data(&data), receiver.receive_data(len));
            sent.unwrap();
            assert_eq!(received.unwrap(), data, "length {len}");
        }
        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn frames_never_exceed_block_size_and_end_with_one_sentinel() {
        let (local, remote) = socket_pairs(2).await;
        let crew = Crew::new(config(2, 64), local, tracing::Span::none()).unwrap();
        let data = pattern(64 * 5 + 10);
        let mut outbound = crew.outbound();
        outbound.write(&data[..100]).await.unwrap();
        outbound.write(&data[100..]).await.unwrap();
        let mut remote = remote.into_iter();
        let port0 = tokio::spawn(raw_frames(remote.next().unwrap(), 1 << 20));
        let port1 = tokio::spawn(raw_frames(remote.next().unwrap(), 1 << 20));
        outbound.finish().await.unwrap();
        let port0 = port0.await.unwrap();
        let port1 = port1.await.unwrap();
        assert!(port0.iter().chain(&port1).all(|f| f.len() <= 64));
        // chunk k went to dataport k mod 2
        let mut rebuilt = Vec::new();
        let mut ports = [port0.into_iter(), port1.into_iter()];
        for k in 0.. {
            match ports[k % 2].next() {
                Some(frame) => rebuilt.extend(frame),
                None => break,
            }
        }
        assert_eq!(rebuilt, data);
        crew.shutdown().await;
    }

    #[tokio::test]
    async fn pipeline_completes_in_request_order_when_workers_race() {
        let (local, remote) = socket_pairs(4).await;
        let crew = Crew::new(config(4, 8), local, tracing::Span::none()).unwrap();
        let mut inbound = crew.inbound().unwrap();
        // write the stripes back to front so later slots are ready first
        let mut writers: Vec<_> = remote.into_iter().collect();
        for (port, writer) in writers.iter_mut().enumerate().rev() {
            for round in 0..3u8 {
                let payload = [port as u8 + 4 * round; 8];
                crate::streams::write_frame(writer, &payload).await.unwrap();
            }
            crate::streams::write_frame(writer, b"").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let mut order = Vec::new();
        while let Some(frame) = tokio::time::timeout(TIMEOUT, inbound.next_frame())
            .await
            .unwrap()
            .unwrap()
        {
            order.push(frame[0]);
        }
        assert_eq!(order, (0..12).collect::<Vec<u8>>());
        crew.shutdown().await;
    }

    #[tokio::test]
    async fn data_after_sentinel_is_a_protocol_error() {
        let (local, remote) = socket_pairs(2).await;
        let crew = Crew::new(config(2, 8), local, tracing::Span::none()).unwrap();
        let mut writers = remote;
        crate::streams::write_frame(&mut writers[0], b"").await.unwrap();
        crate::streams::write_frame(&mut writers[1], b"late").await.unwrap();
        let err = crew.receive_data(64).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        crew.shutdown().await;
    }

    #[tokio::test]
    async fn receive_rejects_more_than_requested() {
        let (sender, receiver) = crew_pair(1, 16).await;
        let data = pattern(100);
        let (sent, received) = tokio::join!(sender.send_data(&data), receiver.receive_data(50));
        sent.unwrap();
        assert!(matches!(received, Err(Error::Protocol(_))));
        // the stream stays in step for the next transfer
        let (sent, received) = tokio::join!(sender.send_data(b"next"), receiver.receive_data(50));
        sent.unwrap();
        assert_eq!(received.unwrap(), b"next");
        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn drained_buffers_are_not_touched_by_workers() {
        let (local, remote) = socket_pairs(2).await;
        let crew = Crew::new(config(2, 32), local, tracing::Span::none()).unwrap();
        let mut remote = remote.into_iter();
        let port0 = tokio::spawn(raw_frames(remote.next().unwrap(), 1 << 20));
        let port1 = tokio::spawn(raw_frames(remote.next().unwrap(), 1 << 20));
        let data = pattern(32 * 12);
        let mut outbound = crew.outbound();
        outbound.write(&data).await.unwrap();
        outbound.finish().await.unwrap();
        crew.wait_idle().await.unwrap();
        assert_eq!(crew.shared.active.get(), 0);
        // poison every pooled buffer; nothing the peer received may change
        let mut poisoned = Vec::new();
        while let Ok(mut buf) = crew.shared.pool.rx.try_recv() {
            buf.resize(32, 0xAA);
            poisoned.push(buf);
        }
        assert_eq!(poisoned.len(), 2 * BUFFERS_PER_WORKER);
        let port0 = port0.await.unwrap();
        let port1 = port1.await.unwrap();
        let mut rebuilt = Vec::new();
        for (a, b) in port0.iter().zip(&port1) {
            rebuilt.extend_from_slice(a);
            rebuilt.extend_from_slice(b);
        }
        assert_eq!(rebuilt, data);
        crew.shutdown().await;
    }

    #[tokio::test]
    async fn peer_close_fails_the_transfer() {
        let (local, remote) = socket_pairs(1).await;
        let crew = Crew::new(config(1, 16), local, tracing::Span::none()).unwrap();
        let mut remote = remote;
        remote[0].shutdown().await.unwrap();
        drop(remote);
        let err = tokio::time::timeout(TIMEOUT, crew.receive_data(16))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(crew.failure().is_some());
        crew.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_with_outstanding_sends_does_not_hang() {
        let (local, remote) = socket_pairs(2).await;
        let crew = Crew::new(config(2, 1024), local, tracing::Span::none()).unwrap();
        let mut outbound = crew.outbound();
        // nobody reads the peer side; queue what fits without blocking
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            outbound.write(&pattern(1 << 20)),
        )
        .await;
        tokio::time::timeout(TIMEOUT, crew.shutdown()).await.unwrap();
        drop(remote);
        assert!(outbound.finish().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_of_a_wide_crew_takes_one_read_timeout() {
        let (local, remote) = socket_pairs(8).await;
        let cfg = config(8, 512);
        let crew = Crew::new(cfg, local, tracing::Span::none()).unwrap();
        // every worker has a read outstanding
        let mut inbound = crew.inbound().unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), inbound.next_frame());
        assert!(pending.await.is_err());
        let started = std::time::Instant::now();
        crew.shutdown().await;
        assert!(started.elapsed() < cfg.read_timeout * 2);
        assert!(inbound.next_frame().await.is_err());
        drop(remote);
    }

    #[test]
    fn crew_rejects_mismatched_socket_count() {
        let err = Crew::new(config(2, 16), Vec::new(), tracing::Span::none()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
