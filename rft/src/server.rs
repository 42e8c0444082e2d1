//! `rftd` side of a session.
//!
//! Every accepted control connection runs in its own task. Commands are read
//! and answered strictly one at a time; only `STOR`, `SEND` and `RECV` move
//! data over the crew, and only `STOR` and `DISCONN` go unanswered.

use anyhow::Context;
use remote::protocol::command::DataPortAddr;
use remote::protocol::reply::ConfigOffer;
use remote::protocol::{Command, Verb};
use remote::protocol::reply::Reply;
use remote::streams::ControlConnection;
use remote::{Crew, CrewConfig};
use tracing::{Instrument, instrument};

use crate::host::{HostConfig, LocalHost, OpError, OpResult};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Dataports offered to every client.
    pub dataports: usize,
    pub blksize: usize,
    /// Dataport socket buffer size, 0 = OS default.
    pub tcp_window: usize,
    /// Poll interval of idle dataports; also bounds crew teardown.
    pub read_timeout: std::time::Duration,
    /// Limit on connecting back to a client's dataport.
    pub conn_timeout: std::time::Duration,
    pub cmd_buffer_size: usize,
    pub host: HostConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dataports: 1,
            blksize: 64 * 1024,
            tcp_window: 0,
            read_timeout: std::time::Duration::from_secs(5),
            conn_timeout: std::time::Duration::from_secs(15),
            cmd_buffer_size: remote::protocol::DEFAULT_CMD_BUFFER_SIZE,
            host: HostConfig::default(),
        }
    }
}

impl ServerConfig {
    fn offer(&self) -> ConfigOffer {
        ConfigOffer {
            dataports: self.dataports,
            blksize: self.blksize,
            tcp_window: self.tcp_window,
        }
    }

    fn crew_config(&self) -> CrewConfig {
        CrewConfig {
            dataports: self.dataports,
            blksize: self.blksize,
            tcp_window: self.tcp_window,
            read_timeout: self.read_timeout,
        }
    }
}

#[derive(Debug)]
pub struct Server {
    listener: tokio::net::TcpListener,
    config: std::sync::Arc<ServerConfig>,
}

impl Server {
    pub async fn bind(addr: std::net::SocketAddr, config: ServerConfig) -> anyhow::Result<Self> {
        if config.dataports == 0 || config.blksize == 0 {
            anyhow::bail!(
                "server needs at least one dataport and a non-zero block size (got {} and {})",
                config.dataports,
                config.blksize
            );
        }
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control listener on {addr}"))?;
        Ok(Self {
            listener,
            config: std::sync::Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to get control listener address")
    }

    /// Accept sessions until `cancel` fires, then wait for the running ones
    /// to wind down.
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let mut sessions = tokio::task::JoinSet::new();
        tracing::info!("Listening for control connections on {}", self.local_addr()?);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Session task failed: {e}");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(serve_connection(
                            stream,
                            peer,
                            self.config.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept control connection: {e}"),
                },
            }
        }
        tracing::info!("Shutting down, {} session(s) still running", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                tracing::error!("Session task failed: {e}");
            }
        }
        Ok(())
    }
}

/// Run one session on an accepted control connection.
pub async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    config: std::sync::Arc<ServerConfig>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let span = tracing::info_span!("session", %peer);
    async move {
        tracing::info!("Accepted control connection");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {e}");
        }
        let mut connection = Connection::new(stream, config, tracing::Span::current());
        match connection.serve(&cancel).await {
            Ok(()) => tracing::info!("Session ended"),
            Err(e) => tracing::error!("Session aborted: {e}"),
        }
        connection.teardown().await;
    }
    .instrument(span)
    .await
}

enum Flow {
    Continue,
    Disconnect,
}

/// Reply for an operation result. Local failures are echoed to the client,
/// session failures end the session.
fn answer<T>(verb: Verb, result: OpResult<T>, ok: impl FnOnce(T) -> Reply) -> remote::Result<Reply> {
    match result {
        Ok(value) => Ok(ok(value)),
        Err(OpError::Os(e)) => {
            tracing::debug!("{verb} failed: {e}");
            Ok(Reply::failed(verb, remote::errno_of(&e)))
        }
        Err(OpError::Session(e)) => Err(e),
    }
}

fn done(verb: Verb) -> impl FnOnce(()) -> Reply {
    move |()| Reply::ok(verb, 0)
}

struct Connection {
    control: ControlConnection,
    config: std::sync::Arc<ServerConfig>,
    host: LocalHost,
    /// Dataports connected so far, by sequence number.
    pending: Vec<Option<tokio::net::TcpStream>>,
    crew: Option<Crew>,
    span: tracing::Span,
}

impl Connection {
    fn new(
        stream: tokio::net::TcpStream,
        config: std::sync::Arc<ServerConfig>,
        span: tracing::Span,
    ) -> Self {
        Self {
            control: ControlConnection::new(stream, config.cmd_buffer_size),
            host: LocalHost::new(config.host.clone()),
            config,
            pending: Vec::new(),
            crew: None,
            span,
        }
    }

    async fn serve(&mut self, cancel: &tokio_util::sync::CancellationToken) -> remote::Result<()> {
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                line = self.control.recv_line() => line?,
            };
            let Some(line) = line else {
                tracing::info!("Client closed the control connection");
                return Ok(());
            };
            let command = match Command::from_line(&line) {
                Ok(command) => command,
                Err(e) if line.verb.expects_reply() => {
                    tracing::warn!("Malformed {} command: {e}", line.verb);
                    self.control
                        .send_reply(&Reply::failed(line.verb, libc::EINVAL))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            tracing::trace!("Received {command:?}");
            let verb = command.verb();
            // a data phase can wait on an idle client indefinitely
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Server shutting down during {verb}");
                    return Ok(());
                }
                flow = self.dispatch(command) => flow?,
            };
            if let Flow::Disconnect = flow {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> remote::Result<Flow> {
        let verb = command.verb();
        let reply = match command {
            Command::Connect => Reply::ok(verb, 0),
            Command::Config { hostname } => {
                tracing::info!(
                    "Client host {}",
                    hostname.as_deref().unwrap_or("(not given)")
                );
                self.config.offer().reply()
            }
            Command::Dport(port) | Command::Dport6(port) => self.dataport(verb, port).await?,
            Command::Open {
                path,
                oflag,
                create,
            } => answer(verb, self.host.open(&path, oflag, create).await, done(verb))?,
            Command::Stor { nbytes } => {
                self.store(nbytes).await?;
                return Ok(Flow::Continue);
            }
            Command::Send { nbytes } => self.receive(nbytes).await?,
            Command::Recv { nbytes } => self.transmit(nbytes).await?,
            Command::Seek { offset, whence } => {
                answer(verb, self.host.seek(offset, whence).await, |offset| {
                    Reply::ok(verb, 0).field(offset)
                })?
            }
            Command::Flock { lock } => answer(verb, self.host.flock(lock).await, done(verb))?,
            Command::ArchiveOp { path, ops } => {
                answer(verb, self.host.archive_op(&path, &ops).await, done(verb))?
            }
            Command::Close => answer(verb, self.host.close().await, done(verb))?,
            Command::Unlink { path } => answer(verb, self.host.unlink(&path).await, done(verb))?,
            Command::Disconn => {
                tracing::info!("Client disconnected");
                return Ok(Flow::Disconnect);
            }
            Command::IsMounted { mount_point } => {
                Reply::ok(verb, i64::from(self.host.is_mounted(&mount_point).await))
            }
            Command::Stat { path } => answer(verb, self.host.stat(&path).await, |info| info.reply())?,
            Command::Statvfs {
                mount_point,
                offline,
            } => answer(verb, self.host.statvfs(&mount_point, offline).await, |fs| {
                fs.reply()
            })?,
            Command::SpaceUsed { path } => {
                answer(verb, self.host.space_used(&path).await, |used| {
                    Reply::ok(verb, 0).field(used)
                })?
            }
            Command::Mkdir { path, attr } => {
                answer(verb, self.host.mkdir(&path, attr).await, done(verb))?
            }
            Command::Opendir { path } => answer(verb, self.host.opendir(&path).await, |dir| {
                Reply::ok(verb, 0).field(dir)
            })?,
            Command::Readdir { dir } => match self.host.readdir(dir).await {
                Ok(Some(entry)) => entry.reply(),
                // end of directory: rc -1 without an errno
                Ok(None) => Reply::failed(verb, 0),
                Err(e) => answer(verb, Err::<(), _>(e), done(verb))?,
            },
            Command::Closedir { dir } => {
                self.host.closedir(dir);
                Reply::ok(verb, 0)
            }
            Command::Rmdir { path } => answer(verb, self.host.rmdir(&path).await, done(verb))?,
            Command::LoadVol { request, oflag } => {
                answer(verb, self.host.load_vol(&request, oflag).await, done(verb))?
            }
            Command::GetVolInfo => {
                answer(verb, self.host.get_vol_info().await, |info| info.reply())?
            }
            Command::SeekVol { block } => {
                answer(verb, self.host.seek_vol(block).await, done(verb))?
            }
            Command::UnloadVol { flags } => {
                answer(verb, self.host.unload_vol(flags).await, |position| {
                    Reply::ok(verb, 0).field(position)
                })?
            }
        };
        self.control.send_reply(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Connect back to one of the client's dataports; the crew starts once
    /// all of them are connected.
    async fn dataport(&mut self, verb: Verb, port: DataPortAddr) -> remote::Result<Reply> {
        if self.crew.is_some() || port.seq >= self.config.dataports {
            tracing::warn!(
                "Refusing dataport {} at {}: {} dataport(s) offered, crew running: {}",
                port.seq,
                port.addr,
                self.config.dataports,
                self.crew.is_some()
            );
            return Ok(Reply::failed(verb, libc::EINVAL));
        }
        if self.pending.is_empty() {
            self.pending.resize_with(self.config.dataports, || None);
        }
        match remote::dataport::connect(port.addr, self.config.conn_timeout).await {
            Ok(stream) => self.pending[port.seq] = Some(stream),
            Err(e) => {
                tracing::warn!("Failed to connect to dataport {} at {}: {e}", port.seq, port.addr);
                return Ok(Reply::failed(verb, e.errno()));
            }
        }
        if self.pending.iter().all(Option::is_some) {
            let sockets = std::mem::take(&mut self.pending)
                .into_iter()
                .flatten()
                .collect();
            self.crew = Some(Crew::new(
                self.config.crew_config(),
                sockets,
                self.span.clone(),
            )?);
        }
        Ok(Reply::ok(verb, 0))
    }

    fn crew(&self) -> remote::Result<&Crew> {
        self.crew
            .as_ref()
            .ok_or_else(|| remote::Error::protocol("data transfer before dataports were established"))
    }

    /// `STOR`: write a stream into the open file. Nothing is answered; a
    /// failure is kept for the next `CLOSE` while the stream is drained.
    #[instrument(level = "debug", skip(self))]
    async fn store(&mut self, nbytes: u64) -> remote::Result<()> {
        let mut inbound = self.crew()?.inbound()?;
        let mut received = 0u64;
        while let Some(frame) = inbound.next_frame().await? {
            received += frame.len() as u64;
            if self.host.store_failed() {
                continue;
            }
            if received > nbytes {
                tracing::warn!("Store stream exceeds the announced {nbytes} bytes");
                self.host.record_store_error(libc::EIO);
                continue;
            }
            match self.host.write(&frame).await {
                Ok(_) => {}
                Err(OpError::Os(e)) => {
                    tracing::warn!("Store write failed: {e}");
                    self.host.record_store_error(remote::errno_of(&e));
                }
                Err(OpError::Session(e)) => return Err(e),
            }
        }
        tracing::debug!("Stored {received} of {nbytes} bytes");
        Ok(())
    }

    /// `SEND`: receive `nbytes` from the client into the open file.
    #[instrument(level = "debug", skip(self))]
    async fn receive(&mut self, nbytes: u64) -> remote::Result<Reply> {
        let mut inbound = self.crew()?.inbound()?;
        let mut received = 0u64;
        let mut written = 0u64;
        let mut failure = None;
        // the whole transfer is drained even after a failed write
        while let Some(frame) = inbound.next_frame().await? {
            received += frame.len() as u64;
            if failure.is_some() {
                continue;
            }
            match self.host.write(&frame).await {
                Ok(n) => written += n as u64,
                Err(OpError::Os(e)) => {
                    tracing::warn!("Write failed after {written} bytes: {e}");
                    failure = Some(remote::errno_of(&e));
                }
                Err(OpError::Session(e)) => return Err(e),
            }
        }
        if let Some(code) = failure {
            return Ok(Reply::failed(Verb::Send, code));
        }
        if received != nbytes {
            tracing::warn!("Client announced {nbytes} bytes but sent {received}");
            return Ok(Reply::failed(Verb::Send, libc::EIO));
        }
        Ok(Reply::ok(Verb::Send, i64::try_from(written).unwrap_or(i64::MAX)))
    }

    /// `RECV`: send up to `nbytes` of the open file, fewer at end of file.
    #[instrument(level = "debug", skip(self))]
    async fn transmit(&mut self, nbytes: u64) -> remote::Result<Reply> {
        let crew = self.crew()?;
        let blksize = crew.config().blksize as u64;
        let mut outbound = crew.outbound();
        let mut remaining = nbytes;
        let mut failure = None;
        while remaining > 0 {
            let want = remaining.min(blksize) as usize;
            let chunk = match self.host.read(want).await {
                Ok(chunk) => chunk,
                Err(OpError::Os(e)) => {
                    tracing::warn!("Read failed after {} bytes: {e}", outbound.bytes());
                    failure = Some(remote::errno_of(&e));
                    break;
                }
                Err(OpError::Session(e)) => return Err(e),
            };
            outbound.write(&chunk).await?;
            remaining -= chunk.len() as u64;
            if chunk.len() < want {
                break;
            }
        }
        let sent = outbound.bytes();
        // the client reads up to the end of transfer even after a failure
        outbound.finish().await?;
        Ok(match failure {
            Some(code) => Reply::failed(Verb::Recv, code),
            None => Reply::ok(Verb::Recv, i64::try_from(sent).unwrap_or(i64::MAX)),
        })
    }

    async fn teardown(&mut self) {
        self.host.release().await;
        if let Some(crew) = self.crew.take() {
            crew.shutdown().await;
        }
        if let Err(e) = self.control.shutdown().await {
            tracing::debug!("Control connection shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(config: ServerConfig) -> (std::net::SocketAddr, tokio_util::sync::CancellationToken) {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, cancel)
    }

    async fn control(addr: std::net::SocketAddr) -> ControlConnection {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        ControlConnection::new(stream, remote::protocol::DEFAULT_CMD_BUFFER_SIZE)
    }

    #[tokio::test]
    async fn handshake_offers_configuration() {
        let (addr, cancel) = start(ServerConfig {
            dataports: 3,
            blksize: 1024,
            tcp_window: 8192,
            ..Default::default()
        })
        .await;
        let mut control = control(addr).await;
        let reply = control.call(&Command::Connect).await.unwrap();
        assert_eq!(reply, Reply::ok(Verb::Connect, 0));
        let reply = control
            .call(&Command::Config {
                hostname: Some("client1".into()),
            })
            .await
            .unwrap();
        let offer = ConfigOffer::from_reply(&reply).unwrap();
        assert_eq!(
            offer,
            ConfigOffer {
                dataports: 3,
                blksize: 1024,
                tcp_window: 8192
            }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_command_gets_einval_and_session_survives() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        let line = remote::protocol::Line::parse("SEEK ten 0").unwrap();
        control.send_line(&line).await.unwrap();
        let reply = control.recv_reply(Verb::Seek).await.unwrap();
        assert_eq!(reply.errno, libc::EINVAL);
        assert_eq!(reply.fields, vec!["-1".to_string()]);
        let reply = control.call(&Command::Connect).await.unwrap();
        assert!(reply.is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn operations_without_open_file_fail_with_ebadf() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        let reply = control.call(&Command::Close).await.unwrap();
        assert_eq!((reply.rc, reply.errno), (-1, libc::EBADF));
        let reply = control
            .call(&Command::Seek {
                offset: 0,
                whence: remote::protocol::command::Whence::End,
            })
            .await
            .unwrap();
        assert_eq!((reply.rc, reply.errno), (-1, libc::EBADF));
        let reply = control.call(&Command::GetVolInfo).await.unwrap();
        assert_eq!(reply.errno, libc::EBADF);
        cancel.cancel();
    }

    #[tokio::test]
    async fn closedir_always_succeeds() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        for dir in [0, 7] {
            let reply = control.call(&Command::Closedir { dir }).await.unwrap();
            assert_eq!(reply, Reply::ok(Verb::Closedir, 0));
        }
        let line = control.call(&Command::Closedir { dir: 3 }).await.unwrap().to_line();
        assert_eq!(line.encode().unwrap(), "CLOSEDIR 0 0");
        cancel.cancel();
    }

    #[tokio::test]
    async fn dataport_beyond_offer_is_refused() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        let reply = control
            .call(&Command::Dport6(DataPortAddr {
                seq: 1,
                addr: "127.0.0.1:9".parse().unwrap(),
            }))
            .await
            .unwrap();
        assert_eq!((reply.rc, reply.errno), (-1, libc::EINVAL));
        cancel.cancel();
    }

    #[tokio::test]
    async fn data_before_dataports_ends_session() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        control.send_command(&Command::Recv { nbytes: 10 }).await.unwrap();
        let err = control.recv_reply(Verb::Recv).await.unwrap_err();
        assert!(err.is_fatal());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_stops_idle_sessions() {
        let (addr, cancel) = start(ServerConfig::default()).await;
        let mut control = control(addr).await;
        control.call(&Command::Connect).await.unwrap();
        cancel.cancel();
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), control.recv_line())
            .await
            .unwrap();
        assert!(matches!(line, Ok(None) | Err(_)));
    }
}
