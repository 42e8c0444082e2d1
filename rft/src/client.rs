//! Client stubs.
//!
//! A [`Session`] mirrors the remote host's view of one open file (or
//! volume) plus its open directories. Each stub is a single command/reply
//! exchange; `store`/`send`, `write` and `read` additionally move data over
//! the session's crew, which is set up on the first `open` or `load_vol`.
//!
//! Sessions on an empty host name or `localhost` never touch the network:
//! the stubs run the same local operations `rftd` would.

use remote::protocol::command::{CreateAttr, DataPortAddr, LockType, VolumeRequest, Whence};
use remote::protocol::reply::{ConfigOffer, DirEntry, FsCapacity, StatInfo, VolInfo};
use remote::protocol::{Command, Reply, Verb};
use remote::streams::ControlConnection;
use remote::{Crew, CrewConfig, Error, Outbound, PortRanges, Result};
use tracing::instrument;

use crate::host::{HostConfig, LocalHost};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control port of `rftd`.
    pub port: u16,
    /// Control connection attempts before `connect` gives up.
    pub connect_attempts: usize,
    pub retry_delay: std::time::Duration,
    /// Limit on each connection attempt and on accepting a dataport.
    pub conn_timeout: std::time::Duration,
    /// Poll interval of idle dataports; also bounds crew teardown.
    pub read_timeout: std::time::Duration,
    /// Limit on waiting for a control reply, `None` waits forever.
    pub reply_timeout: Option<std::time::Duration>,
    pub cmd_buffer_size: usize,
    /// Ports dataport listeners may bind to, any free port if unset.
    pub port_ranges: Option<PortRanges>,
    /// Collaborators of local host sessions.
    pub local: HostConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: remote::protocol::DEFAULT_PORT,
            connect_attempts: 3,
            retry_delay: std::time::Duration::from_secs(2),
            conn_timeout: std::time::Duration::from_secs(15),
            read_timeout: std::time::Duration::from_secs(5),
            reply_timeout: None,
            cmd_buffer_size: remote::protocol::DEFAULT_CMD_BUFFER_SIZE,
            port_ranges: None,
            local: HostConfig::default(),
        }
    }
}

/// True for host names served without a network connection.
pub fn is_local_host(host: &str) -> bool {
    host.is_empty() || host == "localhost"
}

fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| remote::protocol::is_representable(name))
}

async fn connect_once(host: &str, config: &ClientConfig) -> Result<tokio::net::TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, config.port)).await? {
        match tokio::time::timeout(config.conn_timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tracing::debug!("Connected to {addr}");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!("Connecting to {addr} failed: {e}");
                last_error = Some(e);
            }
            Err(_) => {
                tracing::debug!("Connecting to {addr} timed out");
                last_error = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out connecting to {addr}"),
                ));
            }
        }
    }
    Err(Error::Transport(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )
    })))
}

async fn connect_with_retries(host: &str, config: &ClientConfig) -> Result<tokio::net::TcpStream> {
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect_once(host, config).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    "Connection to {host} failed (attempt {attempt}/{attempts}): {e}, retrying in {:?}",
                    config.retry_delay
                );
                tokio::time::sleep(config.retry_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Unfinished `STOR` stream.
#[derive(Debug)]
struct Store {
    outbound: Outbound,
    remaining: u64,
}

#[derive(Debug)]
struct LocalChannel {
    host: LocalHost,
    store_remaining: Option<u64>,
}

#[derive(Debug)]
struct RemoteChannel {
    control: ControlConnection,
    offer: ConfigOffer,
    config: ClientConfig,
    crew: Option<Crew>,
    store: Option<Store>,
    span: tracing::Span,
}

impl RemoteChannel {
    /// Terminate a store stream that is still open. The server reads no
    /// commands until it sees the end of the stream.
    async fn finish_store(&mut self) -> Result<()> {
        if let Some(store) = self.store.take() {
            if store.remaining > 0 {
                tracing::debug!("Ending store stream {} bytes early", store.remaining);
            }
            store.outbound.finish().await?;
        }
        Ok(())
    }

    async fn exchange(&mut self, command: Command) -> Result<Reply> {
        self.finish_store().await?;
        self.control.call(&command).await
    }

    async fn call(&mut self, command: Command) -> Result<Reply> {
        self.exchange(command).await?.check()
    }

    fn crew(&self) -> Result<&Crew> {
        self.crew
            .as_ref()
            .ok_or_else(no_crew)
    }

    /// Announce one listener per offered dataport and accept the server's
    /// connection to each.
    #[instrument(level = "debug", skip(self))]
    async fn ensure_crew(&mut self) -> Result<()> {
        if self.crew.is_some() {
            return Ok(());
        }
        self.finish_store().await?;
        let ip = self.control.local_addr()?.ip();
        let mut sockets = Vec::with_capacity(self.offer.dataports);
        for seq in 0..self.offer.dataports {
            let listener =
                remote::dataport::bind_listener(ip, self.config.port_ranges.as_ref()).await?;
            let addr = listener.local_addr()?;
            self.control
                .call(&Command::Dport6(DataPortAddr { seq, addr }))
                .await?
                .check()?;
            sockets.push(remote::dataport::accept(&listener, self.config.conn_timeout).await?);
        }
        let config = CrewConfig {
            dataports: self.offer.dataports,
            blksize: self.offer.blksize,
            tcp_window: self.offer.tcp_window,
            read_timeout: self.config.read_timeout,
        };
        self.crew = Some(Crew::new(config, sockets, self.span.clone())?);
        Ok(())
    }
}

#[derive(Debug)]
enum Channel {
    Local(LocalChannel),
    Remote(Box<RemoteChannel>),
}

/// Connection to one host, local or remote.
#[derive(Debug)]
pub struct Session {
    host: String,
    channel: Channel,
}

fn no_crew() -> Error {
    Error::protocol("no dataports yet, open a file or volume first")
}

fn local_error(verb: Verb) -> impl FnOnce(crate::host::OpError) -> Error {
    move |e| e.into_remote(verb)
}

fn count(verb: Verb, rc: i64) -> Result<usize> {
    usize::try_from(rc).map_err(|_| Error::protocol(format!("{verb}: negative count {rc}")))
}

impl Session {
    /// Connect and configure a session with `host`. The control connection
    /// is attempted `config.connect_attempts` times.
    #[instrument(skip(config))]
    pub async fn connect(host: &str, config: ClientConfig) -> Result<Self> {
        if is_local_host(host) {
            tracing::debug!("Serving {host:?} with local operations");
            return Ok(Self {
                host: host.to_string(),
                channel: Channel::Local(LocalChannel {
                    host: LocalHost::new(config.local.clone()),
                    store_remaining: None,
                }),
            });
        }
        let stream = connect_with_retries(host, &config).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {e}");
        }
        let mut control = ControlConnection::new(stream, config.cmd_buffer_size)
            .with_read_timeout(config.reply_timeout);
        control.call(&Command::Connect).await?.check()?;
        let reply = control
            .call(&Command::Config {
                hostname: local_hostname(),
            })
            .await?
            .check()?;
        let offer = ConfigOffer::from_reply(&reply)?;
        tracing::info!(
            "Connected to {host}: {} dataport(s) of {} byte blocks, tcp window {}",
            offer.dataports,
            offer.blksize,
            offer.tcp_window
        );
        let span = tracing::info_span!("rft", host);
        Ok(Self {
            host: host.to_string(),
            channel: Channel::Remote(Box::new(RemoteChannel {
                control,
                offer,
                config,
                crew: None,
                store: None,
                span,
            })),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.channel, Channel::Remote(_))
    }

    /// Transfer parameters offered by the server.
    pub fn offer(&self) -> Option<ConfigOffer> {
        match &self.channel {
            Channel::Remote(remote) => Some(remote.offer),
            Channel::Local(_) => None,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn open(&mut self, path: &str, oflag: i32, create: Option<CreateAttr>) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => {
                local.store_remaining = None;
                local
                    .host
                    .open(path, oflag, create)
                    .await
                    .map_err(local_error(Verb::Open))
            }
            Channel::Remote(remote) => {
                remote.ensure_crew().await?;
                remote
                    .call(Command::Open {
                        path: path.to_string(),
                        oflag,
                        create,
                    })
                    .await?;
                Ok(())
            }
        }
    }

    /// Start a stream of `nbytes` into the open file. The data follows in
    /// [`Session::send`] calls; the stream ends after `nbytes` or at the
    /// next command. Failures of the stream are reported by `close`.
    pub async fn store(&mut self, nbytes: u64) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => {
                local.store_remaining = Some(nbytes);
                Ok(())
            }
            Channel::Remote(remote) => {
                remote.finish_store().await?;
                let outbound = remote.crew()?.outbound();
                remote
                    .control
                    .send_command(&Command::Stor { nbytes })
                    .await?;
                if nbytes == 0 {
                    outbound.finish().await?;
                } else {
                    remote.store = Some(Store {
                        outbound,
                        remaining: nbytes,
                    });
                }
                Ok(())
            }
        }
    }

    /// Stream `data` as part of the current store.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let len = data.len() as u64;
        let overrun = |remaining: u64| {
            Error::protocol(format!(
                "send of {len} bytes exceeds the {remaining} bytes left to store"
            ))
        };
        match &mut self.channel {
            Channel::Local(local) => {
                let remaining = local
                    .store_remaining
                    .ok_or_else(|| Error::protocol("send without a store in progress"))?;
                if len > remaining {
                    return Err(overrun(remaining));
                }
                local
                    .host
                    .write(data)
                    .await
                    .map_err(local_error(Verb::Stor))?;
                local.store_remaining = Some(remaining - len).filter(|left| *left > 0);
                Ok(data.len())
            }
            Channel::Remote(remote) => {
                let store = remote
                    .store
                    .as_mut()
                    .ok_or_else(|| Error::protocol("send without a store in progress"))?;
                if len > store.remaining {
                    return Err(overrun(store.remaining));
                }
                store.outbound.write(data).await?;
                store.remaining -= len;
                if store.remaining == 0 {
                    remote.finish_store().await?;
                }
                Ok(data.len())
            }
        }
    }

    /// Write `data` at the current offset of the open file.
    ///
    /// A short write on the remote host that left no errno is reported as
    /// `ENOSPC`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .write(data)
                .await
                .map_err(local_error(Verb::Send)),
            Channel::Remote(remote) => {
                remote.finish_store().await?;
                let crew = remote.crew.as_ref().ok_or_else(no_crew)?;
                remote
                    .control
                    .send_command(&Command::Send {
                        nbytes: data.len() as u64,
                    })
                    .await?;
                crew.send_data(data).await?;
                let reply = remote.control.recv_reply(Verb::Send).await?;
                if !reply.is_ok() {
                    return Err(Error::Remote {
                        verb: Verb::Send,
                        rc: reply.rc,
                        errno: if reply.errno == 0 {
                            libc::ENOSPC
                        } else {
                            reply.errno
                        },
                    });
                }
                count(Verb::Send, reply.rc)
            }
        }
    }

    /// Read up to `buf.len()` bytes from the open file; fewer only at its end.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.channel {
            Channel::Local(local) => {
                let data = local
                    .host
                    .read(buf.len())
                    .await
                    .map_err(local_error(Verb::Recv))?;
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Channel::Remote(remote) => {
                remote.finish_store().await?;
                let crew = remote.crew.as_ref().ok_or_else(no_crew)?;
                remote
                    .control
                    .send_command(&Command::Recv {
                        nbytes: buf.len() as u64,
                    })
                    .await?;
                let mut inbound = crew.inbound()?;
                let mut filled = 0;
                let mut overflow = false;
                // drain to the end of the transfer whatever arrives
                while let Some(frame) = inbound.next_frame().await? {
                    let end = filled + frame.len();
                    if overflow || end > buf.len() {
                        overflow = true;
                        continue;
                    }
                    buf[filled..end].copy_from_slice(&frame);
                    filled = end;
                }
                let reply = remote.control.recv_reply(Verb::Recv).await?;
                if overflow {
                    return Err(Error::protocol(format!(
                        "server sent more than the {} bytes requested",
                        buf.len()
                    )));
                }
                let reply = reply.check()?;
                if count(Verb::Recv, reply.rc)? != filled {
                    return Err(Error::protocol(format!(
                        "server reported {} bytes but sent {filled}",
                        reply.rc
                    )));
                }
                Ok(filled)
            }
        }
    }

    /// Reposition the open file, returning the new absolute offset.
    pub async fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .seek(offset, whence)
                .await
                .map_err(local_error(Verb::Seek)),
            Channel::Remote(remote) => remote
                .call(Command::Seek { offset, whence })
                .await?
                .value("offset"),
        }
    }

    pub async fn flock(&mut self, lock: LockType) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local.host.flock(lock).await.map_err(local_error(Verb::Flock)),
            Channel::Remote(remote) => remote.call(Command::Flock { lock }).await.map(drop),
        }
    }

    pub async fn archive_op(&mut self, path: &str, ops: &str) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .archive_op(path, ops)
                .await
                .map_err(local_error(Verb::ArchiveOp)),
            Channel::Remote(remote) => remote
                .call(Command::ArchiveOp {
                    path: path.to_string(),
                    ops: ops.to_string(),
                })
                .await
                .map(drop),
        }
    }

    /// Close the open file or volume, ending an unfinished store first.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => {
                local.store_remaining = None;
                local.host.close().await.map_err(local_error(Verb::Close))
            }
            Channel::Remote(remote) => remote.call(Command::Close).await.map(drop),
        }
    }

    pub async fn unlink(&mut self, path: &str) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local.host.unlink(path).await.map_err(local_error(Verb::Unlink)),
            Channel::Remote(remote) => remote
                .call(Command::Unlink {
                    path: path.to_string(),
                })
                .await
                .map(drop),
        }
    }

    pub async fn is_mounted(&mut self, mount_point: &str) -> Result<bool> {
        match &mut self.channel {
            Channel::Local(local) => Ok(local.host.is_mounted(mount_point).await),
            Channel::Remote(remote) => {
                let reply = remote
                    .exchange(Command::IsMounted {
                        mount_point: mount_point.to_string(),
                    })
                    .await?;
                Ok(reply.rc > 0)
            }
        }
    }

    pub async fn stat(&mut self, path: &str) -> Result<StatInfo> {
        match &mut self.channel {
            Channel::Local(local) => local.host.stat(path).await.map_err(local_error(Verb::Stat)),
            Channel::Remote(remote) => {
                let reply = remote
                    .call(Command::Stat {
                        path: path.to_string(),
                    })
                    .await?;
                StatInfo::from_reply(&reply)
            }
        }
    }

    /// Capacity of the filesystem at `mount_point`; `offline` adds released
    /// file data on SAM filesystems.
    pub async fn statvfs(&mut self, mount_point: &str, offline: bool) -> Result<FsCapacity> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .statvfs(mount_point, offline)
                .await
                .map_err(local_error(Verb::Statvfs)),
            Channel::Remote(remote) => {
                let reply = remote
                    .call(Command::Statvfs {
                        mount_point: mount_point.to_string(),
                        offline,
                    })
                    .await?;
                FsCapacity::from_reply(&reply)
            }
        }
    }

    pub async fn space_used(&mut self, path: &str) -> Result<u64> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .space_used(path)
                .await
                .map_err(local_error(Verb::SpaceUsed)),
            Channel::Remote(remote) => remote
                .call(Command::SpaceUsed {
                    path: path.to_string(),
                })
                .await?
                .value("used"),
        }
    }

    pub async fn mkdir(&mut self, path: &str, attr: CreateAttr) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .mkdir(path, attr)
                .await
                .map_err(local_error(Verb::Mkdir)),
            Channel::Remote(remote) => remote
                .call(Command::Mkdir {
                    path: path.to_string(),
                    attr,
                })
                .await
                .map(drop),
        }
    }

    pub async fn opendir(&mut self, path: &str) -> Result<usize> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .opendir(path)
                .await
                .map_err(local_error(Verb::Opendir)),
            Channel::Remote(remote) => remote
                .call(Command::Opendir {
                    path: path.to_string(),
                })
                .await?
                .value("dirhandle"),
        }
    }

    /// Next entry of an open directory, `None` once it is exhausted.
    pub async fn readdir(&mut self, dir: usize) -> Result<Option<DirEntry>> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .readdir(dir)
                .await
                .map_err(local_error(Verb::Readdir)),
            Channel::Remote(remote) => {
                let reply = remote.exchange(Command::Readdir { dir }).await?;
                if reply.is_ok() {
                    return DirEntry::from_reply(&reply).map(Some);
                }
                if reply.errno == 0 {
                    return Ok(None);
                }
                reply.check().map(|_| None)
            }
        }
    }

    pub async fn closedir(&mut self, dir: usize) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => {
                local.host.closedir(dir);
                Ok(())
            }
            Channel::Remote(remote) => remote.call(Command::Closedir { dir }).await.map(drop),
        }
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local.host.rmdir(path).await.map_err(local_error(Verb::Rmdir)),
            Channel::Remote(remote) => remote
                .call(Command::Rmdir {
                    path: path.to_string(),
                })
                .await
                .map(drop),
        }
    }

    /// Mount a removable media volume; it then takes the place of the open
    /// file for reads, writes and the volume calls.
    #[instrument(level = "debug", skip(self))]
    pub async fn load_vol(&mut self, request: &VolumeRequest, oflag: i32) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .load_vol(request, oflag)
                .await
                .map_err(local_error(Verb::LoadVol)),
            Channel::Remote(remote) => {
                remote.ensure_crew().await?;
                remote
                    .call(Command::LoadVol {
                        request: request.clone(),
                        oflag,
                    })
                    .await
                    .map(drop)
            }
        }
    }

    pub async fn get_vol_info(&mut self) -> Result<VolInfo> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .get_vol_info()
                .await
                .map_err(local_error(Verb::GetVolInfo)),
            Channel::Remote(remote) => {
                let reply = remote.call(Command::GetVolInfo).await?;
                VolInfo::from_reply(&reply)
            }
        }
    }

    pub async fn seek_vol(&mut self, block: u64) -> Result<()> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .seek_vol(block)
                .await
                .map_err(local_error(Verb::SeekVol)),
            Channel::Remote(remote) => remote.call(Command::SeekVol { block }).await.map(drop),
        }
    }

    /// Unload the mounted volume, returning its final block position.
    pub async fn unload_vol(&mut self, flags: i32) -> Result<u64> {
        match &mut self.channel {
            Channel::Local(local) => local
                .host
                .unload_vol(flags)
                .await
                .map_err(local_error(Verb::UnloadVol)),
            Channel::Remote(remote) => remote
                .call(Command::UnloadVol { flags })
                .await?
                .value("position"),
        }
    }

    /// End the session. The server gets `DISCONN` and no reply is awaited.
    #[instrument(level = "debug", skip(self), fields(host = %self.host))]
    pub async fn disconnect(self) -> Result<()> {
        match self.channel {
            Channel::Local(mut local) => {
                local.host.release().await;
                Ok(())
            }
            Channel::Remote(mut remote) => {
                if let Err(e) = remote.finish_store().await {
                    tracing::warn!("Failed to end store stream: {e}");
                }
                let sent = remote.control.send_command(&Command::Disconn).await;
                if let Err(e) = remote.control.shutdown().await {
                    tracing::debug!("Control connection shutdown: {e}");
                }
                if let Some(crew) = remote.crew.take() {
                    crew.shutdown().await;
                }
                sent
            }
        }
    }
}

/// Whether `path` can be examined on `host`. Makes a single connection
/// attempt.
pub async fn is_accessible(host: &str, path: &str, config: &ClientConfig) -> bool {
    let config = ClientConfig {
        connect_attempts: 1,
        ..config.clone()
    };
    let mut session = match Session::connect(host, config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!("{host} is not reachable: {e}");
            return false;
        }
    };
    let accessible = match session.stat(path).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("{path} is not accessible on {host}: {e}");
            false
        }
    };
    if let Err(e) = session.disconnect().await {
        tracing::debug!("Disconnect from {host} failed: {e}");
    }
    accessible
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn local_host_names() {
        assert!(is_local_host(""));
        assert!(is_local_host("localhost"));
        assert!(!is_local_host("127.0.0.1"));
        assert!(!is_local_host("tapehost"));
    }

    #[tokio::test]
    async fn local_session_runs_operations_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local");
        let path = path.to_str().unwrap();
        let mut session = Session::connect("localhost", ClientConfig::default())
            .await
            .unwrap();
        assert!(!session.is_remote());
        assert!(session.offer().is_none());
        session
            .open(path, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC, None)
            .await
            .unwrap();
        session.store(6).await.unwrap();
        assert_eq!(session.send(b"abc").await.unwrap(), 3);
        assert!(session.send(b"defg").await.is_err());
        session.send(b"def").await.unwrap();
        assert!(session.send(b"x").await.is_err());
        assert_eq!(session.write(b"gh").await.unwrap(), 2);
        assert_eq!(session.seek(2, Whence::Set).await.unwrap(), 2);
        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"cdefgh");
        session.close().await.unwrap();
        assert_eq!(session.stat(path).await.unwrap().size, 8);
        let err = session.stat("/no/such/file").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(matches!(err, Error::Remote { verb: Verb::Stat, rc: -1, .. }));
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_retries_then_fails() {
        // grab a free port and close it again so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            port,
            connect_attempts: 2,
            retry_delay: std::time::Duration::from_millis(50),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let err = Session::connect("127.0.0.1", config.clone()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        assert!(logs_contain("attempt 1/2"));
        assert!(!is_accessible("127.0.0.1", "/", &config).await);
        assert!(is_accessible("localhost", "/", &config).await);
        assert!(!is_accessible("localhost", "/no/such/path", &config).await);
    }
}
