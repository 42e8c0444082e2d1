use super::{Args, Line, Verb};
use crate::error::{Error, Result};

/// Address family codes carried by `DPORT6`.
const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

/// Placeholder for volume request strings that are not set.
const UNSET: &str = "-";

/// Mode and ownership applied when `OPEN` creates a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    pub fn code(self) -> i32 {
        match self {
            Whence::Set => 0,
            Whence::Current => 1,
            Whence::End => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(Error::protocol(format!("invalid whence {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
    Unlock,
}

impl LockType {
    pub fn code(self) -> i32 {
        match self {
            LockType::Read => 1,
            LockType::Write => 2,
            LockType::Unlock => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(LockType::Read),
            2 => Ok(LockType::Write),
            3 => Ok(LockType::Unlock),
            other => Err(Error::protocol(format!("invalid lock type {other}"))),
        }
    }
}

/// Removable-media mount request carried by `LOADVOL`.
///
/// `file_id`, `owner_id` and `group_id` may be empty; they travel as `-`,
/// so a literal `-` cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeRequest {
    pub flags: i32,
    pub file_id: String,
    pub owner_id: String,
    pub group_id: String,
    pub media: String,
    pub vsn: String,
}

impl VolumeRequest {
    pub fn new(media: impl Into<String>, vsn: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            vsn: vsn.into(),
            ..Default::default()
        }
    }
}

fn optional_out<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    match value {
        "" => Ok(UNSET),
        UNSET => Err(Error::protocol(format!(
            "{what} {UNSET:?} would read back as unset"
        ))),
        value => Ok(value),
    }
}

fn optional_in(value: &str) -> String {
    if value == UNSET {
        String::new()
    } else {
        value.to_string()
    }
}

/// Listener address of one dataport, announced by `DPORT`/`DPORT6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPortAddr {
    pub seq: usize,
    pub addr: std::net::SocketAddr,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    /// The client host name is informational only.
    Config {
        hostname: Option<String>,
    },
    /// Legacy IPv4-only form of `Dport6`.
    Dport(DataPortAddr),
    Dport6(DataPortAddr),
    Open {
        path: String,
        oflag: i32,
        create: Option<CreateAttr>,
    },
    Stor {
        nbytes: u64,
    },
    Send {
        nbytes: u64,
    },
    Recv {
        nbytes: u64,
    },
    Seek {
        offset: i64,
        whence: Whence,
    },
    Flock {
        lock: LockType,
    },
    ArchiveOp {
        path: String,
        ops: String,
    },
    Close,
    Unlink {
        path: String,
    },
    Disconn,
    IsMounted {
        mount_point: String,
    },
    Stat {
        path: String,
    },
    Statvfs {
        mount_point: String,
        offline: bool,
    },
    SpaceUsed {
        path: String,
    },
    Mkdir {
        path: String,
        attr: CreateAttr,
    },
    Opendir {
        path: String,
    },
    Readdir {
        dir: usize,
    },
    Closedir {
        dir: usize,
    },
    Rmdir {
        path: String,
    },
    LoadVol {
        request: VolumeRequest,
        oflag: i32,
    },
    GetVolInfo,
    SeekVol {
        block: u64,
    },
    UnloadVol {
        flags: i32,
    },
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Command::Connect => Verb::Connect,
            Command::Config { .. } => Verb::Config,
            Command::Dport(_) => Verb::Dport,
            Command::Dport6(_) => Verb::Dport6,
            Command::Open { .. } => Verb::Open,
            Command::Stor { .. } => Verb::Stor,
            Command::Send { .. } => Verb::Send,
            Command::Recv { .. } => Verb::Recv,
            Command::Seek { .. } => Verb::Seek,
            Command::Flock { .. } => Verb::Flock,
            Command::ArchiveOp { .. } => Verb::ArchiveOp,
            Command::Close => Verb::Close,
            Command::Unlink { .. } => Verb::Unlink,
            Command::Disconn => Verb::Disconn,
            Command::IsMounted { .. } => Verb::IsMounted,
            Command::Stat { .. } => Verb::Stat,
            Command::Statvfs { .. } => Verb::Statvfs,
            Command::SpaceUsed { .. } => Verb::SpaceUsed,
            Command::Mkdir { .. } => Verb::Mkdir,
            Command::Opendir { .. } => Verb::Opendir,
            Command::Readdir { .. } => Verb::Readdir,
            Command::Closedir { .. } => Verb::Closedir,
            Command::Rmdir { .. } => Verb::Rmdir,
            Command::LoadVol { .. } => Verb::LoadVol,
            Command::GetVolInfo => Verb::GetVolInfo,
            Command::SeekVol { .. } => Verb::SeekVol,
            Command::UnloadVol { .. } => Verb::UnloadVol,
        }
    }

    pub fn to_line(&self) -> Result<Line> {
        let line = Line::new(self.verb());
        let line = match self {
            Command::Connect
            | Command::Close
            | Command::Disconn
            | Command::GetVolInfo => line,
            Command::Config { hostname } => match hostname {
                Some(hostname) => line.arg(hostname),
                None => line,
            },
            Command::Dport(port) => {
                let std::net::SocketAddr::V4(v4) = port.addr else {
                    return Err(Error::protocol(format!(
                        "DPORT cannot carry IPv6 address {}",
                        port.addr
                    )));
                };
                let mut line = line.arg(port.seq);
                for octet in v4.ip().octets() {
                    line = line.arg(octet);
                }
                line.arg(v4.port() >> 8).arg(v4.port() & 0xff)
            }
            Command::Dport6(port) => {
                let (family, octets) = match port.addr.ip() {
                    std::net::IpAddr::V4(ip) => {
                        let mut octets = [0u8; 16];
                        octets[..4].copy_from_slice(&ip.octets());
                        (AF_INET, octets)
                    }
                    std::net::IpAddr::V6(ip) => (AF_INET6, ip.octets()),
                };
                let mut line = line.arg(port.seq).arg(family);
                for octet in octets {
                    line = line.arg(octet);
                }
                line.arg(port.addr.port() >> 8)
                    .arg(port.addr.port() & 0xff)
            }
            Command::Open {
                path,
                oflag,
                create,
            } => {
                let line = line.arg(path).arg(oflag);
                match create {
                    Some(attr) => line.arg(attr.mode).arg(attr.uid).arg(attr.gid),
                    None => line,
                }
            }
            Command::Stor { nbytes } | Command::Send { nbytes } | Command::Recv { nbytes } => {
                line.arg(nbytes)
            }
            Command::Seek { offset, whence } => line.arg(offset).arg(whence.code()),
            Command::Flock { lock } => line.arg(lock.code()),
            Command::ArchiveOp { path, ops } => line.arg(path).arg(ops),
            Command::Unlink { path }
            | Command::Stat { path }
            | Command::SpaceUsed { path }
            | Command::Opendir { path }
            | Command::Rmdir { path } => line.arg(path),
            Command::IsMounted { mount_point } => line.arg(mount_point),
            Command::Statvfs {
                mount_point,
                offline,
            } => line.arg(mount_point).arg(i32::from(*offline)),
            Command::Mkdir { path, attr } => {
                line.arg(path).arg(attr.mode).arg(attr.uid).arg(attr.gid)
            }
            Command::Readdir { dir } | Command::Closedir { dir } => line.arg(dir),
            Command::LoadVol { request, oflag } => line
                .arg(request.flags)
                .arg(optional_out("file id", &request.file_id)?)
                .arg(optional_out("owner id", &request.owner_id)?)
                .arg(optional_out("group id", &request.group_id)?)
                .arg(&request.media)
                .arg(&request.vsn)
                .arg(oflag),
            Command::SeekVol { block } => line.arg(block),
            Command::UnloadVol { flags } => line.arg(flags),
        };
        Ok(line)
    }

    pub fn from_line(line: &Line) -> Result<Self> {
        let mut args = line.args();
        let command = match line.verb {
            Verb::Connect => Command::Connect,
            Verb::Config => Command::Config {
                hostname: match args.remaining() {
                    0 => None,
                    _ => Some(args.word("hostname")?.to_string()),
                },
            },
            Verb::Dport => {
                let seq = args.parse("sequence")?;
                let mut octets = [0u8; 4];
                for octet in &mut octets {
                    *octet = args.parse("address octet")?;
                }
                let port = parse_port(&mut args)?;
                Command::Dport(DataPortAddr {
                    seq,
                    addr: std::net::SocketAddr::from((octets, port)),
                })
            }
            Verb::Dport6 => {
                let seq = args.parse("sequence")?;
                let family: u8 = args.parse("address family")?;
                let mut octets = [0u8; 16];
                for octet in &mut octets {
                    *octet = args.parse("address octet")?;
                }
                let port = parse_port(&mut args)?;
                let ip = match family {
                    AF_INET => std::net::IpAddr::from([octets[0], octets[1], octets[2], octets[3]]),
                    AF_INET6 => std::net::IpAddr::from(octets),
                    other => {
                        return Err(Error::protocol(format!(
                            "DPORT6: unsupported address family {other}"
                        )));
                    }
                };
                Command::Dport6(DataPortAddr {
                    seq,
                    addr: std::net::SocketAddr::new(ip, port),
                })
            }
            Verb::Open => {
                let path = args.word("path")?.to_string();
                let oflag = args.parse("oflag")?;
                let create = if args.remaining() == 0 {
                    None
                } else {
                    Some(parse_attr(&mut args)?)
                };
                Command::Open {
                    path,
                    oflag,
                    create,
                }
            }
            Verb::Stor => Command::Stor {
                nbytes: args.parse("byte count")?,
            },
            Verb::Send => Command::Send {
                nbytes: args.parse("byte count")?,
            },
            Verb::Recv => Command::Recv {
                nbytes: args.parse("byte count")?,
            },
            Verb::Seek => Command::Seek {
                offset: args.parse("position")?,
                whence: Whence::from_code(args.parse("whence")?)?,
            },
            Verb::Flock => Command::Flock {
                lock: LockType::from_code(args.parse("lock type")?)?,
            },
            Verb::ArchiveOp => Command::ArchiveOp {
                path: args.word("path")?.to_string(),
                ops: args.word("ops")?.to_string(),
            },
            Verb::Close => Command::Close,
            Verb::Unlink => Command::Unlink {
                path: args.word("path")?.to_string(),
            },
            Verb::Disconn => Command::Disconn,
            Verb::IsMounted => Command::IsMounted {
                mount_point: args.word("mount point")?.to_string(),
            },
            Verb::Stat => Command::Stat {
                path: args.word("path")?.to_string(),
            },
            Verb::Statvfs => Command::Statvfs {
                mount_point: args.word("mount point")?.to_string(),
                offline: args.parse::<i32>("offline flag")? != 0,
            },
            Verb::SpaceUsed => Command::SpaceUsed {
                path: args.word("path")?.to_string(),
            },
            Verb::Mkdir => Command::Mkdir {
                path: args.word("path")?.to_string(),
                attr: parse_attr(&mut args)?,
            },
            Verb::Opendir => Command::Opendir {
                path: args.word("path")?.to_string(),
            },
            Verb::Readdir => Command::Readdir {
                dir: args.parse("directory handle")?,
            },
            Verb::Closedir => Command::Closedir {
                dir: args.parse("directory handle")?,
            },
            Verb::Rmdir => Command::Rmdir {
                path: args.word("path")?.to_string(),
            },
            Verb::LoadVol => {
                let flags = args.parse("flags")?;
                let file_id = optional_in(args.word("file id")?);
                let owner_id = optional_in(args.word("owner id")?);
                let group_id = optional_in(args.word("group id")?);
                let media = args.word("media")?.to_string();
                let vsn = args.word("vsn")?.to_string();
                Command::LoadVol {
                    request: VolumeRequest {
                        flags,
                        file_id,
                        owner_id,
                        group_id,
                        media,
                        vsn,
                    },
                    oflag: args.parse("oflag")?,
                }
            }
            Verb::GetVolInfo => Command::GetVolInfo,
            Verb::SeekVol => Command::SeekVol {
                block: args.parse("block")?,
            },
            Verb::UnloadVol => Command::UnloadVol {
                flags: args.parse("flags")?,
            },
        };
        args.finish()?;
        Ok(command)
    }
}

fn parse_port(args: &mut Args<'_>) -> Result<u16> {
    let high: u8 = args.parse("port high byte")?;
    let low: u8 = args.parse("port low byte")?;
    Ok((u16::from(high) << 8) | u16::from(low))
}

fn parse_attr(args: &mut Args<'_>) -> Result<CreateAttr> {
    Ok(CreateAttr {
        mode: args.parse("mode")?,
        uid: args.parse("uid")?,
        gid: args.parse("gid")?,
    })
}
