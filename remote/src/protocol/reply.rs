use super::{Args, Line, Verb};
use crate::error::{Error, Result};

/// A reply line: `<verb> <rc> <errno> [fields...]`.
///
/// `ISMOUNTED` carries only `rc` and `CONFIG` carries no errno; for those
/// `errno` is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub verb: Verb,
    pub rc: i64,
    pub errno: i32,
    pub fields: Vec<String>,
}

fn has_errno(verb: Verb) -> bool {
    !matches!(verb, Verb::IsMounted | Verb::Config)
}

/// Fields sent in place of the payload of a failed reply so that every
/// reply of a verb has the same arity.
fn placeholders(verb: Verb) -> &'static [&'static str] {
    match verb {
        Verb::Seek | Verb::Opendir | Verb::UnloadVol => &["-1"],
        Verb::Stat => &["0", "0", "0", "0"],
        Verb::Statvfs => &["0", "0", "0", "-"],
        Verb::SpaceUsed => &["0"],
        Verb::Readdir => &[".", "0"],
        Verb::GetVolInfo => &["0", "0", "-1"],
        Verb::Config => &["0", "0", "0"],
        _ => &[],
    }
}

impl Reply {
    pub fn ok(verb: Verb, rc: i64) -> Self {
        Self {
            verb,
            rc,
            errno: 0,
            fields: Vec::new(),
        }
    }

    /// Failure reply, `rc = -1`, with placeholder fields.
    pub fn failed(verb: Verb, errno: i32) -> Self {
        Self {
            verb,
            rc: -1,
            errno: if has_errno(verb) { errno } else { 0 },
            fields: placeholders(verb).iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn field(mut self, value: impl std::fmt::Display) -> Self {
        self.fields.push(value.to_string());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.rc >= 0
    }

    pub fn to_line(&self) -> Line {
        let mut line = Line::new(self.verb).arg(self.rc);
        if has_errno(self.verb) {
            line = line.arg(self.errno);
        }
        for field in &self.fields {
            line = line.arg(field);
        }
        line
    }

    /// Decode a reply to a command issued with `expected`.
    pub fn parse(line: &Line, expected: Verb) -> Result<Self> {
        if line.verb != expected {
            return Err(Error::protocol(format!(
                "expected {expected} reply, got {}",
                line.verb
            )));
        }
        let mut args = line.args();
        let rc = args.parse("return code")?;
        let errno = if has_errno(expected) {
            args.parse("errno")?
        } else {
            0
        };
        let mut fields = Vec::with_capacity(args.remaining());
        while args.remaining() > 0 {
            fields.push(args.word("field")?.to_string());
        }
        Ok(Self {
            verb: expected,
            rc,
            errno,
            fields,
        })
    }

    /// Turn a failure reply into `Error::Remote`.
    pub fn check(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Remote {
                verb: self.verb,
                rc: self.rc,
                errno: self.errno,
            })
        }
    }

    fn payload(&self) -> Args<'_> {
        Args {
            verb: self.verb,
            words: self.fields.iter(),
        }
    }

    /// Single numeric payload field (`SEEK` offset, `SPACEUSED` bytes, ...).
    pub fn value<T: std::str::FromStr>(&self, what: &str) -> Result<T> {
        let mut args = self.payload();
        let value = args.parse(what)?;
        args.finish()?;
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StatInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl StatInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn reply(&self) -> Reply {
        Reply::ok(Verb::Stat, 0)
            .field(self.mode)
            .field(self.uid)
            .field(self.gid)
            .field(self.size)
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let mut args = reply.payload();
        let info = Self {
            mode: args.parse("mode")?,
            uid: args.parse("uid")?,
            gid: args.parse("gid")?,
            size: args.parse("size")?,
        };
        args.finish()?;
        Ok(info)
    }
}

/// Filesystem capacity as reported by `STATVFS`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FsCapacity {
    pub bfree: u64,
    pub blocks: u64,
    pub frsize: u64,
    pub basetype: String,
}

impl FsCapacity {
    pub fn reply(&self) -> Reply {
        Reply::ok(Verb::Statvfs, 0)
            .field(self.bfree)
            .field(self.blocks)
            .field(self.frsize)
            .field(&self.basetype)
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let mut args = reply.payload();
        let capacity = Self {
            bfree: args.parse("bfree")?,
            blocks: args.parse("blocks")?,
            frsize: args.parse("frsize")?,
            basetype: args.word("basetype")?.to_string(),
        };
        args.finish()?;
        Ok(capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn reply(&self) -> Reply {
        Reply::ok(Verb::Readdir, 0)
            .field(&self.name)
            .field(i32::from(self.is_dir))
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let mut args = reply.payload();
        let entry = Self {
            name: args.word("name")?.to_string(),
            is_dir: args.parse::<i32>("isdir")? != 0,
        };
        args.finish()?;
        Ok(entry)
    }
}

/// Mounted volume information as reported by `GETVOLINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct VolInfo {
    pub block_size: u64,
    pub position: u64,
    pub eq: i32,
}

impl VolInfo {
    pub fn reply(&self) -> Reply {
        Reply::ok(Verb::GetVolInfo, 0)
            .field(self.block_size)
            .field(self.position)
            .field(self.eq)
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let mut args = reply.payload();
        let info = Self {
            block_size: args.parse("block size")?,
            position: args.parse("position")?,
            eq: args.parse("eq")?,
        };
        args.finish()?;
        Ok(info)
    }
}

/// Data transfer parameters offered by the server in its `CONFIG` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOffer {
    pub dataports: usize,
    pub blksize: usize,
    pub tcp_window: usize,
}

impl ConfigOffer {
    pub fn reply(&self) -> Reply {
        Reply::ok(Verb::Config, 0)
            .field(self.dataports)
            .field(self.blksize)
            .field(self.tcp_window)
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let mut args = reply.payload();
        let offer = Self {
            dataports: args.parse("ndataports")?,
            blksize: args.parse("blksize")?,
            tcp_window: args.parse("tcpwindow")?,
        };
        args.finish()?;
        if offer.dataports == 0 || offer.blksize == 0 {
            return Err(Error::protocol(format!(
                "CONFIG: unusable offer of {} dataport(s) with {} byte blocks",
                offer.dataports, offer.blksize
            )));
        }
        Ok(offer)
    }
}
