//! Control channel vocabulary.
//!
//! Every command and reply is one line of ASCII: a verb followed by
//! space separated positional arguments. There is no quoting or escaping,
//! so arguments may not be empty and may not contain whitespace; the
//! encoder refuses such values instead of emitting a line the peer would
//! split differently.

use crate::error::{Error, Result};

pub mod command;
pub mod reply;

pub use command::{Command, CreateAttr, DataPortAddr, LockType, VolumeRequest, Whence};
pub use reply::{ConfigOffer, DirEntry, FsCapacity, Reply, StatInfo, VolInfo};

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 7105;

/// Default maximum length of one control line, terminator excluded.
pub const DEFAULT_CMD_BUFFER_SIZE: usize = 4096;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verb {
    Connect,
    Config,
    Dport,
    Dport6,
    Open,
    Stor,
    Send,
    Recv,
    Seek,
    Flock,
    ArchiveOp,
    Close,
    Unlink,
    Disconn,
    IsMounted,
    Stat,
    Statvfs,
    SpaceUsed,
    Mkdir,
    Opendir,
    Readdir,
    Closedir,
    Rmdir,
    LoadVol,
    GetVolInfo,
    SeekVol,
    UnloadVol,
}

impl Verb {
    /// Whether the peer answers this command with a reply line.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Verb::Stor | Verb::Disconn)
    }
}

/// One control line: a verb and its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub verb: Verb,
    pub args: Vec<String>,
}

impl Line {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl std::fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn args(&self) -> Args<'_> {
        Args {
            verb: self.verb,
            words: self.args.iter(),
        }
    }

    /// Render the line without its terminator.
    pub fn encode(&self) -> Result<String> {
        let mut text = self.verb.to_string();
        for arg in &self.args {
            if !is_representable(arg) {
                return Err(Error::protocol(format!(
                    "{} argument {arg:?} cannot be sent on the control channel",
                    self.verb
                )));
            }
            text.push(' ');
            text.push_str(arg);
        }
        Ok(text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut words = text.split_ascii_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| Error::protocol("empty control line"))?;
        let verb = verb
            .parse::<Verb>()
            .map_err(|_| Error::protocol(format!("unknown verb {verb:?}")))?;
        Ok(Self {
            verb,
            args: words.map(str::to_string).collect(),
        })
    }
}

/// True when `value` survives the space separated line format.
pub fn is_representable(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Cursor over the positional arguments of a line.
#[derive(Debug, Clone)]
pub struct Args<'a> {
    verb: Verb,
    words: std::slice::Iter<'a, String>,
}

impl<'a> Args<'a> {
    pub fn word(&mut self, what: &str) -> Result<&'a str> {
        self.words
            .next()
            .map(String::as_str)
            .ok_or_else(|| Error::protocol(format!("{}: missing {what}", self.verb)))
    }

    pub fn parse<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let word = self.word(what)?;
        word.parse::<T>()
            .map_err(|_| Error::protocol(format!("{}: malformed {what} {word:?}", self.verb)))
    }

    pub fn remaining(&self) -> usize {
        self.words.len()
    }

    /// Fails if unconsumed arguments are left.
    pub fn finish(self) -> Result<()> {
        if self.words.len() != 0 {
            return Err(Error::protocol(format!(
                "{}: {} unexpected trailing argument(s)",
                self.verb,
                self.words.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn verb_names_match_wire_vocabulary() {
        assert_eq!(Verb::ArchiveOp.to_string(), "ARCHIVEOP");
        assert_eq!(Verb::Dport6.to_string(), "DPORT6");
        assert_eq!(Verb::GetVolInfo.to_string(), "GETVOLINFO");
        assert_eq!(Verb::IsMounted.to_string(), "ISMOUNTED");
        for verb in Verb::iter() {
            let name: &'static str = verb.into();
            assert_eq!(name.parse::<Verb>().unwrap(), verb);
            assert!(name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn encoder_rejects_unrepresentable_arguments() {
        let line = Line::new(Verb::Stat).arg("/tmp/with space");
        assert!(matches!(line.encode(), Err(Error::Protocol(_))));
        let line = Line::new(Verb::Stat).arg("");
        assert!(matches!(line.encode(), Err(Error::Protocol(_))));
        let line = Line::new(Verb::Stat).arg("/tmp/new\nline");
        assert!(matches!(line.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(Line::parse(""), Err(Error::Protocol(_))));
        assert!(matches!(Line::parse("   "), Err(Error::Protocol(_))));
        assert!(matches!(Line::parse("FETCH 1 2"), Err(Error::Protocol(_))));
        assert!(matches!(Line::parse("open /tmp/x 0"), Err(Error::Protocol(_))));
    }

    #[test]
    fn args_cursor_reports_missing_and_malformed_fields() {
        let line = Line::parse("SEEK 12 x").unwrap();
        let mut args = line.args();
        assert_eq!(args.parse::<i64>("position").unwrap(), 12);
        let err = args.parse::<i32>("whence").unwrap_err();
        assert!(err.to_string().contains("malformed whence"));
        let mut args = line.args();
        args.word("position").unwrap();
        args.word("whence").unwrap();
        assert!(args.word("extra").is_err());
        let args = line.args();
        assert!(args.finish().is_err());
    }
}
