use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::protocol::{Command, Line, Reply, Verb};

/// Control connection carrying newline terminated command and reply lines.
#[derive(Debug)]
pub struct ControlConnection {
    framed: tokio_util::codec::Framed<TcpStream, tokio_util::codec::LinesCodec>,
    max_line: usize,
    read_timeout: Option<std::time::Duration>,
}

impl ControlConnection {
    pub fn new(stream: TcpStream, max_line: usize) -> Self {
        let framed = tokio_util::codec::Framed::new(
            stream,
            tokio_util::codec::LinesCodec::new_with_max_length(max_line),
        );
        Self {
            framed,
            max_line,
            read_timeout: None,
        }
    }

    /// Bound every wait for an incoming line; `None` waits forever.
    pub fn with_read_timeout(mut self, read_timeout: Option<std::time::Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.framed.get_ref().peer_addr()?)
    }

    pub async fn send_line(&mut self, line: &Line) -> Result<()> {
        let text = line.encode()?;
        if text.len() > self.max_line {
            return Err(Error::protocol(format!(
                "{} line of {} bytes exceeds command buffer size {}",
                line.verb,
                text.len(),
                self.max_line
            )));
        }
        tracing::trace!("-> {text}");
        self.framed.send(text).await?;
        Ok(())
    }

    /// Next line from the peer, `None` once the peer closed the connection.
    pub async fn recv_line(&mut self) -> Result<Option<Line>> {
        let next = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.framed.next())
                .await
                .map_err(|_| {
                    Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out waiting for control line",
                    ))
                })?,
            None => self.framed.next().await,
        };
        match next {
            Some(text) => {
                let text = text?;
                tracing::trace!("<- {text}");
                Ok(Some(Line::parse(&text)?))
            }
            None => Ok(None),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        self.send_line(&command.to_line()?).await
    }

    pub async fn recv_command(&mut self) -> Result<Option<Command>> {
        match self.recv_line().await? {
            Some(line) => Ok(Some(Command::from_line(&line)?)),
            None => Ok(None),
        }
    }

    pub async fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        self.send_line(&reply.to_line()).await
    }

    pub async fn recv_reply(&mut self, expected: Verb) -> Result<Reply> {
        match self.recv_line().await? {
            Some(line) => Reply::parse(&line, expected),
            None => Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed while waiting for {expected} reply"),
            ))),
        }
    }

    /// One command/reply round trip. The reply is returned as is; use
    /// [`Reply::check`] to turn a failure into an error.
    #[instrument(level = "trace", skip(self))]
    pub async fn call(&mut self, command: &Command) -> Result<Reply> {
        self.send_command(command).await?;
        self.recv_reply(command.verb()).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Frame reader over one dataport: `[u32 big-endian length][payload]`.
pub type FrameReader<R> = tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>;

pub fn frame_reader<R: AsyncRead>(reader: R, max_frame: usize) -> FrameReader<R> {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame)
        .new_read(reader)
}

/// Writes one data frame; an empty payload is the end-of-transfer sentinel.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes does not fit the length prefix", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
