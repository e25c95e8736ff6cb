//! Client-side connection handling and command execution.
//!
//! Each invocation is one connection carrying one command: connect,
//! write the command frame (plus the message body for `eval`), then
//! consume result frames. Interleaved `log` frames are forwarded to
//! the local printer as they arrive; the terminal frame decides the
//! exit.

use std::io;
use std::time::Instant;

use reee_core::addr::Network;
use reee_core::ident;
use reee_core::log::Printer;
use reee_core::protocol::{
    read_result, write_command, Command, CommandResult, CommandType, ProtocolError,
};
use reee_core::verbose;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Client-side failures. [`code`](CliError::code) maps each to the
/// process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// The daemon was unreachable.
    #[error("failed to connect to daemon (network {net}, address {addr})")]
    Connect {
        net: Network,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An argument failed client-side validation.
    #[error("{0}")]
    Usage(String),

    /// The wire protocol broke down.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The daemon answered with an `error` frame.
    #[error("{0}")]
    Daemon(String),

    /// Local I/O (stdin/stdout) failed.
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// The exit code this error carries.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Connect { .. } => 2,
            _ => 1,
        }
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type Stream = Box<dyn AsyncStream>;

async fn connect(net: Network, addr: &str) -> Result<Stream, CliError> {
    let connect_err = |source| CliError::Connect {
        net,
        addr: addr.to_string(),
        source,
    };
    match net {
        #[cfg(unix)]
        Network::Unix => {
            let stream = UnixStream::connect(addr).await.map_err(connect_err)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(connect_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        ))),
        Network::Tcp => {
            let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
            Ok(Box::new(stream))
        }
    }
}

/// One connected exchange with the daemon.
pub struct Client<'a> {
    logger: &'a (dyn Printer + Send + Sync),
    reader: BufReader<tokio::io::ReadHalf<Stream>>,
    writer: BufWriter<tokio::io::WriteHalf<Stream>>,
    cmd_id: String,
}

impl<'a> Client<'a> {
    /// Connect to the daemon and allocate a command ID.
    pub async fn connect(
        net: Network,
        addr: &str,
        logger: &'a (dyn Printer + Send + Sync),
    ) -> Result<Client<'a>, CliError> {
        let stream = connect(net, addr).await?;
        let (r, w) = tokio::io::split(stream);
        let cmd_id = uuid::Uuid::new_v4().to_string();
        verbose!(logger, "command ID: {cmd_id}");
        Ok(Client {
            logger,
            reader: BufReader::new(r),
            writer: BufWriter::new(w),
            cmd_id,
        })
    }

    /// Run `list` and return the group listing payload.
    pub async fn list(mut self) -> Result<Vec<u8>, CliError> {
        let cmd = Command {
            kind: CommandType::List,
            id: self.cmd_id.clone(),
            level: self.logger.level(),
            args: String::new(),
        };

        let start = Instant::now();
        write_command(&mut self.writer, &cmd).await?;
        verbose!(
            self.logger,
            "wrote list command for cmd {} in {:?}.",
            self.cmd_id,
            start.elapsed()
        );

        self.finish().await
    }

    /// Run `eval` for `group` (optionally one `rule`), submitting
    /// `body` as the message.
    pub async fn eval(
        mut self,
        group: &str,
        rule: Option<&str>,
        body: &[u8],
    ) -> Result<(), CliError> {
        if !ident::is_valid(group) {
            return Err(CliError::Usage(format!("invalid group name {group:?}")));
        }
        if let Some(rule) = rule {
            if !ident::is_valid(rule) {
                return Err(CliError::Usage(format!("invalid rule name {rule:?}")));
            }
        }

        let mut args = format!("{} {group}", body.len());
        if let Some(rule) = rule {
            args.push(' ');
            args.push_str(rule);
        }
        let cmd = Command {
            kind: CommandType::Eval,
            id: self.cmd_id.clone(),
            level: self.logger.level(),
            args,
        };

        let start = Instant::now();
        write_command(&mut self.writer, &cmd).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        verbose!(
            self.logger,
            "wrote eval command and {} body bytes for cmd {} in {:?}.",
            body.len(),
            self.cmd_id,
            start.elapsed()
        );

        self.finish().await.map(|_| ())
    }

    /// Consume result frames until the terminal one.
    async fn finish(mut self) -> Result<Vec<u8>, CliError> {
        let start = Instant::now();
        let result = read_result(&mut self.reader, self.logger).await?;
        match result {
            CommandResult::Success(data) => {
                verbose!(
                    self.logger,
                    "read success result and {} bytes of data in {:?}.",
                    data.len(),
                    start.elapsed()
                );
                Ok(data)
            }
            CommandResult::Error(msg) => Err(CliError::Daemon(msg)),
        }
    }
}
