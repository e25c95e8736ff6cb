use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{flatten, read_line, ProtocolError};
use crate::log::{Level, Printer};

/// The terminal outcome of one command, after any interleaved `log`
/// frames have been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// `success <N>` followed by `N` payload bytes.
    Success(Vec<u8>),
    /// `error <text>`.
    Error(String),
}

/// Write a `success` frame with its payload and flush.
pub async fn write_success<W>(w: &mut W, data: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(format!("success {}\n", data.len()).as_bytes())
        .await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

/// Write an `error` frame and flush. Embedded newlines are replaced so
/// the stream stays line-oriented.
pub async fn write_error<W>(w: &mut W, msg: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(format!("error {}\n", flatten(msg)).as_bytes())
        .await?;
    w.flush().await?;
    Ok(())
}

/// Write a `log` frame and flush. Embedded newlines are replaced so
/// the stream stays line-oriented.
pub async fn write_log<W>(w: &mut W, lvl: Level, msg: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(format!("log {} {}\n", lvl, flatten(msg)).as_bytes())
        .await?;
    w.flush().await?;
    Ok(())
}

/// Read frames until the terminal `success` or `error` arrives.
///
/// `log` frames are forwarded to `logger` as they appear. A bare
/// `success` or `error` line with no space is accepted as an empty
/// body; any other spaceless line is malformed.
pub async fn read_result<R, P>(r: &mut R, logger: &P) -> Result<CommandResult, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    P: Printer + ?Sized,
{
    loop {
        let line = read_line(r).await?;
        let (kind, rest) = match line.split_once(' ') {
            Some((kind, rest)) => (kind, rest),
            None => match line.as_str() {
                "success" => return Ok(CommandResult::Success(Vec::new())),
                "error" => return Ok(CommandResult::Error(String::new())),
                _ => {
                    return Err(ProtocolError::malformed(format!(
                        "unknown result frame [{line}]"
                    )))
                }
            },
        };
        match kind {
            "log" => {
                let (lvl, msg) = match rest.split_once(' ') {
                    Some((lvl, msg)) => (lvl, msg),
                    None => (rest, ""),
                };
                let lvl = lvl.parse::<Level>().map_err(|_| {
                    ProtocolError::malformed(format!("invalid log level in [{line}]"))
                })?;
                logger.print(lvl, msg);
            }
            "success" => {
                let n = rest.parse::<usize>().map_err(|_| {
                    ProtocolError::malformed(format!("invalid payload length in [{line}]"))
                })?;
                let mut data = vec![0u8; n];
                r.read_exact(&mut data).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        ProtocolError::ShortRead
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;
                return Ok(CommandResult::Success(data));
            }
            "error" => return Ok(CommandResult::Error(rest.to_string())),
            _ => {
                return Err(ProtocolError::malformed(format!(
                    "unknown result frame [{line}]"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::BufReader;

    use super::*;

    #[derive(Default)]
    struct Collector(Mutex<Vec<(Level, String)>>);

    impl Printer for Collector {
        fn print(&self, lvl: Level, msg: &str) {
            self.0.lock().unwrap().push((lvl, msg.to_string()));
        }

        fn level(&self) -> Level {
            Level::Verbose
        }
    }

    #[tokio::test]
    async fn success_round_trip_consumes_exact_payload() {
        let mut buf = Vec::new();
        write_success(&mut buf, b"inbox a b\n").await.unwrap();
        assert_eq!(&buf[..11], b"success 10\n");

        let mut r = BufReader::new(buf.as_slice());
        let logs = Collector::default();
        let res = read_result(&mut r, &logs).await.unwrap();
        assert_eq!(res, CommandResult::Success(b"inbox a b\n".to_vec()));
        // Nothing left unread.
        assert_eq!(r.read_to_end(&mut Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn error_round_trip() {
        let mut buf = Vec::new();
        write_error(&mut buf, "group not found: nope").await.unwrap();
        let mut r = BufReader::new(buf.as_slice());
        let logs = Collector::default();
        assert_eq!(
            read_result(&mut r, &logs).await.unwrap(),
            CommandResult::Error("group not found: nope".to_string())
        );
    }

    #[tokio::test]
    async fn log_frames_forward_before_terminal_frame() {
        let mut buf = Vec::new();
        write_log(&mut buf, Level::Verbose, "parsing").await.unwrap();
        write_log(&mut buf, Level::Normal, "two\nlines").await.unwrap();
        write_success(&mut buf, b"").await.unwrap();

        let mut r = BufReader::new(buf.as_slice());
        let logs = Collector::default();
        let res = read_result(&mut r, &logs).await.unwrap();
        assert_eq!(res, CommandResult::Success(Vec::new()));
        assert_eq!(
            *logs.0.lock().unwrap(),
            vec![
                (Level::Verbose, "parsing".to_string()),
                (Level::Normal, "two lines".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn bare_terminal_lines_mean_empty_body() {
        let logs = Collector::default();

        let mut r = BufReader::new(&b"success\n"[..]);
        assert_eq!(
            read_result(&mut r, &logs).await.unwrap(),
            CommandResult::Success(Vec::new())
        );

        let mut r = BufReader::new(&b"error\n"[..]);
        assert_eq!(
            read_result(&mut r, &logs).await.unwrap(),
            CommandResult::Error(String::new())
        );
    }

    #[tokio::test]
    async fn unknown_frame_is_malformed() {
        let logs = Collector::default();
        let mut r = BufReader::new(&b"pong\n"[..]);
        assert!(matches!(
            read_result(&mut r, &logs).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_short_read() {
        let logs = Collector::default();
        let mut r = BufReader::new(&b"success 10\nabc"[..]);
        assert!(matches!(
            read_result(&mut r, &logs).await,
            Err(ProtocolError::ShortRead)
        ));
    }
}
