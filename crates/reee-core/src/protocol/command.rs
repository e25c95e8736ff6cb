use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{read_line, ProtocolError};
use crate::ident;
use crate::log::Level;

/// The request verb a command frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Enumerate rule groups and their rules.
    List,
    /// Evaluate a group (or one rule) against a submitted message.
    Eval,
}

impl CommandType {
    /// The wire name of this command type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Eval => "eval",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(Self::List),
            "eval" => Ok(Self::Eval),
            _ => Err(()),
        }
    }
}

/// One command frame: `<type> <id> <level>[ <args>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Request verb.
    pub kind: CommandType,
    /// Opaque client-generated correlation token, `[A-Za-z0-9_\-]+`.
    pub id: String,
    /// Verbosity the client requests for remote log frames.
    pub level: Level,
    /// Verb-specific arguments; a single line, never containing `\n`.
    pub args: String,
}

/// Render a command as its frame line, without the trailing newline.
///
/// Fails when the ID violates the identifier grammar or the args embed
/// a newline; both would corrupt the line-oriented stream.
pub(crate) fn format_command(cmd: &Command) -> Result<String, ProtocolError> {
    if !ident::is_valid(&cmd.id) {
        return Err(ProtocolError::malformed(format!(
            "invalid command ID {:?}",
            cmd.id
        )));
    }
    if cmd.args.contains('\n') {
        return Err(ProtocolError::malformed(
            "command args must not contain newlines",
        ));
    }
    let mut line = format!("{} {} {}", cmd.kind, cmd.id, cmd.level);
    if !cmd.args.is_empty() {
        line.push(' ');
        line.push_str(&cmd.args);
    }
    Ok(line)
}

/// Parse one command frame line (no trailing newline).
pub(crate) fn parse_command_line(line: &str) -> Result<Command, ProtocolError> {
    let mut parts = line.splitn(4, ' ');

    let kind = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProtocolError::malformed(format!("missing command type in [{line}]")))?;
    let kind = kind.parse::<CommandType>().map_err(|()| {
        ProtocolError::malformed(format!("invalid command type [{kind}] in [{line}]"))
    })?;

    let id = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed(format!("missing command ID in [{line}]")))?;
    if !ident::is_valid(id) {
        return Err(ProtocolError::malformed(format!(
            "invalid command ID [{id}] in [{line}]"
        )));
    }

    let level = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed(format!("missing log level in [{line}]")))?;
    let level = level.parse::<Level>().map_err(|_| {
        ProtocolError::malformed(format!("invalid log level [{level}] in [{line}]"))
    })?;

    Ok(Command {
        kind,
        id: id.to_string(),
        level,
        args: parts.next().unwrap_or("").to_string(),
    })
}

/// Write one command frame and flush.
pub async fn write_command<W>(w: &mut W, cmd: &Command) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = format_command(cmd)?;
    line.push('\n');
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one command frame.
///
/// Fails with [`ProtocolError::Malformed`] when the type, ID, or level
/// is missing or unknown, and with [`ProtocolError::ShortRead`] when
/// the stream ends before the newline.
pub async fn read_command<R>(r: &mut R) -> Result<Command, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    parse_command_line(&line)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::io::BufReader;

    use super::*;

    fn cmd(kind: CommandType, id: &str, level: Level, args: &str) -> Command {
        Command {
            kind,
            id: id.to_string(),
            level,
            args: args.to_string(),
        }
    }

    #[test]
    fn parses_list_without_args() {
        let c = parse_command_line("list c1 normal").unwrap();
        assert_eq!(c, cmd(CommandType::List, "c1", Level::Normal, ""));
    }

    #[test]
    fn parses_eval_with_args() {
        let c = parse_command_line("eval c2 verbose 17 inbox mark-read").unwrap();
        assert_eq!(
            c,
            cmd(CommandType::Eval, "c2", Level::Verbose, "17 inbox mark-read")
        );
    }

    #[test]
    fn rejects_unknown_type_id_and_level() {
        assert!(parse_command_line("ping c1 normal").is_err());
        assert!(parse_command_line("list c 1 normal").is_err());
        assert!(parse_command_line("list c1 loud").is_err());
        assert!(parse_command_line("list").is_err());
        assert!(parse_command_line("").is_err());
    }

    #[test]
    fn rejects_newline_in_args_on_write() {
        let c = cmd(CommandType::Eval, "c1", Level::Normal, "0 a\nb");
        assert!(format_command(&c).is_err());
    }

    #[tokio::test]
    async fn short_read_before_newline() {
        let mut r = BufReader::new(&b"list c1 normal"[..]);
        assert!(matches!(
            read_command(&mut r).await,
            Err(ProtocolError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn wire_round_trip() {
        let c = cmd(CommandType::Eval, "abc-123", Level::Taciturn, "42 g r");
        let mut buf = Vec::new();
        write_command(&mut buf, &c).await.unwrap();
        let mut r = BufReader::new(buf.as_slice());
        assert_eq!(read_command(&mut r).await.unwrap(), c);
    }

    proptest! {
        /// Every well-formed command survives a format/parse round trip.
        #[test]
        fn command_round_trips(
            kind in prop::sample::select(vec![CommandType::List, CommandType::Eval]),
            id in "[A-Za-z0-9_\\-]{1,32}",
            level in prop::sample::select(vec![
                Level::Taciturn,
                Level::Normal,
                Level::Verbose,
            ]),
            // Args start with a non-space token so the rendered line
            // parses back to the same field split.
            args in "([0-9A-Za-z_\\-]{1,8}( [0-9A-Za-z_\\-]{1,8}){0,3})?",
        ) {
            let c = Command { kind, id, level, args };
            let line = format_command(&c).unwrap();
            prop_assert_eq!(parse_command_line(&line).unwrap(), c);
        }

        /// The parser never panics on arbitrary single-line input.
        #[test]
        fn parser_never_panics(line in "[^\n]{0,256}") {
            let _ = parse_command_line(&line);
        }
    }
}
