//! Line-oriented wire protocol between the `reee` client and the
//! `reeed` daemon.
//!
//! One command frame travels client → daemon per connection:
//!
//! ```text
//! <type> <id> <level>[ <args>]\n
//! ```
//!
//! followed, for `eval`, by exactly `N` raw message bytes. The daemon
//! answers with zero or more `log` frames and exactly one terminal
//! frame:
//!
//! ```text
//! log <level> <text>\n
//! success <N>\n<N bytes>
//! error <text>\n
//! ```
//!
//! Frames are ASCII lines except the `success` payload, which is a
//! length-prefixed blob. Lines are bounded at [`MAX_LINE_LEN`] bytes
//! and the bound is enforced before buffering grows past it.

mod command;
mod error;
mod result;

pub use command::{read_command, write_command, Command, CommandType};
pub use error::{ProtocolError, MAX_LINE_LEN};
pub use result::{read_result, write_error, write_log, write_success, CommandResult};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Read one newline-terminated line, without the newline, enforcing
/// [`MAX_LINE_LEN`] as the buffer fills.
pub(crate) async fn read_line<R>(r: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let (done, used) = {
            let available = r.fill_buf().await?;
            if available.is_empty() {
                return Err(ProtocolError::ShortRead);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&available[..i]);
                    (true, i + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        r.consume(used);
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong);
        }
        if done {
            break;
        }
    }
    String::from_utf8(line)
        .map_err(|_| ProtocolError::Malformed("frame is not valid UTF-8".to_string()))
}

/// Replace embedded newlines so a message stays on one frame line.
pub(crate) fn flatten(msg: &str) -> String {
    if msg.contains('\n') {
        msg.replace('\n', " ")
    } else {
        msg.to_string()
    }
}
