//! Command dispatch: one frame in, one terminal frame out.
//!
//! `list` takes no arguments and replies with one line per group;
//! `eval` parses `"<N> <group> [<rule>]"`, reads exactly `N` body
//! bytes from the same connection, and hands off to assembly and the
//! evaluation engine. Group and rule lookup failures are deferred
//! until the body has been drained so the protocol stream stays in a
//! known state.

use md5::{Digest, Md5};
use reee_core::ident;
use reee_core::protocol::CommandType;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, RequestError};
use crate::eval::run_chain;
use crate::reqlog::{req_verbose, RequestLogger};
use crate::server::{Daemon, Reader};

/// Everything one request carries besides the socket itself.
pub(crate) struct CmdContext {
    pub conn_id: u64,
    pub cmd_id: String,
    pub args: String,
    /// Whether the input stream has already reported end-of-stream.
    pub is_eof: bool,
    pub log: RequestLogger,
    pub cancel: CancellationToken,
}

/// Route one command. `list` produces a payload; `eval` replies with an
/// empty success.
pub(crate) async fn dispatch(
    d: &Daemon,
    ctx: &mut CmdContext,
    kind: CommandType,
    reader: &mut Reader,
) -> Result<Option<Vec<u8>>, HandlerError> {
    match kind {
        CommandType::List => handle_list(d, ctx).await.map(Some),
        CommandType::Eval => handle_eval(d, ctx, reader).await.map(|()| None),
    }
}

async fn handle_list(d: &Daemon, ctx: &CmdContext) -> Result<Vec<u8>, HandlerError> {
    if !ctx.args.is_empty() {
        return Err(RequestError::Malformed(format!(
            "list command not allowed arguments but had {:?}",
            ctx.args
        ))
        .into());
    }

    let mut buf = Vec::new();
    let mut rule_count = 0usize;
    for (group, rules) in d.registry.groups() {
        buf.extend_from_slice(group.as_bytes());
        for rule in rules {
            rule_count += 1;
            buf.push(b' ');
            buf.extend_from_slice(rule.name().as_bytes());
        }
        buf.push(b'\n');
    }

    req_verbose!(
        ctx.log,
        "buffered {} groups and {rule_count} rules in {} bytes",
        d.registry.group_count(),
        buf.len()
    );
    Ok(buf)
}

const EVAL_USAGE: &str = "args format must be <len> <group> [<rule>] but ";

/// Parsed `eval` arguments: byte count, group, optional rule.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct EvalArgs<'a> {
    pub len: usize,
    pub group: &'a str,
    pub rule: Option<&'a str>,
}

/// Parse `"<N> <group> [<rule>]"`. Exactly two or three tokens; extra
/// tokens or stray whitespace are malformed, as are identifiers
/// outside the documented grammar.
pub(crate) fn parse_eval_args(args: &str) -> Result<EvalArgs<'_>, RequestError> {
    if args.is_empty() {
        return Err(RequestError::Malformed(format!("{EVAL_USAGE}args is empty")));
    }
    let tokens: Vec<&str> = args.split(' ').collect();
    if tokens.len() > 3 {
        return Err(RequestError::Malformed(format!(
            "{EVAL_USAGE}it has {} elements",
            tokens.len()
        )));
    }
    let len = tokens[0].parse::<usize>().map_err(|_| {
        RequestError::Malformed(format!("{EVAL_USAGE}first element is {:?}", tokens[0]))
    })?;
    let Some(&group) = tokens.get(1) else {
        return Err(RequestError::Malformed(format!(
            "{EVAL_USAGE}args does not contain <group>"
        )));
    };
    if !ident::is_valid(group) {
        return Err(RequestError::Malformed(format!(
            "invalid group name {group:?}"
        )));
    }
    let rule = tokens.get(2).copied();
    if let Some(rule) = rule {
        if !ident::is_valid(rule) {
            return Err(RequestError::Malformed(format!(
                "invalid rule name {rule:?}"
            )));
        }
    }
    Ok(EvalArgs { len, group, rule })
}

async fn handle_eval(
    d: &Daemon,
    ctx: &mut CmdContext,
    reader: &mut Reader,
) -> Result<(), HandlerError> {
    let args = parse_eval_args(&ctx.args)?;

    // Resolve the chain up front but surface lookup failures only
    // after the body has been drained.
    let mut deferred: Option<RequestError> = None;
    let rules = match d.registry.group(args.group) {
        None => {
            deferred = Some(RequestError::GroupNotFound(args.group.to_string()));
            Vec::new()
        }
        Some(rules) => match args.rule {
            None => rules.to_vec(),
            Some(name) => match rules.iter().find(|r| r.name() == name) {
                Some(rule) => vec![rule.clone()],
                None => {
                    deferred = Some(RequestError::RuleNotFound {
                        rule: name.to_string(),
                        group: args.group.to_string(),
                    });
                    Vec::new()
                }
            },
        },
    };

    req_verbose!(
        ctx.log,
        "reading {} bytes of input for group: {}, rules: [{}]...",
        args.len,
        args.group,
        rules
            .iter()
            .map(|r| r.name())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut buf = vec![0u8; args.len];
    let mut got = 0usize;
    let start = std::time::Instant::now();
    while !ctx.is_eof && got < args.len {
        match reader.read(&mut buf[got..]).await {
            Ok(0) => ctx.is_eof = true,
            Ok(n) => got += n,
            // The client hung up mid-frame; nothing further can be
            // written on this connection.
            Err(e) => return Err(HandlerError::Conn(e)),
        }
    }
    let md5_hex = hex::encode(Md5::digest(&buf));
    req_verbose!(
        ctx.log,
        "read {got} bytes of input with md5sum {md5_hex} in {:?}.",
        start.elapsed()
    );

    if let Some(e) = deferred {
        return Err(e.into());
    }
    if got < args.len {
        return Err(RequestError::InsufficientInput {
            got,
            want: args.len,
        }
        .into());
    }

    let (msg, store_id) = d.assemble(&ctx.log, &md5_hex, buf).await?;
    run_chain(
        d.store.as_ref(),
        &ctx.cancel,
        &ctx.log,
        &store_id,
        &msg,
        args.group,
        &rules,
    )
    .await?;
    Ok(())
}
