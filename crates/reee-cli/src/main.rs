//! reee — client for the reeed rule-evaluation daemon.
//!
//! `reee list` prints the daemon's rule groups; `reee eval <group>
//! [<rule>]` submits a message read from standard input for
//! evaluation. Remote log frames stream to stderr as they arrive.

mod client;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reee_core::addr::{default_net_addr, Network};
use reee_core::log::{Level, WriterPrinter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::{Client, CliError};

/// reee - submit mail to the reeed daemon
#[derive(Parser, Debug)]
#[command(name = "reee", version, about, long_about = None)]
struct Cli {
    /// Daemon address
    #[arg(long, env = "REEE_ADDR")]
    addr: Option<String>,

    /// Daemon network ("unix" or "tcp")
    #[arg(long, env = "REEE_NET")]
    net: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List rule groups and their rules
    List,

    /// Evaluate a rule group against a message read from stdin
    Eval {
        /// Rule group to evaluate
        group: String,

        /// Optional single rule to evaluate within the group
        rule: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let msg = e.to_string();
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                eprintln!("error: {msg}");
            }
            ExitCode::from(u8::try_from(e.code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let (default_net, default_addr) = default_net_addr();
    let net = match &cli.net {
        Some(s) => s
            .parse::<Network>()
            .map_err(|e| CliError::Usage(e.to_string()))?,
        None => default_net,
    };
    let addr = cli.addr.clone().unwrap_or(default_addr);

    let level = if cli.verbose {
        Level::Verbose
    } else {
        Level::Normal
    };
    let logger = WriterPrinter::new(level, std::io::stderr());

    let client = Client::connect(net, &addr, &logger).await?;

    match &cli.command {
        Commands::List => {
            let data = client.list().await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
            Ok(())
        }
        Commands::Eval { group, rule } => {
            let mut body = Vec::new();
            tokio::io::stdin().read_to_end(&mut body).await?;
            client.eval(group, rule.as_deref(), &body).await
        }
    }
}
