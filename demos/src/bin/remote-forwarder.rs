//! Accepts wrapped connections from a `local-forwarder` and relays each one
//! to a plain TCP target.
use std::{error::Error, process::ExitCode, time::Duration};

use clap::Parser;
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tunnelmw::{relay_bidirectional, LazyConn, WrappedListener};
use tunnelmw_demos::{init_tracing, ChainArgs, Role};

#[derive(Parser, Debug)]
#[command(name = "remote-forwarder", version, about = "Tunnel exit: wrapped TCP in, plain TCP out")]
struct Args {
    /// Address to accept wrapped connections on.
    #[arg(long, default_value = "0.0.0.0:9999")]
    listen: String,

    /// Plain TCP service to forward to.
    #[arg(long)]
    target: String,

    /// Close a relay after this many idle seconds.
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    #[command(flatten)]
    chain: ChainArgs,
}

async fn forward(
    inbound: LazyConn,
    target: &str,
    idle_timeout: Duration,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let outbound = TcpStream::connect(target).await?;
    let stats = relay_bidirectional(inbound, outbound, idle_timeout).await?;
    info!(up = stats.a_to_b, down = stats.b_to_a, "finish copy");
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let chain = args.chain.build(Role::Server)?;
    info!(listen = %args.listen, target = %args.target, chain = ?chain.names(), "remote forwarder started");
    let listener = WrappedListener::bind(&args.listen, chain).await?;
    let idle_timeout = Duration::from_secs(args.idle_timeout);

    loop {
        let (inbound, peer) = listener.accept().await?;
        let target = args.target.clone();
        tokio::spawn(async move {
            if let Err(e) = forward(inbound, &target, idle_timeout).await {
                warn!(%peer, "forward failed: {}", e);
            }
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.chain.log_level.as_deref());
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
