//! Accepts plain TCP locally and forwards every connection through the chain
//! to a `remote-forwarder`.
use std::{error::Error, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tunnelmw::{relay_bidirectional, Chain};
use tunnelmw_demos::{init_tracing, ChainArgs, Role};

#[derive(Parser, Debug)]
#[command(name = "local-forwarder", version, about = "Tunnel entry: plain TCP in, wrapped TCP out")]
struct Args {
    /// Address to accept plain connections on.
    #[arg(long, default_value = "0.0.0.0:10999")]
    listen: String,

    /// Address of the remote-forwarder.
    #[arg(long, default_value = "127.0.0.1:9999")]
    remote: String,

    /// Close a relay after this many idle seconds.
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    #[command(flatten)]
    chain: ChainArgs,
}

async fn forward(
    inbound: TcpStream,
    remote: &str,
    chain: &Chain,
    idle_timeout: Duration,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let outbound = TcpStream::connect(remote).await?;
    let outbound = chain.wrap_client(Box::new(outbound)).await?;
    let stats = relay_bidirectional(inbound, outbound, idle_timeout).await?;
    info!(up = stats.a_to_b, down = stats.b_to_a, "finish copy");
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let chain = Arc::new(args.chain.build(Role::Client)?);
    let listener = TcpListener::bind(&args.listen).await?;
    let idle_timeout = Duration::from_secs(args.idle_timeout);
    info!(listen = %args.listen, remote = %args.remote, chain = ?chain.names(), "local forwarder started");

    loop {
        let (inbound, peer) = listener.accept().await?;
        let chain = chain.clone();
        let remote = args.remote.clone();
        tokio::spawn(async move {
            info!(%peer, "start copy");
            if let Err(e) = forward(inbound, &remote, &chain, idle_timeout).await {
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
