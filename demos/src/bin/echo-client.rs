//! Sends a handful of messages through the chain and checks the echoes.
use std::{error::Error, process::ExitCode};

use clap::Parser;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{error, info};
use tunnelmw_demos::{init_tracing, ChainArgs, Role};

#[derive(Parser, Debug)]
#[command(name = "echo-client", version, about = "Talks to echo-server through a tunnelmw chain")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9091")]
    server: String,

    /// Number of messages to send.
    #[arg(long, default_value_t = 10)]
    count: usize,

    #[command(flatten)]
    chain: ChainArgs,
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let chain = args.chain.build(Role::Client)?;
    let socket = TcpStream::connect(&args.server).await?;
    let mut stream = chain.wrap_client(Box::new(socket)).await?;
    info!(chain = ?chain.names(), "connected to server: {}", args.server);

    let mut rng = rand::rng();
    for i in 1..=args.count {
        let message = format!("message {} [{:08x}]", i, rng.random::<u32>());
        stream.write_all(message.as_bytes()).await?;

        let mut echoed = vec![0; message.len()];
        stream.read_exact(&mut echoed).await?;
        if echoed != message.as_bytes() {
            return Err(format!("echo mismatch: {}", String::from_utf8_lossy(&echoed)).into());
        }
        info!("echo message received: {}", message);
    }

    stream.shutdown().await?;
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    info!("server closed connection");
    Ok(())
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
