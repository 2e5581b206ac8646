//! Echoes every wrapped connection back to its sender.
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};
use tunnelmw::{LazyConn, WrappedListener};
use tunnelmw_demos::{init_tracing, ChainArgs, Role};

#[derive(Parser, Debug)]
#[command(name = "echo-server", version, about = "Echo server behind a tunnelmw chain")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9091")]
    listen: String,

    #[command(flatten)]
    chain: ChainArgs,
}

async fn echo(mut stream: LazyConn) -> std::io::Result<()> {
    let mut buf = vec![0; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return stream.shutdown().await;
        }
        info!("received message: {}", String::from_utf8_lossy(&buf[..n]));
        stream.write_all(&buf[..n]).await?;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.chain.log_level.as_deref());

    let listener = match args.chain.build(Role::Server) {
        Ok(chain) => WrappedListener::bind(&args.listen, chain).await,
        Err(e) => Err(e.into()),
    };
    let listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("listening on address: {}", args.listen);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {}", e);
                return ExitCode::FAILURE;
            }
        };
        info!(%addr, "new client");
        tokio::spawn(async move {
            match echo(stream).await {
                Ok(()) => info!(%addr, "client closed connection"),
                Err(e) => warn!(%addr, "echo failed: {}", e),
            }
        });
    }
}
