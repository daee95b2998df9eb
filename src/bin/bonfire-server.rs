use clap::Parser;
use clap_derive::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use bonfire::server::{Server, ServerConfig};

#[derive(Parser)]
struct Args {
    /// UDP address to listen on
    #[clap(long, default_value = "0.0.0.0:7890")]
    listen_addr: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                cancel.cancel();
            }
        });
    }

    info!("bonfire server listening on {}", args.listen_addr);
    let server = Server::new(ServerConfig::new());
    server.listen(cancel, "udp", &args.listen_addr).await
}
