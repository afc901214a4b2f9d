use std::sync::Arc;

use clap::Parser;
use omnirpc_demo::DemoService;
use tokio::net::TcpListener;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub http_addr: std::net::SocketAddr,

    /// WebSocket listen address.
    #[arg(long, default_value = "0.0.0.0:8001")]
    pub ws_addr: std::net::SocketAddr,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let service = Arc::new(DemoService::default());
    let http = TcpListener::bind(args.http_addr).await?;
    let ws = TcpListener::bind(args.ws_addr).await?;
    tracing::info!(
        "Serving [echo, greet] on http://{} and ws://{}...",
        http.local_addr()?,
        ws.local_addr()?
    );

    tokio::select! {
        () = service.clone().serve_http(http) => {}
        () = service.serve_ws(ws) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
