use clap::Parser;
use omnirpc::{Client, ClientConfig, ClientEvent};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address, e.g. http://127.0.0.1:8000/, ws://127.0.0.1:8001 or
    /// mqtt://127.0.0.1:1883/device.
    #[arg(default_value = "ws://127.0.0.1:8001")]
    pub address: String,

    /// Remote method.
    #[arg(short, long, default_value = "echo")]
    pub method: String,

    /// Arguments as JSON.
    #[arg(short, long, default_value = r#"{"name": "alice"}"#)]
    pub args: String,

    /// Tag attached to every request.
    #[arg(long, default_value = "")]
    pub tag: String,

    /// Request timeout.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Delay between reconnect attempts.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub reconnect_period: Duration,

    /// Print transport diagnostics.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, client: Arc<Client>, call_args: Value) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let state = state.clone();
        let client = client.clone();
        let call_args = call_args.clone();
        let args = args.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < args.secs {
                for _ in 0..256 {
                    let reply = client
                        .call(&args.method, call_args.clone(), &args.tag)
                        .recv()
                        .await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if !reply.is_ok() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                task.await.unwrap();
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s, pending: {}", client.pending_count());
            }
        } => {
        }
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> omnirpc::Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let call_args: Value = serde_json::from_str(&args.args)?;
    let mut config = ClientConfig {
        timeout: args.timeout,
        address: Some(args.address.clone()),
        debug: args.debug,
        ..Default::default()
    };
    config.transport_options.reconnect_period = args.reconnect_period;
    let client = Arc::new(Client::create(&config, None)?);

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Open => tracing::info!("connected"),
                ClientEvent::Reconnect => tracing::info!("reconnected"),
                ClientEvent::Close { code, reason } => {
                    tracing::warn!("disconnected: {code:?} {reason}")
                }
                ClientEvent::Error(e) => tracing::error!("{e}"),
                ClientEvent::Debug(info) => tracing::debug!("{info}"),
            }
        }
    });

    if tokio::time::timeout(args.timeout, client.wait_until_active())
        .await
        .is_err()
    {
        tracing::error!("{} not reachable within {:?}", args.address, args.timeout);
        return Ok(());
    }

    if args.stress {
        stress_test(args, client, call_args).await;
    } else {
        let reply = client.call(&args.method, call_args, &args.tag).recv().await;
        match reply.result {
            Ok(result) => tracing::info!("{} rsp: {result}", args.method),
            Err(e) => tracing::error!("{} failed: {e}", args.method),
        }
    }
    Ok(())
}
