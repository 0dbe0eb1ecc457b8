use clap::Parser;
use futures::StreamExt;
use pg_subscription::mapper::{JsonMapper, NameTransformation};
use pg_subscription::{cancellation, subscribe, Config, Result, SubscriptionOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-subscribe")]
#[command(about = "Snapshot a PostgreSQL table, then follow its changes as JSON lines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-subscribe");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.subscription.slot_name,
        publication = %config.subscription.publication_name,
        table = %config.subscription.table_name,
        "Configuration summary"
    );

    let options = SubscriptionOptions::from_config(&config, JsonMapper::new(NameTransformation::Identity))?;

    let (cancel_tx, cancel_rx) = cancellation();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping subscription");
                cancel_tx.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let mut events = Box::pin(subscribe(options, cancel_rx));
    let stdout = std::io::stdout();
    let mut delivered: u64 = 0;

    while let Some(event) = events.next().await {
        let event = event?;
        let line = serde_json::json!({
            "kind": event.kind,
            "lsn": event.position,
            "row": event.value,
        });

        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &line)?;
        out.write_all(b"\n")?;
        out.flush()?;
        delivered += 1;
    }

    info!(events = delivered, "Subscription ended");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_subscription=debug,pg_subscribe=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_subscription=info,pg_subscribe=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
