use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cachesync::cache::{ClientIdentity, client_record, memory_store};
use cachesync::core::ColumnValues;
use cachesync::identity::load_clients;
use cachesync::protocol::RouteTable;
use cachesync::sync::{JsonLinesSink, LogNotifier, SystemClock};
use cachesync::upsert::BatchPolicy;
use cachesync::{
    CacheStore, Dispatcher, Downstreams, HandlerRegistry, IdentityResolver, NamedLocks, ProtocolServer, ReloadableRoutes,
    ServerConfig, StoreConnection, SyncPass, SyncScheduler, System, Value,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cachesync")]
#[command(about = "Cache store synchronization between ERP, hotel system and CRM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the protocol server and the sync scheduler
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        routes: Option<PathBuf>,
        #[arg(long)]
        sink: Option<PathBuf>,
        /// JSON array of ERP client rows loaded into the cache before serving
        #[arg(long)]
        clients: Option<PathBuf>,
    },
    /// Validate a route table file
    Routes {
        #[arg(long)]
        check: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, host, port, routes, sink, clients } => {
            let mut settings = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::new(),
            };
            if let Some(host) = host {
                settings = settings.host(&host);
            }
            if let Some(port) = port {
                settings = settings.port(port);
            }
            if let Some(routes) = routes {
                settings = settings.routes_path(routes);
            }
            if let Some(sink) = sink {
                settings = settings.sink_path(sink);
            }
            settings.validate()?;
            serve(settings, clients.as_deref()).await
        }
        Command::Routes { check } => check_routes(&check),
    }
}

async fn serve(settings: ServerConfig, clients: Option<&Path>) -> Result<()> {
    let store = Arc::new(memory_store()?);
    let resolver = IdentityResolver::new(Arc::new(NamedLocks::new()));
    let registry = HandlerRegistry::standard();

    if let Some(path) = clients {
        let mut conn = store.connect().await?;
        preload_clients(conn.as_mut(), &resolver, path, settings.batch_size).await?;
        conn.close().await?;
    }

    let routes = ReloadableRoutes::new(&settings.routes_path);
    routes
        .current(|name| registry.contains(name))
        .await
        .with_context(|| format!("Failed to load route table '{}'", settings.routes_path.display()))?;

    let clock = Arc::new(SystemClock);
    let crm = Arc::new(JsonLinesSink::new(&settings.sink_path, System::Sf));
    let pass = SyncPass::new(store.clone(), Downstreams::new(crm));
    let scheduler = SyncScheduler::new(
        Arc::new(pass),
        clock.clone(),
        Arc::new(LogNotifier),
        settings.interval(),
        settings.stale_lock_multiple,
    );

    let dispatcher = Dispatcher::new(routes, registry, store, resolver, clock)
        .with_skip_market_segments(settings.skip_market_segments.clone());
    let server = ProtocolServer::bind(&settings.addr(), Arc::new(dispatcher))
        .await
        .with_context(|| format!("Failed to bind {}", settings.addr()))?
        .with_scheduler(scheduler.clone())
        .with_max_frame(settings.max_frame_bytes);

    // sync changes left over from a previous run right away
    scheduler.request_pass(Duration::ZERO);

    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    scheduler.shutdown().await;
    Ok(())
}

fn json_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::from(s.as_str()),
        other => Value::from(other.to_string().as_str()),
    }
}

async fn preload_clients(
    conn: &mut dyn StoreConnection,
    resolver: &IdentityResolver,
    path: &Path,
    batch_size: usize,
) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read client file '{}'", path.display()))?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(&text).with_context(|| format!("Invalid client file '{}'", path.display()))?;

    let mut clients = Vec::with_capacity(rows.len());
    for row in &rows {
        let values: ColumnValues = row.iter().map(|(k, v)| (k.clone(), json_value(v))).collect();
        let mut rec = client_record();
        rec.set_system_values(System::Acu, &values);
        rec.pull(System::Acu);
        clients.push(ClientIdentity::from_record(&rec)?);
    }

    let report = load_clients(conn, resolver, clients, batch_size, BatchPolicy::SkipAndContinue).await?;
    info!(
        written = report.written,
        committed = report.committed,
        rolled_back = report.rolled_back,
        failures = report.failures.len(),
        "clients preloaded"
    );
    Ok(())
}

fn check_routes(path: &Path) -> Result<()> {
    let table = RouteTable::load(path)?;
    let registry = HandlerRegistry::standard();
    table.check_handlers(|name| registry.contains(name)).map_err(|e| {
        anyhow!("{} (known handlers: {})", e, registry.names().collect::<Vec<_>>().join(", "))
    })?;

    for oc in table.operation_codes() {
        println!("routed:  {}", oc);
    }
    for oc in table.ignored() {
        println!("ignored: {}", oc);
    }
    println!("Route table '{}' is valid", path.display());
    Ok(())
}
