mod hub;
mod outposts;

use clap::Parser;
use hub::{HubConfig, HubState};
use outpost_core::{outpost_ipc::DEFAULT_MAX_FRAME_BYTES, SystemClock};
use outposts::OutpostCatalog;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const MAX_HELLO_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "outpost-hub", about = "Connection-state hub for outposts")]
struct Args {
    #[arg(long, env = "OUTPOST_HUB_ADDR", default_value = "127.0.0.1:9300")]
    addr: String,
    /// Seconds between HELLO messages expected from each outpost.
    #[arg(long, env = "OUTPOST_HELLO_INTERVAL", default_value_t = 5)]
    hello_interval: u64,
    #[arg(long, env = "OUTPOST_HUB_OUTPOSTS", default_value = "outposts.json")]
    outposts_file: PathBuf,
    /// Seconds between purges of expired instance records; 0 disables.
    #[arg(long, default_value_t = 10)]
    reap_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
    #[arg(long, env = "OUTPOST_LOG_DIR", default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl Args {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            hello_interval: Duration::from_secs(self.hello_interval.clamp(1, MAX_HELLO_INTERVAL_SECS)),
            reap_interval: Duration::from_secs(self.reap_interval),
            write_timeout: Duration::from_secs(self.write_timeout.max(1)),
            queue_capacity: self.queue_capacity,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: self.debug || env_true("OUTPOST_HUB_DEBUG"),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = args.hub_config();
    let _log_guard = init_logging(config.debug, &args.log_dir);

    let addr: SocketAddr = match args.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %args.addr);
            return;
        }
    };

    let catalog = match OutpostCatalog::load(&args.outposts_file) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "outposts_load_failed", error = format!("{err:#}"));
            return;
        }
    };
    info!(
        event = "outposts_loaded",
        path = %args.outposts_file.display(),
        count = catalog.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = Arc::new(HubState::new(
        config.clone(),
        Arc::new(catalog),
        Arc::new(SystemClock),
        shutdown_rx,
    ));
    hub.clone().spawn_state_reaper();

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %addr,
        hello_interval_secs = config.hello_interval.as_secs()
    );

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = hub::serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}

fn init_logging(debug: bool, log_dir: &str) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("OUTPOST_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }

    fn with_file(&self, op: impl FnOnce(&mut std::fs::File)) {
        if let Some(file) = &self.file {
            let mut guard = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut guard);
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        self.with_file(|file| {
            let _ = file.write_all(buf);
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        self.with_file(|file| {
            let _ = file.flush();
        });
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("outpost-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
