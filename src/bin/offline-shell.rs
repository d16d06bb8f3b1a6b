use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use offline_shell::{
    AppConfig, CacheManager, CacheStorage, Clients, DiskStorage, HttpNetwork, MemoryStorage,
    ServiceWorker, proxy,
};
use reqwest::Url;

// ============================================================================
// CLI Parsing
// ============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    config: Option<PathBuf>,
    upstream: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    cache_dir: Option<PathBuf>,
    memory: bool,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut opts = CliOptions::default();

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "-c" | "--config" => opts.config = Some(PathBuf::from(value()?)),
            "-u" | "--upstream" => opts.upstream = Some(value()?),
            "--host" => opts.host = Some(value()?),
            "-p" | "--port" => {
                let raw = value()?;
                opts.port = Some(raw.parse().map_err(|_| format!("invalid port: {raw}"))?);
            }
            "--cache-dir" => opts.cache_dir = Some(PathBuf::from(value()?)),
            "--memory" => opts.memory = true,
            "-h" | "--help" => opts.help = true,
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 1;
    }

    Ok(opts)
}

fn print_usage() {
    eprintln!("Usage: offline-shell [OPTIONS]");
    eprintln!();
    eprintln!("Runs a local proxy that serves an origin with an offline cache.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>    Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  -u, --upstream <URL>   Origin to proxy");
    eprintln!("      --host <HOST>      Bind address");
    eprintln!("  -p, --port <PORT>      Bind port");
    eprintln!("      --cache-dir <DIR>  Directory for the on-disk cache");
    eprintln!("      --memory           Keep the cache in memory only");
    eprintln!("  -h, --help             Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG to change log verbosity (default: info).");
}

fn apply(opts: CliOptions, mut config: AppConfig) -> AppConfig {
    if let Some(upstream) = opts.upstream {
        config.proxy.upstream = upstream;
    }
    if let Some(host) = opts.host {
        config.proxy.host = host;
    }
    if let Some(port) = opts.port {
        config.proxy.port = port;
    }
    if let Some(dir) = opts.cache_dir {
        config.paths.cache_dir = dir;
    }
    config
}

// ============================================================================
// Main
// ============================================================================

async fn run<S: CacheStorage>(storage: S, config: AppConfig) -> offline_shell::Result<()> {
    let upstream = Url::parse(&config.proxy.upstream)
        .map_err(|e| offline_shell::Error::InvalidUrl(format!("{}: {e}", config.proxy.upstream)))?;
    let timeout = (config.proxy.timeout_secs > 0).then(|| Duration::from_secs(config.proxy.timeout_secs));
    let network = HttpNetwork::with_timeout(timeout)?;

    let manager = CacheManager::new(config.cache.clone(), upstream.clone(), storage, network);
    let worker = Arc::new(ServiceWorker::new(manager, Arc::new(Clients::new())));
    worker.start().await?;

    proxy::serve(worker, upstream, &config.proxy.host, config.proxy.port).await
}

#[tokio::main]
async fn main() -> offline_shell::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("Error: {msg}");
            print_usage();
            std::process::exit(1);
        }
    };
    if opts.help {
        print_usage();
        std::process::exit(0);
    }

    let config_path = opts.config.clone().unwrap_or_else(AppConfig::default_path);
    let memory = opts.memory;
    let config = apply(opts, AppConfig::load(&config_path)?);
    log::info!("Cache {} for {}", config.cache.cache_name(), config.proxy.upstream);

    if memory {
        run(MemoryStorage::new(), config).await
    } else {
        log::info!("Cache directory: {}", config.paths.cache_dir.display());
        let storage = DiskStorage::new(config.paths.cache_dir.clone());
        run(storage, config).await
    }
}
