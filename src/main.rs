//! kademlia-node - Main entry point
//!
//! Runs a Kademlia DHT node until interrupted.

use anyhow::{Context, Result};
use kademlia_dht::{CliArgs, Configuration, InMemoryStorage, Kademlia, Key, Node};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Configuration::from_args(&args).context("Failed to build configuration")?;
    config.validate().context("Invalid configuration")?;
    let puts = args.puts()?;
    let seeds = args
        .bootstrap
        .iter()
        .map(|seed| seed.parse::<Node>().with_context(|| format!("Invalid bootstrap peer {:?}", seed)))
        .collect::<Result<Vec<_>>>()?;

    let dht = Kademlia::new(config, Arc::new(InMemoryStorage::new()))
        .await
        .context("Failed to start DHT node")?;
    display_node_info(&dht);

    if args.verbose {
        dht.add_event_listener("log", |event| debug!("Event: {:?}", event));
    }

    for seed in &seeds {
        match dht.bootstrap(seed).await {
            Ok(known) => info!("Bootstrapped from {} ({} peers known)", seed.id, known),
            Err(e) => warn!("Bootstrap from {} failed: {}", seed.id, e),
        }
    }
    dht.start_maintenance();

    for (name, value) in puts {
        let key = Key::from_name(&name);
        match dht.put(key, value).await {
            Ok(peers) => println!("put {} ({}) -> {} peers", name, key, peers),
            Err(e) => error!("put {} failed: {}", name, e),
        }
    }
    for name in &args.get {
        let key = Key::from_name(name);
        match dht.get(&key).await {
            Ok(value) => println!("get {} ({}) = {}", name, key, value),
            Err(e) => error!("get {} failed: {}", name, e),
        }
    }

    info!("Node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    dht.close();
    info!("kademlia-node finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

/// Display node identity and endpoints
fn display_node_info(dht: &Kademlia) {
    let config = dht.config();
    println!("Node:");
    println!("  ID: {}", dht.local_node().id);
    println!("  Contact: {}", dht.local_node());
    for addr in dht.listen_addrs() {
        println!("  Listening: udp://{}", addr);
    }
    println!();
    println!("Configuration:");
    println!("  k: {}", config.k);
    println!("  RPC timeout: {:?}", config.rpc_timeout);
    println!("  Get timeout: {:?}", config.get_timeout);
    println!("  Eviction: {:?}", config.eviction);
    match config.refresh_interval {
        Some(period) => println!("  Bucket refresh: every {:?}", period),
        None => println!("  Bucket refresh: disabled"),
    }
    match config.republish_interval {
        Some(period) => println!("  Republish: every {:?}", period),
        None => println!("  Republish: disabled"),
    }
    println!();
}
