use clap::Parser;
use staple_server::{Config, Stapler};
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// staplerd - OCSP stapling cache and responder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "staplerd")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start the daemon)
    #[arg(short, long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            warn!("Could not load config file from: {}", cli.config_path);
            info!("Creating example configuration at: {}", cli.config_path);

            let example_config = Config::example();
            if let Err(e) = example_config.to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }

            info!("Please edit {} and restart the daemon", cli.config_path);
            process::exit(0);
        }
    };

    // If validate-only mode, print a summary and exit
    if cli.validate {
        println!("Configuration validated successfully!");
        println!();
        println!("Configuration summary:");
        println!("  Listen: {}", config.http_addr);
        println!("  Certificates: {}", config.certificates.len());
        println!("  Monitor tick: {}s", config.monitor_tick_secs);
        println!("  Fetch timeout: {}s", config.fetch_timeout_secs);
        println!(
            "  Cache folder: {}",
            config.cache_folder.as_deref().unwrap_or("(disabled)")
        );
        println!(
            "  Serve stale responses: {}",
            config.dont_die_on_stale_response
        );
        println!("  Log level: {}", config.log_level.as_deref().unwrap_or("info"));
        println!();

        if !config.upstream_responders.is_empty() {
            println!("Default upstream responders:");
            for responder in &config.upstream_responders {
                println!("  {}", responder);
            }
        } else {
            println!("No default upstream responders; entries rely on their own.");
        }

        process::exit(0);
    }

    // Initialize tracing with the configured log level
    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("staplerd v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);

    if config.certificates.is_empty() {
        warn!("No certificates configured; the responder will answer every request with 'unauthorized'");
    }

    let stapler = match Stapler::from_config(config).await {
        Ok(stapler) => stapler,
        Err(e) => {
            error!("Failed to start: {}", e);
            process::exit(1);
        }
    };

    info!("All entries initialized, serving");

    if let Err(e) = stapler.run().await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
