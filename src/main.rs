mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use tc_av::ToolRegistry;
use tc_core::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick levels from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transcoded=trace,tc_server=trace,tc_jobs=trace,tc_av=trace,tc_core=debug,tower_http=debug"
                .to_string()
        } else {
            "transcoded=info,tc_server=info,tc_jobs=info,tc_av=info,tc_core=info,tower_http=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref());
            config.apply_env();
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            tracing::info!("transcoded {} starting", env!("CARGO_PKG_VERSION"));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(tc_server::start(config))?;
            Ok(())
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("transcoded {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let registry = ToolRegistry::discover(&config.tools);
    let mut ffmpeg_ok = false;

    for tool in registry.check_all() {
        let status = if tool.available { "✓" } else { "✗" };
        if tool.name == "ffmpeg" {
            ffmpeg_ok = tool.available;
        }

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({version})");
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if ffmpeg_ok {
        println!("ffmpeg is available; the server can start.");
    } else {
        println!("ffmpeg is missing. Install it or set tools.ffmpeg_path.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    config.check()?;
    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!(
        "  Jobs: {} concurrent, queue {}, deadline {}s (max {}s)",
        config.jobs.max_concurrent_jobs,
        config.jobs.max_queue_length,
        config.jobs.default_deadline_secs,
        config.jobs.max_deadline_secs
    );
    println!("  Allowed schemes: {}", config.sources.allowed_schemes.join(", "));
    println!("  Formats: {}", config.formats.len());

    for warning in config.validate() {
        println!("  warning: {warning}");
    }

    Ok(())
}
