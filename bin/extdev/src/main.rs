mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use extdev_core::{BrowserEngine, Config, Paths};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "extdev")]
#[command(about = "Live-reload and verification tooling for browser extensions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to ~/.extdev/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

/// Browser connection overrides shared by the automation commands.
#[derive(Args, Clone, Debug, Default)]
pub struct BrowserArgs {
    /// chromium or firefox
    #[arg(long)]
    pub engine: Option<BrowserEngine>,

    /// Remote debugging host
    #[arg(long)]
    pub browser_host: Option<String>,

    /// Chromium remote debugging port
    #[arg(long)]
    pub cdp_port: Option<u16>,

    /// Firefox remote debugging port
    #[arg(long)]
    pub rdp_port: Option<u16>,
}

/// Which extension to drive.
#[derive(Args, Clone, Debug, Default)]
pub struct ExtensionArgs {
    /// Extension id
    #[arg(long)]
    pub id: Option<String>,

    /// Manifest name used to discover the id
    #[arg(long)]
    pub name: Option<String>,

    /// Unpacked extension directory to load
    #[arg(long)]
    pub load: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reload server and watch an extension directory
    Serve {
        /// Extension root containing manifest.json
        #[arg(long, default_value = ".")]
        ext: PathBuf,

        /// Port to listen on (overrides config reload.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config reload.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Connect to a reload server and reload extensions on change
    Connect {
        /// Reload server URL (defaults to the configured host and port)
        #[arg(long)]
        url: Option<String>,

        #[command(flatten)]
        browser: BrowserArgs,

        #[command(flatten)]
        extension: ExtensionArgs,
    },

    /// Server, watcher and in-process client in one; page snapshots go to stdout as NDJSON
    Dev {
        #[arg(long, default_value = ".")]
        ext: PathBuf,

        /// Only capture pages whose URL contains this
        #[arg(long)]
        url_filter: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[command(flatten)]
        browser: BrowserArgs,

        #[command(flatten)]
        extension: ExtensionArgs,
    },

    /// Force-reload an extension through the strategy chain
    Reload {
        #[command(flatten)]
        browser: BrowserArgs,

        #[command(flatten)]
        extension: ExtensionArgs,
    },

    /// Print the HTML of a page, extension shadow content merged in
    Capture {
        #[arg(long)]
        url_filter: Option<String>,

        /// Print a JSON summary instead of the HTML
        #[arg(long)]
        summary: bool,

        /// Wait for content-script injection first
        #[arg(long)]
        wait_injection: bool,

        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Discover the id of a running extension
    ExtId {
        /// Manifest name to match
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Run the deterministic live-reload verification
    Verify {
        #[arg(long, default_value = ".")]
        ext: PathBuf,

        /// Token version (defaults to the run id)
        #[arg(long)]
        token_version: Option<String>,

        /// Do not write a report file
        #[arg(long)]
        no_report: bool,

        /// Target command emitting NDJSON page snapshots
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Paths::new())?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    // stdout carries NDJSON events; logs stay on stderr.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { ext, port, host } => {
            if let Some(port) = port {
                config.reload.port = port;
            }
            if let Some(host) = host {
                config.reload.host = host;
            }
            commands::serve::run(&config, &ext).await?;
        }
        Commands::Connect {
            url,
            browser,
            extension,
        } => {
            commands::apply_browser_args(&mut config, &browser);
            commands::dev::connect(&config, url, &extension).await?;
        }
        Commands::Dev {
            ext,
            url_filter,
            port,
            browser,
            extension,
        } => {
            if let Some(port) = port {
                config.reload.port = port;
            }
            commands::apply_browser_args(&mut config, &browser);
            commands::dev::run(&config, &ext, url_filter, &extension).await?;
        }
        Commands::Reload { browser, extension } => {
            commands::apply_browser_args(&mut config, &browser);
            commands::browser::reload(&config, &extension).await?;
        }
        Commands::Capture {
            url_filter,
            summary,
            wait_injection,
            browser,
        } => {
            commands::apply_browser_args(&mut config, &browser);
            commands::browser::capture(&config, url_filter.as_deref(), summary, wait_injection)
                .await?;
        }
        Commands::ExtId { name, browser } => {
            commands::apply_browser_args(&mut config, &browser);
            commands::browser::ext_id(&config, name.as_deref()).await?;
        }
        Commands::Verify {
            ext,
            token_version,
            no_report,
            command,
        } => {
            commands::verify::run(&config, ext, token_version, command, !no_report).await?;
        }
    }

    Ok(())
}
