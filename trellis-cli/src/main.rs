use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use trellis_cli::Overrides;
use trellis_compiler::Engine;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Trellis template compiler")]
struct Cli {
    /// Project directory holding trellis.toml
    #[arg(long, short = 'C', default_value = ".")]
    dir: PathBuf,
    /// Template root (overrides the config file)
    #[arg(long)]
    templates: Option<PathBuf>,
    /// On-disk cache directory (overrides the config file)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Compile on every call
    #[arg(long)]
    no_cache: bool,
    /// Warn about unknown directives instead of failing
    #[arg(long)]
    lenient: bool,
    /// Log debug output (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compiled program of one template, or a bundle of several.
    Compile {
        #[arg(required = true)]
        names: Vec<String>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Render a template with JSON bindings.
    Render {
        name: String,
        /// JSON file with the bindings, `-` for stdin
        #[arg(long, short)]
        data: Option<PathBuf>,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Compile templates (all of them by default) and report errors.
    Check { names: Vec<String> },
    /// Manage the compiled program cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Re-check templates whenever the template directory changes.
    Watch {
        names: Vec<String>,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop every cached program.
    Clear,
    /// Compile every template into the cache.
    Warm,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let overrides = Overrides {
        templates: cli.templates,
        cache_dir: cli.cache_dir,
        no_cache: cli.no_cache,
        lenient: cli.lenient,
    };
    let config = trellis_cli::load_config(&cli.dir, &overrides)?;
    let engine = Engine::from_config(&config);

    match cli.command {
        Commands::Compile { names, out } => {
            let code = trellis_cli::compile_cmd(&engine, &names)?;
            trellis_cli::emit(&code, out.as_deref())?;
        }
        Commands::Render { name, data, out } => {
            let data = trellis_cli::read_data(data.as_deref())?;
            let html = trellis_cli::render_cmd(&engine, &name, &data)?;
            trellis_cli::emit(&html, out.as_deref())?;
        }
        Commands::Check { names } => {
            let report = trellis_cli::check_cmd(&engine, &names)?;
            trellis_cli::report_check(&report);
            if !report.ok() {
                anyhow::bail!("{} template(s) failed to compile", report.failed.len());
            }
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear => {
                trellis_cli::cache_clear(&engine)?;
                println!("cache cleared");
            }
            CacheAction::Warm => {
                let report = trellis_cli::cache_warm(&engine)?;
                for (name, error) in &report.failed {
                    eprintln!("error: {name}: {error}");
                }
                println!(
                    "{} template(s) cached, {} failed",
                    report.compiled.len(),
                    report.failed.len()
                );
            }
        },
        Commands::Watch { names, interval } => {
            trellis_cli::watch_cmd(
                &engine,
                &config.templates,
                &names,
                Duration::from_millis(interval),
                None,
            )?;
        }
    }
    Ok(())
}
