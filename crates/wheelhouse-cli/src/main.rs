//! Thin CLI front-end over the core crates: resolves a build request from
//! config-file-and-flags, then drives either a fresh `build` (resolve +
//! download + emit) or the `update` pipeline (stage + archive + diff +
//! swap + emit a diff package).
//!
//! Grounded on `puffin-cli::main`'s `clap`-derive `Cli`/`Commands` shape and
//! its top-level error handling (an `anyhow::Result` collected at `inner()`,
//! converted to a single logged line and an `ExitCode` in `main()`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use wheelhouse_client::RegistryClientBuilder;
use wheelhouse_resolver::Resolver;
use wheelhouse_tags::Target;

mod config;
mod logging;
mod wishlist;

use config::MirrorConfig;

#[derive(Parser)]
#[command(author, version, about = "Build and maintain a partial offline PyPI mirror")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose (debug) logging.
    #[arg(global = true, long, short)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the wishlist and download + index the closure fresh.
    Build(MirrorArgs),
    /// Run the incremental update pipeline against an existing mirror.
    Update(MirrorArgs),
}

#[derive(Args)]
struct MirrorArgs {
    /// Path to a `wheelhouse.toml` config file with a `[mirror]` table.
    #[arg(long)]
    config: Option<PathBuf>,

    /// A root package to include (repeatable). Combined with `--config`'s
    /// `packages`, if both are given.
    #[arg(long = "package")]
    packages: Vec<String>,

    /// A plaintext wishlist file (one package per line).
    #[arg(long)]
    wishlist_file: Option<PathBuf>,

    /// A target Python version, e.g. `3.12` (repeatable).
    #[arg(long = "python-version")]
    python_versions: Vec<String>,

    /// A target platform tag, e.g. `linux_x86_64` (repeatable).
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// The mirror's output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// The base URL the served mirror will be reachable at, if any. When
    /// unset, wheel URLs in the index are relative (`../../files/...`).
    #[arg(long)]
    base_url: Option<String>,

    /// Base URL of the upstream JSON API.
    #[arg(long)]
    pypi_url: Option<String>,

    /// Number of concurrent registry/download requests.
    #[arg(long)]
    concurrency: Option<usize>,
}

impl MirrorArgs {
    /// Merge an optional config file with the CLI flags that override it.
    /// Flags win when both are present; list fields are unioned.
    fn resolve(self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => MirrorConfig::load(path).with_context(|| format!("loading config {path:?}"))?,
            None => MirrorConfig {
                packages: Vec::new(),
                wishlist_file: None,
                python_versions: Vec::new(),
                platforms: Vec::new(),
                output_dir: PathBuf::from("mirror"),
                index_url: "https://pypi.org/simple".to_string(),
                pypi_url: "https://pypi.org/pypi".to_string(),
                base_url: None,
                concurrency: 10,
            },
        };

        config.packages.extend(self.packages);
        if let Some(wishlist_file) = self.wishlist_file {
            config.wishlist_file = Some(wishlist_file);
        }
        config.python_versions.extend(self.python_versions);
        config.platforms.extend(self.platforms);
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = Some(base_url);
        }
        if let Some(pypi_url) = self.pypi_url {
            config.pypi_url = pypi_url;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }

        if config.packages.is_empty() && config.wishlist_file.is_none() {
            anyhow::bail!("no packages given: pass --package, --wishlist-file, or --config");
        }
        if config.python_versions.is_empty() {
            anyhow::bail!("no target Python versions given: pass --python-version or --config");
        }
        if config.platforms.is_empty() {
            anyhow::bail!("no target platforms given: pass --platform or --config");
        }

        Ok(config)
    }

    fn wishlist(config: &MirrorConfig) -> Result<Vec<String>> {
        let mut names = config.packages.clone();
        if let Some(path) = &config.wishlist_file {
            names.extend(wishlist::parse_wishlist(path).with_context(|| format!("reading wishlist {path:?}"))?);
        }
        Ok(names)
    }
}

async fn run_build(args: MirrorArgs) -> Result<()> {
    let config = args.resolve()?;
    let wishlist = MirrorArgs::wishlist(&config)?;
    let targets = Target::product(&config.python_versions, &config.platforms);

    let client = RegistryClientBuilder::new()
        .pypi_url(&config.pypi_url)
        .concurrency(config.concurrency)
        .build();
    let resolver = Resolver::new(client, targets.clone()).concurrency(config.concurrency);

    info!("resolving closure for {} root package(s)", wishlist.len());
    let closure = resolver.resolve(&wishlist).await;
    info!("closure contains {} package(s)", closure.len());

    let files_dir = config.output_dir.join("files");
    let simple_dir = config.output_dir.join("simple");

    let downloader = wheelhouse_downloader::Downloader::new(files_dir.clone(), config.concurrency);
    let report = downloader.download_all(&closure, &targets).await?;
    info!(
        "downloaded {}, skipped {}, failed {}, refused {}",
        report.downloaded.len(),
        report.skipped_existing.len(),
        report.failed.len(),
        report.refused.len()
    );

    let packages: Vec<_> = closure.into_values().collect();
    wheelhouse_index::emit(&packages, &simple_dir, &files_dir, config.base_url.as_deref())?;
    info!("wrote index to {}", simple_dir.display());

    Ok(())
}

async fn run_update(args: MirrorArgs) -> Result<()> {
    let config = args.resolve()?;
    let wishlist = MirrorArgs::wishlist(&config)?;
    let targets = Target::product(&config.python_versions, &config.platforms);

    let client = RegistryClientBuilder::new()
        .pypi_url(&config.pypi_url)
        .concurrency(config.concurrency)
        .build();
    let resolver = Resolver::new(client, targets.clone()).concurrency(config.concurrency);

    let pipeline = wheelhouse_update::UpdatePipeline::new(
        resolver,
        config.concurrency,
        targets,
        config.output_dir.clone(),
        config.base_url.clone(),
    );

    let report = pipeline.run(&wishlist).await?;
    info!(
        "update {} complete: +{} wheels, -{} wheels, +{} index files, ~{} index files",
        report.timestamp,
        report.diff.added_wheels.len(),
        report.diff.removed_wheels.len(),
        report.diff.added_index_files.len(),
        report.diff.changed_index_files.len(),
    );
    info!("archive: {}", report.archive_dir.display());
    info!("diff package: {}", report.diff_dir.display());

    Ok(())
}

async fn inner() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose);

    match cli.command {
        Commands::Build(args) => run_build(args).await,
        Commands::Update(args) => run_update(args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match inner().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
