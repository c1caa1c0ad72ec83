//! Command line front-end: download every model listed in the CSV directory.

use anyhow::{Context, bail};
use civitai_dl::csv_source::{
    list_csv_files, list_text_files, read_csv_entries, read_text_entries, rewrite_csv_urls,
    write_entries_csv, write_resolved_csv,
};
use civitai_dl::{
    BatchOrchestrator, BatchReport, CivitaiClient, Config, DownloadEngine, Normalizer,
    format_bytes, shutdown_signal, watch_progress,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Suffix of the CSV a batch's failed entries are written to
const FAILED_SUFFIX: &str = ".failed";

/// How often the aggregate progress line is printed while downloads run
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "civitai-dl", version, about = "Download CivitAI models listed in CSV files")]
struct Cli {
    /// Stable Diffusion installation directory; category folders are created below it
    #[arg(long = "sd", visible_alias = "stable-diffusion", value_name = "DIR", default_value = ".")]
    sd_path: PathBuf,

    /// Directory holding the model list CSVs (overrides the configuration)
    #[arg(long = "csv", visible_alias = "csvs-dir", value_name = "DIR")]
    csvs_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// CivitAI API key; saved to the configuration file
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Only process `<STEM>.csv`
    #[arg(long = "type", value_name = "STEM")]
    model_type: Option<String>,

    /// Resolve a single URL, ID or name, print its download URL and exit
    #[arg(long, value_name = "IDENTIFIER")]
    url: Option<String>,

    /// Rewrite the CSVs with canonical download URLs instead of downloading
    #[arg(long)]
    preprocess: bool,

    /// With --preprocess, also convert `*.txt` lists into CSVs
    #[arg(long, requires = "preprocess")]
    text_files: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "civitai_dl=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;
    if let Some(key) = &cli.api_key {
        config.api_key = key.trim().to_string();
        config.save(&cli.config)?;
        tracing::info!(path = %cli.config.display(), "Saved API key to configuration");
    }
    if let Some(dir) = &cli.csvs_dir {
        config.csvs_directory = dir.clone();
    }
    config.validate()?;
    if config.api_key.is_empty() {
        bail!(
            "no CivitAI API key configured; pass --api-key or set civitai_api_key in {}",
            cli.config.display()
        );
    }
    let config = Arc::new(config);

    let catalog = CivitaiClient::connect(
        &config.api_key,
        &config.catalog,
        config.download_settings.timeout,
    )
    .await
    .context("could not connect to the CivitAI catalog")?;
    let normalizer = Arc::new(Normalizer::new(Arc::new(catalog), &config.catalog)?);

    if let Some(identifier) = &cli.url {
        let resolution = normalizer
            .normalize(identifier)
            .await
            .with_context(|| format!("could not resolve {identifier:?}"))?;
        println!("{}", resolution.download_url);
        println!("  category: {}", resolution.category);
        if let Some(file_name) = &resolution.file_name {
            println!("  file:     {file_name}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let engine = DownloadEngine::new(Arc::clone(&config))?;
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    let orchestrator = BatchOrchestrator::new(normalizer, engine, &cli.sd_path);

    let csv_dir = config.csvs_directory.clone();
    if cli.preprocess {
        preprocess(&orchestrator, &csv_dir, cli.model_type.as_deref(), cli.text_files).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let files = model_lists(&csv_dir, cli.model_type.as_deref())?;
    if files.is_empty() {
        bail!("no model CSV files found in {}", csv_dir.display());
    }

    let mut downloaded = 0;
    let mut bytes = 0;
    let mut failed = 0;
    let mut unreadable = 0;
    for path in files {
        let entries = match read_csv_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Could not read model list");
                println!("{}: could not read list: {e}", stem(&path));
                unreadable += 1;
                continue;
            }
        };
        if entries.is_empty() {
            tracing::info!(path = %path.display(), "No entries, skipping");
            continue;
        }

        println!("{}: {} entries", stem(&path), entries.len());
        let reporter = tokio::spawn(watch_progress(
            orchestrator.subscribe(),
            orchestrator.engine().progress(),
            PROGRESS_INTERVAL,
            |line| println!("  {line}"),
        ));
        let report = orchestrator.run(entries).await;
        if let Err(e) = reporter.await {
            tracing::warn!(error = %e, "Progress reporter stopped");
        }
        print_summary(&report);
        let summary = report.summary();
        downloaded += summary.succeeded;
        bytes += summary.bytes;
        failed += summary.total() - summary.succeeded;

        let failed_entries = report.failed_entries();
        if !failed_entries.is_empty() {
            let failed_path = path.with_file_name(format!("{}{FAILED_SUFFIX}.csv", stem(&path)));
            match write_entries_csv(&failed_path, &failed_entries) {
                Ok(()) => println!("  failed entries written to {}", failed_path.display()),
                Err(e) => tracing::error!(
                    path = %failed_path.display(),
                    error = %e,
                    "Could not write failed entries"
                ),
            }
        }

        if orchestrator.engine().is_cancelled() {
            println!("Cancelled");
            break;
        }
    }

    println!(
        "Total: {downloaded} downloaded ({}), {failed} failed",
        format_bytes(bytes)
    );
    if unreadable > 0 {
        println!("{unreadable} list(s) could not be read");
    }

    Ok(if failed == 0 && unreadable == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// CSV lists to download: one stem if requested, otherwise every list except failed subsets
fn model_lists(dir: &Path, model_type: Option<&str>) -> anyhow::Result<Vec<PathBuf>> {
    if let Some(model_type) = model_type {
        let path = dir.join(format!("{model_type}.csv"));
        if !path.is_file() {
            bail!("{} does not exist", path.display());
        }
        return Ok(vec![path]);
    }

    let files = list_csv_files(dir)
        .with_context(|| format!("could not read {}", dir.display()))?
        .into_iter()
        .filter(|path| !stem(path).ends_with(FAILED_SUFFIX))
        .collect();
    Ok(files)
}

async fn preprocess(
    orchestrator: &BatchOrchestrator,
    dir: &Path,
    model_type: Option<&str>,
    text_files: bool,
) -> anyhow::Result<()> {
    for path in model_lists(dir, model_type)? {
        let entries = match read_csv_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Could not read model list");
                continue;
            }
        };
        let results = orchestrator.resolve_all(entries).await;
        let rewritten = rewrite_csv_urls(&path, &results)
            .with_context(|| format!("could not rewrite {}", path.display()))?;
        println!("{}: {rewritten}/{} resolved", path.display(), results.len());
    }

    if text_files {
        for path in list_text_files(dir)? {
            let entries = match read_text_entries(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Could not read text list");
                    continue;
                }
            };
            let results = orchestrator.resolve_all(entries).await;
            let resolved = results.iter().filter(|(_, r)| r.is_ok()).count();
            let output = path.with_extension("csv");
            write_resolved_csv(&output, &results)?;
            println!(
                "{} -> {}: {resolved}/{} resolved",
                path.display(),
                output.display(),
                results.len()
            );
        }
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    let summary = report.summary();
    println!(
        "  downloaded: {}, unresolved: {}, failed downloads: {}",
        summary.succeeded, summary.resolution_failed, summary.download_failed
    );
    for failure in report.failures() {
        println!(
            "  - [{}] {} ({}): {}",
            failure.entry.label,
            failure.entry.identifier(),
            failure.code,
            failure.message
        );
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
