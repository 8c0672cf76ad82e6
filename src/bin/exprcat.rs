use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use exprcat::config::{ConfigLoader, ResolvedConfig};
use exprcat::domain::{CohortId, Orientation, OutputFormat};
use exprcat::engine::{BuildOptions, Engine};
use exprcat::error::ExprcatError;
use exprcat::gdc::GdcHttpClient;
use exprcat::genefilter::GencodeHttpClient;
use exprcat::object_store::FsObjectStore;
use exprcat::output::JsonOutput;

#[derive(Parser)]
#[command(name = "exprcat")]
#[command(about = "Assemble cohort expression datasets from per-sample artifacts")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, transform and assemble a cohort dataset")]
    Build(BuildArgs),
    #[command(about = "Export the flattened clinical table for a cohort")]
    Clinical(ClinicalArgs),
    #[command(about = "Warm the protein-coding gene filter cache")]
    Genes(GenesArgs),
}

#[derive(Args)]
struct BuildArgs {
    cohort: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    orientation: Option<Orientation>,

    #[arg(long)]
    format: Option<OutputFormat>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    sequential: bool,

    #[arg(long)]
    destination: Option<String>,
}

#[derive(Args)]
struct ClinicalArgs {
    cohort: String,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct GenesArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    refresh: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ExprcatError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ExprcatError) -> u8 {
    match error {
        ExprcatError::NoArtifactsFound(_) => 2,
        ExprcatError::MissingConfig => 2,
        ExprcatError::GdcHttp(_)
        | ExprcatError::GdcStatus { .. }
        | ExprcatError::AnnotationHttp(_)
        | ExprcatError::AnnotationStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Clinical(args) => run_clinical(args),
        Commands::Genes(args) => run_genes(args),
    }
}

fn build_engine(
    config: ResolvedConfig,
) -> miette::Result<Engine<FsObjectStore, GdcHttpClient, GencodeHttpClient>> {
    let store = FsObjectStore::new(config.store_root.clone());
    let metadata = GdcHttpClient::new()?;
    let annotation = GencodeHttpClient::new(config.annotation_url.clone())?;
    Ok(Engine::new(store, metadata, annotation, config))
}

fn run_build(args: BuildArgs) -> miette::Result<()> {
    if args.sequential && args.concurrency.is_some() {
        return Err(miette::Report::msg(
            "--sequential conflicts with --concurrency",
        ));
    }

    let cohort = args.cohort.parse::<CohortId>()?;
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let engine = build_engine(config)?;

    let concurrency = if args.sequential {
        Some(1)
    } else {
        args.concurrency
    };
    let options = BuildOptions {
        orientation: args.orientation,
        format: args.format,
        concurrency,
        destination: args.destination,
    };

    let result = engine.build_dataset(&cohort, &options)?;
    JsonOutput::print_build(&result).into_diagnostic()?;
    Ok(())
}

fn run_clinical(args: ClinicalArgs) -> miette::Result<()> {
    let cohort = args.cohort.parse::<CohortId>()?;
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let engine = build_engine(config)?;

    let result = engine.export_clinical(&cohort)?;
    JsonOutput::print_clinical(&result).into_diagnostic()?;
    Ok(())
}

fn run_genes(args: GenesArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let engine = build_engine(config)?;

    let result = engine.warm_gene_cache(args.refresh)?;
    JsonOutput::print_genes(&result).into_diagnostic()?;
    Ok(())
}
