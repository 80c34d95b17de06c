use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_sample_graph::app::{App, ProgressSink, UploadOptions, UploadResult};
use kira_sample_graph::config::{ConfigLoader, ResolvedConfig, RowStoreSettings};
use kira_sample_graph::domain::Delimiter;
use kira_sample_graph::error::IngestError;
use kira_sample_graph::graph::GraphReport;
use kira_sample_graph::grouper::GroupingReport;
use kira_sample_graph::output::{JsonOutput, LogSink, OutputMode};
use kira_sample_graph::registry::{FhirHttpClient, MemoryRegistry, Registry};
use kira_sample_graph::row_store::{CouchRowStore, FileRowStore, RowStore};

#[derive(Parser)]
#[command(name = "kira-sg")]
#[command(about = "Turns sample metadata sheets into stored records and a linked resource graph")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    /// Column separator; detected from the header line when omitted.
    #[arg(long, global = true)]
    delimiter: Option<Delimiter>,

    /// Build everything in memory without writing to either store.
    #[arg(long, global = true)]
    dry_run: bool,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Group samples, store records and build the resource graph")]
    Upload(FileArgs),
    #[command(about = "Group samples and store records only")]
    Group(FileArgs),
    #[command(about = "Build the resource graph only")]
    Graph(FileArgs),
    #[command(about = "Print stored records of an upload as TSV")]
    Export(ExportArgs),
    #[command(about = "List stored uploads")]
    List,
    #[command(about = "Show a summary of one stored upload")]
    Info(NameArgs),
    #[command(about = "Delete stored records of an upload")]
    Delete(NameArgs),
}

#[derive(Args)]
struct FileArgs {
    path: Utf8PathBuf,
}

#[derive(Args)]
struct ExportArgs {
    filename: String,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct NameArgs {
    filename: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    if error.is_validation() {
        2
    } else if error.is_collaborator() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let registry = open_registry(&config, cli.dry_run)?;
    let store = open_row_store(&config)?;
    let app = App::new(
        &*registry,
        &*store,
        config.ingest.clone(),
        config.registry.cache_lookups,
    );
    let options = UploadOptions {
        delimiter: cli.delimiter,
        dry_run: cli.dry_run,
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &LogSink,
        OutputMode::NonInteractive => &JsonOutput,
    };

    match cli.command {
        Commands::Upload(args) => {
            let result = app.upload(&args.path, &options, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_upload(&result).into_diagnostic()?,
                OutputMode::Interactive => print_upload_summary(&result),
            }
        }
        Commands::Group(args) => {
            let result = app.group(&args.path, &options, sink)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_grouping(&result).into_diagnostic()?
                }
                OutputMode::Interactive => print_grouping(&result, cli.dry_run),
            }
        }
        Commands::Graph(args) => {
            let result = app.graph(&args.path, &options, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_graph(&result).into_diagnostic()?,
                OutputMode::Interactive => print_graph(&result),
            }
        }
        Commands::Export(args) => {
            let result = app.export(&args.filename, sink)?;
            if let Some(path) = &args.output {
                fs::write(path.as_std_path(), &result.tsv).into_diagnostic()?;
            }
            match (output_mode, &args.output) {
                (OutputMode::NonInteractive, _) => {
                    JsonOutput::print_export(&result).into_diagnostic()?
                }
                (OutputMode::Interactive, Some(path)) => {
                    println!("{} record(s) written to {path}", result.records)
                }
                (OutputMode::Interactive, None) => print!("{}", result.tsv),
            }
        }
        Commands::List => {
            let result = app.list(sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic()?,
                OutputMode::Interactive => {
                    if result.uploads.is_empty() {
                        println!("no stored uploads");
                    }
                    for upload in &result.uploads {
                        println!(
                            "{}\t{} samples\t{} cells\t{}",
                            upload.filename,
                            upload.samples,
                            upload.cells,
                            upload.created_at.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }
        Commands::Info(args) => {
            let result = app.info(&args.filename, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_info(&result).into_diagnostic()?,
                OutputMode::Interactive => {
                    println!("filename: {}", result.filename);
                    println!("created: {}", result.created_at.as_deref().unwrap_or("-"));
                    println!("samples: {}", result.samples);
                    println!("cells: {}", result.cells);
                    println!("species: {}", result.species.join(", "));
                    println!("sequence types: {}", result.sequence_types.join(", "));
                    println!(
                        "cellular resolutions: {}",
                        result.cellular_resolutions.join(", ")
                    );
                    println!("protocols: {}", result.protocols.join(", "));
                    println!("organs: {}", result.organs.join(", "));
                    println!("disorders: {}", result.disorders.join(", "));
                }
            }
        }
        Commands::Delete(args) => {
            let result = app.delete(&args.filename, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_delete(&result).into_diagnostic()?,
                OutputMode::Interactive => {
                    println!("deleted {} record(s) of {}", result.deleted, result.filename)
                }
            }
        }
    }
    Ok(())
}

fn open_registry(config: &ResolvedConfig, dry_run: bool) -> miette::Result<Box<dyn Registry>> {
    if dry_run {
        return Ok(Box::new(MemoryRegistry::new()));
    }
    Ok(Box::new(FhirHttpClient::new(&config.registry)?))
}

fn open_row_store(config: &ResolvedConfig) -> miette::Result<Box<dyn RowStore>> {
    match &config.row_store {
        RowStoreSettings::Couch(settings) => {
            let store = CouchRowStore::new(settings)?;
            store.ensure_database()?;
            Ok(Box::new(store))
        }
        RowStoreSettings::File { root } => Ok(Box::new(FileRowStore::new(root.clone()))),
    }
}

fn print_upload_summary(result: &UploadResult) {
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";
    println!("{cyan}kira-sg summary: {}{reset}", result.filename);
    print_grouping(&result.grouping, result.dry_run);
    print_graph(&result.graph);
}

fn print_grouping(report: &GroupingReport, dry_run: bool) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";
    let stored = if dry_run {
        "not stored (dry run)".to_string()
    } else {
        format!("{} chunk(s) stored", report.chunks_written)
    };
    println!(
        "{green}records: {} samples, {} cells, {stored}{reset}",
        report.records, report.cells
    );
    if report.skipped_rows > 0 {
        println!("{yellow}skipped rows: {}{reset}", report.skipped_rows);
    }
}

fn print_graph(report: &GraphReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";
    if report.already_ingested {
        println!("{yellow}graph: {} already ingested, nothing written{reset}", report.filename);
        return;
    }
    println!(
        "{green}specimens: {} created, {} existing{reset}",
        report.specimens.created, report.specimens.existing
    );
    println!(
        "{green}subjects: {} created, {} existing{reset}",
        report.subjects.created, report.subjects.existing
    );
    println!(
        "{green}batches: {} created, {} updated{reset}",
        report.batches.created, report.batches.updated
    );
    println!(
        "{green}sequencing: {} created, {} existing{reset}",
        report.sequencing.created, report.sequencing.existing
    );
    if !report.organs.is_empty() {
        println!("organs: {}", report.organs.join(", "));
    }
    if report.skipped_rows > 0 {
        println!("{yellow}skipped rows: {}{reset}", report.skipped_rows);
    }
}
