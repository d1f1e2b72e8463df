use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use scrollcap_core::{
    CaptureConfig, CaptureReport, OutputFormat, OutputSettings, capture_snapshot, load_snapshot,
    render, report_to_raw_json, save_output, write_output,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "scrollcap",
    version,
    about = "Capture a virtualized chat conversation into an archive"
)]
struct Cli {
    /// Page snapshot JSON: layout rules plus the recorded conversation container
    snapshot: PathBuf,

    /// Output format: md, json or txt
    #[arg(long, short, default_value = "md")]
    format: String,

    /// Capture tunables as JSON; unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source name used in the archive header and file name
    #[arg(long)]
    source: Option<String>,

    /// Write the archive to this file instead of stdout
    #[arg(long, short, conflicts_with = "save")]
    output: Option<PathBuf>,

    /// Save as <source>-<date>.<ext> in the output directory
    /// (SCROLLCAP_OUTPUT_DIR, then the downloads directory, then home)
    #[arg(long)]
    save: bool,

    /// Output directory for --save
    #[arg(long, requires = "save")]
    out_dir: Option<PathBuf>,

    /// Debug logging for the capture loop
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "warn,scrollcap_core=debug"
    } else {
        "warn"
    };
    let env_filter = if verbose {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> scrollcap_core::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => CaptureConfig::from_file(path)?,
        None => CaptureConfig::default(),
    };
    let snapshot = load_snapshot(&cli.snapshot)?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("keyboard interrupt; stopping capture");
                cancel.cancel();
            }
        }
    });
    // Let the handler install before the capture starts.
    tokio::task::yield_now().await;
    let captured = capture_snapshot(snapshot, &config, cli.source.as_deref(), &cancel).await;
    interrupt.abort();
    let report = captured?;

    eprintln!("{}", summary(&report));

    let rendered = cli
        .format
        .parse::<OutputFormat>()
        .and_then(|format| render(&report, format).map(|contents| (format, contents)));
    let (format, contents, code) = match rendered {
        Ok((format, contents)) => (format, contents, ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("writing captured blocks as json instead");
            (
                OutputFormat::Json,
                report_to_raw_json(&report)?,
                ExitCode::from(1),
            )
        }
    };

    if let Some(path) = &cli.output {
        write_output(path, &contents)?;
        eprintln!("wrote {}", path.display());
    } else if cli.save {
        let settings = match cli.out_dir {
            Some(output_dir) => OutputSettings { output_dir },
            None => OutputSettings::from_env_or_home()?,
        };
        let path = save_output(&settings, &report, format, &contents)?;
        eprintln!("saved {} ({})", path.display(), format.mime_type());
    } else {
        print!("{contents}");
    }

    Ok(code)
}

fn summary(report: &CaptureReport) -> String {
    let mut line = format!(
        "captured {} blocks ({} messages, {} auxiliary notes) in {} iterations",
        report.blocks().len(),
        report.message_count(),
        report.note_count(),
        report.stats.iterations
    );
    if let Some(termination) = report.stats.termination {
        line.push_str(&format!("; {termination}"));
    }
    if report.is_partial() {
        line.push_str("; partial");
    }
    if !report.warnings.is_empty() {
        line.push_str(&format!("; {} warnings", report.warnings.len()));
    }
    line
}
