//! vidloc command-line entry point
//!
//! Replaces the people in a video with themed personas, keeping each
//! replacement identity consistent across segments.

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use tracing_subscriber::EnvFilter;
use vidloc_artifacts::steps;
use vidloc_core::{FailurePolicy, SegmentationPolicy};
use vidloc_pipeline::{PipelineConfig, TextRemovalMode};

/// vidloc main parser
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Localize a video for a transformation theme
    Run(RunArgs),
    /// Remove cached step results
    ClearCache(ClearCacheArgs),
}

/// What to do with a segment that cannot be regenerated
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyArg {
    /// Fail the whole run
    Abort,
    /// Keep the original clip for that segment
    Substitute,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Abort => FailurePolicy::Abort,
            PolicyArg::Substitute => FailurePolicy::SubstituteOriginal,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Source video (or image-sequence directory with --image-sequence)
    #[arg(value_hint = ValueHint::FilePath)]
    pub input: PathBuf,

    /// Transformation theme, e.g. "Japanese office workers"
    #[arg(short, long)]
    pub theme: String,

    /// Localized output video
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    /// Fixed segment length in seconds
    #[arg(long, conflicts_with = "shots")]
    pub interval: Option<f64>,

    /// Segment at detected shot changes
    #[arg(long)]
    pub shots: bool,

    /// Failure policy for segments that exhaust their retries
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Segments processed at the same time
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Pipeline configuration file (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Directory for intermediate artifacts
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub work_dir: Option<PathBuf>,

    /// Do not read or write the step cache
    #[arg(long)]
    pub no_cache: bool,

    /// Treat input and output as PNG image-sequence directories
    #[arg(long)]
    pub image_sequence: bool,

    /// Remove burned-in text locally instead of with the edit model
    #[arg(long)]
    pub local_inpaint: bool,

    /// Run report (JSON); defaults to <output>.report.json
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub report: Option<PathBuf>,

    /// Also write an EDL of the segment timeline
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub edl: Option<PathBuf>,

    /// Also write CSV segment markers
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub markers: Option<PathBuf>,
}

impl RunArgs {
    /// Flags take precedence over the config file
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(interval_secs) = self.interval {
            config.segmenter.policy = SegmentationPolicy::FixedInterval { interval_secs };
        } else if self.shots {
            config.segmenter.policy = SegmentationPolicy::shot_boundary();
        }
        if let Some(policy) = self.policy {
            config.failure_policy = policy.into();
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent_segments = concurrency;
        }
        if self.no_cache {
            config.use_cache = false;
        }
        if self.local_inpaint {
            config.text_removal = TextRemovalMode::LocalInpaint;
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.report
            .clone()
            .unwrap_or_else(|| self.output.with_extension("report.json"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClearCacheArgs {
    /// Only clear this step
    #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(steps::ALL))]
    pub step: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run(args).await,
        Commands::ClearCache(args) => commands::clear_cache(args).await,
    }
}
