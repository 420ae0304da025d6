use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use coverage_summarizer::QualityGate;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "quality-gate",
    about = "Pass/fail check over a persisted coverage_report.json"
)]
struct GateCli {
    /// Report to check
    #[arg(long, env = "COVSUM_REPORT", default_value = "data/evidence/coverage_report.json")]
    report: PathBuf,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = GateCli::parse();
    let verdict = QualityGate.check_file(&cli.report);
    if verdict.passed {
        println!("quality gate passed: {}", cli.report.display());
        return Ok(());
    }
    for error in &verdict.errors {
        println!("  - {error}");
    }
    bail!("quality gate failed for {}", cli.report.display())
}
