use anyhow::{Context, Result};
use clap::Parser;
use coverage_summarizer::chapters::read_chapters;
use coverage_summarizer::{
    CheckpointStore, Cli, JsonlAttemptLedger, MechanicalRecallSetBuilder, SummaryJob,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let controls = cli.build_controls();

    let chapters = read_chapters(&cli.input)
        .with_context(|| format!("failed to load chapters from {}", cli.input.display()))?;
    anyhow::ensure!(!chapters.is_empty(), "no chapters found in {}", cli.input.display());

    let client = cli.build_client()?;
    let builder = MechanicalRecallSetBuilder::new(controls.hard_cap());
    let ledger = JsonlAttemptLedger::new(&cli.ledger);
    let job = SummaryJob::new(
        client.as_ref(),
        &builder,
        &ledger,
        controls,
        CheckpointStore::new(&cli.checkpoint_dir),
        &cli.evidence_dir,
    );

    let outcome = job.run(&chapters).await.context("summarization failed")?;
    println!("session: {}", outcome.session_id);
    println!(
        "chapters: {} ({} restored from checkpoints)",
        outcome.summaries.len(),
        outcome.resumed_chapters.len()
    );
    println!(
        "coverage: {:.1}%",
        outcome.report.overall_coverage_percentage
    );
    println!("report: {}", outcome.report_path.display());
    println!("digest: {}", outcome.markdown_path.display());
    println!("extractions: {}", outcome.extractions_path.display());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
