use std::collections::BTreeSet;
use std::fs;

use coverage_summarizer::providers::ScriptedClient;
use coverage_summarizer::{
    Chapter, CheckpointStore, ChunkingConfig, ControllerConfig, CoverageReport, ErrorKind,
    JsonlAttemptLedger, MarkerAuditor, MechanicalRecallSetBuilder, MemoryRecorder, QualityGate,
    SummaryControls, SummaryError, SummaryJob,
};
use regex::Regex;

const EXTRACTION_REPLY: &str =
    r#"{"concepts": ["Delta", "Sediment"], "ideas": ["Floods renew soil"], "examples": ["The Nile delta"]}"#;

fn river_text(topic: &str) -> String {
    let sentence = format!("The {topic} river carries sediment downstream and builds a delta at its mouth. ");
    sentence.repeat(5)
}

fn book() -> Vec<Chapter> {
    vec![
        Chapter::new("1", "Rivers", river_text("long")),
        Chapter::new("2", "Deltas", river_text("wide")),
    ]
}

fn controls(session: &str) -> SummaryControls {
    SummaryControls::new(
        ChunkingConfig {
            target_words: 40,
            overlap_words: 5,
        },
        12,
        ControllerConfig::default(),
        4,
    )
    .with_session_id(Some(session.to_string()))
}

fn prompt_markers(prompt: &str) -> Vec<String> {
    let pattern = Regex::new(r"\[\[RS:cap\d+:[a-f0-9]{6}\|chunks:[0-9,]+\]\]").expect("pattern");
    let mut seen = Vec::new();
    for found in pattern.find_iter(prompt) {
        if !seen.iter().any(|m| m == found.as_str()) {
            seen.push(found.as_str().to_string());
        }
    }
    seen
}

/// Extracts the same concepts from every chunk and answers summaries with the
/// markers the prompt asks for, dropping the first one when `drop_first`.
fn cooperative_client(drop_first: bool) -> ScriptedClient {
    ScriptedClient::new(move |request| {
        if request.user.starts_with("Extract from the text below") {
            return Ok(EXTRACTION_REPLY.to_string());
        }
        let markers = prompt_markers(request.user);
        if request.user.contains("BULLETS:") {
            return Ok(markers
                .iter()
                .map(|m| format!("- Covered item {m}"))
                .collect::<Vec<_>>()
                .join("\n"));
        }
        let kept = if drop_first { &markers[1..] } else { &markers[..] };
        let body = kept
            .iter()
            .map(|m| format!("The river shapes land {m}."))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!(
            "SUMMARY:\n{body}\n\nKEY POINTS:\n- Sediment builds deltas\n\nQUOTES:\n\"builds a delta at its mouth\"\n\nEXAMPLES:\n- The Nile delta"
        ))
    })
}

#[tokio::test]
async fn river_book_reaches_full_coverage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = cooperative_client(false);
    let builder = MechanicalRecallSetBuilder::default();
    let ledger = JsonlAttemptLedger::new(dir.path().join("attempts.jsonl"));
    let job = SummaryJob::new(
        &client,
        &builder,
        &ledger,
        controls("river"),
        CheckpointStore::new(dir.path().join("checkpoints")),
        dir.path().join("evidence"),
    );

    let outcome = job.run(&book()).await.expect("job passes");
    assert_eq!(outcome.session_id, "river");
    assert_eq!(outcome.summaries.len(), 2);
    assert!(outcome.resumed_chapters.is_empty());
    assert_eq!(outcome.report.overall_coverage_percentage, 100.0);
    assert!(outcome.report.passed);
    assert_eq!(outcome.report.summary.chapters_failed, 0);
    for chapter in &outcome.report.chapters {
        assert!(chapter.recall_set.critical_items_total >= 2);
        assert_eq!(chapter.chunk_coverage_percentage, 100.0);
    }

    let reloaded = CoverageReport::load(&outcome.report_path).expect("strict load");
    assert!(QualityGate.evaluate(&reloaded).passed);
    assert!(outcome.markdown_path.exists());
    assert!(outcome.extractions_path.exists());

    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let expected: BTreeSet<String> = ["1".to_string(), "2".to_string()].into();
    assert_eq!(store.processed_chapters("river"), expected);

    let attempts = ledger.read_all().expect("ledger");
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.passed));
}

#[tokio::test]
async fn resumed_job_makes_no_generator_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));

    let first_client = cooperative_client(false);
    SummaryJob::new(
        &first_client,
        &builder,
        &recorder,
        controls("resume"),
        checkpoints.clone(),
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect("first run");

    let silent = ScriptedClient::from_responses(Vec::<String>::new());
    let outcome = SummaryJob::new(
        &silent,
        &builder,
        &recorder,
        controls("resume"),
        checkpoints,
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect("resumed run");

    assert_eq!(silent.call_count(), 0);
    assert_eq!(outcome.resumed_chapters, vec!["1".to_string(), "2".to_string()]);
    assert!(outcome.report.passed);
}

#[tokio::test]
async fn corrupted_checkpoint_is_recomputed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));

    let first_client = cooperative_client(false);
    SummaryJob::new(
        &first_client,
        &builder,
        &recorder,
        controls("repair"),
        checkpoints.clone(),
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect("first run");

    fs::write(checkpoints.path_for("repair", "1"), "{ truncated").expect("corrupt");

    let second_client = cooperative_client(false);
    let outcome = SummaryJob::new(
        &second_client,
        &builder,
        &recorder,
        controls("repair"),
        checkpoints.clone(),
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect("second run");

    assert_eq!(outcome.resumed_chapters, vec!["2".to_string()]);
    assert!(second_client.call_count() > 0);
    assert!(checkpoints.load("repair", "1").is_some());
}

#[tokio::test]
async fn addendum_closes_a_missing_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = cooperative_client(true);
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let outcome = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("addendum"),
        CheckpointStore::new(dir.path().join("checkpoints")),
        dir.path().join("evidence"),
    )
    .run(&book()[..1])
    .await
    .expect("job passes through the addendum");

    let chapter = &outcome.report.chapters[0];
    assert_eq!(chapter.audit_result.regeneration_count, 3);
    assert_eq!(chapter.audit_result.addendum_count, 1);
    assert_eq!(outcome.report.summary.chapters_using_addendum, 1);
    assert!(outcome.summaries[0].summary.contains("## Coverage (critical items)"));
}

#[tokio::test]
async fn exhausted_chapter_aborts_but_keeps_earlier_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(|request| {
        if request.user.starts_with("Extract from the text below") {
            return Ok(EXTRACTION_REPLY.to_string());
        }
        if request.user.contains("chapter 2") || request.user.contains("[[RS:cap2:") {
            return Ok("SUMMARY:\nNothing anchored here.".to_string());
        }
        let body = prompt_markers(request.user).join(" ");
        Ok(format!("SUMMARY:\nRiver facts {body}"))
    });
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));
    let err = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("exhaust"),
        checkpoints.clone(),
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect_err("chapter 2 cannot be covered");

    assert_eq!(err.kind(), ErrorKind::CoverageExhausted);
    assert!(matches!(err, SummaryError::Coverage(_)));
    let expected: BTreeSet<String> = ["1".to_string()].into();
    assert_eq!(checkpoints.processed_chapters("exhaust"), expected);
    assert!(!dir.path().join("evidence").join("coverage_report.json").exists());
}

#[tokio::test]
async fn river_flows_east_is_covered_on_second_attempt() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = tempfile::tempdir().expect("tempdir");
    let summaries = AtomicUsize::new(0);
    let client = ScriptedClient::new(move |request| {
        if request.user.starts_with("Extract from the text below") {
            return Ok(r#"{"concepts": ["The river flows east"], "ideas": [], "examples": []}"#.to_string());
        }
        if summaries.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok("SUMMARY:\nThe river is described without its marker.".to_string());
        }
        let marker = prompt_markers(request.user).join(" ");
        Ok(format!("SUMMARY:\nThe river flows east {marker}."))
    });
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let outcome = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("east"),
        CheckpointStore::new(dir.path().join("checkpoints")),
        dir.path().join("evidence"),
    )
    .run(&book()[..1])
    .await
    .expect("covered on the second attempt");

    let chapter = &outcome.report.chapters[0];
    assert_eq!(chapter.recall_set.critical_items_total, 1);
    assert!(chapter.audit_result.passed);
    assert!(chapter.audit_result.missing_markers.is_empty());
    assert!(chapter.audit_result.invalid_chunks.is_empty());
    assert_eq!(chapter.audit_result.regeneration_count, 1);
    let expected = format!(
        "[[RS:cap1:{}|chunks:0,1]]",
        &coverage_summarizer::item_id("The river flows east", "1")["RS:cap1:".len()..]
    );
    assert!(outcome.summaries[0].summary.contains(&expected));
    assert_eq!(recorder.records().len(), 2);
}

#[tokio::test]
async fn markers_listed_under_key_points_survive_in_the_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(|request| {
        if request.user.starts_with("Extract from the text below") {
            return Ok(EXTRACTION_REPLY.to_string());
        }
        let points = prompt_markers(request.user)
            .iter()
            .map(|m| format!("- River fact {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!(
            "SUMMARY:\nThe river builds a delta.\n\nKEY POINTS:\n{points}\n\nQUOTES:\n\"builds a delta\""
        ))
    });
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));
    let outcome = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("points"),
        checkpoints.clone(),
        dir.path().join("evidence"),
    )
    .run(&book()[..1])
    .await
    .expect("job passes");
    assert!(outcome.report.passed);

    let checkpoint = checkpoints.load("points", "1").expect("checkpoint");
    let stored = &checkpoint.chapter_summary;
    let recall_set = &checkpoint.coverage_report.recall_set;
    assert!(!recall_set.critical_items.is_empty());
    assert!(MarkerAuditor.audit(&stored.summary, recall_set, "1").passed);
    assert!(MarkerAuditor.audit(&stored.marked_text, recall_set, "1").passed);
}

#[tokio::test]
async fn roman_numeral_chapter_is_rejected_before_any_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = cooperative_client(false);
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let err = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("roman"),
        CheckpointStore::new(dir.path().join("checkpoints")),
        dir.path().join("evidence"),
    )
    .run(&[
        Chapter::new("1", "Rivers", river_text("long")),
        Chapter::new("II", "Deltas", river_text("wide")),
    ])
    .await
    .expect_err("roman numeral");

    assert!(matches!(err, SummaryError::InvalidInput(_)));
    assert!(err.to_string().contains("\"II\""));
    assert_eq!(client.call_count(), 0);
    assert!(!dir.path().join("checkpoints").exists());
}

#[tokio::test]
async fn session_id_with_path_separators_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = cooperative_client(false);
    let builder = MechanicalRecallSetBuilder::default();
    let recorder = MemoryRecorder::new();
    let checkpoints_dir = dir.path().join("store").join("checkpoints");
    let err = SummaryJob::new(
        &client,
        &builder,
        &recorder,
        controls("../escape"),
        CheckpointStore::new(&checkpoints_dir),
        dir.path().join("evidence"),
    )
    .run(&book())
    .await
    .expect_err("unsafe session id");

    assert!(matches!(err, SummaryError::InvalidInput(_)));
    assert_eq!(client.call_count(), 0);
    assert!(!dir.path().join("store").exists());
}
