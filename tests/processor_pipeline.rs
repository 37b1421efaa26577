mod common;

use common::{
    atlas_path, event, foilhole_path, gridsquare_manifest_path, gridsquare_metadata_path,
    micrograph_path, session_path, FakeParser, RecordingDatastore, SESSION,
};
use epu_ingest::{
    AtlasManifest, DatastoreError, EntityType, ErrorHandler, EventProcessor, FoilHoleManifest,
    FoilHolePosition, GridSquareManifest, GridSquareMetadata, GridSquarePosition, ManifestParser,
    MicrographManifest, ParseError, PipelineLog, ProcessOutcome, ProcessingStats,
    ProcessorOptions, RetryPolicy, SessionManifest,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn processor(parser: &Arc<FakeParser>, store: &Arc<RecordingDatastore>) -> EventProcessor {
    EventProcessor::new(parser.clone(), store.clone())
}

fn log_lines(log: &PipelineLog, level: &str) -> Vec<Value> {
    log.lines()
        .iter()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .filter(|line| line["level"] == level)
        .collect()
}

fn positions(ids: &[&str]) -> Vec<FoilHolePosition> {
    ids.iter()
        .map(|id| FoilHolePosition {
            foilhole_id: id.to_string(),
            x: 1.0,
            y: 2.0,
            diameter: 1.5,
        })
        .collect()
}

fn assert_balanced(stats: &ProcessingStats) {
    assert_eq!(
        stats.total_processed,
        stats.successful + stats.orphaned + stats.failed,
        "{stats:?}"
    );
}

fn square_positions(ids: &[&str]) -> Vec<GridSquarePosition> {
    ids.iter()
        .map(|id| GridSquarePosition {
            gridsquare_id: id.to_string(),
            x: 1.0,
            y: 1.0,
            width: 10.0,
            height: 10.0,
        })
        .collect()
}

#[test]
fn foilhole_orphan_resolves_when_gridsquare_arrives() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    assert_eq!(
        processor.process_event(event(&session_path())),
        ProcessOutcome::Success
    );

    // Micrograph first: its foil-hole is unknown and it is not parked.
    let outcome = processor.process_event(event(&micrograph_path("42", "7", "1_2_3_4")));
    assert_eq!(outcome, ProcessOutcome::Orphaned);
    assert_eq!(processor.get_stats().orphaned, 1);
    assert!(store.calls_for("create_micrograph").is_empty());
    assert_eq!(processor.get_orphan_stats().total_orphans, 0);

    // Foil-hole next: grid-square 42 is unknown so it waits.
    let outcome = processor.process_event(event(&foilhole_path("42", "7")));
    assert_eq!(outcome, ProcessOutcome::Orphaned);
    let orphans = processor.get_orphan_stats();
    assert_eq!(orphans.by_type.foilhole, 1);
    assert_eq!(orphans.total_orphans, 1);

    // Grid-square metadata releases the foil-hole.
    let outcome = processor.process_event(event(&gridsquare_metadata_path("42")));
    assert_eq!(outcome, ProcessOutcome::Success);
    let orphans = processor.get_orphan_stats();
    assert_eq!(orphans.total_orphans, 0);
    assert_eq!(orphans.by_type.foilhole, 0);
    assert_eq!(orphans.total_resolved, 1);
    assert_eq!(store.calls_for("create_gridsquare"), vec!["create_gridsquare:42"]);
    assert_eq!(store.calls_for("create_foilhole"), vec!["create_foilhole:7"]);

    let hole = processor.known_foilhole("7").unwrap();
    assert_eq!(hole.gridsquare_id, "42");
    assert!(!hole.placeholder);

    // The released foil-hole counts as processed work of its own.
    let stats = processor.get_stats();
    assert_eq!(stats.total_processed, 5);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.orphaned, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.orphans_resolved, 1);
    assert_balanced(&stats);
    assert_eq!(processor.get_summary().success_count, 3);

    let warnings = log_lines(processor.log(), "WARN");
    assert_eq!(warnings.len(), 2);
    assert!(warnings
        .iter()
        .any(|line| line["file_path"] == foilhole_path("42", "7").as_str()));
}

#[test]
fn batch_counts_are_folded_into_totals() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    let batch = processor.process_batch(vec![
        event(&session_path()),
        event(&micrograph_path("42", "7", "1_2_3_4")),
        event(&foilhole_path("42", "7")),
        event(&gridsquare_metadata_path("42")),
    ]);
    assert_eq!(
        batch,
        ProcessingStats {
            total_processed: 5,
            successful: 3,
            orphaned: 2,
            failed: 0,
            orphans_resolved: 1,
        }
    );
    processor.process_batch(vec![event(&session_path())]);
    let totals = processor.get_stats();
    assert_eq!(totals.total_processed, 6);
    assert_eq!(totals.successful, 4);
    assert_balanced(&totals);
    assert_eq!(store.calls_for("update_grid"), vec![format!("update_grid:{SESSION}")]);

    processor.reset_stats();
    assert_eq!(processor.get_stats(), ProcessingStats::default());
    assert!(processor.known_gridsquare("42").is_some());
}

#[test]
fn micrograph_orphans_cascade_when_registration_is_enabled() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = EventProcessor::builder(parser.clone(), store.clone())
        .options(ProcessorOptions {
            register_micrograph_orphans: true,
            requeue_retries: false,
        })
        .build();
    processor.process_event(event(&session_path()));

    assert_eq!(
        processor.process_event(event(&micrograph_path("42", "7", "1_2_3_4"))),
        ProcessOutcome::Orphaned
    );
    assert_eq!(processor.get_orphan_stats().by_type.micrograph, 1);
    processor.process_event(event(&foilhole_path("42", "7")));
    processor.process_event(event(&gridsquare_metadata_path("42")));

    assert_eq!(
        store.calls_for("create_micrograph"),
        vec!["create_micrograph:1_2_3_4"]
    );
    let micrograph = processor.known_micrograph("1_2_3_4").unwrap();
    assert_eq!(micrograph.foilhole_id, "7");
    let orphans = processor.get_orphan_stats();
    assert_eq!(orphans.total_orphans, 0);
    assert_eq!(orphans.total_resolved, 2);
    assert_eq!(processor.get_stats().orphans_resolved, 2);
}

#[test]
fn metadata_positions_create_placeholder_foilholes_in_bulk() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    parser.with_metadata(
        &gridsquare_metadata_path("42"),
        GridSquareMetadata {
            atlas_node_id: Some("n1".into()),
            stage_x: Some(0.5),
            stage_y: Some(0.25),
            foilhole_positions: positions(&["7", "8"]),
        },
    );
    let processor = processor(&parser, &store);
    processor.process_event(event(&session_path()));
    processor.process_event(event(&gridsquare_metadata_path("42")));

    assert_eq!(
        store.calls_for("create_foilholes"),
        vec!["create_foilholes:42:7,8"]
    );
    assert!(processor.known_foilhole("8").unwrap().placeholder);

    // A later manifest for hole 7 updates the placeholder instead of creating a duplicate.
    assert_eq!(
        processor.process_event(event(&foilhole_path("42", "7"))),
        ProcessOutcome::Success
    );
    assert_eq!(store.calls_for("update_foilhole"), vec!["update_foilhole:7"]);
    assert!(store.calls_for("create_foilhole").is_empty());
    assert!(!processor.known_foilhole("7").unwrap().placeholder);

    // The micrograph now finds its parent straight away.
    assert_eq!(
        processor.process_event(event(&micrograph_path("42", "8", "9_9"))),
        ProcessOutcome::Success
    );

    // Manifest for the same square merges into the cached entity.
    processor.process_event(event(&gridsquare_manifest_path("42")));
    let square = processor.known_gridsquare("42").unwrap();
    assert!(square.metadata.is_some());
    assert!(square.manifest.is_some());
    assert_eq!(store.calls_for("update_gridsquare"), vec!["update_gridsquare:42"]);
}

#[test]
fn atlas_and_gridsquare_wait_for_their_grid() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    parser.with_atlas(
        &atlas_path(),
        AtlasManifest {
            atlas_id: "atlas-1".into(),
            name: "Atlas".into(),
            gridsquare_positions: ["42", "43"]
                .iter()
                .map(|id| GridSquarePosition {
                    gridsquare_id: id.to_string(),
                    x: 1.0,
                    y: 1.0,
                    width: 10.0,
                    height: 10.0,
                })
                .collect(),
        },
    );
    let processor = processor(&parser, &store);

    assert_eq!(
        processor.process_event(event(&atlas_path())),
        ProcessOutcome::Orphaned
    );
    assert_eq!(
        processor.process_event(event(&gridsquare_metadata_path("42"))),
        ProcessOutcome::Orphaned
    );
    let orphans = processor.get_orphan_stats();
    assert_eq!(orphans.by_type.atlas, 1);
    assert_eq!(orphans.by_type.gridsquare, 1);

    assert_eq!(
        processor.process_event(event(&session_path())),
        ProcessOutcome::Success
    );
    assert_eq!(
        store.calls(),
        vec![
            format!("create_grid:{SESSION}"),
            format!("update_grid:{SESSION}"),
            "create_gridsquare:42".to_string(),
            "create_gridsquare:43".to_string(),
            format!("grid_registered:{SESSION}"),
            "update_gridsquare:42".to_string(),
        ]
    );
    let grid = processor.known_grid(SESSION).unwrap();
    assert_eq!(grid.atlas.unwrap().atlas_id, "atlas-1");
    let square = processor.known_gridsquare("42").unwrap();
    assert!(!square.placeholder);
    assert!(square.position.is_some());
    assert!(processor.known_gridsquare("43").unwrap().placeholder);
    assert_eq!(processor.get_orphan_stats().total_orphans, 0);
    assert_eq!(processor.get_stats().orphans_resolved, 2);
}

#[test]
fn unknown_events_fail_without_side_effects() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    processor.log().set_level(epu_ingest::LogLevel::Debug);
    let outcome = processor.process_event(event("/data/session1/notes.txt"));
    assert_eq!(outcome, ProcessOutcome::Failed);
    assert!(store.calls().is_empty());
    assert!(parser.calls().is_empty());
    assert_eq!(processor.get_error_stats().active_errors, 0);
    assert!(processor.get_error_stats().error_counts.is_empty());
    assert_eq!(processor.get_summary().failure_count, 0);
    assert_eq!(log_lines(processor.log(), "DEBUG").len(), 1);
    assert_eq!(processor.get_stats().failed, 1);
}

#[test]
fn transient_failures_are_recorded_as_retry_candidates() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    processor.process_event(event(&session_path()));
    processor.process_event(event(&gridsquare_metadata_path("42")));

    store.fail_next("create_foilhole", DatastoreError::http(503, "unavailable"));
    let path = foilhole_path("42", "7");
    assert_eq!(
        processor.process_event(event(&path)),
        ProcessOutcome::Failed
    );
    let errors = processor.get_error_stats();
    assert_eq!(errors.active_errors, 1);
    assert_eq!(errors.errors_by_category.get("transient_api"), Some(&1));
    assert_eq!(
        processor.get_summary().retry_distribution.get("transient_api"),
        Some(&1)
    );
    assert_eq!(processor.error_handler().scheduled_retries(), 0);
    let warnings = log_lines(processor.log(), "WARN");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0]["file_path"], path.as_str());

    // The next notification for the same file succeeds and clears the retry state.
    assert_eq!(
        processor.process_event(event(&path)),
        ProcessOutcome::Success
    );
    assert_eq!(processor.get_error_stats().active_errors, 0);
    assert!(processor.error_handler().retry_state(&path).is_none());
}

#[test]
fn exhausted_retries_and_permanent_errors_log_at_error() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = EventProcessor::builder(parser.clone(), store.clone())
        .error_handler(Arc::new(ErrorHandler::new(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        })))
        .build();
    processor.process_event(event(&session_path()));

    let metadata = gridsquare_metadata_path("42");
    parser.fail_next(&metadata, ParseError::incomplete("still being written"));
    parser.fail_next(&metadata, ParseError::incomplete("still being written"));
    assert_eq!(processor.process_event(event(&metadata)), ProcessOutcome::Failed);
    assert_eq!(log_lines(processor.log(), "WARN").len(), 1);
    assert_eq!(processor.process_event(event(&metadata)), ProcessOutcome::Failed);
    let errors = log_lines(processor.log(), "ERROR");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["message"]
        .as_str()
        .unwrap()
        .contains("retries exhausted"));
    assert!(processor.error_handler().is_marked_failed(&metadata));

    let foilhole = foilhole_path("42", "7");
    parser.fail_next(&foilhole, ParseError::malformed("unparseable xml"));
    assert_eq!(processor.process_event(event(&foilhole)), ProcessOutcome::Failed);
    let errors = log_lines(processor.log(), "ERROR");
    assert_eq!(errors.len(), 2);
    assert!(errors[1]["message"]
        .as_str()
        .unwrap()
        .contains("permanent failure"));
    let stats = processor.get_error_stats();
    assert_eq!(stats.error_counts.get("permanent_corrupt"), Some(&1));
    assert_eq!(stats.error_counts.get("transient_parser"), Some(&2));
    assert_eq!(processor.get_summary().failure_count, 3);
}

#[test]
fn retryable_failures_are_scheduled_when_requeue_is_enabled() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = EventProcessor::builder(parser.clone(), store.clone())
        .options(ProcessorOptions {
            register_micrograph_orphans: false,
            requeue_retries: true,
        })
        .build();
    store.fail_next("create_grid", DatastoreError::Timeout);
    assert_eq!(
        processor.process_event(event(&session_path())),
        ProcessOutcome::Failed
    );
    assert_eq!(processor.error_handler().scheduled_retries(), 1);
    assert!(processor.known_grid(SESSION).is_none());
}

#[test]
fn one_failing_event_does_not_abort_the_batch() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    parser.fail_next(&session_path(), ParseError::missing("gone"));
    let batch = processor.process_batch(vec![
        event(&session_path()),
        event(&session_path()),
        event("/data/session1/readme.md"),
    ]);
    assert_eq!(batch.total_processed, 3);
    assert_eq!(batch.failed, 2);
    assert_eq!(batch.successful, 1);
    assert_eq!(
        processor
            .get_error_stats()
            .error_counts
            .get("permanent_missing"),
        Some(&1)
    );
}

struct PanickingParser(Arc<FakeParser>);

impl ManifestParser for PanickingParser {
    fn parse_session_manifest(&self, path: &Path) -> Result<SessionManifest, ParseError> {
        self.0.parse_session_manifest(path)
    }

    fn parse_atlas_manifest(&self, path: &Path) -> Result<AtlasManifest, ParseError> {
        self.0.parse_atlas_manifest(path)
    }

    fn parse_gridsquare_metadata(&self, path: &Path) -> Result<GridSquareMetadata, ParseError> {
        self.0.parse_gridsquare_metadata(path)
    }

    fn parse_gridsquare_manifest(&self, path: &Path) -> Result<GridSquareManifest, ParseError> {
        self.0.parse_gridsquare_manifest(path)
    }

    fn parse_foilhole_manifest(&self, path: &Path) -> Result<FoilHoleManifest, ParseError> {
        self.0.parse_foilhole_manifest(path)
    }

    fn parse_micrograph_manifest(&self, _path: &Path) -> Result<MicrographManifest, ParseError> {
        panic!("parser bug");
    }
}

#[test]
fn handler_panic_is_contained_to_its_event() {
    let store = RecordingDatastore::new();
    let processor = EventProcessor::new(Arc::new(PanickingParser(FakeParser::new())), store.clone());
    let batch = processor.process_batch(vec![
        event(&micrograph_path("42", "7", "1")),
        event(&session_path()),
    ]);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.successful, 1);
    let errors = log_lines(processor.log(), "ERROR");
    assert!(errors[0]["message"]
        .as_str()
        .unwrap()
        .contains("parser bug"));
}

#[test]
fn status_snapshot_serializes_every_section() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    processor.process_event(event(&foilhole_path("42", "7")));
    let snapshot = processor.status_snapshot(None);
    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["stats"]["orphaned"], 1);
    assert_eq!(value["orphans"]["by_type"]["foilhole"], 1);
    assert!(value["errors"]["error_counts"].is_object());
    assert!(value["metrics"]["latency_percentiles"]["p50"].is_number());
    assert!(value.get("queue").is_none());
    let exposition = snapshot.render_metrics();
    assert!(exposition.contains("epu_ingest_orphans_pending{type=\"foilhole\"} 1"));
    epu_ingest::ensure_ms_only_metrics(&exposition).unwrap();
    assert_eq!(
        processor
            .orphans()
            .pending_for(EntityType::GridSquare, "42"),
        1
    );
}

#[test]
fn waiting_foilholes_are_released_even_when_bulk_create_fails() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let metadata = gridsquare_metadata_path("42");
    parser.with_metadata(
        &metadata,
        GridSquareMetadata {
            foilhole_positions: positions(&["8"]),
            ..GridSquareMetadata::default()
        },
    );
    let processor = processor(&parser, &store);
    processor.process_event(event(&session_path()));
    assert_eq!(
        processor.process_event(event(&foilhole_path("42", "7"))),
        ProcessOutcome::Orphaned
    );

    store.fail_next("create_foilholes", DatastoreError::http(503, "unavailable"));
    assert_eq!(processor.process_event(event(&metadata)), ProcessOutcome::Failed);
    assert!(processor.known_gridsquare("42").is_some());
    assert_eq!(
        processor
            .orphans()
            .pending_for(EntityType::GridSquare, "42"),
        0
    );
    assert_eq!(store.calls_for("create_foilhole"), vec!["create_foilhole:7"]);
    assert_eq!(processor.known_foilhole("7").unwrap().gridsquare_id, "42");
    assert!(processor.known_foilhole("8").is_none());

    let stats = processor.get_stats();
    assert_eq!(stats.total_processed, 4);
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.orphans_resolved, 1);
    assert_balanced(&stats);

    // Redelivery updates the square and retries only the missing hole.
    assert_eq!(processor.process_event(event(&metadata)), ProcessOutcome::Success);
    assert_eq!(store.calls_for("update_gridsquare"), vec!["update_gridsquare:42"]);
    assert_eq!(
        store.calls_for("create_foilholes"),
        vec!["create_foilholes:42:8"]
    );
    assert!(processor.known_foilhole("8").unwrap().placeholder);
}

#[test]
fn failed_release_is_counted_once_as_failed() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    let processor = processor(&parser, &store);
    processor.process_event(event(&session_path()));
    processor.process_event(event(&foilhole_path("42", "7")));

    store.fail_next("create_foilhole", DatastoreError::http(503, "unavailable"));
    assert_eq!(
        processor.process_event(event(&gridsquare_metadata_path("42"))),
        ProcessOutcome::Success
    );
    let stats = processor.get_stats();
    assert_eq!(stats.total_processed, 4);
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.orphaned, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.orphans_resolved, 0);
    assert_balanced(&stats);
    assert_eq!(processor.get_orphan_stats().total_orphans, 0);
    assert_eq!(processor.get_error_stats().active_errors, 1);
    assert!(processor
        .error_handler()
        .retry_state(&foilhole_path("42", "7"))
        .is_some());
}

#[test]
fn atlas_failure_midway_keeps_earlier_placeholders_and_releases() {
    let parser = FakeParser::new();
    let store = RecordingDatastore::new();
    parser.with_atlas(
        &atlas_path(),
        AtlasManifest {
            atlas_id: "atlas-1".into(),
            name: "Atlas".into(),
            gridsquare_positions: square_positions(&["41", "42", "43"]),
        },
    );
    let processor = processor(&parser, &store);
    processor.process_event(event(&session_path()));
    processor.process_event(event(&gridsquare_metadata_path("42")));
    assert_eq!(
        processor.process_event(event(&foilhole_path("41", "5"))),
        ProcessOutcome::Orphaned
    );

    store.fail_next("update_gridsquare", DatastoreError::http(500, "write failed"));
    assert_eq!(
        processor.process_event(event(&atlas_path())),
        ProcessOutcome::Failed
    );
    assert!(processor.known_gridsquare("41").unwrap().placeholder);
    assert_eq!(store.calls_for("create_foilhole"), vec!["create_foilhole:5"]);
    assert_eq!(processor.get_orphan_stats().total_orphans, 0);
    assert!(processor.known_gridsquare("43").is_none());
    assert!(store.calls_for("grid_registered").is_empty());
    assert_balanced(&processor.get_stats());

    // Redelivery walks the whole list again and finishes the registration.
    assert_eq!(
        processor.process_event(event(&atlas_path())),
        ProcessOutcome::Success
    );
    assert_eq!(
        store.calls_for("update_gridsquare"),
        vec!["update_gridsquare:41", "update_gridsquare:42"]
    );
    assert_eq!(
        store.calls_for("create_gridsquare"),
        vec![
            "create_gridsquare:42",
            "create_gridsquare:41",
            "create_gridsquare:43"
        ]
    );
    assert_eq!(
        store.calls_for("grid_registered"),
        vec![format!("grid_registered:{SESSION}")]
    );
}
