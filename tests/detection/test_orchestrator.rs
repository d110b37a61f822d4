// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detection run lifecycle against scripted detectors

use super::support::{
    idle_in_context, image, orchestrator, raw, FakeExecutorDetector, FakeInContextDetector,
};
use pii_redactor::detection::{
    BoundingBox, Detection, DetectionError, DetectionStatus, DetectionType, DetectionUpdate,
    ExecutorDetector, ExecutorEvent, InContextDetector, InContextKind,
};
use pii_redactor::redaction::RedactionStyle;
use pii_redactor::session::EditCommand;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn drain(updates: &mut broadcast::Receiver<DetectionUpdate>) -> Vec<DetectionUpdate> {
    let mut collected = Vec::new();
    while let Ok(update) = updates.try_recv() {
        collected.push(update);
    }
    collected
}

fn document_detector() -> FakeExecutorDetector {
    FakeExecutorDetector::new(
        DetectionType::Document,
        vec![
            raw("book", 0.9, 10.0, 10.0, 100.0, 50.0),
            raw("person", 0.95, 200.0, 200.0, 50.0, 50.0),
            raw("laptop", 0.4, 300.0, 300.0, 50.0, 50.0),
            raw("tv", 0.8, 700.0, 500.0, 200.0, 200.0),
        ],
    )
}

fn plate_detector() -> FakeExecutorDetector {
    FakeExecutorDetector::new(
        DetectionType::LicensePlate,
        vec![
            raw("license_plate", 0.85, 40.0, 60.0, 120.0, 30.0),
            raw("license_plate", 0.2, 0.0, 0.0, 10.0, 10.0),
        ],
    )
}

#[tokio::test]
async fn test_document_run_downloads_before_detecting() {
    let document = Arc::new(document_detector().needs_download(vec![25.0, 50.0, 75.0, 100.0]));
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![document.clone()], face, text);
    let mut updates = orchestrator.subscribe();

    assert!(orchestrator.requires_download(&[DetectionType::Document]));
    orchestrator
        .start_detection(Some(image(800, 600)), &[DetectionType::Document], true)
        .unwrap();
    assert_eq!(orchestrator.status(), DetectionStatus::Downloading);

    let status = orchestrator.run_until_settled().await;
    assert_eq!(status, DetectionStatus::Idle);

    let updates = drain(&mut updates);
    let reached_full = updates
        .iter()
        .position(|u| matches!(u, DetectionUpdate::DownloadProgress(p) if *p >= 100.0))
        .expect("download progress should reach 100");
    let first_progress = updates
        .iter()
        .position(|u| matches!(u, DetectionUpdate::Progress { .. }))
        .expect("detection progress expected");
    assert!(reached_full < first_progress);

    let results = orchestrator.results();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|d| d.detection_type == DetectionType::Document));
    assert!(orchestrator.state().models_loaded[&DetectionType::Document]);
    assert!(!orchestrator.requires_download(&[DetectionType::Document]));
    assert!(matches!(
        updates.last(),
        Some(DetectionUpdate::Completed { total: 2 })
    ));
}

#[tokio::test]
async fn test_detections_are_well_formed() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(
        vec![Arc::new(document_detector()), Arc::new(plate_detector())],
        face,
        text,
    );

    orchestrator
        .start_detection(
            Some(image(800, 600)),
            &[DetectionType::Document, DetectionType::LicensePlate],
            false,
        )
        .unwrap();
    orchestrator.run_until_settled().await;

    let results = orchestrator.results();
    assert_eq!(results.len(), 3);
    for detection in results {
        assert!((0.0..=1.0).contains(&detection.confidence));
        assert!(detection.bbox.width > 0 && detection.bbox.height > 0);
        assert!(detection.bbox.x + detection.bbox.width <= 800);
        assert!(detection.bbox.y + detection.bbox.height <= 600);
        assert!(detection.selected);
    }

    // The clipped television keeps only its visible part
    let tv = results
        .iter()
        .find(|d| d.label.as_deref() == Some("tv"))
        .unwrap();
    assert_eq!(tv.bbox, BoundingBox::new(700, 500, 100, 100));
}

#[tokio::test]
async fn test_validation_leaves_state_unchanged() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(
        vec![Arc::new(document_detector().needs_download(vec![100.0]))],
        face,
        text,
    );
    let before = orchestrator.state().clone();

    let err = orchestrator
        .start_detection(Some(image(10, 10)), &[], true)
        .unwrap_err();
    assert!(matches!(err, DetectionError::Validation(_)));

    let err = orchestrator
        .start_detection(None, &[DetectionType::Face], true)
        .unwrap_err();
    assert!(matches!(err, DetectionError::Validation(_)));

    let err = orchestrator
        .start_detection(Some(image(10, 10)), &[DetectionType::Document], false)
        .unwrap_err();
    assert_eq!(
        err,
        DetectionError::Validation("Model download requires consent".into())
    );

    assert_eq!(orchestrator.state(), &before);
    assert_eq!(orchestrator.status(), DetectionStatus::Idle);
}

#[tokio::test]
async fn test_second_start_while_busy_is_rejected() {
    let document = Arc::new(document_detector().with_delay(Duration::from_millis(50)));
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![document.clone()], face, text);

    let first = orchestrator
        .start_detection(Some(image(800, 600)), &[DetectionType::Document], false)
        .unwrap();
    let err = orchestrator
        .start_detection(Some(image(800, 600)), &[DetectionType::Face], false)
        .unwrap_err();
    assert_eq!(err, DetectionError::Busy);
    assert_eq!(orchestrator.state().request_id, Some(first));
    assert_eq!(orchestrator.state().enabled_types, vec![DetectionType::Document]);

    orchestrator.run_until_settled().await;
    assert_eq!(document.detect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_events_are_ignored() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![Arc::new(plate_detector())], face, text);

    let request_id = orchestrator
        .start_detection(Some(image(200, 200)), &[DetectionType::LicensePlate], false)
        .unwrap();

    orchestrator
        .handle_executor_event(ExecutorEvent::PartialResults {
            request_id: request_id + 41,
            detections: vec![Detection::new(
                DetectionType::LicensePlate,
                BoundingBox::new(0, 0, 5, 5),
                0.9,
                None,
            )],
        })
        .await;
    orchestrator
        .handle_executor_event(ExecutorEvent::Error {
            request_id: request_id + 41,
            message: "old run failed".to_string(),
        })
        .await;

    assert!(orchestrator.results().is_empty());
    assert!(orchestrator.is_busy());

    orchestrator.run_until_settled().await;
    assert_eq!(orchestrator.status(), DetectionStatus::Idle);
    assert_eq!(orchestrator.results().len(), 1);
    assert!(orchestrator.state().error.is_none());
}

#[tokio::test]
async fn test_cancel_keeps_partial_results() {
    let plate = Arc::new(plate_detector());
    let document = Arc::new(document_detector().with_delay(Duration::from_millis(200)));
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![plate, document.clone()], face, text);
    let mut updates = orchestrator.subscribe();

    orchestrator
        .start_detection(
            Some(image(800, 600)),
            &[DetectionType::LicensePlate, DetectionType::Document],
            false,
        )
        .unwrap();

    // Process events until the plate batch has landed
    while orchestrator.results().is_empty() {
        let event = orchestrator.next_event().await.unwrap();
        orchestrator.handle_executor_event(event).await;
    }
    orchestrator.cancel_detection().unwrap();

    let status = orchestrator.run_until_settled().await;
    assert_eq!(status, DetectionStatus::Cancelled);
    assert_eq!(orchestrator.results().len(), 1);
    assert!(orchestrator
        .results()
        .iter()
        .all(|d| d.detection_type == DetectionType::LicensePlate));
    assert!(drain(&mut updates)
        .iter()
        .any(|u| matches!(u, DetectionUpdate::Cancelled)));

    // A fresh run starts cleanly afterwards
    orchestrator
        .start_detection(Some(image(800, 600)), &[DetectionType::LicensePlate], false)
        .unwrap();
    assert!(orchestrator.results().is_empty());
    assert_eq!(orchestrator.run_until_settled().await, DetectionStatus::Idle);
}

#[tokio::test]
async fn test_completion_waits_for_in_context_detectors() {
    let face = Arc::new(
        FakeInContextDetector::new(
            InContextKind::Face,
            vec![BoundingBox::new(5, 5, 40, 40), BoundingBox::new(100, 20, 30, 30)],
        )
        .with_delay(Duration::from_millis(30)),
    );
    let text = Arc::new(FakeInContextDetector::new(
        InContextKind::Text,
        vec![BoundingBox::new(10, 150, 60, 12)],
    ));
    let mut orchestrator = orchestrator(
        vec![Arc::new(plate_detector())],
        face.clone(),
        text.clone(),
    );
    let mut updates = orchestrator.subscribe();

    orchestrator
        .start_detection(
            Some(image(200, 200)),
            &[DetectionType::LicensePlate, DetectionType::Text, DetectionType::Face],
            false,
        )
        .unwrap();
    orchestrator.run_until_settled().await;

    assert_eq!(face.calls.load(Ordering::SeqCst), 1);
    assert_eq!(text.calls.load(Ordering::SeqCst), 1);

    let results = orchestrator.results();
    let count = |t: DetectionType| results.iter().filter(|d| d.detection_type == t).count();
    assert_eq!(count(DetectionType::Face), 2);
    assert_eq!(count(DetectionType::Text), 1);
    assert_eq!(count(DetectionType::LicensePlate), 1);

    let updates = drain(&mut updates);
    let completed: Vec<_> = updates
        .iter()
        .filter(|u| matches!(u, DetectionUpdate::Completed { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
    assert!(matches!(updates.last(), Some(DetectionUpdate::Completed { total: 4 })));
}

#[tokio::test]
async fn test_failing_detector_does_not_abort_siblings() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(
        vec![
            Arc::new(plate_detector().failing()),
            Arc::new(document_detector()),
        ],
        face,
        text,
    );

    orchestrator
        .start_detection(
            Some(image(800, 600)),
            &[DetectionType::LicensePlate, DetectionType::Document],
            false,
        )
        .unwrap();

    assert_eq!(orchestrator.run_until_settled().await, DetectionStatus::Idle);
    assert_eq!(orchestrator.results().len(), 2);
    assert!(orchestrator.state().error.is_none());
}

#[tokio::test]
async fn test_empty_image_reports_error() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![Arc::new(plate_detector())], face, text);

    orchestrator
        .start_detection(Some(image(0, 0)), &[DetectionType::LicensePlate], false)
        .unwrap();

    assert_eq!(orchestrator.run_until_settled().await, DetectionStatus::Error);
    assert!(orchestrator.state().error.is_some());
    assert!(!orchestrator.is_busy());
}

#[tokio::test]
async fn test_selection_and_redaction_commands() {
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![Arc::new(document_detector())], face, text);

    orchestrator
        .start_detection(Some(image(800, 600)), &[DetectionType::Document], false)
        .unwrap();
    orchestrator.run_until_settled().await;

    let first_id = orchestrator.results()[0].id.clone();
    assert_eq!(orchestrator.toggle_selected(&first_id), Some(false));
    assert_eq!(orchestrator.toggle_selected("missing"), None);
    assert_eq!(orchestrator.selected_detections().len(), 1);

    let commands = orchestrator.redaction_commands(RedactionStyle::Pixelate, 150);
    assert_eq!(commands.len(), 1);
    match &commands[0] {
        EditCommand::Rect {
            style, intensity, ..
        } => {
            assert_eq!(*style, RedactionStyle::Pixelate);
            assert_eq!(*intensity, 100);
        }
        other => panic!("unexpected command {:?}", other),
    }

    orchestrator.set_all_selected(false);
    assert!(orchestrator.redaction_commands(RedactionStyle::Solid, 70).is_empty());

    orchestrator.clear_results();
    assert!(orchestrator.results().is_empty());
}

#[tokio::test]
async fn test_release_models() {
    let document = Arc::new(document_detector());
    let (face, text) = idle_in_context();
    let mut orchestrator = orchestrator(vec![document.clone()], face.clone(), text);

    orchestrator.release_models().unwrap();
    assert!(!orchestrator.state().models_loaded[&DetectionType::Document]);
    assert!(!face.is_loaded());

    // The executor processes the release after any queued work
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!document.is_loaded());
}

#[tokio::test]
async fn test_cancel_interrupts_in_context_detection() {
    let face = Arc::new(
        FakeInContextDetector::new(InContextKind::Face, vec![BoundingBox::new(5, 5, 40, 40)])
            .with_delay(Duration::from_secs(30)),
    );
    let text = Arc::new(FakeInContextDetector::idle(InContextKind::Text));
    let mut orchestrator = orchestrator(vec![Arc::new(plate_detector())], face.clone(), text);

    orchestrator
        .start_detection(
            Some(image(200, 200)),
            &[DetectionType::LicensePlate, DetectionType::Face],
            false,
        )
        .unwrap();

    while face.calls.load(Ordering::SeqCst) == 0 {
        let event = orchestrator.next_event().await.unwrap();
        orchestrator.handle_executor_event(event).await;
    }
    orchestrator.cancel_detection().unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), orchestrator.run_until_settled())
        .await
        .expect("cancel should not wait for the face detector");
    assert_eq!(status, DetectionStatus::Cancelled);
    assert!(orchestrator
        .results()
        .iter()
        .all(|d| d.detection_type != DetectionType::Face));

    orchestrator
        .start_detection(Some(image(200, 200)), &[DetectionType::LicensePlate], false)
        .unwrap();
    assert_eq!(orchestrator.run_until_settled().await, DetectionStatus::Idle);
    assert_eq!(orchestrator.results().len(), 1);
}

#[tokio::test]
async fn test_in_context_download_and_progress_tracked() {
    let face = Arc::new(
        FakeInContextDetector::new(InContextKind::Face, vec![BoundingBox::new(5, 5, 40, 40)])
            .needs_download(vec![25.0, 50.0, 100.0])
            .with_delay(Duration::from_millis(20)),
    );
    let text = Arc::new(FakeInContextDetector::idle(InContextKind::Text));
    let mut orchestrator = orchestrator(Vec::new(), face.clone(), text);
    let mut updates = orchestrator.subscribe();

    assert!(orchestrator.requires_download(&[DetectionType::Face]));
    orchestrator
        .start_detection(Some(image(200, 200)), &[DetectionType::Face], true)
        .unwrap();
    assert_eq!(orchestrator.status(), DetectionStatus::Downloading);

    let mut saw_half_way = false;
    while orchestrator.is_busy() {
        let event = orchestrator.next_event().await.unwrap();
        orchestrator.handle_executor_event(event).await;

        let state = orchestrator.state();
        if state.progress == 50.0 && state.current_stage == "Detecting faces" {
            assert_eq!(state.status, DetectionStatus::Detecting);
            assert_eq!(state.download_progress, 100.0);
            saw_half_way = true;
        }
    }
    assert!(saw_half_way);
    assert_eq!(orchestrator.status(), DetectionStatus::Idle);
    assert_eq!(orchestrator.results().len(), 1);
    assert!(orchestrator.state().models_loaded[&DetectionType::Face]);
    assert!(!orchestrator.requires_download(&[DetectionType::Face]));

    let downloads: Vec<f32> = drain(&mut updates)
        .into_iter()
        .filter_map(|u| match u {
            DetectionUpdate::DownloadProgress(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(downloads, vec![25.0, 50.0, 100.0]);
}
