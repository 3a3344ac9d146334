use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use hivewatch_service::actors::HiveRegistry;
use hivewatch_service::api::{router, ApiState, DetectionDto};
use hivewatch_service::config::{Cadence, Threshold};
use hivewatch_service::consumer::FrameMessage;
use hivewatch_service::detection::{
    Analysis, BackgroundModel, Detector, HivePipeline, Point, PolygonMask,
};
use hivewatch_service::messages::FrameOutcome;

#[path = "lib.rs"]
mod support;

use support::*;

fn entrance_pipeline() -> HivePipeline {
    let mask = PolygonMask::from_points(
        "hive-1",
        vec![
            Point::new(50, 50),
            Point::new(150, 50),
            Point::new(150, 150),
            Point::new(50, 150),
        ],
    )
    .unwrap();
    assert_eq!(mask.area(), 10_000);
    HivePipeline::new(
        Arc::new(mask),
        BackgroundModel::new(15, 15, Cadence::EveryFrame),
        Detector::new(Threshold::Fixed { level: 25 }, 3, true),
    )
}

fn gray() -> RgbImage {
    RgbImage::from_pixel(200, 200, Rgb([128, 128, 128]))
}

fn warm(pipeline: &mut HivePipeline) {
    for _ in 0..15 {
        match pipeline.analyze(&gray()).unwrap() {
            Analysis::Warming { masked } => pipeline.commit(masked).unwrap(),
            Analysis::Detected { .. } => panic!("detected before warm-up finished"),
        }
    }
}

fn coverage_of(pipeline: &HivePipeline, frame: &RgbImage) -> f64 {
    match pipeline.analyze(frame).unwrap() {
        Analysis::Detected { detection, .. } => detection.coverage.percent(),
        Analysis::Warming { .. } => panic!("still warming"),
    }
}

#[test]
fn test_block_inside_mask_covers_one_percent() {
    init_test_tracing();
    let mut pipeline = entrance_pipeline();
    warm(&mut pipeline);

    assert_eq!(coverage_of(&pipeline, &gray()), 0.0);

    let mut frame = gray();
    for y in 90..100 {
        for x in 90..100 {
            frame.put_pixel(x, y, Rgb([10, 10, 10]));
        }
    }
    assert_eq!(coverage_of(&pipeline, &frame), 1.0);
}

#[test]
fn test_changes_outside_polygon_are_ignored() {
    init_test_tracing();
    let mut pipeline = entrance_pipeline();
    warm(&mut pipeline);

    let mut frame = gray();
    for y in 0..200 {
        for x in 0..40 {
            frame.put_pixel(x, y, Rgb([255, 0, 0]));
        }
    }
    for y in 160..200 {
        for x in 0..200 {
            frame.put_pixel(x, y, Rgb([0, 0, 255]));
        }
    }
    assert_eq!(coverage_of(&pipeline, &frame), 0.0);
}

#[test]
fn test_full_saturation_inside_mask() {
    init_test_tracing();
    let mut pipeline = entrance_pipeline();
    warm(&mut pipeline);

    let frame = RgbImage::from_pixel(200, 200, Rgb([250, 250, 250]));
    assert_eq!(coverage_of(&pipeline, &frame), 100.0);
}

fn frame(filename: &str, image: &RgbImage) -> FrameMessage {
    FrameMessage {
        hive_id: "hive-1".to_string(),
        filename: filename.to_string(),
        image: png(image),
        captured_at: Utc::now(),
    }
}

#[actix::test]
async fn test_registry_results_are_served_by_api() {
    init_test_tracing();
    let env = TestEnv::new(&["hive-1"]);
    let store = env.store();
    let registry = Arc::new(HiveRegistry::new(env.config.clone(), store.clone()));
    registry.preload().unwrap();
    assert_eq!(registry.hive_ids(), vec!["hive-1".to_string()]);

    let timeout = Duration::from_secs(5);
    for name in ["001.jpg", "002.jpg"] {
        let outcome = registry.dispatch(frame(name, &empty_frame()), timeout).await;
        assert!(matches!(outcome, Ok(FrameOutcome::Warming { .. })));
    }
    let stored = registry
        .dispatch(frame("003.jpg", &busy_frame()), timeout)
        .await
        .unwrap();
    let id = match stored {
        FrameOutcome::Stored { id, coverage } => {
            assert_eq!(coverage.percent(), 25.0);
            id
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    let again = registry
        .dispatch(frame("003.jpg", &busy_frame()), timeout)
        .await
        .unwrap();
    assert_eq!(again, FrameOutcome::Duplicate { id });

    let stats = registry.stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].stored, 1);
    assert_eq!(stats[0].duplicates, 1);
    assert_eq!(stats[0].warming, 2);

    let mut state = ApiState::new(store);
    state.registry = Some(registry.clone());
    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/detections?hive_id=hive-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let detections: Vec<DetectionDto> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].id, id);
    assert_eq!(detections[0].coverage, 25.0);

    registry.shutdown();
}
