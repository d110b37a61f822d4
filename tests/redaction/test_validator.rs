// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Planner output sanitization and application

use image::{Rgba, RgbaImage};
use pii_redactor::redaction::{
    validate_plan, PixelRedactor, RedactionStyle, DEFAULT_INTENSITY, DEFAULT_REASON,
};
use pii_redactor::session::RedactionApplier;
use serde_json::{json, Value};

fn hostile_plans() -> Vec<Value> {
    vec![
        json!({"redactions": [{"x": -5, "y": 10, "width": 10000, "height": 10}]}),
        json!({"redactions": [{"x": 250, "y": 250, "width": 30, "height": 30}]}),
        json!({"redactions": [{"x": 99, "y": 99, "width": -20, "height": 0}]}),
        json!({"redactions": [{"x": "12.5", "y": "7", "width": "40", "height": 1e9}]}),
        json!({"redactions": [{"x": -1e12, "y": 1e12, "width": 1, "height": 1}]}),
        json!({"redactions": [{"x": 10, "y": 10, "width": 10, "height": 10, "intensity": 900}]}),
        json!({"redactions": [{"x": null, "y": 3, "width": 4, "height": 4}, {"style": 7}]}),
        json!({"redactions": {"x": 1}}),
        json!({"explanation": "no redactions key"}),
        json!("not even an object"),
    ]
}

#[test]
fn test_every_output_fits_the_image() {
    for (width, height) in [(100, 100), (1, 1), (640, 480), (3, 1000)] {
        for raw in hostile_plans() {
            let plan = validate_plan(&raw, width, height);
            for r in &plan.redactions {
                assert!(r.x < width && r.y < height, "{:?} in {}x{}", r, width, height);
                assert!(r.width >= 1 && r.height >= 1);
                assert!(r.x + r.width <= width, "{:?} in {}x{}", r, width, height);
                assert!(r.y + r.height <= height, "{:?} in {}x{}", r, width, height);
                assert!((1..=100).contains(&r.intensity));
            }
        }
    }
}

#[test]
fn test_validation_is_idempotent() {
    for raw in hostile_plans() {
        let once = validate_plan(&raw, 120, 80);
        let twice = validate_plan(&serde_json::to_value(&once).unwrap(), 120, 80);
        assert_eq!(once, twice);
    }
}

#[test]
fn test_documented_clamp_example() {
    let plan = validate_plan(
        &json!({"redactions": [{"x": -5, "y": 10, "width": 10000, "height": 10}]}),
        100,
        100,
    );
    let r = &plan.redactions[0];
    assert_eq!((r.x, r.y, r.width, r.height), (0, 10, 100, 10));
    assert_eq!(r.style, RedactionStyle::Solid);
    assert_eq!(r.intensity, DEFAULT_INTENSITY);
    assert_eq!(r.reason, DEFAULT_REASON);
}

#[test]
fn test_missing_coordinates_are_dropped() {
    let plan = validate_plan(
        &json!({"redactions": [
            {"x": null, "y": 3, "width": 4, "height": 4},
            {"y": 3, "width": 4, "height": 4},
            {"x": 1, "y": 1, "width": 2, "height": 2, "style": "PIXELATE"}
        ]}),
        10,
        10,
    );
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.redactions[0].style, RedactionStyle::Pixelate);
}

#[test]
fn test_validated_plan_applies_cleanly() {
    let mut image = RgbaImage::from_pixel(64, 48, Rgba([200, 180, 160, 255]));
    let applier = PixelRedactor::new();

    for raw in hostile_plans() {
        let plan = validate_plan(&raw, 64, 48);
        for redaction in &plan.redactions {
            applier.apply(&mut image, redaction).unwrap();
        }
    }

    // The first hostile plan covers the full width at y=10
    assert_eq!(*image.get_pixel(63, 10), Rgba([0, 0, 0, 255]));
}
