use std::sync::Arc;

use facegate_core::decode::{decode_base64_payload, encode_png};
use facegate_core::errors::{AppError, ErrorKind};
use facegate_core::faces::{
    open_identity_service, CacheOptions, DistanceMetric, EmbedderSettings,
    FilesystemIdentityStore, IdentityService, IdentityStore, InMemoryIdentityStore, MatchPolicy,
    ServiceConfig, ThumbnailEmbedder,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

const SIDE: u32 = 96;

fn stripes_vertical() -> RgbImage {
    RgbImage::from_fn(SIDE, SIDE, |x, _| {
        let v = (128.0 + 100.0 * (x as f64 / 5.0).sin()) as u8;
        Rgb([v, v, v])
    })
}

fn stripes_horizontal() -> RgbImage {
    RgbImage::from_fn(SIDE, SIDE, |_, y| {
        let v = (128.0 + 100.0 * (y as f64 / 5.0).sin()) as u8;
        Rgb([v, v, v])
    })
}

fn checkerboard() -> RgbImage {
    RgbImage::from_fn(SIDE, SIDE, |x, y| {
        if (x / 12 + y / 12) % 2 == 0 {
            Rgb([230, 230, 230])
        } else {
            Rgb([20, 20, 20])
        }
    })
}

/// Deterministic low-amplitude noise on top of `image`.
fn perturbed(image: &RgbImage) -> RgbImage {
    let mut copy = image.clone();
    for (x, y, pixel) in copy.enumerate_pixels_mut() {
        let delta = ((x * 5 + y * 3) % 7) as i16 - 3;
        for channel in pixel.0.iter_mut() {
            *channel = (*channel as i16 + delta).clamp(0, 255) as u8;
        }
    }
    copy
}

fn png(image: &RgbImage) -> Vec<u8> {
    encode_png(image).expect("encode png")
}

fn file_config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig {
        storage_dir: dir.path().to_path_buf(),
        embedder: EmbedderSettings::default(),
        metric: DistanceMetric::Cosine,
        threshold: None,
        persist_cache: true,
        rebuild_timeout: None,
    }
}

#[test]
fn alice_and_bob_scenario() {
    let tmp = TempDir::new().unwrap();
    let service = open_identity_service(&file_config(&tmp)).unwrap();

    service
        .enroll("alice@example.com", &png(&stripes_vertical()))
        .unwrap();
    service
        .enroll("bob@example.com", &png(&stripes_horizontal()))
        .unwrap();

    let outcome = service.verify(&png(&perturbed(&stripes_vertical()))).unwrap();
    assert_eq!(
        outcome.result.identity.as_deref(),
        Some("alice@example.com")
    );
    let distance = outcome.result.distance.unwrap();
    assert!(distance <= outcome.result.threshold, "distance {distance}");

    let outcome = service.verify(&png(&checkerboard())).unwrap();
    assert!(!outcome.is_match());
    assert!(outcome.result.distance.unwrap() > outcome.result.threshold);
}

#[test]
fn register_then_verify_round_trip_across_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let service = open_identity_service(&file_config(&tmp)).unwrap();
        service
            .enroll("carol@example.com", &png(&checkerboard()))
            .unwrap();
        service.warm_up();
    }

    // A new process reads the references (or the artifact) back from disk.
    let service = open_identity_service(&file_config(&tmp)).unwrap();
    let outcome = service.verify(&png(&checkerboard())).unwrap();
    assert_eq!(
        outcome.result.identity.as_deref(),
        Some("carol@example.com")
    );
    assert!(outcome.result.distance.unwrap() < 1e-9);
}

#[test]
fn restart_ignores_artifact_when_store_changed_on_disk() {
    let tmp = TempDir::new().unwrap();
    {
        let service = open_identity_service(&file_config(&tmp)).unwrap();
        service
            .enroll("alice@example.com", &png(&stripes_vertical()))
            .unwrap();
        service
            .enroll("mallory@example.com", &png(&checkerboard()))
            .unwrap();
        service.warm_up();
    }

    // Administrative removal, plus a write that never reached the cache.
    std::fs::remove_dir_all(tmp.path().join("mallory@example.com")).unwrap();
    FilesystemIdentityStore::new(tmp.path())
        .put_reference("alice@example.com", &png(&stripes_horizontal()))
        .unwrap();

    let service = open_identity_service(&file_config(&tmp)).unwrap();
    let outcome = service.verify(&png(&checkerboard())).unwrap();
    assert_ne!(
        outcome.result.identity.as_deref(),
        Some("mallory@example.com")
    );
    assert!(!outcome.is_match());

    let outcome = service.verify(&png(&stripes_horizontal())).unwrap();
    assert_eq!(
        outcome.result.identity.as_deref(),
        Some("alice@example.com")
    );
    assert!(outcome.result.distance.unwrap() < 1e-9);
    assert_eq!(outcome.compared, 1);
}

#[test]
fn empty_store_never_matches() {
    let tmp = TempDir::new().unwrap();
    let service = open_identity_service(&file_config(&tmp)).unwrap();
    let outcome = service.verify(&png(&stripes_vertical())).unwrap();
    assert!(!outcome.is_match());
    assert_eq!(outcome.compared, 0);
    assert!(outcome.result.distance.is_none());
}

#[test]
fn enrollment_invalidates_and_next_verify_sees_new_identity() {
    let service = IdentityService::new(
        Arc::new(InMemoryIdentityStore::new()),
        Arc::new(ThumbnailEmbedder::default()),
        MatchPolicy {
            metric: DistanceMetric::Cosine,
            threshold: 0.15,
        },
        CacheOptions::default(),
    );
    service
        .enroll("alice@example.com", &png(&stripes_vertical()))
        .unwrap();
    assert!(!service
        .verify(&png(&checkerboard()))
        .unwrap()
        .is_match());
    assert!(service.cache().is_valid());

    service
        .enroll("dave@example.com", &png(&checkerboard()))
        .unwrap();
    assert!(!service.cache().is_valid());

    let outcome = service.verify(&png(&checkerboard())).unwrap();
    assert_eq!(outcome.result.identity.as_deref(), Some("dave@example.com"));
    assert_eq!(outcome.compared, 2);
    assert_eq!(service.cache().rebuild_count(), 2);
}

#[test]
fn malformed_input_leaves_cache_alone() {
    let tmp = TempDir::new().unwrap();
    let service = open_identity_service(&file_config(&tmp)).unwrap();
    service
        .enroll("alice@example.com", &png(&stripes_vertical()))
        .unwrap();
    service.warm_up();
    assert!(service.cache().is_valid());

    let err = decode_base64_payload("data:image/png;base64,***").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = service.verify(b"\x89PNG but truncated").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = service
        .enroll("eve@example.com", b"not an image at all")
        .unwrap_err();
    match err {
        AppError::ImageDecode { .. } => {}
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(service.cache().is_valid());
    assert!(!tmp.path().join("eve@example.com").exists());
}
