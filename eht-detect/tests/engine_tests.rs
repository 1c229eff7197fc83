//! Review engine integration tests
//!
//! Exercise the detection operations end to end against real files on disk
//! and an in-memory database.

mod helpers;

use eht_common::error::ErrorKind;
use eht_detect::classification::{Classification, DetectionStats};
use eht_detect::models::{ClassifyRequest, LayersQuery, LoadRequest, SaveMaskRequest};
use helpers::{
    create_test_engine, label_png_base64, session_count, write_gray_png, write_npy_stack,
    DatasetDir,
};
use ndarray::{s, Array3};
use ndarray_npy::read_npy;

const OWNER: i64 = 1;
const STRANGER: i64 = 2;

fn load(dataset: String, mask: Option<String>) -> LoadRequest {
    LoadRequest {
        dataset_path: dataset,
        mask_path: mask,
        project_name: "Review".to_string(),
    }
}

fn page(session_id: i64, page: i64, include_images: bool) -> LayersQuery {
    LayersQuery {
        session_id,
        page,
        page_size: None,
        include_images,
        enhance: Some(false),
    }
}

fn classify(session_id: i64, layer_ids: Vec<i64>, classification: &str) -> ClassifyRequest {
    ClassifyRequest {
        session_id,
        layer_ids,
        classification: classification.to_string(),
    }
}

#[tokio::test]
async fn test_single_image_is_one_flat_layer() {
    let data = DatasetDir::new();
    write_gray_png(&data.path("slice.png"), 16, 8, 0);
    let engine = create_test_engine().await;

    let loaded = engine
        .load_dataset(OWNER, load(data.arg("slice.png"), None))
        .await
        .unwrap();

    assert_eq!(loaded.total_layers, 1);
    assert!(!loaded.is_3d);
    assert_eq!(loaded.image_shape, [8, 16]);
    assert!(!loaded.has_masks);
    assert_eq!(loaded.project_name, "Review");
}

#[tokio::test]
async fn test_stack_load_creates_unreviewed_layers() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 25, 4, 4, None);
    let engine = create_test_engine().await;

    let loaded = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap();
    assert_eq!(loaded.total_layers, 25);
    assert!(loaded.is_3d);

    let first = engine
        .get_layers(OWNER, &page(loaded.session_id, 1, false))
        .await
        .unwrap();
    assert_eq!(first.total, 25);
    assert_eq!(first.page_size, 12);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.layers.len(), 12);
    assert_eq!(first.layers[0].layer_name, "Layer 1");
    assert!(first
        .layers
        .iter()
        .all(|l| l.classification == Classification::Error && l.image_base64.is_none()));

    let last = engine
        .get_layers(OWNER, &page(loaded.session_id, 3, false))
        .await
        .unwrap();
    let indices: Vec<i64> = last.layers.iter().map(|l| l.layer_index).collect();
    assert_eq!(indices, vec![24]);

    let err = engine
        .get_layers(OWNER, &page(loaded.session_id, 4, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_mask_count_mismatch_creates_no_session() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 3, 4, 4, None);
    write_npy_stack(&data.path("masks.npy"), 2, 4, 4, Some(0));
    let engine = create_test_engine().await;

    let err = engine
        .load_dataset(
            OWNER,
            load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(session_count(engine.pool()).await, 0);
    assert_eq!(engine.cached_sessions().await, 0);
}

#[tokio::test]
async fn test_missing_dataset_is_not_found() {
    let data = DatasetDir::new();
    let engine = create_test_engine().await;

    let err = engine
        .load_dataset(OWNER, load(data.arg("nothing.tif"), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = engine
        .load_dataset(OWNER, load("../etc/passwd".to_string(), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_classify_skips_unknown_ids_and_updates_stats() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 10, 4, 4, None);
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;

    let fresh = engine.get_stats(OWNER, session_id).await.unwrap();
    assert_eq!(
        fresh,
        DetectionStats {
            error: 10,
            total: 10,
            ..Default::default()
        }
    );

    let layers = engine
        .get_layers(OWNER, &page(session_id, 1, false))
        .await
        .unwrap()
        .layers;
    let (id1, id2) = (layers[0].id, layers[1].id);

    let response = engine
        .classify_layers(OWNER, classify(session_id, vec![id1, id2, 9999], "correct"))
        .await
        .unwrap();
    assert_eq!(response.updated_count, 2);

    let stats = engine.get_stats(OWNER, session_id).await.unwrap();
    assert_eq!(stats.correct, 2);
    assert_eq!(stats.error, 8);
    assert_eq!(stats.reviewed, 2);
    assert_eq!(stats.progress_percent, 20.0);

    let err = engine
        .classify_layers(OWNER, classify(session_id, vec![id1], "maybe"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("correct, incorrect, unsure, error"));

    // Rejected request changed nothing
    let after = engine.get_stats(OWNER, session_id).await.unwrap();
    assert_eq!(after, stats);
}

#[tokio::test]
async fn test_sessions_are_invisible_to_other_users() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 2, 4, 4, None);
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;

    let kinds = vec![
        engine
            .get_layers(STRANGER, &page(session_id, 1, false))
            .await
            .unwrap_err()
            .kind(),
        engine.get_stats(STRANGER, session_id).await.unwrap_err().kind(),
        engine
            .classify_layers(STRANGER, classify(session_id, vec![1], "correct"))
            .await
            .unwrap_err()
            .kind(),
        engine
            .delete_session(STRANGER, session_id)
            .await
            .unwrap_err()
            .kind(),
        engine.get_stats(OWNER, session_id + 100).await.unwrap_err().kind(),
    ];
    assert!(kinds.iter().all(|k| *k == ErrorKind::NotFound));

    // Still intact for the owner
    assert_eq!(engine.get_stats(OWNER, session_id).await.unwrap().total, 2);
}

#[tokio::test]
async fn test_rebuilt_volume_renders_identically() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 3, 6, 6, None);
    write_npy_stack(&data.path("masks.npy"), 3, 6, 6, Some(1));
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(
            OWNER,
            load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
        )
        .await
        .unwrap()
        .session_id;

    let layers = engine
        .get_layers(OWNER, &page(session_id, 1, true))
        .await
        .unwrap()
        .layers;
    engine
        .classify_layers(OWNER, classify(session_id, vec![layers[1].id], "unsure"))
        .await
        .unwrap();

    assert!(engine.cache().evict(session_id).await);
    assert_eq!(engine.cached_sessions().await, 0);

    let rebuilt = engine
        .get_layers(OWNER, &page(session_id, 1, true))
        .await
        .unwrap()
        .layers;
    assert_eq!(engine.cached_sessions().await, 1);

    for (before, after) in layers.iter().zip(&rebuilt) {
        assert!(before.image_base64.is_some());
        assert!(before.mask_base64.is_some());
        assert_eq!(before.image_base64, after.image_base64);
        assert_eq!(before.mask_base64, after.mask_base64);
    }
    assert_eq!(rebuilt[1].classification, Classification::Unsure);
}

#[tokio::test]
async fn test_changed_dataset_is_a_consistency_fault() {
    let data = DatasetDir::new();
    let frames = data.subdir("frames");
    for (i, name) in ["a.png", "b.png", "c.png"].iter().enumerate() {
        write_gray_png(&frames.join(name), 5, 5, i as u8 * 30);
    }
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(frames.to_string_lossy().into_owned(), None))
        .await
        .unwrap()
        .session_id;

    engine.cache().evict(session_id).await;
    write_gray_png(&frames.join("d.png"), 5, 5, 200);

    let err = engine
        .get_layers(OWNER, &page(session_id, 1, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(engine.cache().lookup(session_id).await.is_none());

    // Metadata-only pages never touch the volume
    let records = engine
        .get_layers(OWNER, &page(session_id, 1, false))
        .await
        .unwrap();
    assert_eq!(records.total, 3);
}

#[tokio::test]
async fn test_save_mask_resamples_and_persists() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 3, 4, 4, None);
    write_npy_stack(&data.path("masks.npy"), 3, 4, 4, Some(0));
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(
            OWNER,
            load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
        )
        .await
        .unwrap()
        .session_id;

    // Twice the stored resolution; resampled back down without blending labels
    let response = engine
        .save_mask(
            OWNER,
            SaveMaskRequest {
                session_id,
                layer_index: 1,
                mask_base64: label_png_base64(8, 8, 1, 2),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.message, "Mask saved for layer 1");

    let stored: Array3<u8> = read_npy(data.path("masks.npy")).unwrap();
    assert_eq!(stored.dim(), (3, 4, 4));
    let edited = stored.slice(s![1, .., ..]);
    assert!(edited.iter().all(|v| *v == 1 || *v == 2));
    assert!(edited.column(0).iter().all(|v| *v == 1));
    assert!(edited.column(3).iter().all(|v| *v == 2));
    assert!(stored.slice(s![0, .., ..]).iter().all(|v| *v == 0));
    assert!(stored.slice(s![2, .., ..]).iter().all(|v| *v == 0));

    // The cached mask matches what was written
    let cached = engine.cache().lookup(session_id).await.unwrap();
    let volume = cached.read().await;
    let mask = volume.mask(1).unwrap().unwrap();
    assert_eq!(mask.shape(), (4, 4));
}

#[tokio::test]
async fn test_save_mask_rejections() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 2, 4, 4, None);
    write_npy_stack(&data.path("masks.npy"), 2, 4, 4, Some(0));
    let engine = create_test_engine().await;
    let plain = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;
    let masked = engine
        .load_dataset(
            OWNER,
            load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
        )
        .await
        .unwrap()
        .session_id;

    let request = |session_id, layer_index, mask_base64: String| SaveMaskRequest {
        session_id,
        layer_index,
        mask_base64,
    };

    let no_masks = engine
        .save_mask(OWNER, request(plain, 0, label_png_base64(4, 4, 1, 1)))
        .await
        .unwrap_err();
    assert_eq!(no_masks.kind(), ErrorKind::InvalidInput);

    for index in [-1, 2] {
        let err = engine
            .save_mask(OWNER, request(masked, index, label_png_base64(4, 4, 1, 1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("out of range"));
    }

    let garbage = engine
        .save_mask(OWNER, request(masked, 0, "data:image/png;base64,!!!".to_string()))
        .await
        .unwrap_err();
    assert_eq!(garbage.kind(), ErrorKind::InvalidInput);

    let foreign = engine
        .save_mask(STRANGER, request(masked, 0, label_png_base64(4, 4, 1, 1)))
        .await
        .unwrap_err();
    assert_eq!(foreign.kind(), ErrorKind::NotFound);

    // Nothing was written
    let stored: Array3<u8> = read_npy(data.path("masks.npy")).unwrap();
    assert!(stored.iter().all(|v| *v == 0));
}

#[tokio::test]
async fn test_delete_session_evicts_and_forgets() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 2, 4, 4, None);
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;
    assert_eq!(engine.cached_sessions().await, 1);

    let response = engine.delete_session(OWNER, session_id).await.unwrap();
    assert_eq!(
        response.message,
        format!("Session {} deleted successfully", session_id)
    );
    assert_eq!(engine.cached_sessions().await, 0);
    assert_eq!(session_count(engine.pool()).await, 0);

    let err = engine.get_stats(OWNER, session_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.delete_session(OWNER, session_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_concurrent_classifications_all_land() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 12, 2, 2, None);
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;
    let ids: Vec<i64> = engine
        .get_layers(OWNER, &page(session_id, 1, false))
        .await
        .unwrap()
        .layers
        .iter()
        .map(|l| l.id)
        .collect();

    let tasks: Vec<_> = ids
        .chunks(3)
        .map(|chunk| {
            let engine = engine.clone();
            let chunk = chunk.to_vec();
            tokio::spawn(async move {
                engine
                    .classify_layers(OWNER, classify(session_id, chunk, "incorrect"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().updated_count, 3);
    }

    let stats = engine.get_stats(OWNER, session_id).await.unwrap();
    assert_eq!(stats.incorrect, 12);
    assert_eq!(stats.progress_percent, 100.0);
}

/// Let spawned tasks run until they park on the session gate
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_delete_ahead_of_queued_rebuild_wins() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 2, 4, 4, None);
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(OWNER, load(data.arg("stack.npy"), None))
        .await
        .unwrap()
        .session_id;
    engine.cache().evict(session_id).await;

    let held = engine.cache().lock(session_id).await;
    let delete = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_session(OWNER, session_id).await })
    };
    settle().await;
    let rebuild = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.get_layers(OWNER, &page(session_id, 1, true)).await })
    };
    settle().await;
    drop(held);

    assert!(delete.await.unwrap().is_ok());
    let err = rebuild.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(session_count(engine.pool()).await, 0);
    assert_eq!(engine.cached_sessions().await, 0);
}

#[tokio::test]
async fn test_delete_ahead_of_queued_mask_save_wins() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 2, 4, 4, None);
    write_npy_stack(&data.path("masks.npy"), 2, 4, 4, Some(0));
    let engine = create_test_engine().await;
    let session_id = engine
        .load_dataset(
            OWNER,
            load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
        )
        .await
        .unwrap()
        .session_id;

    let held = engine.cache().lock(session_id).await;
    let delete = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_session(OWNER, session_id).await })
    };
    settle().await;
    let save = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .save_mask(
                    OWNER,
                    SaveMaskRequest {
                        session_id,
                        layer_index: 0,
                        mask_base64: label_png_base64(4, 4, 7, 7),
                    },
                )
                .await
        })
    };
    settle().await;
    drop(held);

    assert!(delete.await.unwrap().is_ok());
    let err = save.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let stored: Array3<u8> = read_npy(data.path("masks.npy")).unwrap();
    assert!(stored.iter().all(|v| *v == 0));
    assert_eq!(engine.cached_sessions().await, 0);
}

#[tokio::test]
async fn test_sessions_sharing_a_mask_file_save_concurrently() {
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 4, 64, 64, None);
    write_npy_stack(&data.path("masks.npy"), 4, 64, 64, Some(0));
    let engine = create_test_engine().await;

    let mut sessions = Vec::new();
    for _ in 0..2 {
        let loaded = engine
            .load_dataset(
                OWNER,
                load(data.arg("stack.npy"), Some(data.arg("masks.npy"))),
            )
            .await
            .unwrap();
        sessions.push(loaded.session_id);
    }

    let save = |session_id: i64, layer_index: i64, label: u8| {
        let engine = engine.clone();
        async move {
            engine
                .save_mask(
                    OWNER,
                    SaveMaskRequest {
                        session_id,
                        layer_index,
                        mask_base64: label_png_base64(64, 64, label, label),
                    },
                )
                .await
        }
    };

    for round in 0..10u8 {
        let (a, b) = tokio::join!(
            save(sessions[0], 0, round + 1),
            save(sessions[1], 1, round + 1)
        );
        assert!(a.is_ok(), "{:?}", a);
        assert!(b.is_ok(), "{:?}", b);
    }

    // The file holds one session's complete stack; no temp files are left
    let stored: Array3<u8> = read_npy(data.path("masks.npy")).unwrap();
    assert_eq!(stored.dim(), (4, 64, 64));
    let edited_0 = stored.slice(s![0, .., ..]).iter().all(|v| *v == 10);
    let edited_1 = stored.slice(s![1, .., ..]).iter().all(|v| *v == 10);
    assert!(edited_0 != edited_1);
    let leftovers = std::fs::read_dir(data.dir.path()).unwrap().count();
    assert_eq!(leftovers, 2);
}
