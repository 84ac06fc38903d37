mod common;

use common::{BLUE, RED, TestRepo, VideoSpec};
use vidsearch_core::{
    BuildState, IndexBuilder, MetadataLedger, SearchEngine, VectorIndex, VsError, build,
};

#[test]
fn test_build_indexes_and_removes_sources() {
    let repo = TestRepo::new();
    let red = repo.stage("red", &VideoSpec::solid(RED, 30.0, 61.0));
    let blue = repo.stage("blue", &VideoSpec::solid(BLUE, 30.0, 61.0));

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let assets = builder.discover_assets();
    assert_eq!(assets, vec![blue.clone(), red.clone()]);

    let stats = builder.build(&assets).unwrap();
    assert_eq!(stats.assets_indexed, 2);
    assert_eq!(stats.frames_indexed, 26);
    assert_eq!(builder.count(), 26);
    assert_eq!(builder.state(), &BuildState::Idle);
    assert!(!red.exists());
    assert!(!blue.exists());

    let report = builder.verify().unwrap();
    assert_eq!(report.rows, 26);
    assert_eq!(report.videos, 2);

    let ledger = MetadataLedger::load(&repo.ctx.ledger_path()).unwrap();
    let first: Vec<_> = ledger.records()[..13]
        .iter()
        .map(|r| (r.video_id.as_str(), r.timestamp))
        .collect();
    let expected: Vec<_> = (0..=12).map(|i| ("blue", i as f64 * 5.0)).collect();
    assert_eq!(first, expected);
    assert!(ledger.records().iter().enumerate().all(|(i, r)| r.row == i as u64));
    assert!(ledger.records().iter().all(|r| r.thumbnail_path.exists()));
}

#[test]
fn test_bad_frame_in_batch_does_not_abort_it() {
    let repo = TestRepo::new();
    // 32 samples at one frame per second, one of which cannot be encoded.
    let mut spec = VideoSpec::solid(RED, 1.0, 160.0);
    spec.poison = vec![50];
    repo.stage("clip", &spec);

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let stats = builder.build(&builder.discover_assets()).unwrap();

    assert_eq!(stats.frames_indexed, 31);
    assert_eq!(stats.frames_skipped, 1);

    let ledger = MetadataLedger::load(&repo.ctx.ledger_path()).unwrap();
    assert_eq!(ledger.len(), 31);
    assert!(ledger.records().iter().all(|r| r.timestamp != 50.0));
    assert_eq!(VectorIndex::load(&repo.ctx.index_path()).unwrap().len(), 31);
}

#[test]
fn test_undecodable_frame_is_skipped() {
    let repo = TestRepo::new();
    let mut spec = VideoSpec::solid(RED, 30.0, 61.0);
    spec.corrupt = vec![300];
    repo.stage("clip", &spec);

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let stats = builder.build(&builder.discover_assets()).unwrap();

    assert_eq!(stats.frames_indexed, 12);
    assert_eq!(stats.frames_skipped, 1);
}

#[test]
fn test_unreadable_asset_is_kept_and_build_continues() {
    let repo = TestRepo::new();
    let broken = repo.ctx.video_dir().join("broken.mp4");
    std::fs::write(&broken, b"not a video").unwrap();
    repo.stage("good", &VideoSpec::solid(BLUE, 30.0, 11.0));

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let stats = builder.build(&builder.discover_assets()).unwrap();

    assert_eq!(stats.assets_skipped, 1);
    assert_eq!(stats.assets_indexed, 1);
    assert_eq!(stats.frames_indexed, 3);
    assert!(broken.exists());
    assert_eq!(builder.state(), &BuildState::Idle);
}

#[test]
fn test_rebuild_over_checkpointed_asset_is_idempotent() {
    let repo = TestRepo::new();
    let spec = VideoSpec::solid(RED, 30.0, 61.0);
    repo.stage("clip", &spec);

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();
    let ledger_before = MetadataLedger::load(&repo.ctx.ledger_path()).unwrap();
    let index_before = VectorIndex::load(&repo.ctx.index_path()).unwrap();

    // The source survived a crash between checkpoint and delete.
    let again = repo.stage("clip", &spec);
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let stats = builder.build(&builder.discover_assets()).unwrap();

    assert_eq!(stats.assets_already_indexed, 1);
    assert_eq!(stats.frames_indexed, 0);
    assert!(!again.exists());
    assert_eq!(
        MetadataLedger::load(&repo.ctx.ledger_path()).unwrap(),
        ledger_before
    );
    assert_eq!(VectorIndex::load(&repo.ctx.index_path()).unwrap(), index_before);
}

#[test]
fn test_index_row_without_ledger_record_is_detected() {
    let repo = TestRepo::new();
    repo.stage("clip", &VideoSpec::solid(RED, 30.0, 61.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();

    // Crash after the index gained a row but before the ledger recorded it.
    let mut index = VectorIndex::load(&repo.ctx.index_path()).unwrap();
    index.add(&[vec![0.5; common::DIM]]).unwrap();
    index.save(&repo.ctx.index_path()).unwrap();

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
    assert!(matches!(builder.verify(), Err(VsError::Consistency(_))));
    assert!(matches!(build::verify(&repo.ctx), Err(VsError::Consistency(_))));
    assert!(matches!(
        SearchEngine::open(&repo.ctx),
        Err(VsError::Consistency(_))
    ));

    repo.stage("other", &VideoSpec::solid(BLUE, 30.0, 11.0));
    let assets = builder.discover_assets();
    assert!(matches!(builder.build(&assets), Err(VsError::Consistency(_))));

    builder.reset().unwrap();
    assert_eq!(builder.state(), &BuildState::Idle);
    let stats = builder.build(&assets).unwrap();
    assert_eq!(stats.frames_indexed, 3);
    assert!(SearchEngine::open(&repo.ctx).is_ok());
}

#[test]
fn test_missing_thumbnail_fails_verification() {
    let repo = TestRepo::new();
    repo.stage("clip", &VideoSpec::solid(RED, 30.0, 11.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();

    let ledger = MetadataLedger::load(&repo.ctx.ledger_path()).unwrap();
    std::fs::remove_file(&ledger.get(1).unwrap().thumbnail_path).unwrap();

    assert!(matches!(builder.verify(), Err(VsError::Consistency(_))));
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
}

#[test]
fn test_failed_checkpoint_keeps_source_and_commits_nothing() {
    let repo = TestRepo::new();
    let source = repo.stage("clip", &VideoSpec::solid(RED, 30.0, 11.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();

    // Make the scratch directory unusable so the checkpoint cannot be written.
    let tmp = repo.ctx.tmp_dir();
    std::fs::remove_dir_all(&tmp).unwrap();
    std::fs::write(&tmp, b"").unwrap();

    let result = builder.build(&[source.clone()]);
    assert!(matches!(result, Err(VsError::Persistence(_))));
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
    assert_eq!(builder.count(), 0);
    assert!(source.exists());
    assert!(!repo.ctx.index_path().exists());
    assert!(!repo.ctx.ledger_path().exists());
}

#[test]
fn test_reset_clears_everything() {
    let repo = TestRepo::new();
    repo.stage("clip", &VideoSpec::solid(RED, 30.0, 11.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();

    builder.reset().unwrap();
    assert_eq!(builder.count(), 0);
    assert!(!repo.ctx.index_path().exists());
    assert!(!repo.ctx.ledger_path().exists());
    assert_eq!(
        std::fs::read_dir(repo.ctx.thumbnails().dir()).unwrap().count(),
        0
    );
    assert_eq!(build::verify(&repo.ctx).unwrap().rows, 0);
}

#[test]
fn test_stream_ending_early_keeps_source_and_commits_nothing() {
    let repo = TestRepo::new();
    let mut spec = VideoSpec::solid(RED, 30.0, 61.0);
    spec.truncated = true;
    let truncated = repo.stage("cut", &spec);
    let good = repo.stage("good", &VideoSpec::solid(BLUE, 30.0, 11.0));

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    let stats = builder.build(&builder.discover_assets()).unwrap();

    assert_eq!(stats.assets_skipped, 1);
    assert_eq!(stats.assets_indexed, 1);
    assert_eq!(stats.frames_indexed, 3);
    assert!(truncated.exists());
    assert!(!good.exists());
    assert_eq!(builder.state(), &BuildState::Idle);

    let ledger = MetadataLedger::load(&repo.ctx.ledger_path()).unwrap();
    assert!(!ledger.contains_video("cut"));
    assert_eq!(build::verify(&repo.ctx).unwrap().rows, 3);
}

/// Put a non-empty directory where the ledger goes so renaming onto it fails.
fn block_ledger_path(repo: &TestRepo) {
    let ledger_path = repo.ctx.ledger_path();
    if ledger_path.exists() {
        std::fs::remove_file(&ledger_path).unwrap();
    }
    std::fs::create_dir(&ledger_path).unwrap();
    std::fs::write(ledger_path.join("occupied"), b"").unwrap();
}

#[test]
fn test_failed_ledger_rename_leaves_no_index() {
    let repo = TestRepo::new();
    let source = repo.stage("clip", &VideoSpec::solid(RED, 30.0, 11.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    block_ledger_path(&repo);

    let result = builder.build(&[source.clone()]);
    assert!(matches!(result, Err(VsError::Persistence(_))));
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
    assert!(source.exists());
    assert!(!repo.ctx.index_path().exists());
}

#[test]
fn test_failed_ledger_rename_restores_previous_checkpoint() {
    let repo = TestRepo::new();
    repo.stage("first", &VideoSpec::solid(RED, 30.0, 11.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();

    let index_before = VectorIndex::load(&repo.ctx.index_path()).unwrap();
    let ledger_bytes = std::fs::read(repo.ctx.ledger_path()).unwrap();
    block_ledger_path(&repo);

    let source = repo.stage("second", &VideoSpec::solid(BLUE, 30.0, 11.0));
    let result = builder.build(&[source.clone()]);
    assert!(matches!(result, Err(VsError::Persistence(_))));
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
    assert_eq!(builder.count(), 3);
    assert!(source.exists());
    assert_eq!(
        VectorIndex::load(&repo.ctx.index_path()).unwrap(),
        index_before
    );

    // Once the ledger is back the last checkpoint is intact and building resumes.
    let ledger_path = repo.ctx.ledger_path();
    std::fs::remove_dir_all(&ledger_path).unwrap();
    std::fs::write(&ledger_path, ledger_bytes).unwrap();
    assert_eq!(build::verify(&repo.ctx).unwrap().rows, 3);

    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    assert_eq!(builder.state(), &BuildState::Idle);
    let stats = builder.build(&builder.discover_assets()).unwrap();
    assert_eq!(stats.assets_indexed, 1);
    assert_eq!(build::verify(&repo.ctx).unwrap().rows, 6);
}

fn assert_refuses_to_serve(repo: &TestRepo) {
    assert!(matches!(build::verify(&repo.ctx), Err(VsError::Consistency(_))));
    assert!(matches!(
        SearchEngine::open(&repo.ctx),
        Err(VsError::Consistency(_))
    ));
    let builder = IndexBuilder::new(&repo.ctx).unwrap();
    assert!(matches!(builder.state(), BuildState::Failed { .. }));
}

fn indexed_clip() -> TestRepo {
    let repo = TestRepo::new();
    repo.stage("clip", &VideoSpec::solid(RED, 30.0, 61.0));
    let mut builder = IndexBuilder::new(&repo.ctx).unwrap();
    builder.build(&builder.discover_assets()).unwrap();
    repo
}

#[test]
fn test_swapped_ledger_rows_are_detected() {
    let repo = indexed_clip();
    let path = repo.ctx.ledger_path();
    let mut doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    doc["records"][0]["row"] = 1.into();
    doc["records"][1]["row"] = 0.into();
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    assert_eq!(MetadataLedger::load(&path).unwrap().len(), 13);
    assert_refuses_to_serve(&repo);
}

#[test]
fn test_wrong_index_key_is_detected() {
    let repo = indexed_clip();
    let path = repo.ctx.index_path();
    let bytes = std::fs::read(&path).unwrap();

    // Header is magic, version, dimension and count; the first key follows.
    let mut body = bytes[..bytes.len() - 32].to_vec();
    body[20..28].copy_from_slice(&7u64.to_le_bytes());
    let digest = blake3::hash(&body);
    body.extend_from_slice(digest.as_bytes());
    std::fs::write(&path, body).unwrap();

    let index = VectorIndex::load(&path).unwrap();
    assert_eq!(index.key(0), Some(7));
    assert_eq!(index.len(), 13);
    assert_refuses_to_serve(&repo);
}

#[test]
fn test_index_dimension_mismatch_is_detected() {
    let repo = indexed_clip();
    let mut index = VectorIndex::new(common::DIM * 2);
    index.add(&vec![vec![0.1; common::DIM * 2]; 13]).unwrap();
    index.save(&repo.ctx.index_path()).unwrap();

    assert_refuses_to_serve(&repo);
}
