use std::sync::Arc;

use anyhow::Error;

use silo_api_types::ResourceType;
use silo_backup::{compact_states, CreateOptions, Repository, WriterOptions};
use silo_datastore::{
    AbortableTask, Backend, Category, MemoryBackend, StateAggregate, StateDelta, StoreError,
};
use silo_tools::time::epoch_i64;

fn new_repo() -> Result<(Arc<dyn Backend>, Arc<Repository>), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;
    Ok((backend, repo))
}

#[test]
fn fresh_load_equals_incremental_reload() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;

    // three transactions, reloading in between
    for payload in [&b"one"[..], b"two", b"three"] {
        let writer = repo.writer(WriterOptions { concurrency: 1 })?;
        writer.put(ResourceType::Chunk, payload)?;
        writer.commit()?;
        repo.reload()?;
    }

    let incremental = repo.aggregate();
    let fresh = StateAggregate::load(backend.as_ref(), None, true)?;

    assert_eq!(fresh.state_count(), incremental.state_count());
    assert_eq!(fresh.max_serial(), incremental.max_serial());

    let collect = |aggregate: &StateAggregate| {
        aggregate
            .list(ResourceType::Chunk)
            .map(|(mac, loc)| (*mac, *loc))
            .collect::<Vec<_>>()
    };
    assert_eq!(collect(&fresh), collect(&incremental));
    assert_eq!(collect(&fresh).len(), 3);
    Ok(())
}

#[test]
fn serials_are_monotone_across_writers() -> Result<(), Error> {
    let (_backend, repo) = new_repo()?;

    let mut last_serial = 0;
    for i in 0..5u8 {
        let writer = repo.writer(WriterOptions { concurrency: 1 })?;
        writer.put(ResourceType::Chunk, &[i; 10])?;
        writer.commit()?;

        let serial = repo.aggregate().max_serial();
        assert!(serial > last_serial);
        last_serial = serial;
    }
    Ok(())
}

#[test]
fn tombstones_are_visible_to_every_reader() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let mac = writer.put(ResourceType::Chunk, b"to be hidden")?;
    writer.commit()?;
    assert!(repo.locate(ResourceType::Chunk, &mac).is_some());

    let mut delta = StateDelta::new(repo.aggregate().next_serial(), [7u8; 16]);
    delta.tombstone(ResourceType::Chunk, mac, epoch_i64());
    repo.publish_delta(&delta)?;

    // the publishing handle sees it immediately
    assert!(repo.locate(ResourceType::Chunk, &mac).is_none());
    assert!(repo.aggregate().is_tombstoned(ResourceType::Chunk, &mac));

    // and so does a completely fresh open
    let other = Repository::open(Arc::clone(&backend), None)?;
    assert!(other.locate(ResourceType::Chunk, &mac).is_none());
    Ok(())
}

#[test]
fn cross_handle_visibility_at_commit_boundaries() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;
    let other = Repository::open(Arc::clone(&backend), None)?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let mac = writer.put(ResourceType::Chunk, b"published later")?;
    writer.commit()?;

    // the other handle lags until it reloads
    assert!(other.locate(ResourceType::Chunk, &mac).is_none());
    assert_eq!(other.reload()?, 1);
    assert!(other.locate(ResourceType::Chunk, &mac).is_some());
    Ok(())
}

#[test]
fn state_compaction_preserves_queries() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;

    let mut macs = Vec::new();
    for payload in [&b"alpha"[..], b"beta", b"gamma"] {
        let writer = repo.writer(WriterOptions { concurrency: 1 })?;
        macs.push(writer.put(ResourceType::Chunk, payload)?);
        writer.commit()?;
    }

    // plus a tombstone, whose timestamp must survive compaction
    let mut delta = StateDelta::new(repo.aggregate().next_serial(), [1u8; 16]);
    delta.tombstone(ResourceType::Chunk, macs[2], 4242);
    repo.publish_delta(&delta)?;

    let states_before = backend.list(Category::State)?.len();
    assert!(states_before >= 4);

    let task = AbortableTask::new();
    let (removed, _) = compact_states(&repo, &task)?;
    assert_eq!(removed, states_before);
    assert_eq!(backend.list(Category::State)?.len(), 1);

    // a fresh open over the single remaining state answers identically
    let fresh = Repository::open(Arc::clone(&backend), None)?;
    assert_eq!(fresh.read_blob(ResourceType::Chunk, &macs[0])?, b"alpha");
    assert_eq!(fresh.read_blob(ResourceType::Chunk, &macs[1])?, b"beta");
    assert!(fresh.locate(ResourceType::Chunk, &macs[2]).is_none());
    assert!(fresh
        .aggregate()
        .is_tombstoned(ResourceType::Chunk, &macs[2]));
    Ok(())
}

#[test]
fn writer_reports_dedup_stats() -> Result<(), Error> {
    let (_backend, repo) = new_repo()?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    writer.put(ResourceType::Chunk, b"counted once")?;
    writer.put(ResourceType::Chunk, b"counted once")?;
    writer.put(ResourceType::Chunk, b"counted too")?;

    let stat = writer.stat();
    assert_eq!(stat.blob_count, 2);
    assert_eq!(stat.duplicate_blobs, 1);
    assert_eq!(stat.size, "counted once".len() as u64 + "counted too".len() as u64);

    writer.commit()?;
    Ok(())
}

#[test]
fn flipped_bit_in_a_packfile_is_detected() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let mac = writer.put(ResourceType::Chunk, b"fragile data")?;
    writer.commit()?;

    let location = repo.locate(ResourceType::Chunk, &mac).unwrap();

    // corrupt one payload byte inside the stored packfile
    let mut raw = backend.get(Category::Packfile, &location.packfile)?;
    raw[location.offset as usize + 25] ^= 0x01;
    backend.put(Category::Packfile, &location.packfile, &raw)?;

    let err = repo.read_blob(ResourceType::Chunk, &mac).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn missing_expected_packfile_is_an_integrity_error() -> Result<(), Error> {
    let (backend, repo) = new_repo()?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let mac = writer.put(ResourceType::Chunk, b"soon gone")?;
    writer.commit()?;

    let location = repo.locate(ResourceType::Chunk, &mac).unwrap();
    backend.delete(Category::Packfile, &location.packfile)?;

    let err = repo.read_blob(ResourceType::Chunk, &mac).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Integrity(_))
    ));

    // a MAC the aggregate never heard of stays NotFound
    let err = repo.read_blob(ResourceType::Chunk, &[0u8; 32]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound(_))
    ));
    Ok(())
}
