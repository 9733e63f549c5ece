use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;

use silo_api_types::ResourceType;
use silo_backup::{CreateOptions, Repository, WriterOptions};
use silo_datastore::snapshot::{BlobRef, ObjectNode, Snapshot};
use silo_datastore::{content_mac, Backend, LocalBackend, MemoryBackend, StoreError};
use silo_tools::time::epoch_i64;

fn testdir(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("silo-repository-{}", name));
    let _ = std::fs::remove_dir_all(&path);
    path
}

/// Store one chunk plus an object tree and snapshot referencing it.
fn commit_snapshot(
    repo: &Arc<Repository>,
    payload: &[u8],
    identifier: Option<&str>,
) -> Result<(silo_api_types::Mac, silo_api_types::Mac), Error> {
    let writer = repo.writer(WriterOptions::default())?;

    let chunk_mac = writer.put(ResourceType::Chunk, payload)?;

    let node = ObjectNode {
        children: vec![BlobRef {
            ty: ResourceType::Chunk,
            mac: chunk_mac,
        }],
    };
    let root_mac = writer.put(ResourceType::Object, &node.encode()?)?;

    let mut snapshot = Snapshot::new(
        "/data".to_string(),
        BlobRef {
            ty: ResourceType::Object,
            mac: root_mac,
        },
        epoch_i64(),
    )?;
    if let Some(identifier) = identifier {
        snapshot.identifier = identifier.to_string();
        snapshot.short_id = identifier[..8.min(identifier.len())].to_string();
    }
    snapshot.summary.files = 1;
    snapshot.summary.bytes = payload.len() as u64;

    let snapshot_mac = writer.put_snapshot(&snapshot)?;
    writer.commit()?;

    Ok((chunk_mac, snapshot_mac))
}

#[test]
fn create_then_open() -> Result<(), Error> {
    let dir = testdir("create-then-open");

    {
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::create(&dir)?);
        let repo = Repository::create(
            backend,
            CreateOptions {
                packfile_max_size: Some(8 * 1024 * 1024),
                ..CreateOptions::default()
            },
        )?;
        commit_snapshot(&repo, b"hello", None)?;
    }

    // fresh handle over the same directory
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::open(&dir)?);
    let repo = Repository::open(backend, None)?;

    let mac = content_mac(None, b"hello");
    let location = repo
        .locate(ResourceType::Chunk, &mac)
        .expect("chunk not found after reopen");
    assert_eq!(
        repo.read_located(ResourceType::Chunk, &mac, &location)?,
        b"hello"
    );
    assert_eq!(repo.read_blob(ResourceType::Chunk, &mac)?, b"hello");

    assert_eq!(repo.list_snapshots()?.len(), 1);

    // opening through the location spec dispatcher works the same
    let repo = Repository::open_location(dir.to_str().unwrap(), None)?;
    assert_eq!(repo.read_blob(ResourceType::Chunk, &mac)?, b"hello");

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn dedup_within_and_across_writers() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let first = writer.put(ResourceType::Chunk, b"hello")?;
    assert!(writer.contains(ResourceType::Chunk, &first));
    let second = writer.put(ResourceType::Chunk, b"hello")?;
    assert_eq!(first, second);
    writer.commit()?;

    let location = repo.locate(ResourceType::Chunk, &first).unwrap();

    // a second writer storing the same payload changes nothing
    let states_before = repo.aggregate().state_count();
    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let third = writer.put(ResourceType::Chunk, b"hello")?;
    assert_eq!(third, first);
    // nothing new queued, so the commit publishes no delta
    assert_eq!(writer.commit()?, None);

    assert_eq!(repo.aggregate().state_count(), states_before);
    assert_eq!(repo.locate(ResourceType::Chunk, &first).unwrap(), location);
    Ok(())
}

#[test]
fn ambiguous_snapshot_prefix() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;

    commit_snapshot(&repo, b"first", Some("aabb11223344556677"))?;
    commit_snapshot(&repo, b"second", Some("aabb99887766554433"))?;

    let err = repo.load_snapshot("aabb").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Ambiguous(_))
    ));

    // a longer prefix disambiguates
    let (_, snapshot) = repo.load_snapshot("aabb11")?;
    assert_eq!(snapshot.identifier, "aabb11223344556677");

    // unknown prefixes are NotFound
    let err = repo.load_snapshot("ffff").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn encrypted_repository_roundtrip() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

    let chunk_mac = {
        let repo = Repository::create(
            Arc::clone(&backend),
            CreateOptions {
                passphrase: Some("open sesame".to_string()),
                ..CreateOptions::default()
            },
        )?;
        let (chunk_mac, _) = commit_snapshot(&repo, b"secret data", None)?;
        chunk_mac
    };

    // the keyed MAC is not the plain hash
    assert_ne!(chunk_mac, content_mac(None, b"secret data"));

    // wrong passphrase is rejected by the canary
    assert!(Repository::open(Arc::clone(&backend), Some("wrong")).is_err());
    // missing passphrase is rejected outright
    assert!(Repository::open(Arc::clone(&backend), None).is_err());

    let repo = Repository::open(Arc::clone(&backend), Some("open sesame"))?;
    assert_eq!(repo.read_blob(ResourceType::Chunk, &chunk_mac)?, b"secret data");
    Ok(())
}

#[test]
fn snapshot_delete_tombstones() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;

    let (_, snapshot_mac) = commit_snapshot(&repo, b"doomed", None)?;
    assert_eq!(repo.list_snapshots()?.len(), 1);

    repo.delete_snapshot(&snapshot_mac)?;

    assert!(repo.list_snapshots()?.is_empty());
    assert!(repo
        .aggregate()
        .is_tombstoned(ResourceType::Snapshot, &snapshot_mac));

    // deleting an unknown snapshot fails
    assert!(repo.delete_snapshot(&[0u8; 32]).is_err());
    Ok(())
}

#[test]
fn empty_payload_blob() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    let mac = writer.put(ResourceType::Chunk, b"")?;
    writer.commit()?;

    // the empty payload MAC is the well known sha256 constant
    assert_eq!(
        hex::encode(mac),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(repo.read_blob(ResourceType::Chunk, &mac)?, b"");
    Ok(())
}

#[test]
fn verify_pass_is_clean() -> Result<(), Error> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = Repository::create(Arc::clone(&backend), CreateOptions::default())?;
    commit_snapshot(&repo, b"verified payload", None)?;

    let task = silo_datastore::AbortableTask::new();
    let status = repo.verify(&task)?;
    assert_eq!(status.errors, 0);
    assert!(status.packfiles >= 1);
    assert!(status.blobs >= 3); // chunk, object, snapshot
    Ok(())
}
