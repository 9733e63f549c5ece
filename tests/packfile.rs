use std::sync::Arc;

use anyhow::Error;

use silo_api_types::ResourceType;
use silo_backup::{CreateOptions, Repository, WriterOptions};
use silo_datastore::{content_mac, Backend, MemoryBackend, PackfileBuilder, PackfileReader};

fn memory() -> Arc<dyn Backend> {
    Arc::new(MemoryBackend::new())
}

#[test]
fn packfile_is_self_consistent() -> Result<(), Error> {
    let backend = memory();

    let mut builder = PackfileBuilder::new(None, Some(1));
    let payloads: Vec<Vec<u8>> = (0..20u8)
        .map(|i| vec![i; 100 + i as usize * 37])
        .collect();
    for payload in &payloads {
        builder.append(ResourceType::Chunk, payload)?;
    }
    let sealed = builder.seal(backend.as_ref())?;

    // footer -> index -> every blob by (offset, length), each framed
    // digest matching the recorded MAC
    let reader = PackfileReader::open(Arc::clone(&backend), None, sealed.mac)?;
    assert_eq!(reader.blob_count(), payloads.len());

    for record in sealed.records {
        let data = reader.blob(record.offset, record.length)?;
        assert_eq!(content_mac(None, &data), record.mac);
    }

    reader.verify()?;
    Ok(())
}

#[test]
fn writer_rolls_over_at_max_size() -> Result<(), Error> {
    let backend = memory();
    let repo = Repository::create(
        Arc::clone(&backend),
        CreateOptions {
            packfile_max_size: Some(1000),
            ..CreateOptions::default()
        },
    )?;

    // incompressible payloads so sizes are predictable
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let mut payload = vec![0u8; 600];
        openssl::rand::rand_bytes(&mut payload)?;
        payloads.push(payload);
    }

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    for payload in &payloads {
        writer.put(ResourceType::Chunk, payload)?;
    }
    writer.commit()?;

    // each append would have crossed the bound, so one packfile per blob
    let aggregate = repo.aggregate();
    assert_eq!(aggregate.list_packfiles().count(), 3);

    for payload in &payloads {
        let mac = content_mac(None, payload);
        assert_eq!(repo.read_blob(ResourceType::Chunk, &mac)?, *payload);
    }
    Ok(())
}

#[test]
fn blob_just_under_the_bound_triggers_rollover_on_next_append() -> Result<(), Error> {
    let backend = memory();
    let max_size = 4096u64;
    let repo = Repository::create(
        Arc::clone(&backend),
        CreateOptions {
            packfile_max_size: Some(max_size),
            ..CreateOptions::default()
        },
    )?;

    let mut big = vec![0u8; max_size as usize - 1];
    openssl::rand::rand_bytes(&mut big)?;
    let mut small = vec![0u8; 64];
    openssl::rand::rand_bytes(&mut small)?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    writer.put(ResourceType::Chunk, &big)?;
    writer.put(ResourceType::Chunk, &small)?;
    writer.commit()?;

    let aggregate = repo.aggregate();
    assert_eq!(aggregate.list_packfiles().count(), 2);
    assert_eq!(
        repo.read_blob(ResourceType::Chunk, &content_mac(None, &big))?,
        big
    );
    assert_eq!(
        repo.read_blob(ResourceType::Chunk, &content_mac(None, &small))?,
        small
    );
    Ok(())
}

#[test]
fn unbounded_writer_uses_a_single_packfile() -> Result<(), Error> {
    let backend = memory();
    let repo = Repository::create(
        Arc::clone(&backend),
        CreateOptions {
            packfile_max_size: None,
            ..CreateOptions::default()
        },
    )?;

    let writer = repo.writer(WriterOptions { concurrency: 1 })?;
    for i in 0..50u8 {
        writer.put(ResourceType::Chunk, &vec![i; 2048])?;
    }
    writer.commit()?;

    assert_eq!(repo.aggregate().list_packfiles().count(), 1);
    Ok(())
}
