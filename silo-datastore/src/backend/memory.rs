//! In-memory backend, for tests and throwaway repositories.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Error;

use silo_api_types::Mac;

use super::{not_found, Backend, Category};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    state: BTreeMap<Mac, Vec<u8>>,
    packfile: BTreeMap<Mac, Vec<u8>>,
    lock: BTreeMap<Mac, Vec<u8>>,
    config: Option<Vec<u8>>,
}

impl Inner {
    fn category(&mut self, category: Category) -> &mut BTreeMap<Mac, Vec<u8>> {
        match category {
            Category::State => &mut self.state,
            Category::Packfile => &mut self.packfile,
            Category::Lock => &mut self.lock,
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn describe(&self) -> String {
        "memory:".to_string()
    }

    fn list(&self, category: Category) -> Result<Vec<Mac>, Error> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.category(category).keys().copied().collect())
    }

    fn get(&self, category: Category, mac: &Mac) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .category(category)
            .get(mac)
            .cloned()
            .ok_or_else(|| not_found(category, mac))
    }

    fn get_range(&self, mac: &Mac, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .category(Category::Packfile)
            .get(mac)
            .ok_or_else(|| not_found(Category::Packfile, mac))?;

        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(StoreError::Corruption(format!(
                "short read on packfile {} at {}+{}",
                hex::encode(mac),
                offset,
                length
            ))
            .into());
        }
        Ok(data[start..end].to_vec())
    }

    fn get_tail(&self, mac: &Mac, length: u64) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .category(Category::Packfile)
            .get(mac)
            .ok_or_else(|| not_found(Category::Packfile, mac))?;

        let start = data.len().saturating_sub(length as usize);
        Ok(data[start..].to_vec())
    }

    fn put(&self, category: Category, mac: &Mac, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.category(category).insert(*mac, data.to_vec());
        Ok(())
    }

    fn delete(&self, category: Category, mac: &Mac) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.category(category).remove(mac);
        Ok(())
    }

    fn create_config(&self, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.config.is_some() {
            return Err(StoreError::Invalid("repository config already exists".into()).into());
        }
        inner.config = Some(data.to_vec());
        Ok(())
    }

    fn open_config(&self) -> Result<Vec<u8>, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .config
            .clone()
            .ok_or_else(|| StoreError::NotFound("repository config".to_string()).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_is_sorted() -> Result<(), Error> {
        let backend = MemoryBackend::new();
        backend.put(Category::State, &[9u8; 32], b"b")?;
        backend.put(Category::State, &[1u8; 32], b"a")?;

        let listed = backend.list(Category::State)?;
        assert_eq!(listed, vec![[1u8; 32], [9u8; 32]]);
        Ok(())
    }

    #[test]
    fn ranged_reads() -> Result<(), Error> {
        let backend = MemoryBackend::new();
        let mac = [2u8; 32];
        backend.put(Category::Packfile, &mac, b"0123456789")?;

        assert_eq!(backend.get_range(&mac, 2, 3)?, b"234");
        assert_eq!(backend.get_tail(&mac, 2)?, b"89");
        assert!(backend.get_range(&mac, 8, 5).is_err());
        Ok(())
    }
}
