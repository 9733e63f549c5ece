//! Filesystem backed backend.
//!
//! Layout below the base directory:
//!
//! ```text
//! config
//! state/xx/<64-hex>
//! packfile/xx/<64-hex>
//! lock/xx/<64-hex>
//! ```
//!
//! `xx` is the first MAC byte in hex. Objects are published by writing a
//! temporary sibling and renaming it into place, so readers never observe
//! partial objects.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use silo_api_types::Mac;

use super::{backend_err, not_found, parse_object_name, Backend, Category};
use crate::error::StoreError;

const CATEGORIES: [Category; 3] = [Category::State, Category::Packfile, Category::Lock];

pub struct LocalBackend {
    base: PathBuf,
}

fn bucket_name(mac: &Mac) -> String {
    hex::encode(&mac[0..1])
}

impl LocalBackend {
    /// Initialize a fresh backend directory.
    ///
    /// Creates the category directories and all 256 buckets each, so the
    /// write path never has to create directories.
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let base: PathBuf = path.into();

        std::fs::create_dir_all(&base)
            .map_err(|err| backend_err(false, format!("unable to create {:?} - {}", base, err)))?;

        for category in CATEGORIES {
            for i in 0..0x100 {
                let mut dir = base.join(category.name());
                dir.push(format!("{:02x}", i));
                std::fs::create_dir_all(&dir).map_err(|err| {
                    backend_err(false, format!("unable to create {:?} - {}", dir, err))
                })?;
            }
        }

        Ok(Self { base })
    }

    /// Open an existing backend directory.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let base: PathBuf = path.into();

        if let Err(err) = std::fs::metadata(&base) {
            bail!("unable to open backend at {:?} - {}", base, err);
        }

        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn object_path(&self, category: Category, mac: &Mac) -> PathBuf {
        let mut path = self.base.join(category.name());
        path.push(bucket_name(mac));
        path.push(hex::encode(mac));
        path
    }

    fn config_path(&self) -> PathBuf {
        self.base.join("config")
    }

    fn open_packfile(&self, mac: &Mac) -> Result<std::fs::File, Error> {
        match std::fs::File::open(self.object_path(Category::Packfile, mac)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(not_found(Category::Packfile, mac))
            }
            Err(err) => Err(backend_err(false, err)),
        }
    }

    fn publish(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tmp_name.push_str(".tmp");
        let tmp_path = path.with_file_name(format!(".{}", tmp_name));

        let result: Result<(), std::io::Error> = (|| {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, path)?;
            Ok(())
        })();

        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(backend_err(
                false,
                format!("publishing {:?} failed - {}", path, err),
            ));
        }
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn describe(&self) -> String {
        format!("file://{}", self.base.display())
    }

    fn list(&self, category: Category) -> Result<Vec<Mac>, Error> {
        let dir = self.base.join(category.name());
        let mut macs = Vec::new();

        for entry in walkdir::WalkDir::new(&dir).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    return Err(backend_err(
                        true,
                        format!("listing {:?} failed - {}", dir, err),
                    ))
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(mac) = entry.file_name().to_str().and_then(parse_object_name) {
                macs.push(mac);
            }
        }

        macs.sort_unstable();
        Ok(macs)
    }

    fn get(&self, category: Category, mac: &Mac) -> Result<Vec<u8>, Error> {
        match std::fs::read(self.object_path(category, mac)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(not_found(category, mac))
            }
            Err(err) => Err(backend_err(false, err)),
        }
    }

    fn get_range(&self, mac: &Mac, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let mut file = self.open_packfile(mac)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| backend_err(false, err))?;

        let mut buf = vec![0u8; length as usize];
        if let Err(err) = file.read_exact(&mut buf) {
            return Err(StoreError::Corruption(format!(
                "short read on packfile {} at {}+{} - {}",
                hex::encode(mac),
                offset,
                length,
                err
            ))
            .into());
        }
        Ok(buf)
    }

    fn get_tail(&self, mac: &Mac, length: u64) -> Result<Vec<u8>, Error> {
        let mut file = self.open_packfile(mac)?;
        let size = file
            .metadata()
            .map_err(|err| backend_err(false, err))?
            .len();

        let start = size.saturating_sub(length);
        file.seek(SeekFrom::Start(start))
            .map_err(|err| backend_err(false, err))?;

        let mut buf = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut buf)
            .map_err(|err| backend_err(false, err))?;
        Ok(buf)
    }

    fn put(&self, category: Category, mac: &Mac, data: &[u8]) -> Result<(), Error> {
        self.publish(&self.object_path(category, mac), data)
    }

    fn delete(&self, category: Category, mac: &Mac) -> Result<(), Error> {
        match std::fs::remove_file(self.object_path(category, mac)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(backend_err(false, err)),
        }
    }

    fn create_config(&self, data: &[u8]) -> Result<(), Error> {
        let path = self.config_path();
        if path.exists() {
            return Err(StoreError::Invalid(format!(
                "repository config already exists at {:?}",
                path
            ))
            .into());
        }
        self.publish(&path, data)
    }

    fn open_config(&self) -> Result<Vec<u8>, Error> {
        match std::fs::read(self.config_path()) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound("repository config".to_string()).into())
            }
            Err(err) => Err(backend_err(false, err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("silo-local-backend-{}", name));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    #[test]
    fn put_get_list_delete() -> Result<(), Error> {
        let backend = LocalBackend::create(testdir("basic"))?;

        let mac = [7u8; 32];
        backend.put(Category::Packfile, &mac, b"payload")?;
        assert_eq!(backend.get(Category::Packfile, &mac)?, b"payload");
        assert_eq!(backend.list(Category::Packfile)?, vec![mac]);
        assert_eq!(backend.list(Category::State)?, Vec::<Mac>::new());

        assert_eq!(backend.get_range(&mac, 1, 3)?, b"ayl");
        assert_eq!(backend.get_tail(&mac, 4)?, b"load");
        assert_eq!(backend.get_tail(&mac, 100)?, b"payload");

        backend.delete(Category::Packfile, &mac)?;
        // deleting twice is fine
        backend.delete(Category::Packfile, &mac)?;
        assert!(backend.get(Category::Packfile, &mac).is_err());

        let _ = std::fs::remove_dir_all(backend.base());
        Ok(())
    }

    #[test]
    fn config_is_create_once() -> Result<(), Error> {
        let backend = LocalBackend::create(testdir("config"))?;

        assert!(backend.open_config().is_err());
        backend.create_config(b"cfg")?;
        assert_eq!(backend.open_config()?, b"cfg");
        assert!(backend.create_config(b"other").is_err());

        let _ = std::fs::remove_dir_all(backend.base());
        Ok(())
    }
}
