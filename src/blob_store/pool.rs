//! Reference-counted pool of open blobs.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use super::{paths::blob_path, Blob, BlobError};

/// Owns the blob directory (`<home>/blobs`) and keeps at most one open [`Blob`] per name.
pub struct BlobStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    open: Mutex<HashMap<String, (Arc<Blob>, usize)>>,
}

impl BlobStore {
    /// Create the store under `home`, creating `<home>/blobs` and its temporary directory.
    pub fn new(home: &Path) -> Result<BlobStore, BlobError> {
        let root = home.join("blobs");
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(BlobError::io("creating blob directories"))?;
        Ok(BlobStore {
            root,
            tmp_dir,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open `name`'s blob, or share the already-open one, and take a reference to it.
    pub fn get(&self, name: &str) -> Result<Arc<Blob>, BlobError> {
        let mut open = self.open.lock().expect("blob pool mutex poisoned");
        if let Some((blob, refs)) = open.get_mut(name) {
            *refs += 1;
            return Ok(blob.clone());
        }
        let blob = Arc::new(Blob::open(name, blob_path(&self.root, name), &self.tmp_dir)?);
        open.insert(name.to_string(), (blob.clone(), 1));
        Ok(blob)
    }

    /// Return a reference taken with [`get`](Self::get). The blob is closed when the last reference
    /// is returned.
    ///
    /// # Panics
    ///
    /// If `blob` is not open in this pool.
    pub fn put(&self, blob: &Arc<Blob>) {
        let mut open = self.open.lock().expect("blob pool mutex poisoned");
        let Some((_, refs)) = open.get_mut(blob.name()) else {
            panic!("put of blob {} which is not in the pool", blob.name());
        };
        *refs -= 1;
        if *refs == 0 {
            if let Some((blob, _)) = open.remove(blob.name()) {
                blob.close();
            }
        }
    }

    /// Run `f` with `name`'s blob checked out of the pool.
    pub fn with_blob<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Arc<Blob>) -> Result<T, BlobError>,
    ) -> Result<T, BlobError> {
        let blob = self.get(name)?;
        let result = f(&blob);
        self.put(&blob);
        result
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().expect("blob pool mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use crate::types::data_types::Sector;

    use super::*;

    #[test]
    fn blobs_are_shared_and_closed_at_zero_references() {
        let home = tempfile::tempdir().unwrap();
        let store = BlobStore::new(home.path()).unwrap();

        let a = store.get("foo").unwrap();
        let b = store.get("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.open_count(), 1);

        store.put(&a);
        assert_eq!(b.read_sector(0).unwrap(), Sector::zeroed());
        store.put(&b);
        assert_eq!(store.open_count(), 0);
        assert!(matches!(b.read_sector(0), Err(BlobError::BlobClosed)));
    }

    #[test]
    fn reopened_blobs_keep_their_data() {
        let home = tempfile::tempdir().unwrap();
        let store = BlobStore::new(home.path()).unwrap();

        store
            .with_blob("foo", |blob| {
                let mut tx = blob.begin_transaction(0);
                tx.write_sector(&Sector::filled(4))?;
                tx.commit()
            })
            .unwrap();
        let sector = store.with_blob("foo", |blob| blob.read_sector(0)).unwrap();
        assert_eq!(sector, Sector::filled(4));
    }

    #[test]
    #[should_panic]
    fn putting_an_unknown_blob_panics() {
        let home = tempfile::tempdir().unwrap();
        let store = BlobStore::new(home.path()).unwrap();
        let other = BlobStore::new(&home.path().join("other")).unwrap();
        let blob = other.get("foo").unwrap();
        store.put(&blob);
    }
}
