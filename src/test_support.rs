//! In-memory [`ObjectStore`] used by translator tests, the Rust analogue of the
//! original plugin's fake `boto3` client (`tests/test-S3/boto3/__init__.py`).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;
use crate::object_store::{GetResult, ObjectStore};

#[derive(Default)]
pub struct MockObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// When set, `head` always fails, forcing callers through the `get`
    /// fallback the way a backend with no HEAD support would.
    head_unsupported: bool,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `head` always errors, for exercising the `get` fallback
    /// in `BlockTranslator::size`.
    pub fn without_head_support() -> Self {
        Self { head_unsupported: true, ..Self::default() }
    }

    /// Seed an object directly, bypassing the `ObjectStore` trait (useful in
    /// `#[tokio::test]`-free setup code).
    pub fn put_sync(&self, key: &str, body: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), body);
    }

    /// Snapshot of the keys currently present, for assertions in tests.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get(&self, key: &str, range: Option<(u64, u64)>) -> Result<GetResult, Error> {
        let objects = self.objects.lock().unwrap();
        let Some(data) = objects.get(key) else {
            return Ok(GetResult::NoSuchKey);
        };
        match range {
            None => Ok(GetResult::Found(data.clone())),
            Some((off, last)) => {
                let off = off as usize;
                let end = last as usize + 1;
                Ok(GetResult::Found(data[off..end].to_vec()))
            }
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), Error> {
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>, Error> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start_after.is_none_or(|sa| k.as_str() > sa))
            .cloned()
            .collect())
    }

    async fn head(&self, key: &str) -> Result<u64, Error> {
        if self.head_unsupported {
            return Err(Error::Backend { transient: false, message: "head_object unsupported".to_string() });
        }
        let objects = self.objects.lock().unwrap();
        objects
            .get(key)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::Backend { transient: false, message: format!("NoSuchKey: {key}") })
    }
}
