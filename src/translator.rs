//! The block-to-object translator: read/write/zero/trim/flush over the address map,
//! the per-object lock registry, and the object store client.

use crate::address_map::{block_key, first_full_block, fragments, last_full_block_exclusive};
use crate::config::Config;
use crate::error::Error;
use crate::object_store::{GetResult, ObjectStore, DELETE_BATCH_LIMIT};
use crate::lock_registry::LockRegistry;

/// Flags on a zero request. Mirrors the virtio-blk write-zeroes `unmap` flag: when
/// set, the device is free to represent the zeroed range as deallocated storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroFlags {
    pub may_trim: bool,
}

pub struct BlockTranslator<S: ObjectStore> {
    config: Config,
    store: S,
    locks: LockRegistry,
}

impl<S: ObjectStore> BlockTranslator<S> {
    pub fn new(config: Config, store: S) -> Self {
        Self { config, store, locks: LockRegistry::new() }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn key_prefix(&self) -> &str {
        &self.config.key
    }

    fn obj_size(&self) -> u64 {
        self.config.sizes.expect("multi-object mode").obj_size
    }

    /// §4.4.1 read. Fills `buf` (length `n`) starting at virtual offset `off`.
    pub async fn read(&self, buf: &mut [u8], off: u64) -> Result<(), Error> {
        if self.config.sizes.is_none() {
            // Single-object read-only mode: one ranged get satisfies the whole request.
            if buf.is_empty() {
                return Ok(());
            }
            let data = self.get_or_zero(&self.config.key, Some((off, off + buf.len() as u64 - 1)), buf.len()).await?;
            buf.copy_from_slice(&data);
            return Ok(());
        }

        let obj_size = self.obj_size();
        let mut written = 0usize;
        for frag in fragments(off, buf.len() as u64, obj_size) {
            let key = block_key(self.key_prefix(), frag.blockno);
            let last = frag.block_offset + frag.len - 1;
            let data = self
                .get_or_zero(&key, Some((frag.block_offset, last)), frag.len as usize)
                .await?;
            let start = written;
            let end = written + frag.len as usize;
            buf[start..end].copy_from_slice(&data);
            written = end;
        }
        debug_assert_eq!(written, buf.len());
        Ok(())
    }

    async fn get_or_zero(&self, key: &str, range: Option<(u64, u64)>, expect_len: usize) -> Result<Vec<u8>, Error> {
        match self.store.get(key, range).await? {
            GetResult::NoSuchKey => Ok(vec![0u8; expect_len]),
            GetResult::Found(data) => {
                if data.len() != expect_len {
                    return Err(Error::Assertion(format!(
                        "requested {expect_len} bytes from {key}, got {}",
                        data.len()
                    )));
                }
                Ok(data)
            }
        }
    }

    /// §4.4.2 write. Forbidden in single-object mode.
    pub async fn write(&self, buf: &[u8], off: u64) -> Result<(), Error> {
        if self.config.sizes.is_none() {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let obj_size = self.obj_size();
        let (blockno1, head_offset) = (off / obj_size, off % obj_size);
        let (blockno2_excl, tail_len_in_last) = {
            let end = off + buf.len() as u64;
            (end / obj_size, end % obj_size)
        };

        // Contained-unaligned case: whole write lands inside one block and isn't
        // aligned on both ends.
        if head_offset != 0 && blockno1 == blockno2_excl {
            let key = block_key(self.key_prefix(), blockno1);
            let _guard = self.locks.lock(&key);
            let mut block = self.get_full_block(&key, obj_size).await?;
            let start = head_offset as usize;
            block[start..start + buf.len()].copy_from_slice(buf);
            self.store.put(&key, block).await?;
            return Ok(());
        }
        let mut cursor = 0usize;
        let mut first_body_block = blockno1;

        if head_offset != 0 {
            let key = block_key(self.key_prefix(), blockno1);
            let _guard = self.locks.lock(&key);
            let prefix_len = head_offset as usize;
            let prefix = self.get_or_zero(&key, Some((0, head_offset - 1)), prefix_len).await?;
            let take = (obj_size - head_offset) as usize;
            let mut block = Vec::with_capacity(obj_size as usize);
            block.extend_from_slice(&prefix);
            block.extend_from_slice(&buf[..take]);
            debug_assert_eq!(block.len(), obj_size as usize);
            self.store.put(&key, block).await?;
            cursor += take;
            first_body_block = blockno1 + 1;
        }

        for blockno in first_body_block..blockno2_excl {
            let key = block_key(self.key_prefix(), blockno);
            let _guard = self.locks.lock(&key);
            let block = buf[cursor..cursor + obj_size as usize].to_vec();
            self.store.put(&key, block).await?;
            cursor += obj_size as usize;
        }

        if tail_len_in_last != 0 {
            let key = block_key(self.key_prefix(), blockno2_excl);
            let _guard = self.locks.lock(&key);
            let suffix_len = (obj_size - tail_len_in_last) as usize;
            let suffix = self
                .get_or_zero(&key, Some((tail_len_in_last, obj_size - 1)), suffix_len)
                .await?;
            let tail_len = tail_len_in_last as usize;
            let mut block = Vec::with_capacity(obj_size as usize);
            block.extend_from_slice(&buf[buf.len() - tail_len..]);
            block.extend_from_slice(&suffix);
            debug_assert_eq!(block.len(), obj_size as usize);
            self.store.put(&key, block).await?;
            cursor += tail_len;
        }

        debug_assert_eq!(cursor, buf.len());
        Ok(())
    }

    async fn get_full_block(&self, key: &str, obj_size: u64) -> Result<Vec<u8>, Error> {
        self.get_or_zero(key, None, obj_size as usize).await
    }

    /// §4.4.3 zero.
    pub async fn zero(&self, off: u64, n: u64, flags: ZeroFlags) -> Result<(), Error> {
        if n == 0 {
            return Ok(());
        }
        if flags.may_trim {
            return self.trim(off, n).await;
        }
        if self.config.sizes.is_none() {
            return Err(Error::ReadOnly);
        }

        let obj_size = self.obj_size();
        let first = first_full_block(off, obj_size);
        let last_excl = last_full_block_exclusive(off, n, obj_size);

        if first >= last_excl {
            // Entirely within one block (or touches no full block): plain zero-write.
            let zeros = vec![0u8; n as usize];
            return self.write(&zeros, off).await;
        }

        let head_len = first * obj_size - off;
        if head_len > 0 {
            let zeros = vec![0u8; head_len as usize];
            self.write(&zeros, off).await?;
        }

        let tail_start = last_excl * obj_size;
        let tail_len = off + n - tail_start;
        if tail_len > 0 {
            let zeros = vec![0u8; tail_len as usize];
            self.write(&zeros, tail_start).await?;
        }

        self.delete_objects(first, last_excl).await
    }

    /// §4.4.4 trim.
    pub async fn trim(&self, off: u64, n: u64) -> Result<(), Error> {
        if n == 0 {
            return Ok(());
        }
        if self.config.sizes.is_none() {
            return Err(Error::ReadOnly);
        }
        let obj_size = self.obj_size();
        let first = first_full_block(off, obj_size);
        let last_excl = last_full_block_exclusive(off, n, obj_size);
        if first >= last_excl {
            return Ok(());
        }
        self.delete_objects(first, last_excl).await
    }

    /// §4.4.5 bulk deletion of blocks `[first, last_excl)`, skipping holes via `list`.
    async fn delete_objects(&self, first: u64, last_excl: u64) -> Result<(), Error> {
        let start_after = if first > 0 { block_key(self.key_prefix(), first - 1) } else { String::new() };
        let last_key = block_key(self.key_prefix(), last_excl);
        let prefix = format!("{}/", self.key_prefix());

        let start_after_opt = if start_after.is_empty() { None } else { Some(start_after.as_str()) };
        let keys = self.store.list(&prefix, start_after_opt).await?;

        let mut batch = Vec::new();
        for key in keys {
            if key.as_str() >= last_key.as_str() {
                break;
            }
            batch.push(key);
            if batch.len() == DELETE_BATCH_LIMIT {
                self.store.delete_many(&batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.store.delete_many(&batch).await?;
        }
        Ok(())
    }

    /// §4.4.6 flush: a no-op, every write is already durable on return.
    pub async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    /// §4.4.7 size discovery. Falls back to a rangeless `get` when `head` isn't
    /// available, mirroring `get_size`'s `head_object`/`get_object` fallback.
    pub async fn size(&self) -> Result<u64, Error> {
        if let Some(sizes) = self.config.sizes {
            return Ok(sizes.dev_size);
        }
        match self.store.head(&self.config.key).await {
            Ok(len) => Ok(len),
            Err(_) => match self.store.get(&self.config.key, None).await? {
                GetResult::Found(data) => Ok(data.len() as u64),
                GetResult::NoSuchKey => {
                    Err(Error::Assertion(format!("NoSuchKey: {}", self.config.key)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::test_support::MockObjectStore;

    const OBJ_SIZE: u64 = 64;
    const DEV_SIZE: u64 = OBJ_SIZE * 100;

    fn translator() -> BlockTranslator<MockObjectStore> {
        let config = ConfigBuilder::new()
            .bucket("test-bucket")
            .key("nbdkit_test")
            .size(Some(DEV_SIZE))
            .object_size(Some(OBJ_SIZE))
            .build()
            .unwrap();
        BlockTranslator::new(config, MockObjectStore::new())
    }

    #[tokio::test]
    async fn read_hole_returns_zeros() {
        let t = translator();
        let mut buf = vec![0xffu8; OBJ_SIZE as usize];
        t.read(&mut buf, 5 * OBJ_SIZE).await.unwrap();
        assert_eq!(buf, vec![0u8; OBJ_SIZE as usize]);
    }

    #[tokio::test]
    async fn aligned_readwrite_roundtrips_and_overwrites() {
        let t = translator();
        let buf1 = vec![b'x'; OBJ_SIZE as usize];
        t.write(&buf1, OBJ_SIZE).await.unwrap();
        let mut out = vec![0u8; OBJ_SIZE as usize];
        t.read(&mut out, OBJ_SIZE).await.unwrap();
        assert_eq!(out, buf1);

        let buf2 = vec![b'y'; OBJ_SIZE as usize];
        t.write(&buf2, OBJ_SIZE).await.unwrap();
        t.read(&mut out, OBJ_SIZE).await.unwrap();
        assert_eq!(out, buf2);
    }

    #[tokio::test]
    async fn partial_read_spans_two_blocks() {
        let t = translator();
        let buf1 = vec![b'x'; OBJ_SIZE as usize];
        let buf2 = vec![b'y'; OBJ_SIZE as usize];
        t.write(&buf1, 0).await.unwrap();
        t.write(&buf2, OBJ_SIZE).await.unwrap();

        let half = (OBJ_SIZE / 2) as usize;
        let mut out = vec![0u8; OBJ_SIZE as usize];
        t.read(&mut out, half as u64).await.unwrap();

        assert_eq!(&out[..half], &buf1[half..]);
        assert_eq!(&out[half..], &buf2[..half]);
    }

    #[tokio::test]
    async fn partial_write_is_a_read_modify_write() {
        let t = translator();
        let buf1 = vec![b'x'; OBJ_SIZE as usize];
        t.write(&buf1, 0).await.unwrap();

        let quarter = (OBJ_SIZE / 4) as usize;
        let buf2 = vec![b'y'; quarter];
        t.write(&buf2, quarter as u64).await.unwrap();

        let mut expected = buf1.clone();
        expected[quarter..quarter + buf2.len()].copy_from_slice(&buf2);

        let mut out = vec![0u8; OBJ_SIZE as usize];
        t.read(&mut out, 0).await.unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn read_across_three_aligned_blocks() {
        let t = translator();
        let b1 = vec![b'x'; OBJ_SIZE as usize];
        let b2 = vec![b'y'; OBJ_SIZE as usize];
        let b3 = vec![b'z'; OBJ_SIZE as usize];
        t.write(&b1, 0).await.unwrap();
        t.write(&b2, OBJ_SIZE).await.unwrap();
        t.write(&b3, 2 * OBJ_SIZE).await.unwrap();

        let mut out = vec![0u8; 3 * OBJ_SIZE as usize];
        t.read(&mut out, 0).await.unwrap();

        let expected: Vec<u8> = b1.iter().chain(&b2).chain(&b3).copied().collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn write_across_three_aligned_blocks() {
        let t = translator();
        let buf: Vec<u8> = vec![b'x'; OBJ_SIZE as usize]
            .into_iter()
            .chain(vec![b'y'; OBJ_SIZE as usize])
            .chain(vec![b'z'; OBJ_SIZE as usize])
            .collect();
        t.write(&buf, 0).await.unwrap();

        let mut b1 = vec![0u8; OBJ_SIZE as usize];
        let mut b2 = vec![0u8; OBJ_SIZE as usize];
        let mut b3 = vec![0u8; OBJ_SIZE as usize];
        t.read(&mut b1, 0).await.unwrap();
        t.read(&mut b2, OBJ_SIZE).await.unwrap();
        t.read(&mut b3, 2 * OBJ_SIZE).await.unwrap();

        let got: Vec<u8> = b1.into_iter().chain(b2).chain(b3).collect();
        assert_eq!(got, buf);
    }

    #[tokio::test]
    async fn trim_deletes_fully_covered_blocks_only() {
        let t = translator();
        let buf = vec![b'x'; (3 * OBJ_SIZE) as usize];
        t.write(&buf, 0).await.unwrap();

        // trim [OBJ_SIZE/2, OBJ_SIZE/2 + 2*OBJ_SIZE): only block 1 is fully covered.
        let half = OBJ_SIZE / 2;
        t.trim(half, 2 * OBJ_SIZE).await.unwrap();

        let mut b0 = vec![0u8; OBJ_SIZE as usize];
        let mut b1 = vec![0u8; OBJ_SIZE as usize];
        t.read(&mut b0, 0).await.unwrap();
        t.read(&mut b1, OBJ_SIZE).await.unwrap();

        assert_eq!(b0, vec![b'x'; OBJ_SIZE as usize], "untouched block survives trim");
        assert_eq!(b1, vec![0u8; OBJ_SIZE as usize], "fully covered block reads as a hole");
    }

    #[tokio::test]
    async fn zero_without_trim_still_deletes_fully_covered_blocks() {
        let t = translator();
        let buf = vec![b'x'; (3 * OBJ_SIZE) as usize];
        t.write(&buf, 0).await.unwrap();

        t.zero(0, 3 * OBJ_SIZE, ZeroFlags { may_trim: false }).await.unwrap();

        let mut out = vec![0xffu8; (3 * OBJ_SIZE) as usize];
        t.read(&mut out, 0).await.unwrap();
        assert_eq!(out, vec![0u8; (3 * OBJ_SIZE) as usize]);
    }

    #[tokio::test]
    async fn zero_with_trim_is_equivalent_to_trim() {
        let t = translator();
        let buf = vec![b'x'; OBJ_SIZE as usize];
        t.write(&buf, 0).await.unwrap();

        t.zero(0, OBJ_SIZE, ZeroFlags { may_trim: true }).await.unwrap();

        let mut out = vec![0xffu8; OBJ_SIZE as usize];
        t.read(&mut out, 0).await.unwrap();
        assert_eq!(out, vec![0u8; OBJ_SIZE as usize]);
    }

    #[tokio::test]
    async fn flush_is_a_no_op() {
        let t = translator();
        t.flush().await.unwrap();
    }

    #[tokio::test]
    async fn size_reports_configured_device_size() {
        let t = translator();
        assert_eq!(t.size().await.unwrap(), DEV_SIZE);
    }

    #[tokio::test]
    async fn size_falls_back_to_get_when_head_is_unavailable() {
        let store = MockObjectStore::without_head_support();
        store.put_sync("single-object-key", vec![b'q'; 4096]);
        let config = ConfigBuilder::new()
            .bucket("test-bucket")
            .key("single-object-key")
            .build()
            .unwrap();
        let t = BlockTranslator::new(config, store);
        assert_eq!(t.size().await.unwrap(), 4096);
    }
}
