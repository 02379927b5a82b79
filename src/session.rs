//! Session Facade: one handle per host connection, owning an object-store client
//! and a dedicated Tokio runtime used to drive it from the synchronous
//! `VhostUserBackendMut` event loop. §4.5.

use log::{error, warn};
use tokio::runtime::{Builder, Runtime};

use crate::config::Config;
use crate::error::Error;
use crate::object_store::ObjectStore;
use crate::translator::{BlockTranslator, ZeroFlags};

/// A session's status-code outcome: `Ok` or a virtio-blk status to report to the
/// host. There is no richer status than `VIRTIO_BLK_S_IOERR` to distinguish
/// transient from permanent failures, so the facade only varies the log level.
pub type SessionResult<T> = Result<T, ()>;

pub struct Session<S: ObjectStore> {
    translator: BlockTranslator<S>,
    runtime: Runtime,
}

impl<S: ObjectStore> Session<S> {
    pub fn new(config: Config, store: S) -> Self {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build per-session Tokio runtime");
        Self { translator: BlockTranslator::new(config, store), runtime }
    }

    pub fn config(&self) -> &Config {
        self.translator.config()
    }

    fn log_and_discard(op: &str, err: Error) {
        if err.is_transient() {
            warn!("{op}: transient backend error: {err}");
        } else {
            error!("{op}: {err}");
        }
    }

    pub fn read(&self, buf: &mut [u8], off: u64) -> SessionResult<()> {
        self.runtime
            .block_on(self.translator.read(buf, off))
            .map_err(|e| Self::log_and_discard("read", e))
    }

    pub fn write(&self, buf: &[u8], off: u64) -> SessionResult<()> {
        self.runtime
            .block_on(self.translator.write(buf, off))
            .map_err(|e| Self::log_and_discard("write", e))
    }

    pub fn zero(&self, off: u64, n: u64, flags: ZeroFlags) -> SessionResult<()> {
        self.runtime
            .block_on(self.translator.zero(off, n, flags))
            .map_err(|e| Self::log_and_discard("zero", e))
    }

    pub fn trim(&self, off: u64, n: u64) -> SessionResult<()> {
        self.runtime
            .block_on(self.translator.trim(off, n))
            .map_err(|e| Self::log_and_discard("trim", e))
    }

    pub fn flush(&self) -> SessionResult<()> {
        self.runtime
            .block_on(self.translator.flush())
            .map_err(|e| Self::log_and_discard("flush", e))
    }

    pub fn size(&self) -> SessionResult<u64> {
        self.runtime
            .block_on(self.translator.size())
            .map_err(|e| Self::log_and_discard("size", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::test_support::MockObjectStore;

    fn session() -> Session<MockObjectStore> {
        let config = ConfigBuilder::new()
            .bucket("b")
            .key("disk")
            .size(Some(320))
            .object_size(Some(16))
            .build()
            .unwrap();
        Session::new(config, MockObjectStore::new())
    }

    #[test]
    fn round_trips_through_the_runtime_bridge() {
        let session = session();
        session.write(b"hello!!!", 10).unwrap();
        let mut buf = [0u8; 8];
        session.read(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello!!!");
    }

    #[test]
    fn size_reports_the_configured_device_size() {
        let session = session();
        assert_eq!(session.size().unwrap(), 320);
    }
}
