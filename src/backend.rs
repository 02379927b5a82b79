//! The `VhostUserBackendMut` adapter: decodes virtio-blk request chains and
//! dispatches them onto a [`Session`].

use std::ops::Deref;
use std::sync::{Arc, RwLockWriteGuard};

use log::{error, trace, warn};
use smallvec::{SmallVec, smallvec};
use vhost::vhost_user::message::VHOST_USER_CONFIG_OFFSET;
use vhost::vhost_user::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackendMut, VringRwLock, VringState, VringT};
use virtio_bindings::virtio_blk::{
    VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP,
    VIRTIO_BLK_T_DISCARD, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN,
    VIRTIO_BLK_T_OUT, VIRTIO_BLK_T_WRITE_ZEROES, VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP,
    virtio_blk_config as VirtioBlockConfig, virtio_blk_outhdr as VirtioBlockHeader,
};
use virtio_queue::{DescriptorChain, QueueT, desc::split::Descriptor};
use vm_memory::{
    ByteValued, Bytes, GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryAtomic,
    GuestMemoryMmap, bitmap::Bitmap,
};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use crate::object_store::ObjectStore;
use crate::session::Session;
use crate::translator::ZeroFlags;

// Matches the teacher's wrapper-type convention: kernel uapi structs need a local
// newtype to implement `ByteValued` for use with `read_obj`/`write_obj`.
#[derive(Copy, Clone)]
#[allow(dead_code)]
struct VirtioBlockConfigWriter(VirtioBlockConfig);
unsafe impl ByteValued for VirtioBlockConfigWriter {}

#[derive(Copy, Clone)]
#[allow(dead_code)]
struct VirtioBlockHeaderReader(VirtioBlockHeader);
unsafe impl ByteValued for VirtioBlockHeaderReader {}

/// `struct virtio_blk_discard_write_zeroes` (include/uapi/linux/virtio_blk.h):
/// one discard/write-zeroes segment. virtio-bindings doesn't expose this one as a
/// plain struct with accessible fields usable via `read_obj`, so it's defined here.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct VirtioBlkDiscardWriteZeroes {
    sector: u64,
    num_sectors: u32,
    flags: u32,
}
unsafe impl ByteValued for VirtioBlkDiscardWriteZeroes {}

const SECTOR_SIZE: u64 = 512;
const QUEUE_SIZE: usize = 1024;
const SEG_MAX: usize = 16;

#[derive(Debug, thiserror::Error)]
enum Error {
    NoHead,
    NeedRead,
    NeedWrite,
    NoStatus,
    Mem,
    StatusDescTooSmall,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e)
    }
}

fn read_virtio_blk_outhdr<B: Bitmap + 'static>(
    mem: &vm_memory::GuestMemoryMmap<B>,
    addr: GuestAddress,
) -> Result<VirtioBlockHeader, Error> {
    Ok(mem
        .read_obj::<VirtioBlockHeaderReader>(addr)
        .map_err(|_| Error::Mem)?
        .0)
}

struct ProcessItemResponse {
    status: u8,
    status_addr: GuestAddress,
    len: u32,
}

impl ProcessItemResponse {
    fn ok(len: u32, status_desc: &Descriptor) -> Self {
        ProcessItemResponse { status: VIRTIO_BLK_S_OK as u8, len, status_addr: status_desc.addr() }
    }
    fn ioerr(status_desc: &Descriptor) -> Self {
        ProcessItemResponse { status: VIRTIO_BLK_S_IOERR as u8, len: 1, status_addr: status_desc.addr() }
    }
    fn unsupp(status_desc: &Descriptor) -> Self {
        ProcessItemResponse { status: VIRTIO_BLK_S_UNSUPP as u8, len: 1, status_addr: status_desc.addr() }
    }
}

#[derive(Default, Debug)]
struct Metrics {
    reads: usize,
    writes: usize,
    flushes: usize,
    discards: usize,
    write_zeroes: usize,
    segments: usize,
}

pub struct VhostUserBlockService<S: ObjectStore> {
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
    config: VirtioBlockConfig,
    exit_evt: EventFd,
    session: Arc<Session<S>>,
    metrics: Metrics,
}

impl<S: ObjectStore> VhostUserBlockService<S> {
    pub fn new(mem: GuestMemoryAtomic<GuestMemoryMmap>, exit_evt: EventFd, session: Arc<Session<S>>, config: VirtioBlockConfig) -> Self {
        Self { mem, config, exit_evt, session, metrics: Metrics::default() }
    }

    fn process_queue(&mut self, vring: &mut RwLockWriteGuard<'_, VringState>) -> Result<bool, Error> {
        let mut used_any = false;
        while let Some(mut chain) = vring.get_queue_mut().pop_descriptor_chain(self.mem.memory()) {
            let len = match self.process_item(&mut chain) {
                Ok(ProcessItemResponse { status, len, status_addr }) => {
                    chain.memory().write_obj(status, status_addr).unwrap();
                    len
                }
                Err(e) => {
                    error!("error process_item {e}");
                    1
                }
            };
            used_any = true;
            vring.add_used(chain.head_index(), len).unwrap();
        }
        Ok(used_any)
    }

    fn process_item<M>(&mut self, chain: &mut DescriptorChain<M>) -> Result<ProcessItemResponse, Error>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        let head_desc = chain.next().ok_or(Error::NoHead).inspect_err(|_| error!("no head"))?;
        if head_desc.is_write_only() {
            error!("head not readable");
            return Err(Error::NeedRead);
        }

        let header = read_virtio_blk_outhdr(chain.memory(), head_desc.addr())
            .inspect_err(|e| error!("read head {e}"))?;
        trace!("header {:?}", header);

        let mut data_descs: SmallVec<[Descriptor; SEG_MAX]> = smallvec![];
        let mut status_desc = None;
        while let Some(desc) = chain.next() {
            if desc.has_next() {
                data_descs.push(desc);
            } else {
                status_desc = Some(desc);
            }
        }
        let status_desc = status_desc.ok_or(Error::NoStatus)?;
        if status_desc.len() < 1 {
            return Err(Error::StatusDescTooSmall);
        }

        let resp = match header.type_ {
            VIRTIO_BLK_T_IN => self.handle_read(chain, &header, &data_descs, &status_desc)?,
            VIRTIO_BLK_T_OUT => self.handle_write(chain, &header, &data_descs, &status_desc)?,
            VIRTIO_BLK_T_FLUSH => self.handle_flush(&status_desc),
            VIRTIO_BLK_T_DISCARD => self.handle_discard_or_write_zeroes(chain, &data_descs, &status_desc, false)?,
            VIRTIO_BLK_T_WRITE_ZEROES => self.handle_discard_or_write_zeroes(chain, &data_descs, &status_desc, true)?,
            VIRTIO_BLK_T_GET_ID => self.handle_get_id(chain, &data_descs, &status_desc)?,
            other => {
                warn!("unsupported request type {other}");
                ProcessItemResponse::unsupp(&status_desc)
            }
        };
        self.metrics.segments += data_descs.len();
        Ok(resp)
    }

    fn handle_read<M>(
        &self,
        chain: &DescriptorChain<M>,
        header: &VirtioBlockHeader,
        data_descs: &[Descriptor],
        status_desc: &Descriptor,
    ) -> Result<ProcessItemResponse, Error>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        for desc in data_descs {
            if !desc.is_write_only() {
                return Err(Error::NeedWrite);
            }
        }
        let off = header.sector * SECTOR_SIZE;
        let mut total_len = 0u32;
        let mut failed = false;
        let mut cursor = off;
        for desc in data_descs {
            let len = desc.len();
            let mut buf = vec![0u8; len as usize];
            if self.session.read(&mut buf, cursor).is_err() {
                failed = true;
                break;
            }
            chain.memory().get_slice(desc.addr(), len as usize).unwrap().copy_from(&buf);
            total_len += len;
            cursor += len as u64;
        }
        if failed {
            return Ok(ProcessItemResponse::ioerr(status_desc));
        }
        Ok(ProcessItemResponse::ok(total_len, status_desc))
    }

    fn handle_write<M>(
        &mut self,
        chain: &DescriptorChain<M>,
        header: &VirtioBlockHeader,
        data_descs: &[Descriptor],
        status_desc: &Descriptor,
    ) -> Result<ProcessItemResponse, Error>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        for desc in data_descs {
            if desc.is_write_only() {
                return Err(Error::NeedRead);
            }
        }
        if !self.session.config().is_multi_object() {
            return Ok(ProcessItemResponse::ioerr(status_desc));
        }
        let mut cursor = header.sector * SECTOR_SIZE;
        for desc in data_descs {
            let len = desc.len();
            let mut data = vec![0u8; len as usize];
            chain.memory().get_slice(desc.addr(), len as usize).unwrap().copy_to(&mut data);
            if self.session.write(&data, cursor).is_err() {
                return Ok(ProcessItemResponse::ioerr(status_desc));
            }
            cursor += len as u64;
        }
        self.metrics.writes += 1;
        Ok(ProcessItemResponse::ok(0, status_desc))
    }

    fn handle_flush(&mut self, status_desc: &Descriptor) -> ProcessItemResponse {
        self.metrics.flushes += 1;
        match self.session.flush() {
            Ok(()) => ProcessItemResponse::ok(0, status_desc),
            Err(()) => ProcessItemResponse::ioerr(status_desc),
        }
    }

    fn handle_discard_or_write_zeroes<M>(
        &mut self,
        chain: &DescriptorChain<M>,
        data_descs: &[Descriptor],
        status_desc: &Descriptor,
        write_zeroes: bool,
    ) -> Result<ProcessItemResponse, Error>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        if !self.session.config().is_multi_object() {
            return Ok(ProcessItemResponse::ioerr(status_desc));
        }
        for desc in data_descs {
            let seg: VirtioBlkDiscardWriteZeroes = chain
                .memory()
                .read_obj(desc.addr())
                .map_err(|_| Error::Mem)?;
            let off = seg.sector * SECTOR_SIZE;
            let len = seg.num_sectors as u64 * SECTOR_SIZE;

            let result = if write_zeroes {
                self.metrics.write_zeroes += 1;
                let may_trim = seg.flags & VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP != 0;
                self.session.zero(off, len, ZeroFlags { may_trim })
            } else {
                self.metrics.discards += 1;
                self.session.trim(off, len)
            };
            if result.is_err() {
                return Ok(ProcessItemResponse::ioerr(status_desc));
            }
        }
        Ok(ProcessItemResponse::ok(0, status_desc))
    }

    fn handle_get_id<M>(
        &self,
        chain: &DescriptorChain<M>,
        data_descs: &[Descriptor],
        status_desc: &Descriptor,
    ) -> Result<ProcessItemResponse, Error>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        let Some(desc) = data_descs.first() else {
            return Err(Error::NeedWrite);
        };
        if !desc.is_write_only() {
            return Err(Error::NeedWrite);
        }
        let id = b"virtio-user-block-s3\0\0\0\0\0\0\0\0\0\0\0\0";
        let len = (VIRTIO_BLK_ID_BYTES as usize).min(desc.len() as usize).min(id.len());
        chain.memory().get_slice(desc.addr(), len).unwrap().copy_from(&id[..len]);
        Ok(ProcessItemResponse::ok(len as u32, status_desc))
    }
}

impl<S: ObjectStore + 'static> VhostUserBackendMut for VhostUserBlockService<S> {
    type Bitmap = ();
    type Vring = VringRwLock;

    fn num_queues(&self) -> usize {
        1
    }

    fn max_queue_size(&self) -> usize {
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        use virtio_bindings::virtio_blk::*;
        use virtio_bindings::virtio_config::*;

        let mut features = (1 << VIRTIO_BLK_F_SEG_MAX)
            | (1 << VIRTIO_BLK_F_BLK_SIZE)
            | (1 << VIRTIO_BLK_F_MQ)
            | (1 << VIRTIO_BLK_F_FLUSH)
            | (1 << VIRTIO_F_VERSION_1)
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits();

        if self.session.config().is_multi_object() {
            features |= (1 << VIRTIO_BLK_F_DISCARD) | (1 << VIRTIO_BLK_F_WRITE_ZEROES);
        } else {
            features |= 1 << VIRTIO_BLK_F_RO;
        }
        features
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::CONFIG
    }

    fn update_memory(&mut self, _mem: GuestMemoryAtomic<GuestMemoryMmap>) -> std::io::Result<()> {
        Ok(())
    }

    fn set_event_idx(&mut self, event_idx: bool) {
        if event_idx {
            warn!("event_idx unsupported, ignoring");
        }
    }

    fn handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock<GuestMemoryAtomic<GuestMemoryMmap>>],
        _thread_id: usize,
    ) -> std::io::Result<()> {
        if evset != EventSet::IN {
            warn!("handle_event called for non IN event");
            return Ok(());
        }

        let mut vring = vrings[device_event as usize].get_mut();
        if self
            .process_queue(&mut vring)
            .inspect_err(|e| error!("error while processing queue {e}"))
            .unwrap_or(false)
            && vring.needs_notification().unwrap()
        {
            vring.signal_used_queue().unwrap();
        }
        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        if offset != VHOST_USER_CONFIG_OFFSET {
            return vec![];
        }
        VirtioBlockConfigWriter(self.config).as_slice().get(..size as usize).unwrap_or(&[]).to_vec()
    }

    fn set_config(&mut self, _offset: u32, _buf: &[u8]) -> std::io::Result<()> {
        warn!("set_config called, ignoring");
        Ok(())
    }

    fn queues_per_thread(&self) -> Vec<u64> {
        vec![1]
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.exit_evt.try_clone().ok()
    }
}

/// Builds the `virtio_blk_config` advertised to the host: block size fields all
/// equal to `object-size`, capacity derived from the configured device size (or
/// 0 in single-object read-only mode, where size is discovered lazily via `head`).
pub fn build_virtio_blk_config(config: &crate::config::Config) -> VirtioBlockConfig {
    let (capacity, blk_size) = match config.sizes {
        Some(sizes) => (sizes.dev_size / SECTOR_SIZE, sizes.obj_size as u32),
        None => (0, SECTOR_SIZE as u32),
    };
    let physical_block_exp = blk_size.max(1).ilog2();
    VirtioBlockConfig {
        capacity,
        blk_size,
        size_max: 65536,
        seg_max: SEG_MAX as u32,
        num_queues: 1,
        physical_block_exp: physical_block_exp.try_into().unwrap_or(0),
        min_io_size: 1,
        opt_io_size: 1,
        ..Default::default()
    }
}
