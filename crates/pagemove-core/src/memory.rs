//! Physical memory: the frame table, partitions and the swap cache
//!
//! [`PhysMemory`] is the allocator collaborator. Frames are handed out from
//! per-zone free lists with a reference count of one; dropping the last
//! reference returns a frame to its zone with its flags, metadata and bytes
//! reset. Allocation never blocks and never reclaims.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffers::BufferRing;
use crate::cache::{BackingStore, StoreKind};
use crate::error::{MigrateError, Result};
use crate::flags::{AllocFlags, FrameFlags};
use crate::frame::{Frame, Owner};
use crate::page::{pages_in_order, FrameId, PartitionId, PAGE_SIZE};
use crate::partition::{Partition, PartitionStat, Zone};
use crate::relocate::GenericRelocator;

/// Zone layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Frame descriptors in the zone
    pub frames: u32,
    /// Capacity in base pages; a huge frame consumes 512 of them
    pub pages: u64,
    /// High watermark in base pages
    pub high_watermark: u64,
    /// Whether reclaim can make progress here
    pub reclaimable: bool,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            frames: 128,
            pages: 4096,
            high_watermark: 32,
            reclaimable: true,
        }
    }
}

/// Partition layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Zones, lowest first
    pub zones: Vec<ZoneConfig>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            zones: vec![ZoneConfig::default()],
        }
    }
}

impl PartitionConfig {
    /// A partition without any memory
    pub fn memoryless() -> Self {
        Self { zones: Vec::new() }
    }
}

/// Physical memory layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Partitions, indexed by [`PartitionId`]
    pub partitions: Vec<PartitionConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            partitions: vec![PartitionConfig::default(), PartitionConfig::default()],
        }
    }
}

impl MemoryConfig {
    /// `count` identical partitions with one zone each
    pub fn uniform(count: usize, zone: ZoneConfig) -> Self {
        Self {
            partitions: (0..count)
                .map(|_| PartitionConfig {
                    zones: vec![zone.clone()],
                })
                .collect(),
        }
    }

    /// Validate the layout
    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(MigrateError::InvalidConfig(
                "at least one partition is required".to_string(),
            ));
        }
        if self.partitions.len() > u16::MAX as usize {
            return Err(MigrateError::InvalidConfig(format!(
                "too many partitions: {}",
                self.partitions.len()
            )));
        }

        let mut frames: u64 = 0;
        for (p, part) in self.partitions.iter().enumerate() {
            for (z, zone) in part.zones.iter().enumerate() {
                if zone.pages < zone.frames as u64 {
                    return Err(MigrateError::InvalidConfig(format!(
                        "partition {p} zone {z}: {} pages cannot back {} frames",
                        zone.pages, zone.frames
                    )));
                }
                frames += zone.frames as u64;
            }
        }
        if frames > u32::MAX as u64 {
            return Err(MigrateError::InvalidConfig(format!(
                "too many frames: {frames}"
            )));
        }
        Ok(())
    }
}

/// The frame table and its partitions
#[derive(Debug)]
pub struct PhysMemory {
    frames: Vec<Frame>,
    partitions: Vec<Partition>,
    swap: Arc<BackingStore>,
}

impl PhysMemory {
    /// Build physical memory from a layout
    pub fn new(config: MemoryConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut frames = Vec::new();
        let mut partitions = Vec::with_capacity(config.partitions.len());

        for (p, part) in config.partitions.iter().enumerate() {
            let pid = PartitionId::new(p as u16);
            let mut zones = Vec::with_capacity(part.zones.len());
            for (z, zone) in part.zones.iter().enumerate() {
                let first = frames.len() as u32;
                let ids: Vec<FrameId> = (first..first + zone.frames)
                    .rev()
                    .map(FrameId::new)
                    .collect();
                frames.extend(
                    (first..first + zone.frames).map(|id| Frame::new(FrameId::new(id), pid, z)),
                );
                let present = if zone.frames == 0 { 0 } else { zone.pages };
                zones.push(Zone::new(ids, present, zone.high_watermark, zone.reclaimable));
            }
            partitions.push(Partition::new(pid, zones));
        }

        debug!(
            partitions = partitions.len(),
            frames = frames.len(),
            "physical memory initialized"
        );

        let swap = Arc::new(
            BackingStore::new(StoreKind::Swap).with_relocator(Arc::new(GenericRelocator)),
        );

        Ok(Arc::new(Self {
            frames,
            partitions,
            swap,
        }))
    }

    /// Frame descriptor for an id handed out by this memory
    #[inline]
    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id.index()]
    }

    /// Frame descriptor, if the id is in range
    #[inline]
    pub fn try_frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.index())
    }

    /// Total frame descriptors
    #[inline]
    pub fn nr_frames(&self) -> usize {
        self.frames.len()
    }

    /// Partition by id
    #[inline]
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id.index())
    }

    /// All partitions
    #[inline]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The swap cache
    #[inline]
    pub fn swap_cache(&self) -> &Arc<BackingStore> {
        &self.swap
    }

    /// Adjust a counter on the partition a frame resides in
    pub(crate) fn mod_frame_stat(&self, id: FrameId, stat: PartitionStat, delta: i64) {
        if let Some(part) = self.partition(self.frame(id).partition()) {
            part.mod_stat(stat, delta);
        }
    }

    /// Allocate a frame of `order` on `partition`.
    ///
    /// Falls back to other partitions unless [`AllocFlags::THIS_NODE`] is
    /// given. The frame starts with one reference and zeroed bytes.
    pub fn alloc(&self, partition: PartitionId, order: u8, flags: AllocFlags) -> Option<FrameId> {
        let pages = pages_in_order(order) as u64;
        let preferred = self.partition(partition).and_then(|p| Self::take_from(p, pages));

        let id = preferred.or_else(|| {
            if flags.contains(AllocFlags::THIS_NODE) {
                return None;
            }
            self.partitions
                .iter()
                .filter(|p| p.id() != partition)
                .find_map(|p| Self::take_from(p, pages))
        });

        let Some(id) = id else {
            if !flags.contains(AllocFlags::NO_WARN) {
                warn!(partition = %partition, order, "frame allocation failed");
            }
            return None;
        };

        self.frame(id).init(order, PAGE_SIZE << order);
        Some(id)
    }

    fn take_from(partition: &Partition, pages: u64) -> Option<FrameId> {
        partition
            .zones()
            .iter()
            .rev()
            .find_map(|zone| zone.take(pages))
    }

    /// Take a reference on a live frame
    #[inline]
    pub fn get(&self, id: FrameId) {
        self.frame(id).get();
    }

    /// Drop a reference, freeing the frame when it was the last one
    pub fn put(&self, id: FrameId) {
        if self.frame(id).put_testzero() {
            self.free_frame(id);
        }
    }

    fn free_frame(&self, id: FrameId) {
        let frame = self.frame(id);
        let pages = frame.nr_pages() as u64;
        if frame.test(FrameFlags::MLOCKED) {
            self.mod_frame_stat(id, PartitionStat::Mlocked, -(pages as i64));
        }
        frame.reset();
        if let Some(zone) = self
            .partition(frame.partition())
            .and_then(|p| p.zones().get(frame.zone()))
        {
            zone.give(id, pages);
        }
    }

    /// Backing store and key of a cache-indexed frame.
    ///
    /// File frames are indexed by their owner; anonymous frames only while
    /// they sit in the swap cache, keyed by their swap entry.
    pub fn cache_identity(&self, id: FrameId) -> Option<(Arc<BackingStore>, u64)> {
        let frame = self.frame(id);
        let meta = frame.meta();
        match &meta.owner {
            Owner::File { store, index } => Some((Arc::clone(store), *index)),
            _ if frame.test(FrameFlags::SWAP_CACHE) => Some((Arc::clone(&self.swap), meta.private)),
            _ => None,
        }
    }

    /// Place an anonymous frame in the swap cache under `entry`
    pub fn add_to_swap_cache(&self, id: FrameId, entry: u64) -> Result<()> {
        let frame = self.frame(id);
        if frame.test(FrameFlags::SWAP_CACHE) {
            return Err(MigrateError::InvalidArgument(format!(
                "{id} is already in the swap cache"
            )));
        }
        {
            let mut index = self.swap.lock_index();
            if index.contains(entry) {
                return Err(MigrateError::InvalidArgument(format!(
                    "swap entry {entry} is in use"
                )));
            }
            frame.get();
            frame.meta().private = entry;
            frame.set(FrameFlags::SWAP_CACHE | FrameFlags::SWAP_BACKED | FrameFlags::UPTODATE);
            index.insert(entry, id);
        }
        self.mod_frame_stat(id, PartitionStat::FilePages, frame.nr_pages() as i64);
        Ok(())
    }

    /// Mark a frame dirty, tagging its cache slot
    pub fn set_dirty(&self, id: FrameId) -> bool {
        let frame = self.frame(id);
        if frame.test_and_set(FrameFlags::DIRTY) {
            return false;
        }
        if let Owner::File { store, index } = frame.owner() {
            store.tag_dirty(index);
        }
        true
    }

    /// Clear the dirty bit ahead of I/O; false when it was already clean
    pub fn clear_dirty_for_io(&self, id: FrameId) -> bool {
        let frame = self.frame(id);
        if let Owner::File { store, index } = frame.owner() {
            store.clear_dirty_tag(index);
        }
        frame.test_and_clear(FrameFlags::DIRTY)
    }

    /// Attach `count` block buffers to a frame as its private state
    pub fn attach_buffers(&self, id: FrameId, count: usize) -> Result<Arc<BufferRing>> {
        let frame = self.frame(id);
        let mut meta = frame.meta();
        if meta.buffers.is_some() {
            return Err(MigrateError::InvalidArgument(format!(
                "{id} already has buffers"
            )));
        }
        let ring = Arc::new(BufferRing::new(id, count));
        meta.buffers = Some(Arc::clone(&ring));
        frame.get();
        frame.set(FrameFlags::PRIVATE);
        Ok(ring)
    }

    /// Detach private buffers when none is in use.
    ///
    /// Returns false while some buffer is locked or referenced.
    pub fn try_release_private(&self, id: FrameId) -> bool {
        let frame = self.frame(id);
        {
            let mut meta = frame.meta();
            match &meta.buffers {
                Some(ring) if ring.is_busy() => return false,
                Some(_) => meta.buffers = None,
                None => {}
            }
        }
        if frame.test_and_clear(FrameFlags::PRIVATE) {
            self.put(id);
        }
        true
    }
}
