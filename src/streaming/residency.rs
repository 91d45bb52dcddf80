/// Residency bookkeeping: which node payloads are loaded, pending or evicted
///
/// The manager owns the chunk slot allocator and the fetch pool. Node state
/// lives in the `SpatialIndex`; every method that moves a node takes the index
/// by `&mut` and only ever runs on the render thread. Workers communicate
/// through the fetch pool's channels and the handles' atomic flags.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use rustc_hash::{FxHashMap, FxHashSet};

use super::fetch::{FetchCompletion, FetchHandle, FetchJob, FetchOutcome, FetchPool, FetchSource};
use super::slot_allocator::{BufferSlotAllocator, SlotDiscipline, SlotId};
use crate::error::OctreeResult;
use crate::octree::{NodeId, NodeState, SpatialIndex};
use crate::persistence::payload_path;

/// Where payloads are kept between admissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyMode {
    /// Payloads are fetched on admission and dropped on eviction
    Streaming,
    /// The whole tree fits in RAM; the CPU budget is ignored and nothing is
    /// evicted to make room, but slot capacity still applies
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitPriority {
    /// Needed to draw the current frame; may evict non-visible residents
    Visible,
    /// Speculative; never evicts
    Prefetch,
}

#[derive(Debug, Clone)]
pub enum Admission {
    Resident,
    Pending(FetchHandle),
    /// No room right now; try again next frame
    Deferred,
    /// Can never become resident (broken payload, or larger than the budget)
    Rejected,
}

#[derive(Debug)]
struct PendingFetch {
    handle: FetchHandle,
    slot: SlotId,
    bytes: u64,
}

#[derive(Debug, Default)]
struct ResidencyTable {
    bytes_in_use: u64,
    pending: FxHashMap<NodeId, PendingFetch>,
    resident: FxHashSet<NodeId>,
    requested: FxHashSet<NodeId>,
    visible: FxHashSet<NodeId>,
    visible_last_frame: FxHashSet<NodeId>,
    prefetched: FxHashSet<NodeId>,
    prefetched_last_frame: FxHashSet<NodeId>,
}

impl ResidencyTable {
    fn is_visible(&self, id: NodeId) -> bool {
        self.visible.contains(&id) || self.visible_last_frame.contains(&id)
    }

    fn is_prefetched(&self, id: NodeId) -> bool {
        self.prefetched.contains(&id) || self.prefetched_last_frame.contains(&id)
    }
}

#[derive(Debug)]
pub struct ResidencyManager {
    mode: ResidencyMode,
    payload_dir: Option<PathBuf>,
    slots: BufferSlotAllocator,
    pool: FetchPool,
    cpu_budget: u64,
    camera: Vec3,
    table: ResidencyTable,
}

impl ResidencyManager {
    pub fn new(
        mode: ResidencyMode,
        payload_dir: Option<PathBuf>,
        slots: BufferSlotAllocator,
        pool: FetchPool,
        cpu_budget: u64,
    ) -> Self {
        Self {
            mode,
            payload_dir,
            slots,
            pool,
            cpu_budget,
            camera: Vec3::ZERO,
            table: ResidencyTable::default(),
        }
    }

    /// Forget every assignment and start over with a fresh slot pool
    ///
    /// Pending fetches are cancelled and resident nodes evicted. The slot pool
    /// is rebuilt, deferred releases included, so the renderer must drop every
    /// chunk buffer it still holds.
    pub fn reset(
        &mut self,
        index: &mut SpatialIndex,
        capacity: u32,
        discipline: SlotDiscipline,
        mode: ResidencyMode,
    ) -> OctreeResult<()> {
        let pending: Vec<(NodeId, PendingFetch)> = self.table.pending.drain().collect();
        for (id, pending) in pending {
            pending.handle.cancel();
            self.abort(index, id, pending.slot, pending.bytes)?;
        }
        let resident: Vec<NodeId> = self.table.resident.iter().copied().collect();
        for id in resident {
            self.evict(index, id)?;
        }
        self.table = ResidencyTable::default();
        self.mode = mode;
        self.slots.reset(capacity, discipline);
        log::info!(
            "[ResidencyManager::reset] {:?} mode with {} slots ({:?})",
            mode,
            capacity,
            discipline
        );
        Ok(())
    }

    /// Request residency for a node
    pub fn admit(
        &mut self,
        index: &mut SpatialIndex,
        id: NodeId,
        priority: AdmitPriority,
    ) -> OctreeResult<Admission> {
        let node = index.node(id)?;
        let (state, broken, payload_len, has_payload) = (
            node.state(),
            node.payload_broken,
            node.payload_len,
            node.payload.is_some(),
        );

        {
            let table = &mut self.table;
            table.requested.insert(id);
            match priority {
                AdmitPriority::Visible => table.visible.insert(id),
                AdmitPriority::Prefetch => table.prefetched.insert(id),
            };
            match state {
                NodeState::Resident => return Ok(Admission::Resident),
                NodeState::PendingLoad => {
                    return Ok(match table.pending.get(&id) {
                        Some(pending) => {
                            pending.handle.resume();
                            Admission::Pending(pending.handle.clone())
                        }
                        None => Admission::Deferred,
                    });
                }
                NodeState::Evicting => return Ok(Admission::Deferred),
                NodeState::Unloaded => {}
            }
        }

        if broken || payload_len == 0 {
            return Ok(Admission::Rejected);
        }
        let bytes = index.payload_bytes(id);
        let over_budget = self.mode == ResidencyMode::Streaming && bytes > self.cpu_budget;
        if over_budget || self.slots.capacity() == 0 {
            log::debug!(
                "[ResidencyManager::admit] Node {} ({} bytes) can never fit",
                id,
                bytes
            );
            return Ok(Admission::Rejected);
        }

        if !self.has_room(bytes) {
            if priority == AdmitPriority::Visible && self.mode == ResidencyMode::Streaming {
                self.evict_for(index, bytes)?;
            }
            if !self.has_room(bytes) {
                log::debug!(
                    "[ResidencyManager::admit] Deferring node {} ({:?}), {} bytes in use, {} slots free",
                    id,
                    priority,
                    self.bytes_in_use(),
                    self.slots.num_free_slots()
                );
                return Ok(Admission::Deferred);
            }
        }

        let Some(slot) = self.slots.acquire_slot() else {
            return Ok(Admission::Deferred);
        };
        index.node_mut(id)?.transition(id, NodeState::PendingLoad)?;
        self.table.bytes_in_use += bytes;

        if self.mode == ResidencyMode::InMemory && has_payload {
            self.promote(index, id, slot, None)?;
            return Ok(Admission::Resident);
        }
        self.submit_fetch(index, id, slot, bytes)
    }

    fn submit_fetch(
        &mut self,
        index: &mut SpatialIndex,
        id: NodeId,
        slot: SlotId,
        bytes: u64,
    ) -> OctreeResult<Admission> {
        let (payload, payload_len) = {
            let node = index.node(id)?;
            (node.payload.clone(), node.payload_len)
        };
        let source = match (payload, &self.payload_dir) {
            (Some(data), _) => Some(FetchSource::Memory(data)),
            (None, Some(dir)) => Some(FetchSource::File(payload_path(dir, id))),
            (None, None) => None,
        };
        let Some(source) = source else {
            log::warn!(
                "[ResidencyManager::submit_fetch] Node {} has no payload source, rendering from LOD only",
                id
            );
            index.node_mut(id)?.payload_broken = true;
            self.abort(index, id, slot, bytes)?;
            return Ok(Admission::Rejected);
        };

        let handle = FetchHandle::new(id);
        let job = FetchJob {
            handle: handle.clone(),
            source,
            values_per_star: index.values_per_star(),
            expected_records: payload_len,
        };
        self.table.pending.insert(
            id,
            PendingFetch {
                handle: handle.clone(),
                slot,
                bytes,
            },
        );
        if !self.pool.submit(job) {
            log::error!("[ResidencyManager::submit_fetch] Fetch pool is shut down");
            self.table.pending.remove(&id);
            self.abort(index, id, slot, bytes)?;
            return Ok(Admission::Deferred);
        }
        log::debug!(
            "[ResidencyManager::submit_fetch] Fetching node {} into slot {}",
            id,
            slot.0
        );
        Ok(Admission::Pending(handle))
    }

    /// Take a node out of residency, deferring slot reuse past in-flight draws
    pub fn evict(&mut self, index: &mut SpatialIndex, id: NodeId) -> OctreeResult<()> {
        let bytes = index.payload_bytes(id);
        let drop_payload = self.drops_payloads();
        let node = index.node_mut(id)?;
        node.transition(id, NodeState::Evicting)?;
        let slot = node.chunk_slot.take();
        if drop_payload {
            node.payload = None;
        }
        node.transition(id, NodeState::Unloaded)?;

        if let Some(slot) = slot {
            self.slots.release_slot(slot);
        }
        let table = &mut self.table;
        table.bytes_in_use = table.bytes_in_use.saturating_sub(bytes);
        table.resident.remove(&id);
        log::debug!("[ResidencyManager::evict] Evicted node {}", id);
        Ok(())
    }

    /// A node replaced by its children no longer draws: give its slot back,
    /// unless it was requested this frame or prefetched recently.
    /// Returns true if the node was evicted.
    pub fn release_refined(&mut self, index: &mut SpatialIndex, id: NodeId) -> OctreeResult<bool> {
        if !index.node(id)?.is_resident() {
            return Ok(false);
        }
        if self.table.requested.contains(&id) || self.table.is_prefetched(id) {
            return Ok(false);
        }
        self.evict(index, id)?;
        Ok(true)
    }

    /// Promote finished fetches; returns how many nodes became resident
    pub fn poll_completions(&mut self, index: &mut SpatialIndex) -> OctreeResult<usize> {
        let mut promoted = 0;
        for completion in self.pool.drain() {
            if self.handle_completion(index, completion)? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Block until no fetch is outstanding or `timeout` passes; true if drained
    pub fn wait_for_fetches(&mut self, index: &mut SpatialIndex, timeout: Duration) -> OctreeResult<bool> {
        let deadline = Instant::now() + timeout;
        self.poll_completions(index)?;
        while self.num_pending() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let Some(completion) = self.pool.recv_timeout(deadline - now) {
                self.handle_completion(index, completion)?;
            }
        }
        Ok(true)
    }

    fn handle_completion(&mut self, index: &mut SpatialIndex, completion: FetchCompletion) -> OctreeResult<bool> {
        let id = completion.handle.node();
        let pending = {
            let table = &mut self.table;
            match table.pending.get(&id) {
                Some(pending) if pending.handle.same_fetch(&completion.handle) => table.pending.remove(&id),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            // Left over from before a reset
            return Ok(false);
        };

        match completion.outcome {
            FetchOutcome::Loaded(data) if !pending.handle.is_cancelled() => {
                self.promote(index, id, pending.slot, Some(data))?;
                Ok(true)
            }
            FetchOutcome::Loaded(_) | FetchOutcome::Cancelled => {
                log::debug!("[ResidencyManager::handle_completion] Dropping cancelled fetch of node {}", id);
                self.abort(index, id, pending.slot, pending.bytes)?;
                Ok(false)
            }
            FetchOutcome::Failed(err) => {
                log::warn!(
                    "[ResidencyManager::handle_completion] Node {} payload unusable, rendering from LOD only: {}",
                    id,
                    err
                );
                index.node_mut(id)?.payload_broken = true;
                self.abort(index, id, pending.slot, pending.bytes)?;
                Ok(false)
            }
        }
    }

    fn promote(
        &mut self,
        index: &mut SpatialIndex,
        id: NodeId,
        slot: SlotId,
        data: Option<Arc<[f32]>>,
    ) -> OctreeResult<()> {
        let node = index.node_mut(id)?;
        node.transition(id, NodeState::Resident)?;
        node.chunk_slot = Some(slot);
        if let Some(data) = data {
            node.payload = Some(data);
        }
        node.generation = node.generation.wrapping_add(1);
        self.table.resident.insert(id);
        Ok(())
    }

    /// PendingLoad -> Unloaded, handing back the reserved slot and bytes
    fn abort(&mut self, index: &mut SpatialIndex, id: NodeId, slot: SlotId, bytes: u64) -> OctreeResult<()> {
        index.node_mut(id)?.transition(id, NodeState::Unloaded)?;
        self.slots.release_slot(slot);
        let table = &mut self.table;
        table.bytes_in_use = table.bytes_in_use.saturating_sub(bytes);
        Ok(())
    }

    /// Frame start: cancel fetches nobody asked for last frame, rotate the visible sets
    pub fn begin_frame(&mut self) {
        let table = &mut self.table;
        for (id, pending) in table.pending.iter() {
            if !table.requested.contains(id) && !pending.handle.is_cancelled() {
                log::debug!("[ResidencyManager::begin_frame] Cancelling stale fetch of node {}", id);
                pending.handle.cancel();
            }
        }
        table.visible_last_frame = std::mem::take(&mut table.visible);
        table.prefetched_last_frame = std::mem::take(&mut table.prefetched);
        table.requested.clear();
    }

    /// Frame boundary for deferred slot release
    pub fn end_frame(&mut self) {
        self.slots.end_frame();
    }

    /// The node is inside the view this frame and must not be evicted for room
    pub fn mark_visible(&mut self, id: NodeId) {
        self.table.visible.insert(id);
    }

    /// A draw submitted this frame reads from `slot`
    pub fn mark_referenced(&mut self, slot: SlotId) {
        self.slots.mark_referenced(slot);
    }

    pub fn set_camera(&mut self, camera: Vec3) {
        self.camera = camera;
    }

    pub fn set_cpu_budget(&mut self, cpu_budget: u64) {
        self.cpu_budget = cpu_budget;
    }

    pub fn resize_slots(&mut self, capacity: u32) {
        self.slots.resize(capacity);
    }

    /// Evict residents, non-visible and farthest first, until the budget and
    /// slot capacity hold again. Returns the number evicted.
    pub fn enforce_budget(&mut self, index: &mut SpatialIndex) -> OctreeResult<usize> {
        let candidates = self.eviction_order(index, true);
        let mut evicted = 0;
        for id in candidates {
            if self.within_limits() {
                break;
            }
            self.evict(index, id)?;
            evicted += 1;
        }
        if !self.within_limits() {
            log::warn!(
                "[ResidencyManager::enforce_budget] Still over budget with {} fetches pending",
                self.num_pending()
            );
        }
        if evicted > 0 {
            log::info!("[ResidencyManager::enforce_budget] Evicted {} nodes after budget change", evicted);
        }
        Ok(evicted)
    }

    fn within_limits(&self) -> bool {
        let table = &self.table;
        let assigned = table.resident.len() + table.pending.len();
        let bytes_ok = self.mode == ResidencyMode::InMemory || table.bytes_in_use <= self.cpu_budget;
        bytes_ok && assigned <= self.slots.capacity() as usize
    }

    fn evict_for(&mut self, index: &mut SpatialIndex, bytes: u64) -> OctreeResult<usize> {
        let candidates = self.eviction_order(index, false);
        let mut evicted = 0;
        for id in candidates {
            if self.has_room(bytes) {
                break;
            }
            self.evict(index, id)?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Residents ordered for eviction: farthest from the camera first.
    /// Visible nodes are excluded, or placed last when `include_visible`.
    fn eviction_order(&self, index: &SpatialIndex, include_visible: bool) -> Vec<NodeId> {
        let table = &self.table;
        let mut candidates: Vec<(bool, f32, NodeId)> = table
            .resident
            .iter()
            .filter_map(|&id| {
                let visible = table.is_visible(id);
                if visible && !include_visible {
                    return None;
                }
                let distance = index.node(id).ok()?.bounds.distance_to(self.camera);
                Some((visible, distance, id))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.total_cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });
        candidates.into_iter().map(|(_, _, id)| id).collect()
    }

    fn has_room(&self, bytes: u64) -> bool {
        let fits = self.mode == ResidencyMode::InMemory || self.bytes_in_use() + bytes <= self.cpu_budget;
        // After a shrink, slots above the new capacity stay held until evicted.
        fits && self.slots.num_free_slots() > 0 && self.slots.num_in_use() < self.slots.capacity() as usize
    }

    fn drops_payloads(&self) -> bool {
        self.mode == ResidencyMode::Streaming && self.payload_dir.is_some()
    }

    pub fn mode(&self) -> ResidencyMode {
        self.mode
    }

    pub fn cpu_budget(&self) -> u64 {
        self.cpu_budget
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.table.bytes_in_use
    }

    /// CPU bytes still available for admissions; unbounded in memory mode
    pub fn remaining_cpu_budget(&self) -> u64 {
        match self.mode {
            ResidencyMode::InMemory => u64::MAX,
            ResidencyMode::Streaming => self.cpu_budget.saturating_sub(self.bytes_in_use()),
        }
    }

    pub fn num_pending(&self) -> usize {
        self.table.pending.len()
    }

    pub fn num_resident(&self) -> usize {
        self.table.resident.len()
    }

    pub fn resident_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.table.resident.iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn slots(&self) -> &BufferSlotAllocator {
        &self.slots
    }
}
