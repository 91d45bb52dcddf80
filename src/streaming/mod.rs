//! Budgeted streaming of octree payloads into renderer chunk slots
//!
//! `StreamingContext` is the renderer-facing entry point. It owns the
//! spatial index, the memory budgets and the residency manager, and runs one
//! traversal per frame:
//!
//! 1. frame start: apply pending budget changes, cancel stale fetches,
//!    promote finished ones;
//! 2. `traverse`: pick the render set and emit slot deltas;
//! 3. optionally `fetch_surrounding_nodes` to warm the neighbourhood;
//! 4. `end_frame` once the frame's draws are submitted.

pub mod budget;
pub mod fetch;
pub mod frustum;
pub mod prefetch;
pub mod residency;
pub mod slot_allocator;
pub mod traversal;

pub use budget::{
    BudgetController, BudgetTelemetry, FixedMemoryProbe, HostMemoryProbe, MemoryProbe,
    FALLBACK_INSTALLED_RAM, FALLBACK_VIDEO_MEMORY,
};
pub use fetch::{FetchHandle, FetchPool};
pub use frustum::{projected_footprint, Frustum};
pub use prefetch::{fetch_surrounding_nodes, prefetch_candidates, PrefetchReport};
pub use residency::{AdmitPriority, Admission, ResidencyManager, ResidencyMode};
pub use slot_allocator::{BufferSlotAllocator, SlotDiscipline, SlotId};
pub use traversal::{RenderItem, RenderSource, TraversalOutput, Traverser};

use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::config::{AdditionalLayers, StreamingConfig};
use crate::error::{OctreeError, OctreeResult};
use crate::octree::{NodeId, NodeState, SpatialIndex, StarRecord};
use crate::persistence::{payload_dir_for, PayloadLayout};

/// Everything one renderer needs to stream a star octree
pub struct StreamingContext {
    config: StreamingConfig,
    index: SpatialIndex,
    payload_dir: Option<PathBuf>,
    budget: BudgetController,
    residency: Option<ResidencyManager>,
    traverser: Traverser,
    requested_capacity: u32,
    camera: Vec3,
}

impl StreamingContext {
    /// Empty index, budgets from the host's installed RAM
    pub fn new(config: StreamingConfig) -> OctreeResult<Self> {
        Self::with_probe(config, Box::new(HostMemoryProbe::new()))
    }

    pub fn with_probe(config: StreamingConfig, probe: Box<dyn MemoryProbe>) -> OctreeResult<Self> {
        config.validate()?;
        let index = SpatialIndex::new(&config);
        Self::from_index(index, None, config, probe)
    }

    /// Open a persisted index; streaming-layout payloads are fetched from disk
    pub fn open(
        path: impl AsRef<Path>,
        config: StreamingConfig,
        probe: Box<dyn MemoryProbe>,
    ) -> OctreeResult<Self> {
        config.validate()?;
        let path = path.as_ref();
        let (index, layout) = SpatialIndex::read_from_file(path, &config)?;
        let payload_dir = (layout == PayloadLayout::Streaming).then(|| payload_dir_for(path));
        Self::from_index(index, payload_dir, config, probe)
    }

    fn from_index(
        index: SpatialIndex,
        payload_dir: Option<PathBuf>,
        config: StreamingConfig,
        probe: Box<dyn MemoryProbe>,
    ) -> OctreeResult<Self> {
        let budget = BudgetController::new(probe, config.cpu_ram_percent, config.gpu_memory_percent)?;
        Ok(Self {
            config,
            index,
            payload_dir,
            budget,
            residency: None,
            traverser: Traverser::new(),
            requested_capacity: 0,
            camera: Vec3::ZERO,
        })
    }

    pub fn set_values_per_star(&mut self, values_per_star: usize) -> OctreeResult<()> {
        self.index.set_values_per_star(values_per_star)
    }

    pub fn insert(&mut self, record: &StarRecord) -> OctreeResult<()> {
        self.index.insert(record)
    }

    pub fn insert_values(&mut self, row: &[f32]) -> OctreeResult<()> {
        self.index.insert_values(row)
    }

    pub fn slice_lod_data(&mut self) -> OctreeResult<()> {
        self.index.slice_lod_data()
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>, layout: PayloadLayout) -> OctreeResult<()> {
        self.index.write_to_file(path, layout)
    }

    /// Replace the index with one read from disk; slots must be initialized again
    pub fn read_from_file(&mut self, path: impl AsRef<Path>) -> OctreeResult<PayloadLayout> {
        let path = path.as_ref();
        let (index, layout) = SpatialIndex::read_from_file(path, &self.config)?;
        self.index = index;
        self.payload_dir = (layout == PayloadLayout::Streaming).then(|| payload_dir_for(path));
        self.residency = None;
        self.traverser.reset();
        Ok(layout)
    }

    /// Set up the chunk slot pool
    ///
    /// `use_vbo` picks discrete per-slot buffers over one indexed storage
    /// buffer. `dataset_fits_in_memory` keeps every payload in RAM and lifts
    /// the CPU budget. Calling this again drops all residency, and the renderer
    /// must then drop every chunk buffer it holds.
    pub fn init_buffer_index_stack(
        &mut self,
        capacity: u32,
        use_vbo: bool,
        dataset_fits_in_memory: bool,
    ) -> OctreeResult<()> {
        let mode = if dataset_fits_in_memory {
            ResidencyMode::InMemory
        } else {
            ResidencyMode::Streaming
        };
        let discipline = SlotDiscipline::from_use_vbo(use_vbo);
        self.requested_capacity = capacity;
        let effective = effective_capacity(&self.budget, &self.index, capacity);

        match self.residency.as_mut() {
            Some(residency) => {
                residency.set_cpu_budget(self.budget.cpu_ram_budget());
                residency.reset(&mut self.index, effective, discipline, mode)?;
            }
            None => {
                let pool = FetchPool::new(self.config.fetch_threads)?;
                let slots = BufferSlotAllocator::new(effective, discipline, self.config.frames_in_flight);
                self.residency = Some(ResidencyManager::new(
                    mode,
                    self.payload_dir.clone(),
                    slots,
                    pool,
                    self.budget.cpu_ram_budget(),
                ));
                log::info!(
                    "[StreamingContext::init_buffer_index_stack] {:?} mode with {} slots ({:?})",
                    mode,
                    effective,
                    discipline
                );
            }
        }
        self.traverser.reset();
        Ok(())
    }

    /// Run one frame's traversal
    pub fn traverse(
        &mut self,
        view_projection: Mat4,
        screen_size: Vec2,
        lod_pixel_threshold: f32,
    ) -> OctreeResult<TraversalOutput> {
        self.begin_frame()?;
        if let Some(eye) = eye_position(&view_projection) {
            self.camera = eye;
        }
        let residency = self.residency.as_mut().ok_or(OctreeError::SlotsNotInitialized)?;
        residency.set_camera(self.camera);
        self.traverser.traverse(
            &mut self.index,
            residency,
            &view_projection,
            screen_size,
            lod_pixel_threshold,
        )
    }

    /// Same as `traverse` with the configured pixel threshold
    pub fn traverse_default(&mut self, view_projection: Mat4, screen_size: Vec2) -> OctreeResult<TraversalOutput> {
        let threshold = self.config.lod_pixel_threshold;
        self.traverse(view_projection, screen_size, threshold)
    }

    /// Request the neighbourhood of the camera at prefetch priority
    pub fn fetch_surrounding_nodes(
        &mut self,
        camera_position: Vec3,
        chunk_size_bytes: u64,
        layers: AdditionalLayers,
    ) -> OctreeResult<PrefetchReport> {
        self.camera = camera_position;
        let residency = self.residency.as_mut().ok_or(OctreeError::SlotsNotInitialized)?;
        prefetch::fetch_surrounding_nodes(&mut self.index, residency, camera_position, chunk_size_bytes, layers)
    }

    /// Frame boundary: the frame's draws are submitted
    pub fn end_frame(&mut self) {
        if let Some(residency) = self.residency.as_mut() {
            residency.end_frame();
        }
    }

    /// Promote finished fetches without waiting; returns the number promoted
    pub fn poll_completions(&mut self) -> OctreeResult<usize> {
        match self.residency.as_mut() {
            Some(residency) => residency.poll_completions(&mut self.index),
            None => Ok(0),
        }
    }

    /// Block until outstanding fetches land, for loading screens and tests
    pub fn wait_for_fetches(&mut self, timeout: Duration) -> OctreeResult<bool> {
        match self.residency.as_mut() {
            Some(residency) => residency.wait_for_fetches(&mut self.index, timeout),
            None => Ok(true),
        }
    }

    pub fn evict(&mut self, id: NodeId) -> OctreeResult<()> {
        let residency = self.residency.as_mut().ok_or(OctreeError::SlotsNotInitialized)?;
        residency.evict(&mut self.index, id)
    }

    /// Applied at the next frame start
    pub fn set_cpu_ram_percent(&mut self, percent: f32) -> OctreeResult<()> {
        self.budget.set_cpu_ram_percent(percent)
    }

    /// Applied at the next frame start
    pub fn set_gpu_memory_percent(&mut self, percent: f32) -> OctreeResult<()> {
        self.budget.set_gpu_memory_percent(percent)
    }

    fn begin_frame(&mut self) -> OctreeResult<()> {
        let budget_changed = self.budget.apply_pending();
        let residency = self.residency.as_mut().ok_or(OctreeError::SlotsNotInitialized)?;
        if budget_changed {
            residency.set_cpu_budget(self.budget.cpu_ram_budget());
            residency.resize_slots(effective_capacity(&self.budget, &self.index, self.requested_capacity));
            residency.enforce_budget(&mut self.index)?;
        }
        residency.begin_frame();
        residency.poll_completions(&mut self.index)?;
        Ok(())
    }

    pub fn cpu_ram_budget(&self) -> u64 {
        self.budget.cpu_ram_budget()
    }

    pub fn gpu_memory_budget(&self) -> u64 {
        self.budget.gpu_memory_budget()
    }

    pub fn num_free_spots_in_buffer(&self) -> usize {
        self.residency
            .as_ref()
            .map(|residency| residency.slots().num_free_slots())
            .unwrap_or(0)
    }

    pub fn biggest_chunk_index_in_use(&self) -> Option<SlotId> {
        self.residency
            .as_ref()
            .and_then(|residency| residency.slots().biggest_slot_index_in_use())
    }

    pub fn total_nodes(&self) -> usize {
        self.index.total_nodes()
    }

    pub fn max_stars_per_node(&self) -> u32 {
        self.index.max_stars_per_node()
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.index.chunk_size_bytes()
    }

    pub fn node_state(&self, id: NodeId) -> OctreeResult<NodeState> {
        Ok(self.index.node(id)?.state())
    }

    pub fn budget_telemetry(&self) -> BudgetTelemetry {
        let cpu_ram_budget = self.budget.cpu_ram_budget();
        let (cpu_bytes_in_use, slot_capacity, free_slots) = match self.residency.as_ref() {
            Some(residency) => (
                residency.bytes_in_use(),
                residency.slots().capacity(),
                residency.slots().num_free_slots(),
            ),
            None => (0, 0, 0),
        };
        BudgetTelemetry {
            cpu_ram_budget,
            gpu_memory_budget: self.budget.gpu_memory_budget(),
            cpu_bytes_in_use,
            cpu_bytes_remaining: cpu_ram_budget.saturating_sub(cpu_bytes_in_use),
            slot_capacity,
            free_slots,
        }
    }

    pub fn residency_mode(&self) -> Option<ResidencyMode> {
        self.residency.as_ref().map(|residency| residency.mode())
    }

    pub fn residency(&self) -> Option<&ResidencyManager> {
        self.residency.as_ref()
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn camera_position(&self) -> Vec3 {
        self.camera
    }
}

impl std::fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingContext")
            .field("total_nodes", &self.index.total_nodes())
            .field("payload_dir", &self.payload_dir)
            .field("budget", &self.budget)
            .field("residency", &self.residency)
            .finish()
    }
}

/// Slots the renderer asked for, capped by what the GPU budget holds
fn effective_capacity(budget: &BudgetController, index: &SpatialIndex, requested: u32) -> u32 {
    let chunk = index.chunk_size_bytes();
    if chunk == 0 {
        return requested;
    }
    let affordable = budget.slot_capacity(chunk);
    if affordable < requested {
        log::info!(
            "[StreamingContext] GPU budget holds {} of the {} requested slots",
            affordable,
            requested
        );
    }
    requested.min(affordable)
}

/// World-space eye of a perspective view-projection matrix
///
/// The eye maps to a clip-space point with `w == 0`, so it is recovered by
/// pushing `(0, 0, 1, 0)` back through the inverse. None for orthographic or
/// singular matrices.
fn eye_position(view_projection: &Mat4) -> Option<Vec3> {
    let homogeneous = view_projection.inverse() * Vec4::Z;
    if !homogeneous.is_finite() || homogeneous.w.abs() <= f32::EPSILON {
        return None;
    }
    Some(homogeneous.truncate() / homogeneous.w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::{CANONICAL_VALUES_PER_STAR, ROOT_NODE};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn context() -> StreamingContext {
        context_with_video(2 * GIB)
    }

    fn context_with_video(video_memory: u64) -> StreamingContext {
        let config = StreamingConfig {
            max_stars_per_node: 8,
            max_depth: 5,
            root_half_extent: 50.0,
            lod_stride: 4,
            fetch_threads: 1,
            ..Default::default()
        };
        let mut context =
            StreamingContext::with_probe(config, Box::new(FixedMemoryProbe::new(8 * GIB, video_memory))).unwrap();
        context.set_values_per_star(CANONICAL_VALUES_PER_STAR).unwrap();
        for i in 0..200 {
            let t = i as f32;
            let position = Vec3::new((t * 9.7) % 98.0 - 49.0, (t * 4.3) % 98.0 - 49.0, (t * 6.1) % 98.0 - 49.0);
            context.insert(&StarRecord::new(position, t % 7.0, 0.0)).unwrap();
        }
        context.slice_lod_data().unwrap();
        context
    }

    #[test]
    fn test_eye_position_round_trip() {
        let eye = Vec3::new(3.0, -7.0, 42.0);
        let matrix = Mat4::perspective_rh(1.0, 1.5, 0.1, 1000.0) * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let recovered = eye_position(&matrix).unwrap();
        assert!((recovered - eye).length() < 1e-2);

        let ortho = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        assert!(eye_position(&ortho).is_none());
    }

    #[test]
    fn test_traverse_requires_slots() {
        let mut context = context();
        let err = context
            .traverse(Mat4::IDENTITY, Vec2::new(100.0, 100.0), 250.0)
            .unwrap_err();
        assert!(matches!(err, OctreeError::SlotsNotInitialized));
    }

    #[test]
    fn test_reinit_clears_residency() {
        let mut context = context();
        context.init_buffer_index_stack(16, true, true).unwrap();
        let eye = Vec3::new(0.0, 0.0, 120.0);
        let matrix = Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 10_000.0) * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        context.traverse(matrix, Vec2::new(1280.0, 720.0), 250.0).unwrap();
        assert!(context.num_free_spots_in_buffer() < 16);

        context.init_buffer_index_stack(16, false, true).unwrap();
        assert_eq!(context.num_free_spots_in_buffer(), 16);
        assert_eq!(context.node_state(ROOT_NODE).unwrap(), NodeState::Unloaded);
        assert!(context.index().nodes().iter().all(|node| node.chunk_slot.is_none()));
    }

    #[test]
    fn test_gpu_budget_caps_slots() {
        // 8 stars * 9 values * 4 bytes per chunk; half of 40 chunks of video memory.
        let mut context = context_with_video(40 * 288);
        assert_eq!(context.chunk_size_bytes(), 288);
        context.init_buffer_index_stack(64, true, false).unwrap();
        assert_eq!(context.budget_telemetry().slot_capacity, 20);

        context.init_buffer_index_stack(8, true, false).unwrap();
        assert_eq!(context.budget_telemetry().slot_capacity, 8);
    }
}
