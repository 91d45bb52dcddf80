//! End-to-end streaming scenarios through `StreamingContext`
//!
//! These tests verify that:
//! - a camera far outside the catalog keeps nothing resident
//! - moving close streams payloads in over a few frames
//! - a static camera converges to an empty delta
//! - CPU budget and slot capacity are never exceeded
//! - slots are exclusive and released slots wait for in-flight draws
//! - budget percentage changes land at the next frame start

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use glam::{Mat4, Vec2, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use star_octree::octree::CANONICAL_VALUES_PER_STAR;
use star_octree::streaming::ResidencyMode;
use star_octree::{
    AdditionalLayers, FixedMemoryProbe, NodeState, PayloadLayout, RenderSource, SpatialIndex, StarRecord,
    StreamingConfig, StreamingContext, TraversalOutput, ROOT_NODE,
};

const GIB: u64 = 1024 * 1024 * 1024;
const HALF_EXTENT: f32 = 1000.0;
const SCREEN: Vec2 = Vec2::new(1280.0, 720.0);
const THRESHOLD: f32 = 250.0;
const SLOTS: u32 = 256;
const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> StreamingConfig {
    StreamingConfig {
        max_stars_per_node: 32,
        max_depth: 7,
        root_half_extent: HALF_EXTENT,
        lod_stride: 4,
        fetch_threads: 2,
        ..Default::default()
    }
}

fn chunk_size_bytes() -> u64 {
    test_config().max_stars_per_node as u64 * CANONICAL_VALUES_PER_STAR as u64 * 4
}

/// Seeded catalog written with one payload file per node
fn write_catalog(dir: &TempDir) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(42);
    let mut index = SpatialIndex::new(&test_config());
    index.set_values_per_star(CANONICAL_VALUES_PER_STAR).unwrap();
    for _ in 0..3000 {
        let position = Vec3::new(
            rng.gen_range(-HALF_EXTENT..HALF_EXTENT),
            rng.gen_range(-HALF_EXTENT..HALF_EXTENT),
            rng.gen_range(-HALF_EXTENT..HALF_EXTENT),
        );
        index
            .insert(&StarRecord::new(position, rng.gen_range(-1.0..15.0), rng.gen_range(-0.3..1.8)))
            .unwrap();
    }
    index.slice_lod_data().unwrap();
    let path = dir.path().join("catalog.soct");
    index.write_to_file(&path, PayloadLayout::Streaming).unwrap();
    path
}

fn open_context(installed_ram: u64, video_memory: u64) -> (TempDir, StreamingContext) {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temporary directory for test");
    let path = write_catalog(&dir);
    let context = StreamingContext::open(
        &path,
        test_config(),
        Box::new(FixedMemoryProbe::new(installed_ram, video_memory)),
    )
    .unwrap();
    (dir, context)
}

fn view_from(eye: Vec3) -> Mat4 {
    Mat4::perspective_rh(60f32.to_radians(), SCREEN.x / SCREEN.y, 0.1, 1.0e7)
        * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y)
}

/// Run `frames` full frames, letting fetches land between them
fn settle(context: &mut StreamingContext, view: Mat4, frames: usize) -> TraversalOutput {
    let mut last = TraversalOutput::default();
    for _ in 0..frames {
        last = context.traverse(view, SCREEN, THRESHOLD).unwrap();
        context.end_frame();
        context.wait_for_fetches(WAIT).unwrap();
    }
    last
}

fn assert_slots_exclusive(context: &StreamingContext) {
    let residency = context.residency().unwrap();
    let mut seen = HashSet::new();
    for node in context.index().nodes() {
        match (node.state(), node.chunk_slot) {
            (NodeState::Resident, Some(slot)) => {
                assert!(seen.insert(slot), "slot {:?} held by two nodes", slot);
                assert!(residency.slots().is_in_use(slot));
            }
            (NodeState::Resident, None) => panic!("resident node without a slot"),
            (_, Some(_)) => panic!("non-resident node still holds a slot"),
            _ => {}
        }
    }
}

#[test]
fn test_distant_camera_keeps_nothing_resident() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();

    let output = settle(&mut context, view_from(Vec3::new(0.0, 0.0, 5.0e6)), 3);
    assert_eq!(output.render_set.len(), 1);
    assert_eq!(output.render_set[0].node, ROOT_NODE);
    assert_eq!(output.render_set[0].source, RenderSource::LodSlice);
    assert_eq!(context.num_free_spots_in_buffer(), SLOTS as usize);
    assert_eq!(context.biggest_chunk_index_in_use(), None);
    assert_eq!(context.budget_telemetry().cpu_bytes_in_use, 0);
}

#[test]
fn test_close_camera_streams_payloads_in() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    let view = view_from(Vec3::new(0.0, 0.0, 2500.0));

    let first = context.traverse(view, SCREEN, THRESHOLD).unwrap();
    assert!(first.render_set.iter().all(|item| item.source == RenderSource::LodSlice));
    assert!(context
        .index()
        .nodes()
        .iter()
        .any(|node| node.state() == NodeState::PendingLoad));
    context.end_frame();

    assert!(context.wait_for_fetches(WAIT).unwrap());
    let second = context.traverse(view, SCREEN, THRESHOLD).unwrap();
    assert!(!second.delta.is_empty());
    assert!(second.delta_star_count > 0);
    assert!(second
        .render_set
        .iter()
        .any(|item| matches!(item.source, RenderSource::Slot(_))));
    for (slot, buffer) in &second.delta {
        assert!(!buffer.is_empty());
        assert!(context.residency().unwrap().slots().is_in_use(*slot));
    }
    assert!(context.biggest_chunk_index_in_use().is_some());
}

#[test]
fn test_static_camera_converges() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, false, false).unwrap();
    let view = view_from(Vec3::new(300.0, 200.0, 2200.0));

    settle(&mut context, view, 6);
    let before = context.index().nodes().iter().map(|node| node.state()).collect::<Vec<_>>();
    let output = context.traverse(view, SCREEN, THRESHOLD).unwrap();
    let after = context.index().nodes().iter().map(|node| node.state()).collect::<Vec<_>>();

    assert!(output.delta.is_empty());
    assert_eq!(output.delta_star_count, 0);
    assert_eq!(before, after);
}

#[test]
fn test_small_slot_pool_holds_only_drawn_nodes() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(8, true, false).unwrap();
    let output = settle(&mut context, view_from(Vec3::new(0.0, 0.0, 1500.0)), 20);

    let drawn: HashSet<u32> = output.render_set.iter().map(|item| item.node).collect();
    let resident = context.residency().unwrap().resident_nodes();
    assert!(!resident.is_empty());
    for id in &resident {
        assert!(drawn.contains(id), "node {} holds a slot but is not drawn", id);
    }
    let from_slots = output
        .render_set
        .iter()
        .filter(|item| matches!(item.source, RenderSource::Slot(_)))
        .count();
    assert_eq!(from_slots, resident.len());
    assert_slots_exclusive(&context);
}

#[test]
fn test_render_set_star_counts_match_sources() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    let output = settle(&mut context, view_from(Vec3::new(-400.0, 100.0, 1800.0)), 4);

    let vps = context.index().values_per_star();
    for item in &output.render_set {
        let node = context.index().node(item.node).unwrap();
        match item.source {
            RenderSource::Slot(slot) => {
                assert_eq!(node.chunk_slot, Some(slot));
                assert_eq!(item.star_count, node.payload_len as u64);
            }
            RenderSource::LodSlice => assert_eq!(item.star_count, node.lod_star_count(vps)),
        }
    }
    assert_eq!(output.rendered_stars(), output.render_set.iter().map(|i| i.star_count).sum::<u64>());
}

#[test]
fn test_cpu_budget_is_never_exceeded() {
    // Ten chunks of CPU budget at the default 50%.
    let installed_ram = chunk_size_bytes() * 20;
    let (_dir, mut context) = open_context(installed_ram, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    let budget = context.cpu_ram_budget();

    let eyes = [
        Vec3::new(0.0, 0.0, 2500.0),
        Vec3::new(900.0, 0.0, 1200.0),
        Vec3::new(-600.0, 700.0, 900.0),
        Vec3::new(0.0, -900.0, 400.0),
    ];
    for eye in eyes {
        for _ in 0..3 {
            context.traverse(view_from(eye), SCREEN, THRESHOLD).unwrap();
            assert!(context.budget_telemetry().cpu_bytes_in_use <= budget);
            context.end_frame();
            context.wait_for_fetches(WAIT).unwrap();
            assert!(context.budget_telemetry().cpu_bytes_in_use <= budget);
            assert_slots_exclusive(&context);
        }
    }
}

#[test]
fn test_evicted_nodes_drop_payload_and_slot() {
    let installed_ram = chunk_size_bytes() * 20;
    let (_dir, mut context) = open_context(installed_ram, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();

    settle(&mut context, view_from(Vec3::new(900.0, 900.0, 900.0)), 4);
    let near_first: HashSet<u32> = context.residency().unwrap().resident_nodes().into_iter().collect();
    settle(&mut context, view_from(Vec3::new(-900.0, -900.0, -900.0)), 4);
    let near_second: HashSet<u32> = context.residency().unwrap().resident_nodes().into_iter().collect();

    for id in near_first.difference(&near_second) {
        let node = context.index().node(*id).unwrap();
        assert_eq!(node.state(), NodeState::Unloaded);
        assert!(node.chunk_slot.is_none());
        assert!(node.payload.is_none());
    }
    assert_slots_exclusive(&context);
}

#[test]
fn test_released_slot_waits_for_frame_boundary() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    let view = view_from(Vec3::new(0.0, 0.0, 2500.0));
    settle(&mut context, view, 3);

    let output = context.traverse(view, SCREEN, THRESHOLD).unwrap();
    let (node, slot) = output
        .render_set
        .iter()
        .find_map(|item| match item.source {
            RenderSource::Slot(slot) => Some((item.node, slot)),
            RenderSource::LodSlice => None,
        })
        .expect("a resident node in view");

    let free_before = context.num_free_spots_in_buffer();
    context.evict(node).unwrap();
    assert_eq!(context.node_state(node).unwrap(), NodeState::Unloaded);
    assert_eq!(context.num_free_spots_in_buffer(), free_before);
    assert_eq!(context.residency().unwrap().slots().num_deferred(), 1);
    assert!(!context.residency().unwrap().slots().is_in_use(slot));

    context.end_frame();
    assert_eq!(context.num_free_spots_in_buffer(), free_before + 1);
    assert_eq!(context.residency().unwrap().slots().num_deferred(), 0);
}

#[test]
fn test_percent_changes_apply_at_next_frame() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    let view = view_from(Vec3::new(0.0, 0.0, 2500.0));
    settle(&mut context, view, 2);

    assert_eq!(context.cpu_ram_budget(), 4 * GIB);
    context.set_cpu_ram_percent(10.0).unwrap();
    assert_eq!(context.cpu_ram_budget(), 4 * GIB);

    context.traverse(view, SCREEN, THRESHOLD).unwrap();
    let expected = (8.0 * GIB as f64 * 0.10) as u64;
    assert_eq!(context.cpu_ram_budget(), expected);
    assert_eq!(context.residency().unwrap().cpu_budget(), expected);

    assert!(context.set_cpu_ram_percent(0.0).is_err());
    assert!(context.set_gpu_memory_percent(150.0).is_err());
}

#[test]
fn test_gpu_shrink_evicts_down_to_capacity() {
    let chunk = chunk_size_bytes();
    // 50 slots at the default 50%.
    let (_dir, mut context) = open_context(8 * GIB, chunk * 100);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();
    assert_eq!(context.budget_telemetry().slot_capacity, 50);

    let view = view_from(Vec3::new(0.0, 0.0, 1500.0));
    settle(&mut context, view, 4);

    context.set_gpu_memory_percent(10.0).unwrap();
    for _ in 0..3 {
        context.traverse(view, SCREEN, THRESHOLD).unwrap();
        let telemetry = context.budget_telemetry();
        assert_eq!(telemetry.slot_capacity, 10);
        assert!(context.residency().unwrap().slots().num_in_use() <= 10);
        context.end_frame();
        context.wait_for_fetches(WAIT).unwrap();
    }
    assert_slots_exclusive(&context);
}

#[test]
fn test_prefetch_warms_neighbourhood() {
    let (_dir, mut context) = open_context(8 * GIB, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, false).unwrap();

    let report = context
        .fetch_surrounding_nodes(Vec3::new(120.0, -80.0, 40.0), chunk_size_bytes(), AdditionalLayers::default())
        .unwrap();
    assert!(report.candidates > 0);
    assert!(report.pending > 0);
    assert!(context.wait_for_fetches(WAIT).unwrap());
    assert!(context.residency().unwrap().num_resident() >= report.pending);
}

#[test]
fn test_in_memory_mode_ignores_cpu_budget() {
    let installed_ram = chunk_size_bytes() * 2;
    let (_dir, mut context) = open_context(installed_ram, 2 * GIB);
    context.init_buffer_index_stack(SLOTS, true, true).unwrap();
    assert_eq!(context.residency_mode(), Some(ResidencyMode::InMemory));

    settle(&mut context, view_from(Vec3::new(0.0, 0.0, 1500.0)), 4);
    assert!(context.budget_telemetry().cpu_bytes_in_use > context.cpu_ram_budget());
    assert_slots_exclusive(&context);
}
