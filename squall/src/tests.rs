/// Squall engine tests
///
/// Everything here runs host-side: heap record bookkeeping, capacity
/// estimation, message packing, texel addressing, the intern tables,
/// the dispatcher, and the SPIR-V rewrite machinery are all exercised
/// without a live device.
///
/// Austin Shafer - 2025
use ash::vk::Handle;
use crate::heap::HeapLayout;
use crate::instrument::dispatch::{Dispatcher, DispatcherBucket};
use crate::instrument::{
    FilterEntry, InstrumentationKey, PipelineRecord, PipelineType, ShaderStore,
};
use crate::messages::{
    self, AccessKind, FailureCode, GpuMessage, MessageUid, StreamHeader,
};
use crate::sguid::SguidRegistry;
use crate::spv;
use crate::stream::CapacityEstimator;
use crate::streamer::PipelineLayoutInfo;
use crate::texelmem::{SpanList, TexelResourceInfo};
use crate::{features, kernels};

use ash::vk;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------
// heap records
// ---------------------------------------------------------------

#[test]
fn heap_allocates_end_point_first() {
    let mut heap = HeapLayout::new(350);
    assert_eq!(heap.allocate(1, 100), Some(0));
    assert_eq!(heap.allocate(1, 100), Some(100));

    // Freeing the first span leaves a gap, but the bump path wins
    // while there is still tail space
    heap.free(0);
    assert_eq!(heap.allocate(1, 100), Some(200));

    // Once the tail is exhausted the gap list gets scanned
    assert_eq!(heap.allocate(1, 150), None);
    assert_eq!(heap.allocate(1, 100), Some(0));
}

#[test]
fn heap_adjacent_records_never_overlap() {
    let mut heap = HeapLayout::new(4096);
    for _ in 0..8 {
        heap.allocate(64, 100).unwrap();
    }
    heap.free(heap.records()[3].offset);
    heap.free(heap.records()[5].offset);
    heap.allocate(64, 60).unwrap();
    heap.allocate(64, 100).unwrap();

    for pair in heap.records().windows(2) {
        assert!(pair[0].offset + pair[0].size <= pair[1].offset);
    }
    let last = heap.records().last().unwrap();
    assert!(last.offset + last.size <= heap.capacity());
}

#[test]
fn heap_defragment_marks_record_after_largest_span() {
    let mut heap = HeapLayout::new(1024);
    assert_eq!(heap.allocate(1, 100), Some(0));
    assert_eq!(heap.allocate(1, 100), Some(100));
    assert_eq!(heap.allocate(1, 100), Some(200));
    heap.free(100);

    // The span between [0..100] and [200..300] is the only candidate
    assert_eq!(heap.defragment(), Some(100));
    assert_eq!(heap.rebind_target(200), Some(100));

    // The owner recreates its object, then commits
    assert_eq!(heap.commit_rebind(200), 100);
    assert_eq!(heap.rebind_target(100), None);

    let offsets: Vec<(u64, u64)> = heap
        .records()
        .iter()
        .map(|r| (r.offset, r.offset + r.size))
        .collect();
    assert_eq!(offsets, vec![(0, 100), (100, 200)]);
}

#[test]
fn heap_defragment_without_gap_is_a_noop() {
    let mut heap = HeapLayout::new(1024);
    heap.allocate(1, 100).unwrap();
    heap.allocate(1, 100).unwrap();
    assert_eq!(heap.defragment(), None);
}

#[test]
fn heap_defragment_then_commit_matches_direct_allocation() {
    // Build a fragmented heap and compact it
    let mut defragged = HeapLayout::new(512);
    defragged.allocate(1, 64).unwrap();
    defragged.allocate(1, 64).unwrap();
    defragged.allocate(1, 64).unwrap();
    defragged.free(64);
    defragged.defragment().unwrap();
    defragged.commit_rebind(128);

    // Against allocating the record at the target from scratch
    let mut direct = HeapLayout::new(512);
    direct.allocate(1, 64).unwrap();
    direct.allocate(1, 64).unwrap();

    let shape =
        |h: &HeapLayout| h.records().iter().map(|r| (r.offset, r.size)).collect::<Vec<_>>();
    assert_eq!(shape(&defragged), shape(&direct));
}

#[test]
fn heap_pending_rebind_freezes_bordering_gaps() {
    let mut heap = HeapLayout::new(300);
    assert_eq!(heap.allocate(1, 100), Some(0));
    assert_eq!(heap.allocate(1, 100), Some(100));
    assert_eq!(heap.allocate(1, 100), Some(200));
    heap.free(100);
    heap.defragment().unwrap();

    // The tail is full and the only gap borders the rebinding
    // record, so nothing may land there
    assert_eq!(heap.allocate(1, 50), None);

    heap.commit_rebind(200);
    // Compaction freed the tail again
    assert_eq!(heap.allocate(1, 50), Some(200));
}

// ---------------------------------------------------------------
// capacity estimation
// ---------------------------------------------------------------

#[test]
fn estimator_grows_after_overflow() {
    let mut est = CapacityEstimator::new(10, 1 << 20);
    let tag = 7;

    // History of small dispatches
    for _ in 0..4 {
        assert!(!est.record(tag, 5, 10));
    }
    assert_eq!(est.estimate(tag), 10);

    // A dispatch produced 50 messages into a capacity-10 stream
    assert!(est.record(tag, 50, 10));
    assert_eq!(est.estimate(tag), 75);
}

#[test]
fn estimator_clamps_to_default_and_limit() {
    let mut est = CapacityEstimator::new(64, 100);
    assert_eq!(est.estimate(0), 64);
    assert_eq!(est.estimate(42), 64);

    est.record(42, 5000, 100);
    assert_eq!(est.estimate(42), 100);
}

#[test]
fn estimator_ring_tracks_recent_counts() {
    let mut est = CapacityEstimator::new(1, 1 << 20);
    let tag = 3;
    for count in [40, 80, 20, 30] {
        est.record(tag, count, 1000);
    }
    assert_eq!(est.estimate(tag), 80);

    // The ring only remembers four entries, the 80 ages out
    for count in [10, 10, 10, 10] {
        est.record(tag, count, 1000);
    }
    assert_eq!(est.estimate(tag), 10);
}

// ---------------------------------------------------------------
// message packing
// ---------------------------------------------------------------

#[test]
fn stream_header_layout_is_stable() {
    assert_eq!(messages::STREAM_HEADER_SIZE, 16);
    assert_eq!(messages::stream_buffer_size(4), 16 + 4 * 8);

    // The snapshot kernel addresses these members by hardcoded
    // offset, the Rust layout has to agree
    assert_eq!(offset_of!(StreamHeader, written_count), 0);
    assert_eq!(offset_of!(StreamHeader, capacity), 4);
    assert_eq!(offset_of!(StreamHeader, debug_cookie), 8);
    assert_eq!(offset_of!(StreamHeader, transferred_count), 12);

    let header = StreamHeader {
        written_count: 3,
        capacity: 8,
        debug_cookie: messages::DEBUG_COOKIE_DEFAULT,
        transferred_count: 2,
    };
    assert!(header.transferred_count <= header.written_count);
}

#[test]
fn uninitialized_message_roundtrip() {
    let msg = messages::pack_uninitialized(42, FailureCode::Ok, 0);
    assert_eq!(msg.uid(), Some(MessageUid::UninitializedResource));
    assert_eq!(messages::unpack_uninitialized(msg), (42, FailureCode::Ok, 0));

    let msg = messages::pack_uninitialized(
        niebla::PUID_CEILING as u32,
        FailureCode::MetadataRequiresClear,
        512,
    );
    let (puid, code, offset) = messages::unpack_uninitialized(msg);
    assert_eq!(puid, niebla::PUID_CEILING as u32);
    assert_eq!(code, FailureCode::MetadataRequiresClear);
    assert_eq!(offset, 512);

    // Offsets past the detail field saturate instead of aliasing
    let msg = messages::pack_uninitialized(1, FailureCode::Ok, u64::MAX);
    let (_, _, offset) = messages::unpack_uninitialized(msg);
    assert_eq!(offset, messages::INIT_DETAIL_MAX);
}

#[test]
fn out_of_bounds_message_roundtrip() {
    let msg = messages::pack_out_of_bounds(0xabcde, AccessKind::Write, 4096);
    assert_eq!(msg.uid(), Some(MessageUid::OutOfBounds));
    assert_eq!(
        messages::unpack_out_of_bounds(msg),
        (0xabcde, AccessKind::Write, 4096)
    );
}

#[test]
fn descriptor_mismatch_message_roundtrip() {
    let msg = messages::pack_descriptor_mismatch(77, 2, 19, 4, 6);
    assert_eq!(msg.uid(), Some(MessageUid::DescriptorMismatch));
    assert_eq!(messages::unpack_descriptor_mismatch(msg), (77, 2, 19, 4, 6));
}

#[test]
fn unknown_uid_is_rejected() {
    assert_eq!(GpuMessage(0xff << 56).uid(), None);
}

// ---------------------------------------------------------------
// texel memory
// ---------------------------------------------------------------

#[test]
fn span_list_allocates_and_merges() {
    let mut spans = SpanList::new(100);
    let a = spans.allocate(30).unwrap();
    let b = spans.allocate(30).unwrap();
    let c = spans.allocate(40).unwrap();
    assert_eq!((a, b, c), (0, 30, 60));
    assert!(spans.allocate(1).is_none());

    // Freeing out of order still merges back to one span
    spans.free(b, 30);
    spans.free(c, 40);
    spans.free(a, 30);
    assert_eq!(spans.free_words(), 100);
    assert_eq!(spans.allocate(100), Some(0));
}

#[test]
fn tiled_resources_clamp_untracked_dimensions() {
    let info = TexelResourceInfo {
        width: 1024,
        height: 1024,
        depth: 4,
        tiled: true,
        tracked_width: true,
        tracked_height: false,
        tracked_depth: false,
    };
    assert_eq!(info.texel_count(), 1024);

    let linear = TexelResourceInfo {
        tiled: false,
        ..info
    };
    assert_eq!(linear.texel_count(), 1024 * 1024 * 4);
}

#[test]
fn block_bit_addressing() {
    let info = TexelResourceInfo::buffer(1024);
    assert_eq!(info.texel_count(), 1024);

    let block = crate::texelmem::TexelMemoryBlock {
        base_block_index: 8,
        texel_count: 1024,
        word_count: 32,
        granularity: 1,
        failure_code: FailureCode::Ok,
    };
    assert_eq!(block.bit_address(0), (8, 0));
    assert_eq!(block.bit_address(31), (8, 31));
    assert_eq!(block.bit_address(32), (9, 0));
    assert_eq!(block.bit_address(1023), (8 + 31, 31));
}

// ---------------------------------------------------------------
// intern tables and records
// ---------------------------------------------------------------

#[test]
fn shader_store_interns_by_content() {
    let store = ShaderStore::new();
    let a = store.intern(&[1, 2, 3, 4]);
    let b = store.intern(&[1, 2, 3, 4]);
    let c = store.intern(&[5, 6, 7, 8]);

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(store.len(), 2);

    drop(a);
    drop(b);
    drop(c);
    store.collect();
    assert_eq!(store.len(), 0);
}

#[test]
fn variant_reservation_is_single_winner() {
    let store = ShaderStore::new();
    let shader = store.intern(&[9, 9, 9]);
    let key = InstrumentationKey {
        features: 1,
        layout_summary: 2,
        specialization_hash: 3,
    };

    // Re-running the same activation must not produce a second job
    assert!(shader.reserve(key));
    assert!(!shader.reserve(key));

    shader.store(key, Some(vec![1, 2]));
    assert!(shader.get_variant(&key).is_some());
    assert!(!shader.reserve(key));

    // Failed slots may be retried by a later batch
    let failed = InstrumentationKey {
        features: 4,
        ..key
    };
    assert!(shader.reserve(failed));
    shader.store(failed, None);
    assert!(shader.get_variant(&failed).is_none());
    assert!(shader.reserve(failed));
}

fn test_layout() -> PipelineLayoutInfo {
    PipelineLayoutInfo {
        layout: vk::PipelineLayout::null(),
        user_slot_count: 2,
        compat_hash: 0x1234,
        slot_hashes: [0; crate::streamer::MAX_SETS],
        push_constant_size: 16,
    }
}

fn test_pipeline(uid: u64, name: &str, ptype: PipelineType) -> Arc<PipelineRecord> {
    let store = ShaderStore::new();
    let shader = store.intern(&[uid as u8, 1, 2]);
    Arc::new(PipelineRecord::new(
        uid,
        name.to_string(),
        ptype,
        vk::Pipeline::null(),
        test_layout(),
        vec![shader],
        Box::new(|_| Err(crate::SquallError::COULD_NOT_CREATE_PIPELINE)),
    ))
}

#[test]
fn pipeline_hot_swap_slot() {
    let record = test_pipeline(1, "swap", PipelineType::Compute);

    // Binding before any compile lands uses the native object
    assert!(record.instrumented().is_none());

    let fresh = vk::Pipeline::from_raw(0xdead_0001);
    assert!(record.swap_instrumented(Some(fresh)).is_none());
    assert_eq!(record.instrumented(), Some(fresh));

    // Deactivation clears the slot and hands back the old object
    assert_eq!(record.swap_instrumented(None), Some(fresh));
    assert!(record.instrumented().is_none());
}

#[test]
fn filters_replace_in_place_and_match() {
    let mut filters = crate::instrument::filters::FilterList::new();
    filters.set_or_add(FilterEntry {
        guid: 1,
        name_substring: Some("shadow".to_string()),
        pipeline_type: None,
        features: features::FeatureSet::INITIALIZATION.bits(),
        specialization: vec![],
    });
    filters.set_or_add(FilterEntry {
        guid: 2,
        name_substring: None,
        pipeline_type: Some(PipelineType::Compute),
        features: features::FeatureSet::RESOURCE_BOUNDS.bits(),
        specialization: vec![],
    });

    let shadow_gfx = test_pipeline(10, "shadow-pass", PipelineType::Graphics);
    let plain_comp = test_pipeline(11, "skinning", PipelineType::Compute);

    let collect = |record: &PipelineRecord, filters: &crate::instrument::filters::FilterList| {
        filters.matching(record).map(|f| f.guid).collect::<Vec<_>>()
    };
    assert_eq!(collect(&shadow_gfx, &filters), vec![1]);
    assert_eq!(collect(&plain_comp, &filters), vec![2]);

    // Same guid, new content: replaced in place, same position
    filters.set_or_add(FilterEntry {
        guid: 1,
        name_substring: Some("skinning".to_string()),
        pipeline_type: None,
        features: features::FeatureSet::INITIALIZATION.bits(),
        specialization: vec![],
    });
    assert_eq!(collect(&plain_comp, &filters), vec![1, 2]);

    assert!(filters.remove(1));
    assert!(!filters.remove(1));
    assert_eq!(collect(&plain_comp, &filters), vec![2]);
}

#[test]
fn sguid_interning_is_dense_and_stable() {
    let registry = SguidRegistry::new();
    let a = registry.intern(0xaaaa, 100).unwrap();
    let b = registry.intern(0xaaaa, 200).unwrap();
    let a2 = registry.intern(0xaaaa, 100).unwrap();

    assert_ne!(a, 0);
    assert_ne!(a, b);
    assert_eq!(a, a2);

    let entry = registry.resolve(a).unwrap();
    assert_eq!(entry.shader_hash, 0xaaaa);
    assert_eq!(entry.inst_offset, 100);
    assert!(registry.resolve(0).is_none());
}

// ---------------------------------------------------------------
// dispatcher
// ---------------------------------------------------------------

#[test]
fn bucket_phases_chain_in_order() {
    let dispatcher = Arc::new(Dispatcher::new(2));
    let phase_one_done = Arc::new(AtomicUsize::new(0));
    let phase_two_done = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = std::sync::mpsc::channel();

    // Phase two runs from phase one's completion hook, mirroring the
    // shaders -> pipelines -> commit chain
    let p1 = phase_one_done.clone();
    let p2 = phase_two_done.clone();
    let chain_dispatcher = dispatcher.clone();
    let bucket = DispatcherBucket::new(Box::new(move || {
        assert_eq!(p1.load(Ordering::SeqCst), 8);

        let inner = DispatcherBucket::new(Box::new(move || {
            tx.send(()).unwrap();
        }));
        for _ in 0..4 {
            let p2 = p2.clone();
            chain_dispatcher.enqueue(&inner, move || {
                p2.fetch_add(1, Ordering::SeqCst);
            });
        }
        inner.release();
    }));

    for _ in 0..8 {
        let p1 = phase_one_done.clone();
        dispatcher.enqueue(&bucket, move || {
            p1.fetch_add(1, Ordering::SeqCst);
        });
    }
    bucket.release();

    rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(phase_two_done.load(Ordering::SeqCst), 4);
    dispatcher.shutdown();
}

// ---------------------------------------------------------------
// SPIR-V rewriting
// ---------------------------------------------------------------

#[test]
fn module_parses_and_reserializes() {
    let words = kernels::build_mask_kernel(false);
    let module = spv::Module::from_words(&words).unwrap();
    assert_eq!(module.words(), words.as_slice());

    let bytes = module.clone().into_bytes();
    let reparsed = spv::Module::from_bytes(&bytes).unwrap();
    assert_eq!(reparsed.words(), words.as_slice());
}

#[test]
fn module_rejects_garbage() {
    assert!(spv::Module::from_words(&[1, 2, 3]).is_err());
    assert!(spv::Module::from_words(&[0xdeadbeef, 0, 0, 10, 0]).is_err());
    assert!(spv::Module::from_bytes(&[1, 2, 3]).is_err());
}

/// Count instructions with a given opcode
fn count_ops(module: &spv::Module, op: spirv_headers::Op) -> usize {
    module
        .instructions()
        .filter(|i| i.opcode == op as u16)
        .count()
}

#[test]
fn initialization_pass_instruments_buffer_accesses() {
    // The copy kernel reads and writes a decorated storage buffer
    // through access chains, exactly the shape the pass rewrites
    let words = kernels::build_mask_kernel(true);
    let mut module = spv::Module::from_words(&words).unwrap();

    let baseline_atomics = count_ops(&module, spirv_headers::Op::AtomicIAdd);
    assert_eq!(baseline_atomics, 0);

    let mut manager = spv::PassManager::new();
    manager.register(crate::features::init::injection_pass(0xfeed));
    let modified = manager.run(&mut module, 3).unwrap();
    assert!(modified);

    // The load probe exports through the stream counter, the store
    // marks its bit with an atomic OR
    assert!(count_ops(&module, spirv_headers::Op::AtomicIAdd) >= 1);
    assert!(count_ops(&module, spirv_headers::Op::AtomicOr) >= 1);
    assert!(count_ops(&module, spirv_headers::Op::SelectionMerge) > 1);

    // Still a parseable module, with the id bound grown to cover the
    // minted instrumentation ids
    let original_bound = spv::Module::from_words(&words).unwrap().id_bound();
    let bytes = module.into_bytes();
    let reparsed = spv::Module::from_bytes(&bytes).unwrap();
    assert!(reparsed.id_bound() > original_bound);
}

#[test]
fn empty_pass_manager_leaves_module_untouched() {
    let words = kernels::build_mask_kernel(false);
    let mut module = spv::Module::from_words(&words).unwrap();
    let mut manager = spv::PassManager::new();
    assert!(!manager.run(&mut module, 3).unwrap());
    assert_eq!(module.words(), words.as_slice());
}
