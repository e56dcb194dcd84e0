use gtt::info::{DeviceInfo, GttConfig, PpgttType, platforms};
use gtt::sim::HostPages;
use gtt::*;
use std::sync::Arc;

const BACKING: u64 = 0x40_0000_0000;
const MIB: u64 = 1 << 20;

fn device(info: DeviceInfo, config: GttConfig) -> (Arc<Device>, Arc<HostPages>) {
    let host = Arc::new(HostPages::new());
    let device = Device::new(info, config, host.clone());
    (device, host)
}

fn pages(dma: u64, length: u64) -> Arc<SgTable> {
    Arc::new(SgTable::contiguous(DmaAddress::new(dma), length).unwrap())
}

fn legacy_32bit() -> AddressSpace {
    let config = GttConfig::new().with_enable_ppgtt(PpgttType::Full);
    device(platforms::BROADWELL, config).0.create_ppgtt().unwrap()
}

fn addr(a: u64) -> GttAddress {
    GttAddress::new(a)
}

#[test]
fn formats_follow_the_device() {
    let cases = [
        (platforms::IVYBRIDGE, TableFormat::TwoLevel, 1 << 31),
        (platforms::CHERRYVIEW, TableFormat::ThreeLevel, 1 << 32),
        (platforms::BROADWELL, TableFormat::FourLevel, 1 << 48),
    ];
    for (info, format, total) in cases {
        let space = device(info, GttConfig::new()).0.create_ppgtt().unwrap();
        assert_eq!(space.format(), format, "{}", info.name);
        assert_eq!(space.total(), total, "{}", info.name);
        assert!(space.verify().is_empty());
    }

    // a 32-bit vGPU cannot run 48-bit tables
    let vgpu = GttConfig::new().with_virtualized(true);
    let space = device(platforms::SKYLAKE, vgpu).0.create_ppgtt().unwrap();
    assert_eq!(space.format(), TableFormat::ThreeLevel);

    let off = GttConfig::new().with_enable_ppgtt(PpgttType::None);
    let err = device(platforms::SKYLAKE, off).0.create_ppgtt().unwrap_err();
    assert_eq!(err, GttError::Unsupported);
}

#[test]
fn explicit_spaces_are_checked() {
    let (ivb, _) = device(platforms::IVYBRIDGE, GttConfig::new());
    assert_eq!(
        ivb.create_address_space("x", TableFormat::FourLevel, 1 << 48).unwrap_err(),
        GttError::Unsupported
    );
    let (bdw, _) = device(platforms::BROADWELL, GttConfig::new());
    assert!(matches!(
        bdw.create_address_space("x", TableFormat::ThreeLevel, 3 << 30),
        Err(GttError::InvalidRange { .. })
    ));
    let small = bdw.create_address_space("x", TableFormat::ThreeLevel, 1 << 31).unwrap();
    assert_eq!(small.total(), 1 << 31);
}

#[test]
fn basic_map_fills_one_table() {
    let space = legacy_32bit();
    let sg = SgTable::contiguous(DmaAddress::new(BACKING), 16 * PAGE_SIZE).unwrap();

    space.allocate_va_range(addr(0), sg.len()).unwrap();
    space.insert_entries(addr(0), &sg, CacheLevel::Llc, BindFlags::empty()).unwrap();

    let nodes = space.stats().nodes;
    assert_eq!((nodes.pml4, nodes.pdp, nodes.pd, nodes.pt), (0, 1, 1, 1));
    for i in 0..16 {
        let expected = (BACKING + i * PAGE_SIZE) | 0b11;
        assert_eq!(space.read_pte(addr(i * PAGE_SIZE)), Some(expected));
    }
    let scratch = space.scratch_pte();
    for i in 16..512 {
        assert_eq!(space.read_pte(addr(i * PAGE_SIZE)), Some(scratch));
    }
    assert!(space.take_invalidate());
    assert!(space.verify().is_empty());
}

#[test]
fn clearing_frees_emptied_tables_but_not_the_root() {
    let space = legacy_32bit();
    let sg = SgTable::contiguous(DmaAddress::new(BACKING), 16 * PAGE_SIZE).unwrap();
    let baseline = space.stats().live_pages;

    space.allocate_va_range(addr(0), sg.len()).unwrap();
    space.insert_entries(addr(0), &sg, CacheLevel::Llc, BindFlags::empty()).unwrap();
    space.clear_range(addr(0), sg.len()).unwrap();

    let nodes = space.stats().nodes;
    assert_eq!((nodes.pdp, nodes.pd, nodes.pt), (1, 0, 0));
    assert_eq!(space.read_pte(addr(0)), None);
    assert_eq!(space.stats().live_pages, baseline);

    // clearing again changes nothing
    space.clear_range(addr(0), sg.len()).unwrap();
    assert_eq!(space.stats().nodes, nodes);
    assert!(space.verify().is_empty());
}

#[test]
fn partial_clear_keeps_shared_tables() {
    let space = legacy_32bit();
    space.allocate_va_range(addr(0), 8 * PAGE_SIZE).unwrap();
    space.clear_range(addr(0), 4 * PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes.pt, 1);
    space.clear_range(addr(4 * PAGE_SIZE), 4 * PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes.pt, 0);
}

#[test]
fn ranges_are_validated() {
    let space = legacy_32bit();
    let invalid = |r: Result<(), GttError>| matches!(r, Err(GttError::InvalidRange { .. }));

    assert!(invalid(space.allocate_va_range(addr(0x800), PAGE_SIZE)));
    assert!(invalid(space.allocate_va_range(addr(0), 0x1800)));
    assert!(invalid(space.allocate_va_range(addr(0), 0)));
    assert!(invalid(space.allocate_va_range(addr((1 << 32) - PAGE_SIZE), 2 * PAGE_SIZE)));
    assert!(invalid(space.clear_range(addr(u64::MAX & !0xfff), PAGE_SIZE)));

    // inserting needs tables underneath
    let sg = SgTable::contiguous(DmaAddress::new(BACKING), PAGE_SIZE).unwrap();
    assert!(invalid(space.insert_entries(addr(0), &sg, CacheLevel::Llc, BindFlags::empty())));
    assert_eq!(space.stats().nodes.pt, 0);
}

#[test]
fn two_level_tables_straddle_a_directory_entry() {
    let (device, _) = device(platforms::IVYBRIDGE, GttConfig::new());
    let space = device.create_ppgtt().unwrap();
    let start = addr((4 * MIB) - PAGE_SIZE);

    let node = space.bind(&BindRequest::new(pages(BACKING, 3 * PAGE_SIZE)).at(start)).unwrap();
    assert_eq!(node, GttRange::new(start, 3 * PAGE_SIZE));
    assert_eq!(space.stats().nodes.pd, 1);
    assert_eq!(space.stats().nodes.pt, 2);

    for i in 0..3 {
        let expected = PteFormat::Ivb.encode(DmaAddress::new(BACKING + i * PAGE_SIZE), CacheLevel::Llc, false);
        assert_eq!(space.read_pte(start + i * PAGE_SIZE), Some(expected));
    }
    assert_eq!(space.read_pde(start).map(|pde| pde & 1), Some(1));
    assert!(space.verify().is_empty());

    assert!(space.unbind(start));
    assert!(!space.unbind(start));
    assert_eq!(space.stats().nodes.pt, 0);
    assert_eq!(space.read_pde(start), Some(space.read_pde(addr(0)).unwrap()));
}

#[test]
fn read_only_needs_gen8_ppgtt() {
    let (ivb, _) = device(platforms::IVYBRIDGE, GttConfig::new());
    let space = ivb.create_ppgtt().unwrap();
    let req = BindRequest::new(pages(BACKING, PAGE_SIZE)).flags(BindFlags::READ_ONLY);
    assert_eq!(space.bind(&req).unwrap_err(), GttError::Unsupported);
    assert_eq!(space.stats().bindings, 0);

    let space = legacy_32bit();
    let node = space.bind(&req).unwrap();
    assert_eq!(space.read_pte(node.start()), Some(BACKING | 0b1));
}

#[test]
fn four_level_reaches_high_addresses() {
    let config = GttConfig::new().with_huge_pages(false);
    let (device, _) = device(platforms::SKYLAKE, config);
    let space = device.create_ppgtt().unwrap();
    assert_eq!(space.format(), TableFormat::FourLevel);
    space.take_tlb_dirty();

    let high = addr(1 << 40);
    space.bind(&BindRequest::new(pages(BACKING, 2 * PAGE_SIZE)).at(high)).unwrap();
    let nodes = space.stats().nodes;
    assert_eq!((nodes.pml4, nodes.pdp, nodes.pd, nodes.pt), (1, 1, 1, 1));
    assert!(space.take_tlb_dirty());
    assert_eq!(space.read_pte(high + PAGE_SIZE), Some((BACKING + PAGE_SIZE) | 0b11));

    assert!(space.unbind(high));
    assert_eq!(space.stats().nodes, NodeCount { pml4: 1, ..NodeCount::default() });
    assert!(space.verify().is_empty());
}

#[test]
fn anywhere_bindings_do_not_overlap() {
    let space = legacy_32bit();
    let a = space.bind(&BindRequest::new(pages(BACKING, 3 * PAGE_SIZE))).unwrap();
    let b = space.bind(&BindRequest::new(pages(BACKING, 5 * PAGE_SIZE)).aligned(64 << 10)).unwrap();
    let c = space.bind(&BindRequest::new(pages(BACKING, PAGE_SIZE))).unwrap();
    assert!(!a.overlaps(&b) && !b.overlaps(&c) && !a.overlaps(&c));
    assert!(b.start().is_aligned::<Size64K>());
    assert_eq!(space.bindings().len(), 3);
    assert_eq!(space.binding(b.start()).unwrap().mapped(), b);
}

#[test]
fn fixed_placement_collides_or_evicts() {
    let space = legacy_32bit();
    let at = addr(16 * PAGE_SIZE);
    space.bind(&BindRequest::new(pages(BACKING, 4 * PAGE_SIZE)).at(at)).unwrap();

    let overlapping = BindRequest::new(pages(BACKING + MIB, 4 * PAGE_SIZE)).at(at + 2 * PAGE_SIZE);
    assert!(matches!(space.bind(&overlapping), Err(GttError::EvictionRequired { .. })));

    let evicting = overlapping.clone().at_evicting(at + 2 * PAGE_SIZE);
    space.bind(&evicting).unwrap();
    assert!(space.binding(at).is_none());
    assert_eq!(space.bindings().len(), 1);
    assert_eq!(space.read_pte(at), Some(space.scratch_pte()));
    assert_eq!(space.read_pte(at + 2 * PAGE_SIZE), Some((BACKING + MIB) | 0b11));
    assert!(space.verify().is_empty());
}

struct Stubborn;

impl Evictor for Stubborn {
    fn evict_for_range(&self, _space: &AddressSpace, _range: GttRange) -> Result<(), GttError> {
        Ok(())
    }
}

#[test]
fn failed_eviction_reports_no_space() {
    let space = legacy_32bit().with_evictor(Arc::new(Stubborn));
    let at = addr(0);
    space.bind(&BindRequest::new(pages(BACKING, PAGE_SIZE)).at(at)).unwrap();
    let again = BindRequest::new(pages(BACKING, PAGE_SIZE)).at_evicting(at);
    assert_eq!(space.bind(&again).unwrap_err(), GttError::NoSpace);
    assert!(space.binding(at).is_some());
}

#[test]
fn oversized_requests_find_no_space() {
    let (device, _) = device(platforms::BROADWELL, GttConfig::new());
    let space = device.create_address_space("small", TableFormat::ThreeLevel, 1 << 30).unwrap();
    let too_big = Arc::new(
        SgTable::new(vec![
            SgChunk { dma: DmaAddress::new(BACKING), length: 1 << 30 },
            SgChunk { dma: DmaAddress::new(BACKING), length: PAGE_SIZE },
        ])
        .unwrap(),
    );
    assert_eq!(space.bind(&BindRequest::new(too_big)).unwrap_err(), GttError::NoSpace);
}

#[test]
fn asleep_devices_refuse_work() {
    let (device, _) = device(platforms::BROADWELL, GttConfig::new());
    let space = device.create_ppgtt().unwrap();
    device.suspend();
    let req = BindRequest::new(pages(BACKING, PAGE_SIZE));
    assert_eq!(space.bind(&req).unwrap_err(), GttError::DeviceAsleep);
    assert_eq!(space.restore_mappings().unwrap_err(), GttError::DeviceAsleep);
    device.wake();
    space.bind(&req).unwrap();
}

#[test]
fn raw_table_operations_need_an_awake_device() {
    let (device, host) = device(platforms::BROADWELL, GttConfig::new());
    let space = device.create_ppgtt().unwrap();
    let allocations = host.stats().allocations;
    let sg = SgTable::contiguous(DmaAddress::new(BACKING), PAGE_SIZE).unwrap();

    device.suspend();
    assert_eq!(space.allocate_va_range(addr(0), 4 * PAGE_SIZE), Err(GttError::DeviceAsleep));
    assert_eq!(
        space.insert_entries(addr(0), &sg, CacheLevel::Llc, BindFlags::empty()),
        Err(GttError::DeviceAsleep)
    );
    assert_eq!(space.clear_range(addr(0), PAGE_SIZE), Err(GttError::DeviceAsleep));
    assert_eq!(host.stats().allocations, allocations);
    assert_eq!(space.stats().nodes.pt, 0);

    device.wake();
    space.allocate_va_range(addr(0), 4 * PAGE_SIZE).unwrap();
    space.insert_entries(addr(0), &sg, CacheLevel::Llc, BindFlags::empty()).unwrap();
    assert_eq!(space.read_pte(addr(0)), Some(BACKING | 0b11));
}

#[test]
fn bad_alignments_are_rejected() {
    let space = legacy_32bit();
    let sg = pages(BACKING, PAGE_SIZE);
    for alignment in [u64::MAX, 3 * PAGE_SIZE, 1 << 33] {
        assert_eq!(
            space.bind(&BindRequest::new(sg.clone()).aligned(alignment)),
            Err(GttError::InvalidRange { start: 0, length: PAGE_SIZE }),
            "{alignment:#x}"
        );
    }
    assert_eq!(space.stats().bindings, 0);

    // the whole span is still a valid alignment
    let node = space.bind(&BindRequest::new(sg).aligned(1 << 32)).unwrap();
    assert_eq!(node.start(), addr(0));
}

#[test]
fn padding_a_huge_object_cannot_overflow() {
    let (device, _) = device(platforms::SKYLAKE, GttConfig::new());
    let space = device.create_ppgtt().unwrap();
    let endless = Arc::new(SgTable::contiguous(DmaAddress::new(0), u64::MAX & !0xffff).unwrap());
    assert_eq!(space.bind(&BindRequest::new(endless)).unwrap_err(), GttError::NoSpace);
    assert_eq!(space.stats().bindings, 0);
}

#[test]
fn three_level_page_table_boundaries() {
    let space = legacy_32bit();
    let pt_span = 2 * MIB;

    // exactly one page table
    space.allocate_va_range(addr(pt_span), pt_span).unwrap();
    let nodes = space.stats().nodes;
    assert_eq!((nodes.pdp, nodes.pd, nodes.pt), (1, 1, 1));
    space.clear_range(addr(pt_span), pt_span).unwrap();
    assert_eq!(space.stats().nodes.pt, 0);

    // one page over the edge
    space.allocate_va_range(addr(pt_span), pt_span + PAGE_SIZE).unwrap();
    let nodes = space.stats().nodes;
    assert_eq!((nodes.pdp, nodes.pd, nodes.pt), (1, 1, 2));
    space.clear_range(addr(pt_span), pt_span + PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes, NodeCount { pdp: 1, ..NodeCount::default() });
}

#[test]
fn three_level_clear_across_a_directory_boundary() {
    let space = legacy_32bit();
    let gib = 1 << 30;
    let start = addr(gib - PAGE_SIZE);

    space.allocate_va_range(start, 2 * PAGE_SIZE).unwrap();
    let nodes = space.stats().nodes;
    assert_eq!((nodes.pdp, nodes.pd, nodes.pt), (1, 2, 2));

    // the lower directory empties, the upper one keeps its table
    space.clear_range(start, PAGE_SIZE).unwrap();
    let nodes = space.stats().nodes;
    assert_eq!((nodes.pdp, nodes.pd, nodes.pt), (1, 1, 1));
    assert!(space.verify().is_empty());

    space.clear_range(addr(gib), PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes, NodeCount { pdp: 1, ..NodeCount::default() });
    assert!(space.verify().is_empty());
}

#[test]
fn four_level_page_table_boundaries() {
    let config = GttConfig::new().with_huge_pages(false);
    let (device, _) = device(platforms::SKYLAKE, config);
    let space = device.create_ppgtt().unwrap();
    let pt_span = 2 * MIB;

    space.allocate_va_range(addr(0), pt_span).unwrap();
    assert_eq!(
        space.stats().nodes,
        NodeCount { pml4: 1, pdp: 1, pd: 1, pt: 1 }
    );
    space.allocate_va_range(addr(pt_span), PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes.pt, 2);
    space.clear_range(addr(0), pt_span + PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes, NodeCount { pml4: 1, ..NodeCount::default() });
}

#[test]
fn four_level_clear_across_a_pml4_entry() {
    let config = GttConfig::new().with_huge_pages(false);
    let (device, _) = device(platforms::SKYLAKE, config);
    let space = device.create_ppgtt().unwrap();
    let pml4e_span = 1 << 39;
    let start = addr(pml4e_span - PAGE_SIZE);

    space.allocate_va_range(start, 2 * PAGE_SIZE).unwrap();
    assert_eq!(
        space.stats().nodes,
        NodeCount { pml4: 1, pdp: 2, pd: 2, pt: 2 }
    );

    space.clear_range(addr(pml4e_span), PAGE_SIZE).unwrap();
    assert_eq!(
        space.stats().nodes,
        NodeCount { pml4: 1, pdp: 1, pd: 1, pt: 1 }
    );
    assert!(space.verify().is_empty());

    space.clear_range(start, PAGE_SIZE).unwrap();
    assert_eq!(space.stats().nodes, NodeCount { pml4: 1, ..NodeCount::default() });
    assert!(space.verify().is_empty());
}

#[test]
fn restore_replays_bindings() {
    let space = legacy_32bit();
    let a = space.bind(&BindRequest::new(pages(BACKING, 3 * PAGE_SIZE))).unwrap();
    let b = space
        .bind(&BindRequest::new(pages(BACKING + MIB, PAGE_SIZE)).cache(CacheLevel::None))
        .unwrap();
    let before: Vec<_> = [a.start(), b.start()].iter().map(|&s| space.read_pte(s)).collect();

    space.restore_mappings().unwrap();
    let after: Vec<_> = [a.start(), b.start()].iter().map(|&s| space.read_pte(s)).collect();
    assert_eq!(before, after);
    assert!(space.take_tlb_dirty());
    assert!(space.verify().is_empty());
}

#[test]
fn dump_lists_mappings() {
    let space = legacy_32bit();
    space.bind(&BindRequest::new(pages(BACKING, 4 * PAGE_SIZE))).unwrap();
    let mut out = String::new();
    space.dump(&mut out).unwrap();
    assert!(out.starts_with("ppgtt: ThreeLevel"));
    assert!(out.contains("1 bindings"));
}
