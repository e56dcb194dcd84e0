use gtt::info::{GttConfig, PpgttType, platforms};
use gtt::sim::HostPages;
use gtt::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const BACKING: u64 = 0x40_0000_0000;
const MIB: u64 = 1 << 20;

fn legacy_32bit(host: &Arc<HostPages>) -> (Arc<Device>, AddressSpace) {
    let config = GttConfig::new().with_enable_ppgtt(PpgttType::Full);
    let device = Device::new(platforms::BROADWELL, config, host.clone());
    let space = device.create_ppgtt().unwrap();
    (device, space)
}

fn pages(dma: u64, length: u64) -> Arc<SgTable> {
    Arc::new(SgTable::contiguous(DmaAddress::new(dma), length).unwrap())
}

#[test]
fn failed_allocation_unwinds_completely() {
    let host = Arc::new(HostPages::new());
    let (_device, space) = legacy_32bit(&host);
    let before = space.stats();

    // one PD and four PTs; the third page never arrives
    space.page_allocator().fail_nth(3);
    let err = space.allocate_va_range(GttAddress::new(0), 8 * MIB).unwrap_err();
    assert_eq!(err, GttError::OutOfMemory);

    let after = space.stats();
    assert_eq!(after.nodes, before.nodes);
    assert_eq!(after.live_pages, before.live_pages);
    assert!(space.verify().is_empty());

    // the injected failure fired once; the retry goes through
    space.allocate_va_range(GttAddress::new(0), 8 * MIB).unwrap();
    assert_eq!(space.stats().nodes.pt, 4);
}

#[test]
fn failure_inside_a_partly_populated_directory_keeps_old_tables() {
    let host = Arc::new(HostPages::new());
    let (_device, space) = legacy_32bit(&host);
    let first = space.bind(&BindRequest::new(pages(BACKING, PAGE_SIZE)).at(GttAddress::new(0))).unwrap();
    let before = space.stats();

    space.page_allocator().fail_nth(2);
    let big = BindRequest::new(pages(BACKING, 6 * MIB)).at(GttAddress::new(2 * MIB));
    assert_eq!(space.bind(&big).unwrap_err(), GttError::OutOfMemory);

    assert_eq!(space.stats().nodes, before.nodes);
    assert_eq!(space.stats().live_pages, before.live_pages);
    assert_eq!(space.read_pte(first.start()), Some(BACKING | 0b11));
    // the node was given back
    space.bind(&big).unwrap();
}

#[test]
fn scratch_exhaustion_leaks_nothing() {
    let host = Arc::new(HostPages::with_limit(3));
    let device = Device::new(platforms::SKYLAKE, GttConfig::new(), host.clone());
    assert_eq!(device.create_ppgtt().unwrap_err(), GttError::OutOfMemory);
    assert_eq!(host.stats().outstanding, 0);
    assert!(host.stats().refused > 0);
}

#[test]
fn bind_unbind_round_trip_returns_to_baseline() {
    let host = Arc::new(HostPages::new());
    let config = GttConfig::new().with_huge_pages(false);
    let device = Device::new(platforms::SKYLAKE, config, host.clone());
    let space = device.create_ppgtt().unwrap();
    let baseline = space.stats();

    let nodes: Vec<_> = [
        (0, PAGE_SIZE),
        (3 * MIB, 5 * MIB),
        (1 << 39, 2 * PAGE_SIZE),
        ((1 << 40) - PAGE_SIZE, 2 * PAGE_SIZE),
    ]
    .into_iter()
    .map(|(at, len)| space.bind(&BindRequest::new(pages(BACKING, len)).at(GttAddress::new(at))).unwrap())
    .collect();
    assert!(space.stats().live_pages > baseline.live_pages);
    assert!(space.verify().is_empty());

    for node in nodes {
        assert!(space.unbind(node.start()));
    }
    let after = space.stats();
    assert_eq!(after.nodes, baseline.nodes);
    assert_eq!(after.live_pages, baseline.live_pages);
    assert!(space.verify().is_empty());

    drop(space);
    device.shutdown();
    assert_eq!(host.stats().outstanding, 0);
}

#[test]
fn freed_tables_are_recycled() {
    let host = Arc::new(HostPages::new());
    let (_device, space) = legacy_32bit(&host);
    space.allocate_va_range(GttAddress::new(0), 4 * MIB).unwrap();
    space.clear_range(GttAddress::new(0), 4 * MIB).unwrap();
    let stashed = space.stats().stashed_pages;
    assert_eq!(stashed, 3);

    let allocations = host.stats().allocations;
    space.allocate_va_range(GttAddress::new(0), 4 * MIB).unwrap();
    assert_eq!(host.stats().allocations, allocations);
    assert_eq!(space.stats().stashed_pages, 0);
}

#[test]
fn write_combined_tables_are_converted_in_batches() {
    let host = Arc::new(HostPages::new());
    let device = Device::new(platforms::CHERRYVIEW, GttConfig::new(), host.clone());
    let space = device.create_ppgtt().unwrap();
    assert!(space.page_allocator().is_write_combined());

    space.allocate_va_range(GttAddress::new(0), 8 * MIB).unwrap();
    let stats = host.stats();
    assert_eq!(stats.wc_batches, 1);
    assert!(stats.wc_pages >= 8);

    space.clear_range(GttAddress::new(0), 8 * MIB).unwrap();
    drop(space);
    device.shutdown();
    let stats = host.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.wc_pages, 0);
    assert!(stats.wb_conversions > 0);
}

#[test]
fn failed_wc_conversion_is_out_of_memory() {
    let host = Arc::new(HostPages::new());
    host.fail_wc_conversion(true);
    let device = Device::new(platforms::CHERRYVIEW, GttConfig::new(), host.clone());
    assert_eq!(device.create_ppgtt().unwrap_err(), GttError::OutOfMemory);
    assert_eq!(host.stats().outstanding, 0);
}

#[test]
fn exhaustion_reclaims_other_spaces_stashes() {
    let host = Arc::new(HostPages::new());
    let config = GttConfig::new().with_huge_pages(false);
    let device = Device::new(platforms::SKYLAKE, config, host.clone());
    let a = device.create_ppgtt().unwrap();
    let b = device.create_ppgtt().unwrap();

    a.allocate_va_range(GttAddress::new(0), 16 * MIB).unwrap();
    a.clear_range(GttAddress::new(0), 16 * MIB).unwrap();
    assert!(a.stats().stashed_pages >= 4);

    host.set_limit(Some(host.stats().outstanding));
    b.allocate_va_range(GttAddress::new(0), 4 * MIB).unwrap();
    assert_eq!(a.stats().stashed_pages, 0);
    assert_eq!(b.stats().nodes.pt, 2);
}

struct Balloon {
    host: Arc<HostPages>,
    calls: AtomicUsize,
}

impl Reclaim for Balloon {
    fn reclaim(&self) -> usize {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.host.set_limit(None);
        1
    }
}

#[test]
fn reclaim_hooks_run_when_memory_is_short() {
    let host = Arc::new(HostPages::new());
    let config = GttConfig::new().with_huge_pages(false);
    let device = Device::new(platforms::SKYLAKE, config, host.clone());
    let space = device.create_ppgtt().unwrap();
    let balloon = Arc::new(Balloon {
        host: host.clone(),
        calls: AtomicUsize::new(0),
    });
    device.add_reclaim_hook(balloon.clone());

    host.set_limit(Some(host.stats().outstanding));
    space.allocate_va_range(GttAddress::new(0), PAGE_SIZE).unwrap();
    assert!(balloon.calls.load(Ordering::Relaxed) > 0);
}
