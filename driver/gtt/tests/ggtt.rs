use gtt::info::{DeviceInfo, GttConfig, PpgttType, platforms};
use gtt::sim::{HostPages, SimulatedGpu};
use gtt::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const BACKING: u64 = 0x40_0000_0000;
const ENTRIES: usize = 1024;

struct Rig {
    device: Arc<Device>,
    gpu: Arc<SimulatedGpu>,
    ggtt: Ggtt,
}

fn rig(info: DeviceInfo, config: GttConfig) -> Rig {
    let device = Device::new(info, config, Arc::new(HostPages::new()));
    let gpu = SimulatedGpu::new(ENTRIES, info.has_gtt_cache);
    let ggtt = device.create_ggtt(gpu.gsm(), gpu.clone()).unwrap();
    Rig { device, gpu, ggtt }
}

fn pages(dma: u64, count: u64) -> Arc<SgTable> {
    Arc::new(SgTable::contiguous(DmaAddress::new(dma), count * PAGE_SIZE).unwrap())
}

fn index(addr: GttAddress) -> u64 {
    addr.as_u64() / PAGE_SIZE
}

#[test]
fn new_tables_point_at_scratch() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    assert_eq!(rig.ggtt.total(), ENTRIES as u64 * PAGE_SIZE);
    let scratch = rig.ggtt.space().scratch_pte();
    assert_ne!(scratch, 0);
    assert_eq!(rig.gpu.device_read(0), scratch);
    assert_eq!(rig.gpu.device_read(ENTRIES as u64 - 1), scratch);
    assert_eq!(rig.gpu.pending_writes(), 0);
}

#[test]
fn writes_become_visible_after_invalidate() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let at = GttAddress::new(0x4000);
    let scratch = rig.ggtt.space().scratch_pte();

    rig.ggtt
        .space()
        .insert_entries(at, &pages(BACKING, 2), CacheLevel::Llc, BindFlags::GLOBAL_BIND)
        .unwrap();
    assert_eq!(rig.ggtt.space().read_pte(at), Some(BACKING | 1));
    assert_eq!(rig.gpu.device_read(index(at)), scratch);

    rig.ggtt.invalidate();
    assert_eq!(rig.gpu.device_read(index(at)), BACKING | 1);
    assert_eq!(rig.gpu.device_read(index(at) + 1), (BACKING + PAGE_SIZE) | 1);
}

#[test]
fn bind_and_unbind_invalidate_themselves() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let flushes = rig.gpu.flushes();
    let node = rig.ggtt.bind(&BindRequest::new(pages(BACKING, 4))).unwrap();
    assert!(rig.gpu.flushes() > flushes);
    assert_eq!(rig.gpu.device_read(index(node.start()) + 3), (BACKING + 3 * PAGE_SIZE) | 1);
    assert!(
        rig.ggtt
            .space()
            .binding(node.start())
            .unwrap()
            .flags
            .contains(BindFlags::GLOBAL_BIND)
    );

    assert!(rig.ggtt.unbind(node.start()));
    assert_eq!(rig.gpu.device_read(index(node.start())), rig.ggtt.space().scratch_pte());
    assert_eq!(rig.gpu.pending_writes(), 0);
}

#[test]
fn gtt_cache_is_invalidated_too() {
    let info = DeviceInfo::new("cached", 0xfffe, 9)
        .with_ppgtt(PpgttType::Full48)
        .with_has_gtt_cache(true);
    let rig = rig(info, GttConfig::new());
    let at = GttAddress::new(0x8000);
    // prime the cache with the scratch entry
    let stale = rig.gpu.device_read(index(at));

    rig.ggtt.bind(&BindRequest::new(pages(BACKING, 1)).at(at)).unwrap();
    assert_ne!(rig.gpu.device_read(index(at)), stale);
    assert!(rig.gpu.cache_invalidations() > 0);
}

#[test]
fn global_entries_cannot_be_read_only() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let req = BindRequest::new(pages(BACKING, 1)).flags(BindFlags::READ_ONLY);
    assert_eq!(rig.ggtt.bind(&req).unwrap_err(), GttError::Unsupported);
    assert!(rig.ggtt.space().bindings().is_empty());
}

#[test]
fn clear_range_reaches_the_device() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let node = rig.ggtt.bind(&BindRequest::new(pages(BACKING, 2))).unwrap();
    rig.ggtt.clear_range(node.start(), PAGE_SIZE).unwrap();
    assert_eq!(rig.gpu.device_read(index(node.start())), rig.ggtt.space().scratch_pte());
    assert_eq!(rig.gpu.device_read(index(node.start()) + 1), (BACKING + PAGE_SIZE) | 1);
    assert!(matches!(
        rig.ggtt.clear_range(GttAddress::new(rig.ggtt.total()), PAGE_SIZE),
        Err(GttError::InvalidRange { .. })
    ));
}

#[test]
fn fixed_evicting_binds_replace_old_ones() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let at = GttAddress::new(0x10_000);
    rig.ggtt.bind(&BindRequest::new(pages(BACKING, 4)).at(at)).unwrap();
    rig.ggtt
        .bind(&BindRequest::new(pages(BACKING + 0x10_0000, 2)).at_evicting(at + PAGE_SIZE))
        .unwrap();
    assert_eq!(rig.ggtt.space().bindings().len(), 1);
    assert_eq!(rig.gpu.device_read(index(at)), rig.ggtt.space().scratch_pte());
    assert_eq!(rig.gpu.device_read(index(at) + 1), (BACKING + 0x10_0000) | 1);
}

#[test]
fn rejected_evicting_binds_keep_existing_bindings() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    let old = rig.ggtt.bind(&BindRequest::new(pages(BACKING, 2)).at(GttAddress::new(0))).unwrap();
    let replacement = || BindRequest::new(pages(BACKING + 0x10_0000, 1));

    // Misaligned, past the end, read-only and asleep all fail before eviction.
    let err = rig.ggtt.bind(&replacement().at_evicting(GttAddress::new(0x800))).unwrap_err();
    assert_eq!(err, GttError::InvalidRange { start: 0x800, length: PAGE_SIZE });
    let past_end = GttAddress::new(rig.ggtt.total());
    assert!(rig.ggtt.bind(&replacement().at_evicting(past_end)).is_err());
    let read_only = replacement()
        .at_evicting(GttAddress::new(0))
        .flags(BindFlags::READ_ONLY);
    assert_eq!(rig.ggtt.bind(&read_only), Err(GttError::Unsupported));
    rig.device.suspend();
    assert_eq!(
        rig.ggtt.bind(&replacement().at_evicting(GttAddress::new(0))),
        Err(GttError::DeviceAsleep)
    );
    rig.device.wake();

    assert_eq!(rig.ggtt.space().bindings().len(), 1);
    assert_eq!(rig.gpu.device_read(index(old.start()) + 1), (BACKING + PAGE_SIZE) | 1);
    assert!(rig.ggtt.unbind(old.start()));
}

#[test]
fn local_binds_go_to_the_aliasing_ppgtt() {
    let rig = rig(platforms::SANDYBRIDGE, GttConfig::new());
    let alias = rig.ggtt.alias().expect("sandybridge aliases the ggtt");
    assert_eq!(alias.format(), TableFormat::TwoLevel);

    let req = BindRequest::new(pages(BACKING, 2)).flags(BindFlags::LOCAL_BIND);
    let node = rig.ggtt.bind(&req).unwrap();
    let expected = PteFormat::Snb.encode(DmaAddress::new(BACKING), CacheLevel::Llc, false);
    assert_eq!(alias.read_pte(node.start()), Some(expected));
    assert_eq!(rig.gpu.device_read(index(node.start())), rig.ggtt.space().scratch_pte());

    let both = BindRequest::new(pages(BACKING, 1)).flags(BindFlags::LOCAL_BIND | BindFlags::GLOBAL_BIND);
    let shared = rig.ggtt.bind(&both).unwrap();
    assert_eq!(rig.gpu.device_read(index(shared.start())), expected);
    assert_eq!(alias.read_pte(shared.start()), Some(expected));

    assert!(rig.ggtt.unbind(node.start()));
    assert!(rig.ggtt.unbind(shared.start()));
    assert_eq!(alias.stats().nodes.pt, 0);
    assert!(alias.verify().is_empty());
}

#[test]
fn without_an_alias_local_binds_are_global() {
    let rig = rig(platforms::IVYBRIDGE, GttConfig::new());
    assert!(rig.ggtt.alias().is_none());
    let node = rig
        .ggtt
        .bind(&BindRequest::new(pages(BACKING, 1)).flags(BindFlags::LOCAL_BIND))
        .unwrap();
    let expected = PteFormat::Ivb.encode(DmaAddress::new(BACKING), CacheLevel::Llc, false);
    assert_eq!(rig.gpu.device_read(index(node.start())), expected);
}

#[test]
fn vtd_workaround_stops_the_machine() {
    let quiet = rig(platforms::BROXTON, GttConfig::new());
    let rig = rig(platforms::BROXTON, GttConfig::new().with_vtd_active(true));
    let before = rig.device.rendezvous().generation();
    let node = rig.ggtt.bind(&BindRequest::new(pages(BACKING, 1))).unwrap();
    assert!(rig.device.rendezvous().generation() > before);
    assert_eq!(rig.gpu.device_read(index(node.start())), BACKING | 1);

    quiet.ggtt.bind(&BindRequest::new(pages(BACKING, 1))).unwrap();
    assert_eq!(quiet.device.rendezvous().generation(), 0);
}

#[test]
fn aperture_users_park_during_updates() {
    let rig = rig(platforms::BROXTON, GttConfig::new().with_vtd_active(true));
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let participant = rig.device.rendezvous().register();
        let done = &done;
        let worker = s.spawn(move || {
            while !done.load(Ordering::Acquire) {
                participant.checkpoint();
                thread::yield_now();
            }
        });

        for i in 0..8 {
            let node = rig.ggtt.bind(&BindRequest::new(pages(BACKING + i * PAGE_SIZE, 1))).unwrap();
            assert_eq!(rig.gpu.device_read(index(node.start())), (BACKING + i * PAGE_SIZE) | 1);
        }
        done.store(true, Ordering::Release);
        worker.join().unwrap();
    });
    assert_eq!(rig.device.rendezvous().generation(), 8);
    assert_eq!(rig.device.rendezvous().participants(), 0);
}

#[test]
fn restore_rewrites_lost_tables() {
    let rig = rig(platforms::SANDYBRIDGE, GttConfig::new());
    let global = rig.ggtt.bind(&BindRequest::new(pages(BACKING, 3))).unwrap();
    let local = rig
        .ggtt
        .bind(&BindRequest::new(pages(BACKING, 1)).flags(BindFlags::LOCAL_BIND))
        .unwrap();
    let alias = rig.ggtt.alias().unwrap();
    let local_pte = alias.read_pte(local.start());

    // the device forgets its table across suspend
    let mut raw = rig.gpu.gsm();
    for i in 0..ENTRIES as u64 {
        raw.write_entry(i, 0);
    }
    rig.ggtt.invalidate();
    assert_eq!(rig.gpu.device_read(index(global.start())), 0);

    rig.device.suspend();
    assert_eq!(rig.ggtt.restore_mappings().unwrap_err(), GttError::DeviceAsleep);
    rig.device.wake();
    rig.ggtt.restore_mappings().unwrap();

    let expected = PteFormat::Snb.encode(DmaAddress::new(BACKING + 2 * PAGE_SIZE), CacheLevel::Llc, false);
    assert_eq!(rig.gpu.device_read(index(global.start()) + 2), expected);
    assert_eq!(rig.gpu.device_read(0x3ff), rig.ggtt.space().scratch_pte());
    assert_eq!(alias.read_pte(local.start()), local_pte);
    assert_eq!(rig.ggtt.space().bindings().len(), 2);
}

#[test]
fn gen8_faults_are_decoded_and_cleared() {
    let rig = rig(platforms::BROADWELL, GttConfig::new());
    assert!(rig.ggtt.check_faults().is_empty());

    rig.gpu.inject_fault(0x0000_7fff_1234_5000, true, 0x1f, 2, 3);
    let faults = rig.ggtt.check_faults();
    assert_eq!(
        faults,
        [DeviceFault {
            address: GttAddress::new(0x0000_7fff_1234_5000),
            ggtt: true,
            source_id: 0x1f,
            fault_type: 2,
            engine: 3,
        }]
    );
    assert!(faults[0].to_string().contains("GPU page fault"));
    assert!(rig.ggtt.check_faults().is_empty());
}

#[test]
fn gen6_faults_are_per_engine() {
    let rig = rig(platforms::IVYBRIDGE, GttConfig::new());
    rig.gpu.inject_gen6_fault(2, 0x0123_4000, false, 1);
    let faults = rig.ggtt.check_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].engine, 2);
    assert_eq!(faults[0].address, GttAddress::new(0x0123_4000));
    assert!(rig.ggtt.check_faults().is_empty());
}
