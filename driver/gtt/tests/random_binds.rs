use gtt::info::{DeviceInfo, GttConfig, platforms};
use gtt::sim::HostPages;
use gtt::*;
use proptest::prelude::*;
use std::sync::Arc;

const BACKING: u64 = 0x40_0000_0000;

#[derive(Debug, Clone)]
enum Op {
    Bind { pages: u64, dma_page: u64, align_shift: u32 },
    Unbind(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..1100, prop::sample::select(vec![0u64, 1, 16, 512]), 12u32..22)
            .prop_map(|(pages, dma_page, align_shift)| Op::Bind { pages, dma_page, align_shift }),
        2 => any::<usize>().prop_map(Op::Unbind),
    ]
}

fn platform() -> impl Strategy<Value = DeviceInfo> {
    prop::sample::select(vec![
        platforms::IVYBRIDGE,
        platforms::BROADWELL,
        platforms::CHERRYVIEW,
        platforms::SKYLAKE,
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_binds_keep_tables_consistent(info in platform(), ops in prop::collection::vec(op(), 1..40)) {
        let host = Arc::new(HostPages::new());
        let device = Device::new(info, GttConfig::new(), host.clone());
        let space = device.create_ppgtt().unwrap();
        let format = space.pte_format();
        let baseline = space.stats();
        let mut bound: Vec<GttRange> = Vec::new();

        for op in ops {
            match op {
                Op::Bind { pages, dma_page, align_shift } => {
                    let dma = BACKING + dma_page * PAGE_SIZE;
                    let sg = Arc::new(SgTable::contiguous(DmaAddress::new(dma), pages * PAGE_SIZE).unwrap());
                    let node = space.bind(&BindRequest::new(sg).aligned(1 << align_shift)).unwrap();
                    prop_assert!(bound.iter().all(|b| !b.overlaps(&node)));

                    let last = node.start() + (pages - 1) * PAGE_SIZE;
                    let decoded = space.read_pte(last).and_then(|pte| format.decode(pte));
                    prop_assert_eq!(decoded, Some(DmaAddress::new(dma + (pages - 1) * PAGE_SIZE)));
                    bound.push(node);
                }
                Op::Unbind(i) if !bound.is_empty() => {
                    let node = bound.swap_remove(i % bound.len());
                    prop_assert!(space.unbind(node.start()));
                    prop_assert!(!space.unbind(node.start()));
                }
                Op::Unbind(_) => {}
            }
            let problems = space.verify();
            prop_assert!(problems.is_empty(), "{:?}", problems);
        }

        for node in bound.drain(..) {
            prop_assert!(space.unbind(node.start()));
        }
        let after = space.stats();
        prop_assert_eq!(after.nodes, baseline.nodes);
        prop_assert_eq!(after.live_pages, baseline.live_pages);

        drop(space);
        device.shutdown();
        prop_assert_eq!(host.stats().outstanding, 0);
    }
}
