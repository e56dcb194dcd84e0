//! The global GTT.
//!
//! A single flat table shared by the whole device, written through a
//! write-combined window. Writes only become visible to the GPU once the
//! table is invalidated, so every update path here ends with
//! [`Ggtt::invalidate`]. On devices with the VT-d erratum, updates and the
//! invalidate run with every other aperture user parked.
//!
//! When the device runs an aliasing PPGTT, bindings flagged
//! [`BindFlags::LOCAL_BIND`] are mirrored into it at the same offsets.

use crate::device::Device;
use crate::error::GttError;
use crate::fault::{DeviceFault, check_faults};
use crate::gsm::GsmWindow;
use crate::space::{AddressSpace, BindRequest, Placement};
use crate::walk::TableFormat;
use crate::BindFlags;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use gtt_addresses::{GttAddress, GttRange};
use gtt_info::PpgttType;
use gtt_registers::flush::{GfxFlushControl, GtCacheControl};
use gtt_registers::{Mmio, Register, StoreRegister};
use log::{debug, warn};

pub struct Ggtt {
    space: AddressSpace,
    alias: Option<AddressSpace>,
    mmio: Arc<dyn Mmio>,
    vtd_wa: bool,
}

impl Ggtt {
    pub(crate) fn new(
        device: &Arc<Device>,
        gsm: Box<dyn GsmWindow>,
        mmio: Arc<dyn Mmio>,
    ) -> Result<Self, GttError> {
        let space = AddressSpace::new(device, "ggtt", TableFormat::Flat, 0, Some(gsm))?;

        let alias = match device.ppgtt_format() {
            Some((format, total)) if device.effective_ppgtt() == PpgttType::Aliasing => {
                if total >= space.total() {
                    Some(AddressSpace::new(device, "aliasing-ppgtt", format, total, None)?)
                } else {
                    warn!("aliasing ppgtt ({total:#x}) smaller than ggtt, not created");
                    None
                }
            }
            _ => None,
        };

        let ggtt = Self {
            space,
            alias,
            mmio,
            vtd_wa: device.info().needs_vtd_wa(device.config()),
        };
        if ggtt.vtd_wa {
            debug!("ggtt updates serialized against aperture access");
        }
        ggtt.space.scrub();
        ggtt.invalidate();
        Ok(ggtt)
    }

    #[must_use]
    pub const fn space(&self) -> &AddressSpace {
        &self.space
    }

    #[must_use]
    pub const fn alias(&self) -> Option<&AddressSpace> {
        self.alias.as_ref()
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.space.total()
    }

    /// Runs a table update followed by an invalidate, inside the stop-machine
    /// barrier when the VT-d workaround is on.
    fn update<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.vtd_wa {
            self.space.device().rendezvous().stop_machine(|| {
                let result = f();
                self.invalidate();
                self.mmio.posting_read(GfxFlushControl::OFFSET);
                result
            })
        } else {
            let result = f();
            self.invalidate();
            result
        }
    }

    /// Makes outstanding PTE writes visible to the GPU.
    pub fn invalidate(&self) {
        GfxFlushControl::flush().store(self.mmio.as_ref());
        if self.space.device().info().has_gtt_cache {
            GtCacheControl::invalidate_all().store(self.mmio.as_ref());
        }
        self.space.take_invalidate();
    }

    /// Binds into the GGTT, the aliasing PPGTT, or both. Without either
    /// flag the binding is global.
    pub fn bind(&self, req: &BindRequest) -> Result<GttRange, GttError> {
        let mut flags = req.flags;
        if !flags.intersects(BindFlags::LOCAL_BIND | BindFlags::GLOBAL_BIND) {
            flags |= BindFlags::GLOBAL_BIND;
        }
        let mut req = req.clone().flags(flags);
        if let Placement::Fixed {
            offset,
            evict: true,
        } = req.placement
        {
            // A request that fails anyway must not cost anyone their binding.
            self.space.check_request(&req)?;
            self.evict_range(GttRange::new(offset, req.pages.len()));
            req = req.at(offset);
        }

        let global = flags.contains(BindFlags::GLOBAL_BIND) || self.alias.is_none();
        self.space.bind_with(&req, |node| {
            if global {
                self.update(|| self.space.map(node, &req))?;
            }
            if let (true, Some(alias)) = (flags.contains(BindFlags::LOCAL_BIND), &self.alias) {
                if let Err(e) = alias.map(node, &req) {
                    if global {
                        self.update(|| self.space.scrub_range(node.start(), req.pages.len()));
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    pub fn unbind(&self, start: GttAddress) -> bool {
        let Some(binding) = self.space.take_binding(start) else {
            return false;
        };
        let flags = binding.flags;
        if flags.contains(BindFlags::GLOBAL_BIND) || self.alias.is_none() {
            self.update(|| self.space.unmap(&binding));
        }
        if let (true, Some(alias)) = (flags.contains(BindFlags::LOCAL_BIND), &self.alias) {
            alias.unmap(&binding);
        }
        self.space.release_node(binding.node);
        true
    }

    /// Unbinds everything overlapping `range`.
    pub fn evict_range(&self, range: GttRange) -> usize {
        let victims: Vec<GttAddress> = self
            .space
            .bindings()
            .into_iter()
            .filter(|b| b.node.overlaps(&range))
            .map(|b| b.node.start())
            .collect();
        victims.into_iter().filter(|&start| self.unbind(start)).count()
    }

    /// Points a range at scratch and invalidates.
    pub fn clear_range(&self, start: GttAddress, length: u64) -> Result<(), GttError> {
        self.space.device().ensure_awake()?;
        self.update(|| self.space.clear_range(start, length))
    }

    /// Rewrites the whole table from the recorded bindings, e.g. on resume.
    pub fn restore_mappings(&self) -> Result<(), GttError> {
        self.space.device().ensure_awake()?;
        let (global, local): (Vec<_>, Vec<_>) = self
            .space
            .bindings()
            .into_iter()
            .partition(|b| b.flags.contains(BindFlags::GLOBAL_BIND) || self.alias.is_none());
        self.update(|| self.space.restore_with(Some(&global)))?;
        if let Some(alias) = &self.alias {
            let local: Vec<_> = local
                .into_iter()
                .chain(global.iter().filter(|b| b.flags.contains(BindFlags::LOCAL_BIND)).cloned())
                .collect();
            alias.restore_with(Some(&local))?;
        }
        Ok(())
    }

    /// Reads, logs and clears latched GPU page faults.
    #[must_use]
    pub fn check_faults(&self) -> Vec<DeviceFault> {
        check_faults(self.mmio.as_ref(), self.space.device().info().generation)
    }
}

impl core::fmt::Debug for Ggtt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ggtt")
            .field("space", &self.space)
            .field("alias", &self.alias)
            .field("vtd_wa", &self.vtd_wa)
            .finish_non_exhaustive()
    }
}
