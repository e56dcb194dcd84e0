use gtt_addresses::GttRange;

/// Errors surfaced by address-space operations.
///
/// Every mutation that fails has already been unwound when one of these is
/// returned; no partial structural state is left behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GttError {
    /// The page allocator stayed exhausted after reclaim.
    #[error("out of memory")]
    OutOfMemory,
    /// Outside the address space, misaligned to 4 KiB, empty, or not
    /// allocated where allocation is required.
    #[error("invalid range {start:#x}+{length:#x}")]
    InvalidRange { start: u64, length: u64 },
    /// A scatter list with an unaligned or empty chunk.
    #[error("invalid backing pages: chunk {dma:#x}+{length:#x}")]
    InvalidPages { dma: u64, length: u64 },
    /// No free hole large enough in the range allocator.
    #[error("no space left in address space")]
    NoSpace,
    /// A fixed placement collides with existing bindings.
    #[error("range {start:#x}+{length:#x} collides with existing bindings")]
    EvictionRequired { start: u64, length: u64 },
    /// The device is suspended.
    #[error("device is asleep")]
    DeviceAsleep,
    /// The format or device cannot express the request.
    #[error("operation not supported by this address space")]
    Unsupported,
}

impl GttError {
    #[inline]
    pub(crate) const fn invalid(start: u64, length: u64) -> Self {
        Self::InvalidRange { start, length }
    }

    #[inline]
    pub(crate) const fn collision(range: &GttRange) -> Self {
        Self::EvictionRequired {
            start: range.start().as_u64(),
            length: range.len(),
        }
    }
}
