use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for leaf granularities the GPU translation hardware supports.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE).
    const SHIFT: u32;
    /// Number of 4 KiB PTE slots one page of this size covers.
    const PTES: usize = 1 << (Self::SHIFT - 12);

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page (4096 bytes).
    Size4K, 12, "4K"
);
page_size!(
    /// 64 KiB page (`65_536` bytes), 16 consecutive 4 KiB PTEs.
    Size64K, 16, "64K"
);
page_size!(
    /// 2 MiB page (`2_097_152` bytes), a PDE-level leaf.
    Size2M, 21, "2M"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_counts() {
        assert_eq!(Size4K::PTES, 1);
        assert_eq!(Size64K::PTES, 16);
        assert_eq!(Size2M::PTES, 512);
        assert_eq!(Size2M::SIZE, 2 * 1024 * 1024);
    }

    #[test]
    fn labels() {
        assert_eq!(format!("{Size64K}"), "64K");
        assert_eq!(format!("{Size2M:?}"), "2M");
    }
}
