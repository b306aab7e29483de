use crate::addr::VirtAddr;

/// Recoverable failures of the virtual-memory core.
///
/// Invariant violations (remapping a mapped address, unmapping an absent
/// one, walking past [`VirtAddr::MAX`] on a write path) are kernel bugs
/// and panic instead of being reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The frame allocator is exhausted.
    #[error("no free frame")]
    NoFreeFrame,
    /// No valid leaf mapping exists for the address.
    #[error("address {0:#x} is not mapped")]
    AddressNotMapped(VirtAddr),
    /// A mapping exists but lacks the required permission bits.
    #[error("address {0:#x} is not accessible")]
    InaccessibleMemory(VirtAddr),
    /// No NUL terminator was found within the destination buffer.
    #[error("string is not NUL-terminated")]
    UnterminatedString,
}
