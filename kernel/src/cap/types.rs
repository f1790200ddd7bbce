//! Capability value types: handles, domain ids, kinds and permission bits.

/// Process-wide, monotonically increasing identifier for a capability.
/// Never reused once issued, even after the capability it named is deleted.
pub type Handle = u32;

/// Identifier for a protection domain (kernel, a Core-1 service, a Core-3
/// process).
pub type DomainId = u32;

/// At most this many live handles in any one domain's handle space.
pub const MAX_HANDLES_PER_DOMAIN: usize = 64;

/// What kind of resource a capability names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Memory,
    IoPort,
    Irq,
    IpcEndpoint,
    Service,
    Device,
    Custom,
}

bitflags::bitflags! {
    /// Operations a capability's holder is permitted to perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXECUTE = 1 << 2;
        const GRANT  = 1 << 3;
        const REVOKE = 1 << 4;
    }
}

/// Lifecycle state of a protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// A single capability record. Liveness is the map entry's presence, not a
/// separate sentinel field -- an absent handle and a deleted handle look
/// identical, which is the point: deletion is monotone.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityRecord {
    pub kind: CapabilityKind,
    pub perms: Permissions,
    pub resource_id: u64,
    pub base: u64,
    pub size: u64,
    pub owner_domain: DomainId,
    pub ref_count: u32,
}
