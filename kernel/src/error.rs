//! Kernel-wide error types.
//!
//! One enum per subsystem, folded into `KernelError` at the boundary where
//! subsystems call into each other, so a syscall handler can `?` through
//! several layers without losing which layer failed.

use core::fmt;

/// Capability-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    UnknownDomain,
    NoHandle,
    InsufficientPermissions,
    HandleSpaceFull,
    TableFull,
    NotGrantable,
    InvalidKind,
}

/// Isolation (page table / call gate) errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationError {
    MissingCapability,
    TableFramesExhausted,
    Unaligned,
    InvalidAddress,
    NotMapped,
    CallGateTableFull,
    UnknownGate,
    GateCapabilityRevoked,
    UnknownDomain,
}

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    ThreadTableFull,
    UnknownThread,
    StackAllocationFailed,
    InvalidPriority,
}

/// Service manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    TableFull,
    UnknownService,
    WrongState,
    RestartLimitReached,
}

/// Process manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    UnknownProcess,
    LoadFailed,
}

/// System-call dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: usize },
    InvalidArgument,
    AccessDenied,
    NotImplemented,
}

/// Top-level kernel error, composed from the subsystem errors above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    OutOfMemory { requested: usize, available: usize },
    Cap(CapError),
    Isolation(IsolationError),
    Sched(SchedError),
    Service(ServiceError),
    Process(ProcessError),
    Syscall(SyscallError),
    InvalidArgument { name: &'static str },
    NotImplemented { feature: &'static str },
}

pub type KernelResult<T> = Result<T, KernelError>;

impl From<CapError> for KernelError {
    fn from(e: CapError) -> Self {
        Self::Cap(e)
    }
}

impl From<IsolationError> for KernelError {
    fn from(e: IsolationError) -> Self {
        Self::Isolation(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        Self::Sched(e)
    }
}

impl From<ServiceError> for KernelError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<ProcessError> for KernelError {
    fn from(e: ProcessError) -> Self {
        Self::Process(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        Self::Syscall(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {requested} bytes, {available} available"
            ),
            Self::Cap(e) => write!(f, "capability error: {e:?}"),
            Self::Isolation(e) => write!(f, "isolation error: {e:?}"),
            Self::Sched(e) => write!(f, "scheduler error: {e:?}"),
            Self::Service(e) => write!(f, "service error: {e:?}"),
            Self::Process(e) => write!(f, "process error: {e:?}"),
            Self::Syscall(e) => write!(f, "syscall error: {e:?}"),
            Self::InvalidArgument { name } => write!(f, "invalid argument: {name}"),
            Self::NotImplemented { feature } => write!(f, "not implemented: {feature}"),
        }
    }
}
