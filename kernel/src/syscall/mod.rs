//! System-call surface: the table Core-3 processes invoke through, dispatched
//! with the caller's capability set in scope. Mirrors how `service::api`
//! exposes a typed Rust surface to Core-1 -- this is the analogous boundary
//! for Core-3, except the far side of it is a raw integer ABI (register in,
//! register out) rather than a trait object, so `dispatch` is the one place
//! that translates between the two.
//!
//! This core has no generic "copy bytes from the calling process's address
//! space" primitive (see DESIGN.md): page-table contents live in the
//! isolation arena, not behind an identity-mapped physical window the kernel
//! can dereference. `read`/`write`/`open`/`close`/`ioctl` are therefore
//! capability-checked but otherwise unsupported, and IPC payloads move
//! through capability-granted shared mappings (`mmap` with a `Shared`
//! capability), not through syscall argument registers -- `ipc_call`/
//! `ipc_wait` carry only the message header.

use crate::cap::{self, CapabilityKind, DomainId, Handle, Permissions};
use crate::error::SyscallError;
use crate::ipc::{self, EndpointId, Message, MessageHeader, MessageType};
use crate::isolation::{self, addr, MapType};
use crate::mm::{PhysAddr, VirtAddr};
use crate::process;
use crate::sched;

/// Syscall numbers, exactly as fixed by the external ABI.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Ioctl = 5,
    Mmap = 6,
    Munmap = 7,
    IpcCall = 8,
    IpcRegister = 9,
    IpcWait = 10,
    GetPid = 11,
    GetPpid = 12,
    Sleep = 13,
    Yield = 14,
    GetTime = 15,
}

impl Syscall {
    fn from_nr(nr: usize) -> Result<Self, SyscallError> {
        Ok(match nr {
            0 => Self::Exit,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Ioctl,
            6 => Self::Mmap,
            7 => Self::Munmap,
            8 => Self::IpcCall,
            9 => Self::IpcRegister,
            10 => Self::IpcWait,
            11 => Self::GetPid,
            12 => Self::GetPpid,
            13 => Self::Sleep,
            14 => Self::Yield,
            15 => Self::GetTime,
            _ => return Err(SyscallError::InvalidSyscall { nr }),
        })
    }
}

/// `errno`-style encoding for the negative half of the ABI's single result
/// register. Stable across calls so user-space can match on it; values are
/// this core's own, not Linux's.
fn errno(e: SyscallError) -> i64 {
    match e {
        SyscallError::InvalidSyscall { .. } => 1,
        SyscallError::InvalidArgument => 2,
        SyscallError::AccessDenied => 3,
        SyscallError::NotImplemented => 4,
    }
}

/// Entry point for the raw ABI described in the external interfaces: syscall
/// number and up to five integer/pointer arguments, one integer result,
/// negative on error. `domain` is the caller's domain id, already resolved
/// by the architecture-level entry trampoline (never trusted from the
/// arguments themselves -- a process cannot claim to be a different domain).
pub fn dispatch(domain: DomainId, nr: usize, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    match dispatch_checked(domain, nr, a0, a1, a2, a3, a4) {
        Ok(value) => value,
        Err(e) => -errno(e),
    }
}

fn dispatch_checked(
    domain: DomainId,
    nr: usize,
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
) -> Result<i64, SyscallError> {
    match Syscall::from_nr(nr)? {
        Syscall::Exit => sys_exit(domain, a0 as i32),
        Syscall::Read => sys_unsupported_stream_io(domain, a0 as Handle, Permissions::READ),
        Syscall::Write => sys_unsupported_stream_io(domain, a0 as Handle, Permissions::WRITE),
        Syscall::Open => Err(SyscallError::NotImplemented),
        Syscall::Close => Err(SyscallError::NotImplemented),
        Syscall::Ioctl => Err(SyscallError::NotImplemented),
        Syscall::Mmap => sys_mmap(domain, a0 as Handle, a1, a2, a3),
        Syscall::Munmap => sys_munmap(domain, a0, a1),
        Syscall::IpcCall => sys_ipc_call(domain, a0 as EndpointId, a1 as Handle, a2, a3),
        Syscall::IpcRegister => sys_ipc_register(domain),
        Syscall::IpcWait => sys_ipc_wait(domain, a0 as EndpointId),
        Syscall::GetPid => sys_getpid(domain),
        Syscall::GetPpid => sys_getppid(domain),
        Syscall::Sleep => sys_sleep(a0),
        Syscall::Yield => sys_yield(),
        Syscall::GetTime => sys_gettime(),
    }
}

/// `read`/`write` are capability-checked -- the handle must be live, owned by
/// the caller's domain, and carry the requested permission -- but this core
/// models no resource kind that backs a byte stream, so every otherwise-valid
/// call still reports `NotImplemented` (see module docs).
fn sys_unsupported_stream_io(domain: DomainId, handle: Handle, required: Permissions) -> Result<i64, SyscallError> {
    cap::check(domain, handle, required).map_err(|_| SyscallError::AccessDenied)?;
    Err(SyscallError::NotImplemented)
}

fn sys_exit(domain: DomainId, code: i32) -> Result<i64, SyscallError> {
    process::exit(domain, code).map_err(|_| SyscallError::InvalidArgument)?;
    Ok(0)
}

const PROT_READ: u64 = 1 << 0;
const PROT_WRITE: u64 = 1 << 1;
const PROT_EXEC: u64 = 1 << 2;

fn map_type_for_prot(prot: u64) -> MapType {
    if prot & PROT_EXEC != 0 {
        MapType::Code
    } else if prot & PROT_WRITE != 0 {
        MapType::Data
    } else {
        MapType::ReadOnly
    }
}

/// Map the memory named by `handle` into the caller's own address space at
/// `va`. `handle` must already be present in the caller's handle space --
/// this core has no notion of an anonymous, backing-store-less mapping.
fn sys_mmap(domain: DomainId, handle: Handle, va: u64, size: u64, prot: u64) -> Result<i64, SyscallError> {
    if size == 0 || !addr::is_user_address(va) || !addr::is_user_address(va + size - 1) {
        return Err(SyscallError::InvalidArgument);
    }
    let record = cap::record(handle).map_err(|_| SyscallError::AccessDenied)?;
    if record.kind != CapabilityKind::Memory || record.owner_domain != domain || size > record.size {
        return Err(SyscallError::AccessDenied);
    }
    let map_type = map_type_for_prot(prot);
    isolation::map(domain, VirtAddr::new(va), PhysAddr::new(record.base), size, map_type, handle)
        .map_err(|_| SyscallError::AccessDenied)?;
    Ok(va as i64)
}

fn sys_munmap(domain: DomainId, va: u64, size: u64) -> Result<i64, SyscallError> {
    if size == 0 || !addr::is_user_address(va) {
        return Err(SyscallError::InvalidArgument);
    }
    isolation::unmap(domain, VirtAddr::new(va), size).map_err(|_| SyscallError::InvalidArgument)?;
    Ok(0)
}

/// Send a header-only notification to `endpoint`. Real payloads travel
/// through a shared mapping negotiated beforehand with `mmap`, not through
/// this call (see module docs); `msg_type` selects which of the four wire
/// kinds the notification carries.
fn sys_ipc_call(domain: DomainId, endpoint: EndpointId, presented: Handle, msg_type: u64, flags: u64) -> Result<i64, SyscallError> {
    let msg_type = match msg_type {
        0 => MessageType::Request,
        1 => MessageType::Response,
        2 => MessageType::Notification,
        3 => MessageType::Error,
        _ => return Err(SyscallError::InvalidArgument),
    };
    let header = MessageHeader {
        msg_type,
        msg_id: 0,
        src_service: domain,
        dst_service: domain,
        data_size: 0,
        flags: flags as u32,
        timestamp: sched::stats().ticks,
    };
    let msg = Message::new(header, &[]).map_err(|_| SyscallError::InvalidArgument)?;
    ipc::call(endpoint, domain, presented, msg).map_err(|_| SyscallError::AccessDenied)?;
    Ok(0)
}

/// Register a fresh endpoint owned by the caller's domain. The endpoint id
/// and the governing `IpcEndpoint` handle are both 32-bit, so both fit in
/// the single result register: endpoint in the high half, handle in the low.
fn sys_ipc_register(domain: DomainId) -> Result<i64, SyscallError> {
    let (endpoint, handle) = ipc::register(domain).map_err(|_| SyscallError::AccessDenied)?;
    Ok(((endpoint as i64) << 32) | handle as i64)
}

fn sys_ipc_wait(domain: DomainId, endpoint: EndpointId) -> Result<i64, SyscallError> {
    match ipc::wait(endpoint, domain).map_err(|_| SyscallError::AccessDenied)? {
        Some(_msg) => Ok(1),
        None => Ok(0),
    }
}

fn sys_getpid(domain: DomainId) -> Result<i64, SyscallError> {
    process::pid_of_domain(domain)
        .map(|pid| pid as i64)
        .ok_or(SyscallError::InvalidArgument)
}

fn sys_getppid(domain: DomainId) -> Result<i64, SyscallError> {
    let pid = process::pid_of_domain(domain).ok_or(SyscallError::InvalidArgument)?;
    Ok(process::parent_pid(pid).map(|p| p as i64).unwrap_or(0))
}

/// The design's ~1ms tick makes "milliseconds" and "ticks" the same unit;
/// `sleep` blocks the calling thread and voluntarily re-enters the scheduler.
fn sys_sleep(ms: u64) -> Result<i64, SyscallError> {
    sched::sleep(ms);
    Ok(0)
}

fn sys_yield() -> Result<i64, SyscallError> {
    sched::yield_now();
    Ok(0)
}

fn sys_gettime() -> Result<i64, SyscallError> {
    Ok(sched::stats().ticks as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::DomainFlags;
    use crate::mm::FRAME_SIZE;
    use crate::mm::pmm::{self, FrameType};

    fn user_domain() -> DomainId {
        let domain = cap::create_domain(0, 0);
        isolation::create_page_tables(domain, DomainFlags::App).unwrap();
        domain
    }

    #[test]
    fn unknown_syscall_number_is_rejected() {
        let domain = user_domain();
        assert_eq!(dispatch(domain, 999, 0, 0, 0, 0, 0), -1);
    }

    #[test]
    fn yield_and_gettime_succeed() {
        let domain = user_domain();
        assert_eq!(dispatch(domain, Syscall::Yield as usize, 0, 0, 0, 0, 0), 0);
        assert!(dispatch(domain, Syscall::GetTime as usize, 0, 0, 0, 0, 0) >= 0);
    }

    #[test]
    fn read_checks_capability_then_reports_not_implemented() {
        let domain = user_domain();
        let handle = cap::create(CapabilityKind::IoPort, Permissions::READ, 0, 0, 0, domain).unwrap();
        assert_eq!(dispatch(domain, Syscall::Read as usize, handle as u64, 0, 0, 0, 0), -4);

        let other = user_domain();
        assert_eq!(dispatch(other, Syscall::Read as usize, handle as u64, 0, 0, 0, 0), -3);
    }

    #[test]
    fn mmap_then_munmap_round_trip() {
        let domain = user_domain();
        let pa = pmm::alloc(FRAME_SIZE, FRAME_SIZE, FrameType::Application, domain);
        let handle = cap::create(CapabilityKind::Memory, Permissions::READ | Permissions::WRITE, 0, pa.as_u64(), FRAME_SIZE, domain).unwrap();

        let va = addr::USER_BASE;
        let mapped = dispatch(domain, Syscall::Mmap as usize, handle as u64, va, FRAME_SIZE, PROT_READ | PROT_WRITE, 0);
        assert_eq!(mapped, va as i64);

        isolation::verify_access(domain, VirtAddr::new(va), FRAME_SIZE, Permissions::WRITE).unwrap();

        assert_eq!(dispatch(domain, Syscall::Munmap as usize, va, FRAME_SIZE, 0, 0, 0), 0);
        assert!(isolation::verify_access(domain, VirtAddr::new(va), FRAME_SIZE, Permissions::READ).is_err());
    }

    #[test]
    fn mmap_rejects_capability_from_another_domain() {
        let domain = user_domain();
        let owner = user_domain();
        let pa = pmm::alloc(FRAME_SIZE, FRAME_SIZE, FrameType::Application, owner);
        let handle = cap::create(CapabilityKind::Memory, Permissions::READ, 0, pa.as_u64(), FRAME_SIZE, owner).unwrap();

        let result = dispatch(domain, Syscall::Mmap as usize, handle as u64, addr::USER_BASE, FRAME_SIZE, PROT_READ, 0);
        assert_eq!(result, -3);
    }

    #[test]
    fn ipc_register_then_call_then_wait() {
        let domain = user_domain();
        let packed = dispatch(domain, Syscall::IpcRegister as usize, 0, 0, 0, 0, 0);
        assert!(packed >= 0);
        let endpoint = (packed >> 32) as u32;
        let handle = packed as u32;

        assert_eq!(
            dispatch(domain, Syscall::IpcCall as usize, endpoint as u64, handle as u64, 2, 0, 0),
            0
        );
        assert_eq!(dispatch(domain, Syscall::IpcWait as usize, endpoint as u64, 0, 0, 0, 0), 1);
        assert_eq!(dispatch(domain, Syscall::IpcWait as usize, endpoint as u64, 0, 0, 0, 0), 0);
    }

    #[test]
    fn getpid_and_getppid_resolve_through_process_manager() {
        let image = process::ProcessImage {
            path: "/bin/init",
            entry_point: 0x40_0000,
            code_size: 4096,
            data_size: 4096,
            stack_size: 0,
            heap_size: 0,
        };
        let parent_pid = process::create(&image, None, 0).unwrap();
        let parent_domain = process::domain_of_pid(parent_pid).unwrap();
        let child_pid = process::create(&image, Some(parent_pid), 0).unwrap();
        let child_domain = process::domain_of_pid(child_pid).unwrap();

        assert_eq!(
            dispatch(parent_domain, Syscall::GetPid as usize, 0, 0, 0, 0, 0),
            parent_pid as i64
        );
        assert_eq!(dispatch(parent_domain, Syscall::GetPpid as usize, 0, 0, 0, 0, 0), 0);
        assert_eq!(
            dispatch(child_domain, Syscall::GetPpid as usize, 0, 0, 0, 0, 0),
            parent_pid as i64
        );
    }
}
