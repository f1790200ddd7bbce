//! Interrupt router: a 256-entry vector table that dispatches to in-kernel,
//! service, or application handlers, capability-gating the latter two.
//!
//! The dispatcher is non-reentrant: this core is single-processor, so the
//! only possible reentrance is a nested hardware interrupt arriving while
//! `dispatch` is already running for an earlier one. Rather than unwind into
//! undefined recursive state, a nested arrival is logged and dropped; real
//! hardware re-raises level-triggered lines and the PIC/APIC itself holds
//! edge-triggered ones pending, so nothing is silently lost at the wire.

use spin::Mutex;

use crate::cap::{self, CapabilityKind, Handle, Permissions};

pub const VECTOR_COUNT: usize = 256;
const EXCEPTION_VECTORS: usize = 32;
const LEGACY_IRQ_END: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    InKernel,
    Service,
    Application,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptRoute {
    pub handler_kind: HandlerKind,
    pub required_capability: Option<Handle>,
    pub enabled: bool,
    pub masked: bool,
    pub edge_triggered: bool,
}

impl InterruptRoute {
    const fn masked_default() -> Self {
        Self {
            handler_kind: HandlerKind::InKernel,
            required_capability: None,
            enabled: false,
            masked: true,
            edge_triggered: true,
        }
    }

    const fn in_kernel_enabled() -> Self {
        Self {
            handler_kind: HandlerKind::InKernel,
            required_capability: None,
            enabled: true,
            masked: false,
            edge_triggered: true,
        }
    }
}

/// Kernel-side trampoline invoked on dispatch: vector, architectural error
/// code (0 where the exception carries none), faulting instruction pointer.
pub type Handler = fn(u8, u64, u64);

pub struct InterruptRouter {
    routes: [InterruptRoute; VECTOR_COUNT],
    handlers: [Option<Handler>; VECTOR_COUNT],
    in_dispatch: bool,
}

impl InterruptRouter {
    pub const fn new() -> Self {
        let mut routes = [InterruptRoute::masked_default(); VECTOR_COUNT];
        let mut i = 0;
        while i < LEGACY_IRQ_END {
            routes[i] = InterruptRoute::in_kernel_enabled();
            i += 1;
        }
        Self {
            routes,
            handlers: [None; VECTOR_COUNT],
            in_dispatch: false,
        }
    }

    pub fn route(
        &mut self,
        vector: usize,
        handler: Option<Handler>,
        kind: HandlerKind,
        cap: Option<Handle>,
    ) -> Result<(), crate::error::SyscallError> {
        if vector >= VECTOR_COUNT {
            return Err(crate::error::SyscallError::InvalidArgument);
        }
        self.routes[vector].handler_kind = kind;
        self.routes[vector].required_capability = cap;
        self.handlers[vector] = handler;
        Ok(())
    }

    pub fn set_enabled(&mut self, vector: usize, enabled: bool) {
        if vector < VECTOR_COUNT {
            self.routes[vector].enabled = enabled;
        }
    }

    pub fn set_masked(&mut self, vector: usize, masked: bool) {
        if vector < VECTOR_COUNT {
            self.routes[vector].masked = masked;
        }
    }

    pub fn route_of(&self, vector: usize) -> Option<InterruptRoute> {
        self.routes.get(vector).copied()
    }

    /// Dispatch one interrupt. `vector < EXCEPTION_VECTORS` are CPU
    /// exceptions, `EXCEPTION_VECTORS..LEGACY_IRQ_END` are legacy IRQs, both
    /// seeded `InKernel` at `init`; everything above is build-time masked
    /// until a manager calls `route`.
    pub fn dispatch(&mut self, vector: usize, error_code: u64, ip: u64) {
        if vector >= VECTOR_COUNT {
            return;
        }
        let route = self.routes[vector];
        if !route.enabled || route.masked {
            return;
        }
        if self.in_dispatch {
            log::warn!("irq: nested interrupt on vector {vector} deferred");
            return;
        }
        self.in_dispatch = true;

        let allowed = match route.handler_kind {
            HandlerKind::InKernel => true,
            HandlerKind::Service | HandlerKind::Application => route
                .required_capability
                .and_then(|h| cap::record(h).ok())
                .is_some_and(|rec| {
                    rec.kind == CapabilityKind::Irq && rec.perms.contains(Permissions::READ)
                }),
        };

        if allowed {
            if let Some(handler) = self.handlers[vector] {
                handler(vector as u8, error_code, ip);
            }
        } else {
            log::warn!("irq: vector {vector} dropped, capability check failed");
        }

        self.in_dispatch = false;
    }
}

impl Default for InterruptRouter {
    fn default() -> Self {
        Self::new()
    }
}

static ROUTER: Mutex<InterruptRouter> = Mutex::new(InterruptRouter::new());

/// Seed the vector table. Called once from `kernel_init`, after the
/// capability system exists (routes to `Service`/`Application` handlers are
/// capability-gated from the moment they're registered).
pub fn init() {
    log::info!("irq: vector table seeded, exceptions and legacy IRQs enabled");
}

pub fn route(
    vector: usize,
    handler: Option<Handler>,
    kind: HandlerKind,
    cap: Option<Handle>,
) -> Result<(), crate::error::SyscallError> {
    ROUTER.lock().route(vector, handler, kind, cap)
}

pub fn enable(vector: usize) {
    ROUTER.lock().set_enabled(vector, true);
}

pub fn disable(vector: usize) {
    ROUTER.lock().set_enabled(vector, false);
}

pub fn route_of(vector: usize) -> Option<InterruptRoute> {
    ROUTER.lock().route_of(vector)
}

/// Entry point called by every architectural trap handler in
/// `arch::x86_64::idt`.
pub fn dispatch(vector: usize, error_code: u64, ip: u64) {
    ROUTER.lock().dispatch(vector, error_code, ip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn bump(_vector: u8, _error_code: u64, _ip: u64) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn seeds_exceptions_and_legacy_irqs_enabled() {
        let router = InterruptRouter::new();
        assert!(router.route_of(0).unwrap().enabled);
        assert!(router.route_of(47).unwrap().enabled);
        assert!(router.route_of(48).unwrap().masked);
    }

    #[test]
    fn in_kernel_dispatch_calls_handler() {
        let mut router = InterruptRouter::new();
        router
            .route(0, Some(bump), HandlerKind::InKernel, None)
            .unwrap();
        let before = HITS.load(Ordering::SeqCst);
        router.dispatch(0, 0, 0);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn masked_vector_is_rejected() {
        let mut router = InterruptRouter::new();
        router
            .route(100, Some(bump), HandlerKind::InKernel, None)
            .unwrap();
        let before = HITS.load(Ordering::SeqCst);
        router.dispatch(100, 0, 0); // still masked
        assert_eq!(HITS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn service_route_requires_capability_check() {
        let mut router = InterruptRouter::new();
        let domain = cap::create_domain(0, 0);
        let irq_cap = cap::create(CapabilityKind::Irq, Permissions::READ, 0, 0, 0, domain).unwrap();
        router
            .route(60, Some(bump), HandlerKind::Service, Some(irq_cap))
            .unwrap();
        router.set_enabled(60, true);
        router.set_masked(60, false);

        let before = HITS.load(Ordering::SeqCst);
        router.dispatch(60, 0, 0);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 1);

        cap::delete(irq_cap).unwrap();
        router.dispatch(60, 0, 0);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 1, "dropped once capability is gone");
    }
}
