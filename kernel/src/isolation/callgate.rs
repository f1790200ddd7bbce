//! Call gates: the mechanism by which a caller in one domain invokes an
//! entry point in another, with a stack switch and a capability check that
//! is re-verified on every call, not just at gate creation (the source's
//! create-time-only check would let a revoked caller keep calling forever).

use alloc::collections::BTreeMap;

use crate::cap::{self, DomainId, Handle, Permissions};
use crate::error::IsolationError;

pub type GateId = u32;

/// Default stack-switch IST-equivalent; call gates in this design always run
/// at `dpl=user` so a syscall-like capability check, not a CPU privilege
/// check, is what actually gates the transfer.
pub const GATE_DPL: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct CallGate {
    pub offset: u64,
    pub selector: u16,
    pub ist: u8,
    pub dpl: u8,
    pub present: bool,
    pub target_domain: DomainId,
    pub governing_cap: Handle,
}

pub struct CallGateTable {
    gates: BTreeMap<GateId, CallGate>,
    next_id: GateId,
}

impl CallGateTable {
    pub const fn new() -> Self {
        Self {
            gates: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// `creator_domain` must hold `cap` with `Service:Execute` naming
    /// `target_domain`; the gate retains `cap` and re-checks it on every
    /// `call`, since it may be revoked after the gate exists.
    pub fn create_call_gate(
        &mut self,
        creator_domain: DomainId,
        target_domain: DomainId,
        entry: u64,
        cap: Handle,
    ) -> Result<GateId, IsolationError> {
        cap::check(creator_domain, cap, Permissions::EXECUTE)
            .map_err(|_| IsolationError::MissingCapability)?;
        let record = cap::record(cap).map_err(|_| IsolationError::MissingCapability)?;
        if record.kind != cap::CapabilityKind::Service {
            return Err(IsolationError::MissingCapability);
        }

        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(IsolationError::CallGateTableFull)?;
        self.gates.insert(
            id,
            CallGate {
                offset: entry,
                selector: 0,
                ist: 0,
                dpl: GATE_DPL,
                present: true,
                target_domain,
                governing_cap: cap,
            },
        );
        Ok(id)
    }

    /// Re-check that `caller_domain` still holds the gate's governing
    /// capability. Returns the gate's entry point on success.
    pub fn check_gate(&self, gate_id: GateId, caller_domain: DomainId) -> Result<&CallGate, IsolationError> {
        let gate = self.gates.get(&gate_id).ok_or(IsolationError::UnknownGate)?;
        if !gate.present {
            return Err(IsolationError::UnknownGate);
        }
        cap::check(caller_domain, gate.governing_cap, Permissions::EXECUTE)
            .map_err(|_| IsolationError::GateCapabilityRevoked)?;
        Ok(gate)
    }

    pub fn remove(&mut self, gate_id: GateId) {
        self.gates.remove(&gate_id);
    }
}

impl Default for CallGateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_gate_gating_requires_live_capability_e11() {
        let mut gates = CallGateTable::new();
        let creator = cap::create_domain(0, 0);
        let target = cap::create_domain(0, 0);
        let cap = cap::create(
            cap::CapabilityKind::Service,
            Permissions::EXECUTE,
            0,
            0,
            0,
            creator,
        )
        .unwrap();

        let gate = gates
            .create_call_gate(creator, target, 0xdead_beef, cap)
            .unwrap();
        assert!(gates.check_gate(gate, creator).is_ok());

        cap::delete(cap).unwrap();
        assert_eq!(
            gates.check_gate(gate, creator),
            Err(IsolationError::GateCapabilityRevoked)
        );
    }

    #[test]
    fn create_call_gate_requires_service_execute() {
        let mut gates = CallGateTable::new();
        let creator = cap::create_domain(0, 0);
        let target = cap::create_domain(0, 0);
        let memory_cap = cap::create(
            cap::CapabilityKind::Memory,
            Permissions::EXECUTE,
            0,
            0,
            0,
            creator,
        )
        .unwrap();
        assert!(gates
            .create_call_gate(creator, target, 0, memory_cap)
            .is_err());
    }
}
