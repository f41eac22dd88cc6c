//! Dynamic method descriptors.
use crate::{
    code_heap::CodeHeapManager,
    error::{Result, StateError},
    resolver::{AnyResolver, DynamicResolver, NativeCode, ResolverLifecycle},
    utils::{
        sync::{Mutex, MutexGuard},
        CodeAddr, MethodSlot, ModuleId, TableId,
    },
};
use serde::Serialize;

/// Where a descriptor slot is in its life cycle.
///
/// A slot is on at most one of its table's lists, and which one follows from
/// this tag: `Free` slots are on the free list, `PendingRegionRelease` slots
/// on the delayed-cleanup queue, `InUse` slots on neither.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SlotState {
    InUse,
    /// Teardown started but the code heap lock was busy; waiting for a retry.
    PendingRegionRelease,
    Free,
}

#[derive(Debug)]
pub struct MethodState {
    pub status: SlotState,
    pub name: String,
    pub signature: Vec<u8>,
    pub resolver: Option<AnyResolver>,
}

/// A reusable method descriptor slot owned by a
/// [`DynamicMethodTable`](crate::table::DynamicMethodTable).
#[derive(Debug)]
pub struct DynamicMethodDesc {
    slot: MethodSlot,
    table: TableId,
    module: ModuleId,
    state: Mutex<MethodState>,
}

impl DynamicMethodDesc {
    pub(crate) fn new(
        slot: MethodSlot,
        table: TableId,
        module: ModuleId,
        name: &str,
        signature: &[u8],
    ) -> Self {
        Self {
            slot,
            table,
            module,
            state: Mutex::new(MethodState {
                status: SlotState::InUse,
                name: name.to_string(),
                signature: signature.to_vec(),
                resolver: None,
            }),
        }
    }

    pub fn slot(&self) -> MethodSlot {
        self.slot
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn status(&self) -> SlotState {
        self.state.lock().status
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn signature(&self) -> Vec<u8> {
        self.state.lock().signature.clone()
    }

    pub fn has_resolver(&self) -> bool {
        self.state.lock().resolver.is_some()
    }

    pub fn lock(&self) -> MutexGuard<'_, MethodState> {
        self.state.lock()
    }

    /// Attaches the resolver that will answer the JIT's queries for this method.
    pub fn attach_resolver(&self, resolver: impl Into<AnyResolver>) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != SlotState::InUse {
            return Err(StateError::SlotNotInUse(self.slot).into());
        }
        state.resolver = Some(resolver.into());
        Ok(())
    }

    /// Runs `f` against the attached resolver.
    pub fn with_resolver<T>(&self, f: impl FnOnce(&mut AnyResolver) -> T) -> Result<T> {
        let mut state = self.state.lock();
        if state.status != SlotState::InUse {
            return Err(StateError::SlotNotInUse(self.slot).into());
        }
        let resolver = state.resolver.as_mut().ok_or(StateError::NoResolver)?;
        Ok(f(resolver))
    }

    /// Places compiled code in the code heap and records it with the resolver.
    ///
    /// The descriptor lock is not held while the code heap lock is. If the
    /// method was torn down in between, the block is returned right away.
    pub fn install_code(
        &self,
        heaps: &CodeHeapManager,
        code: &[u8],
        header: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Result<CodeAddr> {
        if !self.has_resolver() {
            return Err(StateError::NoResolver.into());
        }
        let addr = heaps.alloc_code(header, code.len(), alignment, reserve_for_jump_stubs)?;
        if let Err(e) = heaps.write_code(addr, code) {
            heaps.free_code(addr)?;
            return Err(e.into());
        }

        let native = NativeCode {
            addr,
            size: code.len(),
        };
        match self.with_resolver(|resolver| resolver.set_native_code(native)) {
            Ok(()) => {
                tracing::debug!(
                    "method {}: installed {} bytes of code at {}",
                    self.slot,
                    code.len(),
                    addr
                );
                Ok(addr)
            }
            Err(e) => {
                heaps.free_code(addr)?;
                Err(e)
            }
        }
    }

    /// Compiled code entry point, once installed.
    pub fn native_code(&self) -> Result<NativeCode> {
        self.with_resolver(|resolver| resolver.native_code())?
    }

    /// Frees the resolver's scratch heaps once the JIT is done with them.
    pub fn finish_compilation(&self) -> Result<()> {
        self.with_resolver(|resolver| resolver.free_compile_time_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DynamicMethodConfig,
        resolver::IlStubResolver,
        services::{ManagedCodeInfo, RuntimeServices, StaticTokenTable},
    };

    fn desc() -> DynamicMethodDesc {
        DynamicMethodDesc::new(MethodSlot(0), TableId(1), ModuleId(2), "stub", &[0x00])
    }

    fn stub() -> IlStubResolver {
        IlStubResolver::new(
            MethodSlot(0),
            StaticTokenTable::new(ManagedCodeInfo::default()),
            RuntimeServices::in_process(),
            64,
        )
    }

    #[test]
    fn test_resolver_required_for_queries() {
        let desc = desc();
        assert_eq!(
            desc.with_resolver(|r| r.get_jit_flags()),
            Err(StateError::NoResolver.into())
        );
        desc.attach_resolver(stub()).unwrap();
        assert!(desc.with_resolver(|r| r.get_jit_flags()).is_ok());
        assert_eq!(desc.name(), "stub");
        assert_eq!(desc.module(), ModuleId(2));
    }

    #[test]
    fn test_free_slot_rejects_attach() {
        let desc = desc();
        desc.lock().status = SlotState::Free;
        assert_eq!(
            desc.attach_resolver(stub()),
            Err(StateError::SlotNotInUse(MethodSlot(0)).into())
        );
    }

    #[test]
    fn test_install_code_records_native_code() {
        let heaps = CodeHeapManager::in_process(DynamicMethodConfig::default());
        let desc = desc();
        assert_eq!(
            desc.install_code(&heaps, &[0xC3], 0, 16, 0),
            Err(StateError::NoResolver.into())
        );

        desc.attach_resolver(stub()).unwrap();
        let addr = desc.install_code(&heaps, &[0x90, 0xC3], 8, 16, 0).unwrap();
        assert_eq!(desc.native_code().unwrap().addr, addr);

        let mut out = [0u8; 2];
        heaps.read_code(addr, &mut out).unwrap();
        assert_eq!(out, [0x90, 0xC3]);
        assert_eq!(
            desc.with_resolver(|r| r.code_heap_blocks().to_vec()).unwrap(),
            vec![addr]
        );
    }
}
