use super::{
    eh_clause, string_literal_text, CodeInfo, CompileScratch, DynamicResolver, EhClause, JitContext,
    JitFlags, NativeCode, ResolverLifecycle, SecurityControlFlags, StringLiteralTable,
};
use crate::{
    chunk::ChunkAllocator,
    error::{MemoryError, Result, StateError},
    services::{
        IndirectionCell, ManagedToken, ManagedTokenTable, ObjectHandle, ReportRoots, RootKind,
        RootVisitor, RuntimeServices,
    },
    token::{MetadataToken, ResolvedToken, SigPointer},
    utils::{sync::Arc, CodeAddr, MethodSlot, TableId},
};

/// Opaque profile-guided optimization data attached to a method.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PgoHandle(pub u64);

/// Resolver for a method built through lightweight code generation.
///
/// The bytecode and token table belong to a managed-side resolver object; this
/// type marshals the JIT's queries to it and owns the scratch memory, literal
/// table, code pointer records and indirection cells the compiled method needs.
pub struct LcgMethodResolver {
    method: MethodSlot,
    table: TableId,
    managed: Option<Arc<dyn ManagedTokenTable>>,
    managed_handle: Option<ObjectHandle>,
    security: SecurityControlFlags,
    jit_flags: JitFlags,
    scratch: CompileScratch,
    strings: StringLiteralTable,
    /// Addresses embedded in generated code. A `None` slot has been reserved
    /// but not yet filled in.
    code_pointers: Vec<Option<CodeAddr>>,
    used_ind_cells: Vec<IndirectionCell>,
    native_code: Option<NativeCode>,
    code_blocks: Vec<CodeAddr>,
    pgo_manager: Option<PgoHandle>,
    services: RuntimeServices,
}

impl LcgMethodResolver {
    pub fn new(
        method: MethodSlot,
        table: TableId,
        managed: Arc<dyn ManagedTokenTable>,
        managed_handle: ObjectHandle,
        services: RuntimeServices,
        chunk_size: usize,
    ) -> Self {
        let security = managed.jit_context().flags;
        let mut jit_flags = JitFlags::DYNAMIC_METHOD;
        if managed.wants_debug_code() {
            jit_flags |= JitFlags::DEBUG_CODE | JitFlags::MIN_OPT;
        }
        Self {
            method,
            table,
            managed: Some(managed),
            managed_handle: Some(managed_handle),
            security,
            jit_flags,
            scratch: CompileScratch::new(chunk_size),
            strings: StringLiteralTable::new(),
            code_pointers: Vec::new(),
            used_ind_cells: Vec::new(),
            native_code: None,
            code_blocks: Vec::new(),
            pgo_manager: None,
            services,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn managed_handle(&self) -> Option<ObjectHandle> {
        self.managed_handle
    }

    pub fn is_compile_time_state_freed(&self) -> bool {
        self.scratch.is_freed()
    }

    pub fn string_literals(&self) -> &StringLiteralTable {
        &self.strings
    }

    /// Reserves a slot for an address the generated code will embed.
    pub fn allocate_record_code_pointer(&mut self) -> usize {
        self.code_pointers.push(None);
        self.code_pointers.len() - 1
    }

    pub fn set_record_code_pointer(&mut self, index: usize, addr: CodeAddr) -> bool {
        match self.code_pointers.get_mut(index) {
            Some(slot) => {
                *slot = Some(addr);
                true
            }
            None => false,
        }
    }

    pub fn recorded_code_pointers(&self) -> impl Iterator<Item = CodeAddr> + '_ {
        self.code_pointers.iter().flatten().copied()
    }

    pub fn add_to_used_ind_cell_list(&mut self, cell: IndirectionCell) {
        self.used_ind_cells.push(cell);
    }

    pub fn used_ind_cells(&self) -> &[IndirectionCell] {
        &self.used_ind_cells
    }

    /// Hands every used indirection cell back to the stub cache in one batch.
    pub fn recycle_ind_cells(&mut self) -> usize {
        if self.used_ind_cells.is_empty() {
            return 0;
        }
        let cells = std::mem::take(&mut self.used_ind_cells);
        let count = cells.len();
        self.services.stub_cache.recycle(cells);
        count
    }

    pub fn pgo_manager(&self) -> Option<PgoHandle> {
        self.pgo_manager
    }

    pub fn set_pgo_manager(&mut self, handle: Option<PgoHandle>) {
        self.pgo_manager = handle;
    }

    /// Records an extra code heap block, such as a jump stub, owned by this method.
    pub fn add_code_heap_block(&mut self, addr: CodeAddr) {
        self.code_blocks.push(addr);
    }
}

impl DynamicResolver for LcgMethodResolver {
    fn free_compile_time_state(&mut self) {
        let pages = self.scratch.free();
        if pages > 0 {
            tracing::trace!("method {}: released {} scratch pages", self.method, pages);
        }
    }

    fn get_jit_context(&self) -> Result<JitContext> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        Ok(managed.jit_context())
    }

    fn get_jit_meta_heap(&mut self) -> &mut ChunkAllocator {
        self.scratch.meta_heap()
    }

    fn requires_access_check(&self) -> bool {
        !self
            .security
            .contains(SecurityControlFlags::SKIP_VISIBILITY_CHECKS)
    }

    fn get_jit_flags(&self) -> JitFlags {
        self.jit_flags
    }

    fn get_code_info(&mut self) -> Result<CodeInfo> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        self.scratch.code_info(|| managed.code_info())
    }

    fn get_local_sig(&mut self) -> Result<SigPointer> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        self.scratch.local_sig(|| managed.code_info())
    }

    fn construct_string_literal(&mut self, token: MetadataToken) -> Result<ObjectHandle> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        let text = string_literal_text(managed, token)?;
        self.get_or_intern_string(&text)
    }

    fn is_valid_string_ref(&self, token: MetadataToken) -> bool {
        self.managed
            .as_deref()
            .is_some_and(|m| matches!(m.lookup(token), Some(ManagedToken::String(_))))
    }

    fn get_string_literal(&self, token: MetadataToken) -> Result<String> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        string_literal_text(managed, token)
    }

    fn get_or_intern_string(&mut self, text: &str) -> Result<ObjectHandle> {
        Ok(self
            .strings
            .get_or_intern(text, self.services.objects.as_ref())
            .ok_or(MemoryError::OutOfMemory)?)
    }

    fn resolve_token(&mut self, token: MetadataToken) -> Result<ResolvedToken> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        self.scratch.resolve_token(managed, token)
    }

    fn resolve_signature(&mut self, token: MetadataToken) -> Result<SigPointer> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        self.scratch.resolve_signature(managed, token, false)
    }

    fn resolve_signature_for_var_arg(&mut self, token: MetadataToken) -> Result<SigPointer> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        self.scratch.resolve_signature(managed, token, true)
    }

    fn get_eh_info(&mut self, index: u32) -> Result<EhClause> {
        let managed = self.managed.as_deref().ok_or(StateError::ResolverDetached)?;
        let info = self.scratch.code_info(|| managed.code_info())?;
        eh_clause(managed, &info, index)
    }

    fn get_dynamic_method(&self) -> MethodSlot {
        self.method
    }

    fn sig_bytes(&self, sig: &SigPointer) -> Option<&[u8]> {
        self.scratch.sig_bytes(sig)
    }
}

impl ResolverLifecycle for LcgMethodResolver {
    fn set_native_code(&mut self, code: NativeCode) {
        self.native_code = Some(code);
        self.code_blocks.push(code.addr);
    }

    fn native_code(&self) -> Result<NativeCode> {
        Ok(self.native_code.ok_or(StateError::NativeCodeNotReady)?)
    }

    fn code_heap_blocks(&self) -> &[CodeAddr] {
        &self.code_blocks
    }

    fn release_code_heap_blocks(&mut self) -> Vec<CodeAddr> {
        self.native_code = None;
        std::mem::take(&mut self.code_blocks)
    }

    fn scratch_pages_created(&self) -> u64 {
        self.scratch.pages_created()
    }

    fn destroy_resolver(&mut self) {
        if !self.code_blocks.is_empty() {
            tracing::warn!(
                "method {}: destroyed while still owning {} code heap blocks",
                self.method,
                self.code_blocks.len()
            );
        }
        self.free_compile_time_state();
        let literals = self.strings.release_all(self.services.objects.as_ref());
        let cells = self.recycle_ind_cells();
        self.code_pointers.clear();
        if let Some(handle) = self.managed_handle.take() {
            self.services.objects.release_handle(handle);
        }
        self.managed = None;
        self.pgo_manager = None;
        tracing::debug!(
            "method {}: resolver destroyed ({} literals, {} cells released)",
            self.method,
            literals,
            cells
        );
    }
}

impl ReportRoots for LcgMethodResolver {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        if let Some(handle) = self.managed_handle {
            visitor.visit(RootKind::ManagedResolver, handle);
        }
        self.strings.enumerate_roots(visitor);
    }

    fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize {
        let mut moved = self.strings.object_moved(from, to);
        if self.managed_handle == Some(from) {
            self.managed_handle = Some(to);
            moved += 1;
        }
        moved
    }
}
