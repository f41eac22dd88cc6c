use super::{
    eh_clause, string_literal_text, CodeInfo, CompileScratch, DynamicResolver, EhClause, JitContext,
    JitFlags, NativeCode, ResolverLifecycle, SecurityControlFlags, StringLiteralTable,
};
use crate::{
    chunk::ChunkAllocator,
    error::{MemoryError, Result, StateError},
    services::{
        ManagedToken, ManagedTokenTable, ObjectHandle, ReportRoots, RootVisitor, RuntimeServices,
        StaticTokenTable,
    },
    token::{MetadataToken, ResolvedToken, SigPointer},
    utils::{CodeAddr, MethodSlot},
};

/// Resolver for a runtime-generated stub.
///
/// Stubs are built by the runtime itself, so the bytecode and token table are
/// held in process and visibility checks are always skipped.
pub struct IlStubResolver {
    method: MethodSlot,
    tokens: StaticTokenTable,
    scratch: CompileScratch,
    strings: StringLiteralTable,
    native_code: Option<NativeCode>,
    code_blocks: Vec<CodeAddr>,
    services: RuntimeServices,
}

impl IlStubResolver {
    pub fn new(
        method: MethodSlot,
        tokens: StaticTokenTable,
        services: RuntimeServices,
        chunk_size: usize,
    ) -> Self {
        Self {
            method,
            tokens,
            scratch: CompileScratch::new(chunk_size),
            strings: StringLiteralTable::new(),
            native_code: None,
            code_blocks: Vec::new(),
            services,
        }
    }

    /// The stub's token table, for adding tokens while the stub is generated.
    pub fn tokens_mut(&mut self) -> &mut StaticTokenTable {
        &mut self.tokens
    }
}

impl DynamicResolver for IlStubResolver {
    fn free_compile_time_state(&mut self) {
        self.scratch.free();
    }

    fn get_jit_context(&self) -> Result<JitContext> {
        let mut context = self.tokens.jit_context();
        context.flags |= SecurityControlFlags::SKIP_VISIBILITY_CHECKS;
        Ok(context)
    }

    fn get_jit_meta_heap(&mut self) -> &mut ChunkAllocator {
        self.scratch.meta_heap()
    }

    fn requires_access_check(&self) -> bool {
        false
    }

    fn get_jit_flags(&self) -> JitFlags {
        JitFlags::DYNAMIC_METHOD | JitFlags::IL_STUB
    }

    fn get_code_info(&mut self) -> Result<CodeInfo> {
        let tokens = &self.tokens;
        self.scratch.code_info(|| tokens.code_info())
    }

    fn get_local_sig(&mut self) -> Result<SigPointer> {
        let tokens = &self.tokens;
        self.scratch.local_sig(|| tokens.code_info())
    }

    fn construct_string_literal(&mut self, token: MetadataToken) -> Result<ObjectHandle> {
        let text = string_literal_text(&self.tokens, token)?;
        self.get_or_intern_string(&text)
    }

    fn is_valid_string_ref(&self, token: MetadataToken) -> bool {
        matches!(self.tokens.lookup(token), Some(ManagedToken::String(_)))
    }

    fn get_string_literal(&self, token: MetadataToken) -> Result<String> {
        string_literal_text(&self.tokens, token)
    }

    fn get_or_intern_string(&mut self, text: &str) -> Result<ObjectHandle> {
        Ok(self
            .strings
            .get_or_intern(text, self.services.objects.as_ref())
            .ok_or(MemoryError::OutOfMemory)?)
    }

    fn resolve_token(&mut self, token: MetadataToken) -> Result<ResolvedToken> {
        self.scratch.resolve_token(&self.tokens, token)
    }

    fn resolve_signature(&mut self, token: MetadataToken) -> Result<SigPointer> {
        self.scratch.resolve_signature(&self.tokens, token, false)
    }

    fn resolve_signature_for_var_arg(&mut self, token: MetadataToken) -> Result<SigPointer> {
        self.scratch.resolve_signature(&self.tokens, token, true)
    }

    fn get_eh_info(&mut self, index: u32) -> Result<EhClause> {
        let tokens = &self.tokens;
        let info = self.scratch.code_info(|| tokens.code_info())?;
        eh_clause(tokens, &info, index)
    }

    fn get_dynamic_method(&self) -> MethodSlot {
        self.method
    }

    fn sig_bytes(&self, sig: &SigPointer) -> Option<&[u8]> {
        self.scratch.sig_bytes(sig)
    }
}

impl ResolverLifecycle for IlStubResolver {
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
        self.free_compile_time_state();
        self.strings.release_all(self.services.objects.as_ref());
        tracing::debug!("stub {}: resolver destroyed", self.method);
    }
}

impl ReportRoots for IlStubResolver {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        self.strings.enumerate_roots(visitor);
    }

    fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize {
        self.strings.object_moved(from, to)
    }
}
