//! Per-method resolvers that answer the JIT's questions about a dynamic method.
//!
//! A dynamic method has no metadata scope, so everything the JIT would normally
//! read from metadata (bytecode, locals signature, exception clauses, tokens)
//! comes from the method's resolver instead. [`DynamicResolver`] is the query
//! surface; [`ResolverLifecycle`] is the teardown surface used by the owning
//! [`DynamicMethodTable`](crate::table::DynamicMethodTable).
//!
//! Two resolvers exist:
//!
//! - [`LcgMethodResolver`]: lightweight code generation. The token table and
//!   bytecode live on the managed side and are reached through a
//!   [`ManagedTokenTable`].
//! - [`IlStubResolver`]: runtime-generated marshalling stubs, whose tables are
//!   built in process.
//!
//! Both are dispatched statically through [`AnyResolver`].
use crate::{
    chunk::{ChunkAllocator, ChunkSpan},
    code_heap::CodeHeapManager,
    error::{MemoryError, ResolutionError, Result, StateError},
    services::{ManagedCodeInfo, ManagedToken, ManagedTokenTable, ObjectHandle, ReportRoots, RootVisitor},
    token::{MetadataToken, ResolvedToken, SigPointer, TypeHandle},
    utils::{CodeAddr, MethodSlot},
};
use enum_dispatch::enum_dispatch;
use serde::Serialize;

mod il_stub;
mod lcg;
mod strings;

pub use il_stub::IlStubResolver;
pub use lcg::{LcgMethodResolver, PgoHandle};
pub use strings::{StringLiteral, StringLiteralTable};

flag_set! {
    /// Visibility and security options the creator attached to a dynamic method.
    pub struct SecurityControlFlags(u32) {
        const DEFAULT = 0x0;
        const SKIP_VISIBILITY_CHECKS = 0x1;
        const RESTRICTED_SKIP_VISIBILITY_CHECKS = 0x2;
        const HAS_CREATION_CONTEXT = 0x4;
        const CAN_SKIP_CS_EVALUATION = 0x8;
    }
}

flag_set! {
    /// Flags the method is compiled with.
    pub struct JitFlags(u32) {
        const DYNAMIC_METHOD = 0x1;
        const IL_STUB = 0x2;
        const DEBUG_CODE = 0x4;
        const MIN_OPT = 0x8;
    }
}

flag_set! {
    pub struct CorInfoOptions(u32) {
        const NONE = 0x0;
        /// Zero-initialize locals on entry.
        const INIT_LOCALS = 0x10;
    }
}

flag_set! {
    pub struct EhClauseFlags(u32) {
        const NONE = 0x0;
        const FILTER = 0x1;
        const FINALLY = 0x2;
        const FAULT = 0x4;
    }
}

/// One exception handling clause, with offsets into the method's bytecode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EhClause {
    pub flags: EhClauseFlags,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Class token for typed handlers, filter offset for filters.
    pub class_token_or_filter_offset: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct JitContext {
    pub flags: SecurityControlFlags,
    /// The type the method is logically attached to, if any.
    pub type_owner: Option<TypeHandle>,
}

/// The method body as the JIT sees it. `code` lives in the resolver's meta heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeInfo {
    pub code: ChunkSpan,
    pub code_size: usize,
    pub stack_size: u16,
    pub options: CorInfoOptions,
    pub eh_size: u32,
}

/// Compiled code resident in the executable code heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NativeCode {
    pub addr: CodeAddr,
    pub size: usize,
}

/// What the JIT may ask of a method that has no metadata scope.
///
/// Every call is made by the single thread compiling the method.
#[enum_dispatch]
pub trait DynamicResolver {
    /// Releases both scratch heaps. Idempotent; compiled code is unaffected.
    fn free_compile_time_state(&mut self);

    fn get_jit_context(&self) -> Result<JitContext>;

    /// Scratch heap for data that must live as long as the compilation.
    fn get_jit_meta_heap(&mut self) -> &mut ChunkAllocator;

    /// Cheap pre-filter: only call [`get_jit_context`](Self::get_jit_context)
    /// when this returns true.
    fn requires_access_check(&self) -> bool;

    fn get_jit_flags(&self) -> JitFlags;

    /// The bytecode and its shape. Fetched once and cached in the meta heap.
    fn get_code_info(&mut self) -> Result<CodeInfo>;

    fn get_local_sig(&mut self) -> Result<SigPointer>;

    /// Returns a handle to the string object for a literal, creating it in the
    /// method's private table on first use.
    fn construct_string_literal(&mut self, token: MetadataToken) -> Result<ObjectHandle>;

    fn is_valid_string_ref(&self, token: MetadataToken) -> bool;

    fn get_string_literal(&self, token: MetadataToken) -> Result<String>;

    /// Looks `text` up in the private literal table, adding it if absent.
    fn get_or_intern_string(&mut self, text: &str) -> Result<ObjectHandle>;

    fn resolve_token(&mut self, token: MetadataToken) -> Result<ResolvedToken>;

    fn resolve_signature(&mut self, token: MetadataToken) -> Result<SigPointer>;

    fn resolve_signature_for_var_arg(&mut self, token: MetadataToken) -> Result<SigPointer>;

    fn get_eh_info(&mut self, index: u32) -> Result<EhClause>;

    fn get_dynamic_method(&self) -> MethodSlot;

    /// Reads the unread part of a signature returned by this resolver.
    fn sig_bytes(&self, sig: &SigPointer) -> Option<&[u8]>;
}

/// Teardown-side operations, driven by the owning table.
#[enum_dispatch]
pub trait ResolverLifecycle {
    fn set_native_code(&mut self, code: NativeCode);

    fn native_code(&self) -> Result<NativeCode>;

    /// Code heap blocks this method still owns.
    fn code_heap_blocks(&self) -> &[CodeAddr];

    /// Forgets the owned blocks once they have been returned to the code heap.
    fn release_code_heap_blocks(&mut self) -> Vec<CodeAddr>;

    /// Pages ever carved by the two scratch heaps.
    fn scratch_pages_created(&self) -> u64;

    /// Releases everything except code heap memory: scratch heaps, literal
    /// handles, indirection cells, code pointer records.
    fn destroy_resolver(&mut self);
}

#[enum_dispatch(DynamicResolver, ResolverLifecycle)]
pub enum AnyResolver {
    LcgMethodResolver,
    IlStubResolver,
}

impl AnyResolver {
    pub fn is_il_stub(&self) -> bool {
        matches!(self, AnyResolver::IlStubResolver(_))
    }

    pub fn as_lcg_mut(&mut self) -> Option<&mut LcgMethodResolver> {
        match self {
            AnyResolver::LcgMethodResolver(r) => Some(r),
            AnyResolver::IlStubResolver(_) => None,
        }
    }

    /// First teardown stage: returns this method's code heap blocks if the
    /// code heap lock can be taken without waiting.
    ///
    /// Returns `false` when the lock is busy; nothing changes and the caller
    /// must retry later.
    pub fn try_destroy_code_heap_memory(&mut self, heaps: &CodeHeapManager) -> bool {
        if self.code_heap_blocks().is_empty() {
            return true;
        }
        let Some(freed) = heaps.try_free_code_blocks(self.code_heap_blocks()) else {
            return false;
        };
        tracing::debug!(
            "method {}: returned {} code bytes",
            self.get_dynamic_method(),
            freed.bytes
        );
        if !freed.stale.is_empty() {
            tracing::warn!(
                "method {}: skipped {} blocks that were already free: {:?}",
                self.get_dynamic_method(),
                freed.stale.len(),
                freed.stale
            );
        }
        self.release_code_heap_blocks();
        true
    }
}

impl std::fmt::Debug for AnyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            AnyResolver::LcgMethodResolver(_) => "LcgMethodResolver",
            AnyResolver::IlStubResolver(_) => "IlStubResolver",
        };
        f.debug_struct(kind)
            .field("method", &self.get_dynamic_method())
            .field("flags", &self.get_jit_flags())
            .finish_non_exhaustive()
    }
}

impl ReportRoots for AnyResolver {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        match self {
            AnyResolver::LcgMethodResolver(r) => r.enumerate_roots(visitor),
            AnyResolver::IlStubResolver(r) => r.enumerate_roots(visitor),
        }
    }

    fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize {
        match self {
            AnyResolver::LcgMethodResolver(r) => r.object_moved(from, to),
            AnyResolver::IlStubResolver(r) => r.object_moved(from, to),
        }
    }
}

/// The two scratch heaps plus what the JIT has already been handed from them.
#[derive(Debug)]
pub(crate) struct CompileScratch {
    meta_heap: ChunkAllocator,
    temp_data: ChunkAllocator,
    code_info: Option<CodeInfo>,
    local_sig: Option<SigPointer>,
    freed: bool,
}

impl CompileScratch {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            meta_heap: ChunkAllocator::with_chunk_size(chunk_size),
            temp_data: ChunkAllocator::with_chunk_size(chunk_size),
            code_info: None,
            local_sig: None,
            freed: false,
        }
    }

    pub(crate) fn meta_heap(&mut self) -> &mut ChunkAllocator {
        &mut self.meta_heap
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed
    }

    /// Returns pages released by this call.
    pub(crate) fn free(&mut self) -> u64 {
        let before = self.meta_heap.pages_released() + self.temp_data.pages_released();
        self.meta_heap.delete();
        self.temp_data.delete();
        self.code_info = None;
        self.local_sig = None;
        self.freed = true;
        self.meta_heap.pages_released() + self.temp_data.pages_released() - before
    }

    pub(crate) fn pages_created(&self) -> u64 {
        self.meta_heap.pages_created() + self.temp_data.pages_created()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.freed {
            return Err(StateError::CodeInfoUnavailable.into());
        }
        Ok(())
    }

    pub(crate) fn code_info(&mut self, fetch: impl FnOnce() -> ManagedCodeInfo) -> Result<CodeInfo> {
        self.ensure_live()?;
        if let Some(info) = self.code_info {
            return Ok(info);
        }
        let managed = fetch();
        let code = self
            .meta_heap
            .alloc_copy(&managed.code)
            .ok_or(MemoryError::OutOfMemory)?;
        let local_sig = self
            .meta_heap
            .alloc_copy(&managed.local_sig)
            .ok_or(MemoryError::OutOfMemory)?;

        let mut options = CorInfoOptions::NONE;
        if managed.init_locals {
            options |= CorInfoOptions::INIT_LOCALS;
        }
        let info = CodeInfo {
            code,
            code_size: managed.code.len(),
            stack_size: managed.max_stack,
            options,
            eh_size: managed.eh_count,
        };
        self.code_info = Some(info);
        self.local_sig = Some(SigPointer::new(local_sig));
        Ok(info)
    }

    pub(crate) fn local_sig(&mut self, fetch: impl FnOnce() -> ManagedCodeInfo) -> Result<SigPointer> {
        self.code_info(fetch)?;
        Ok(self.local_sig.unwrap_or_default())
    }

    /// Copies a signature blob into the temporary data heap.
    fn copy_sig(&mut self, bytes: &[u8]) -> Result<SigPointer> {
        self.ensure_live()?;
        let span = self
            .temp_data
            .alloc_copy(bytes)
            .ok_or(MemoryError::OutOfMemory)?;
        Ok(SigPointer::new(span))
    }

    pub(crate) fn sig_bytes(&self, sig: &SigPointer) -> Option<&[u8]> {
        let span = sig.span()?;
        self.temp_data
            .bytes(span)
            .or_else(|| self.meta_heap.bytes(span))
    }

    #[cfg(test)]
    pub(crate) fn code_bytes(&self, info: &CodeInfo) -> Option<&[u8]> {
        self.meta_heap.bytes(info.code)
    }

    pub(crate) fn resolve_token(
        &mut self,
        table: &dyn ManagedTokenTable,
        token: MetadataToken,
    ) -> Result<ResolvedToken> {
        self.ensure_live()?;
        let entry = table
            .lookup(token)
            .ok_or(ResolutionError::TokenNotFound(token))?;
        let resolved = match entry {
            ManagedToken::Type { handle, type_spec } => ResolvedToken {
                type_handle: Some(handle),
                type_signature: self.copy_optional_sig(type_spec.as_deref())?,
                ..Default::default()
            },
            ManagedToken::Method {
                owner,
                method,
                method_spec,
            } => ResolvedToken {
                type_handle: Some(owner),
                method: Some(method),
                method_signature: self.copy_optional_sig(method_spec.as_deref())?,
                ..Default::default()
            },
            ManagedToken::Field { owner, field } => ResolvedToken {
                type_handle: Some(owner),
                field: Some(field),
                ..Default::default()
            },
            other => {
                tracing::debug!("token {} is a {}, not a member", token, other.kind_name());
                return Err(ResolutionError::UnexpectedTokenKind {
                    token,
                    expected: "type, method or field",
                }
                .into());
            }
        };
        Ok(resolved)
    }

    pub(crate) fn resolve_signature(
        &mut self,
        table: &dyn ManagedTokenTable,
        token: MetadataToken,
        var_arg: bool,
    ) -> Result<SigPointer> {
        self.ensure_live()?;
        match table.lookup(token) {
            Some(ManagedToken::Signature(bytes)) => self.copy_sig(&bytes),
            Some(ManagedToken::VarArgSignature(bytes)) if var_arg => self.copy_sig(&bytes),
            Some(_) => Err(ResolutionError::UnexpectedTokenKind {
                token,
                expected: if var_arg {
                    "call site signature"
                } else {
                    "signature"
                },
            }
            .into()),
            None => Err(ResolutionError::SignatureNotFound(token).into()),
        }
    }

    fn copy_optional_sig(&mut self, bytes: Option<&[u8]>) -> Result<SigPointer> {
        match bytes {
            Some(bytes) => self.copy_sig(bytes),
            None => Ok(SigPointer::empty()),
        }
    }
}

pub(crate) fn eh_clause(
    table: &dyn ManagedTokenTable,
    info: &CodeInfo,
    index: u32,
) -> Result<EhClause> {
    let out_of_range = ResolutionError::EhClauseOutOfRange {
        index,
        count: info.eh_size,
    };
    if index >= info.eh_size {
        return Err(out_of_range.into());
    }
    Ok(table.eh_clause(index).ok_or(out_of_range)?)
}

pub(crate) fn string_literal_text(
    table: &dyn ManagedTokenTable,
    token: MetadataToken,
) -> Result<String> {
    match table.lookup(token) {
        Some(ManagedToken::String(text)) => Ok(text),
        _ => Err(ResolutionError::StringLiteralNotFound(token).into()),
    }
}
