//! Interfaces to the runtime components this subsystem relies on but does not own.
//!
//! - [`ManagedTokenTable`]: the managed-side resolver object that actually holds
//!   a dynamic method's bytecode, locals signature and token table.
//! - [`ObjectHeap`]: allocates the string objects behind private literals and
//!   releases their handles.
//! - [`IndirectionCellCache`]: the virtual stub cache that takes back
//!   indirection cells in bulk when a method dies.
//! - [`ReportRoots`] / [`RootVisitor`]: how descriptors expose the object
//!   handles they keep alive to the garbage collector.
//!
//! In-process implementations ([`StaticTokenTable`], [`HandleTable`],
//! [`RecyclingCellCache`]) back IL stubs and standalone use.
use crate::{
    resolver::{EhClause, JitContext},
    token::{FieldRef, MetadataToken, MethodRef, TypeHandle},
    utils::sync::{Arc, AtomicU64, Mutex, Ordering},
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// A strong handle to a garbage-collected object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectHandle(pub u64);

/// A small cell used by generated code to make an indirect call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct IndirectionCell(pub usize);

/// One entry of a managed token table.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedToken {
    Type {
        handle: TypeHandle,
        /// Instantiation signature for generic types.
        type_spec: Option<Vec<u8>>,
    },
    Method {
        owner: TypeHandle,
        method: MethodRef,
        /// Instantiation signature for generic methods.
        method_spec: Option<Vec<u8>>,
    },
    Field {
        owner: TypeHandle,
        field: FieldRef,
    },
    Signature(Vec<u8>),
    /// A call site signature for a varargs call.
    VarArgSignature(Vec<u8>),
    String(String),
}

impl ManagedToken {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ManagedToken::Type { .. } => "type",
            ManagedToken::Method { .. } => "method",
            ManagedToken::Field { .. } => "field",
            ManagedToken::Signature(_) => "signature",
            ManagedToken::VarArgSignature(_) => "varargs signature",
            ManagedToken::String(_) => "string",
        }
    }
}

/// Method body as reported by the managed side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManagedCodeInfo {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub init_locals: bool,
    pub eh_count: u32,
    pub local_sig: Vec<u8>,
}

pub trait ManagedTokenTable: Send + Sync {
    fn lookup(&self, token: MetadataToken) -> Option<ManagedToken>;
    fn code_info(&self) -> ManagedCodeInfo;
    fn eh_clause(&self, index: u32) -> Option<EhClause>;
    fn jit_context(&self) -> JitContext;

    /// Whether the creator asked for debuggable code.
    fn wants_debug_code(&self) -> bool {
        false
    }
}

pub trait ObjectHeap: Send + Sync {
    /// Allocates a string object and returns a strong handle to it.
    fn alloc_string(&self, text: &str) -> Option<ObjectHandle>;
    fn release_handle(&self, handle: ObjectHandle);
}

pub trait IndirectionCellCache: Send + Sync {
    fn recycle(&self, cells: Vec<IndirectionCell>);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RootKind {
    ManagedResolver,
    StringLiteral,
}

pub trait RootVisitor {
    fn visit(&mut self, kind: RootKind, handle: ObjectHandle);
}

impl<F: FnMut(RootKind, ObjectHandle)> RootVisitor for F {
    fn visit(&mut self, kind: RootKind, handle: ObjectHandle) {
        self(kind, handle)
    }
}

/// Implemented by everything that keeps object handles alive on behalf of a
/// dynamic method. The collector only traverses; `object_moved` is the one
/// mutation it may request.
pub trait ReportRoots {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor);

    /// Rewrites every reference to `from` so it points at `to`. Returns how
    /// many references were updated.
    fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize;
}

/// The collaborators every resolver needs, bundled so they can be shared.
#[derive(Clone)]
pub struct RuntimeServices {
    pub objects: Arc<dyn ObjectHeap>,
    pub stub_cache: Arc<dyn IndirectionCellCache>,
}

impl RuntimeServices {
    pub fn new(
        objects: Arc<dyn ObjectHeap>,
        stub_cache: Arc<dyn IndirectionCellCache>,
    ) -> Self {
        Self {
            objects,
            stub_cache,
        }
    }

    pub fn in_process() -> Self {
        Self::new(
            Arc::new(HandleTable::new()),
            Arc::new(RecyclingCellCache::new()),
        )
    }
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices").finish_non_exhaustive()
    }
}

/// A token table held entirely in process.
#[derive(Debug, Default)]
pub struct StaticTokenTable {
    tokens: HashMap<MetadataToken, ManagedToken>,
    code: ManagedCodeInfo,
    eh_clauses: Vec<EhClause>,
    context: JitContext,
    debug_code: bool,
}

impl StaticTokenTable {
    pub fn new(code: ManagedCodeInfo) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: MetadataToken, entry: ManagedToken) -> Self {
        self.insert(token, entry);
        self
    }

    pub fn with_eh_clause(mut self, clause: EhClause) -> Self {
        self.eh_clauses.push(clause);
        self.code.eh_count = self.eh_clauses.len() as u32;
        self
    }

    pub fn with_context(mut self, context: JitContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_debug_code(mut self, debug_code: bool) -> Self {
        self.debug_code = debug_code;
        self
    }

    pub fn insert(&mut self, token: MetadataToken, entry: ManagedToken) {
        self.tokens.insert(token, entry);
    }
}

impl ManagedTokenTable for StaticTokenTable {
    fn lookup(&self, token: MetadataToken) -> Option<ManagedToken> {
        self.tokens.get(&token).cloned()
    }

    fn code_info(&self) -> ManagedCodeInfo {
        self.code.clone()
    }

    fn eh_clause(&self, index: u32) -> Option<EhClause> {
        self.eh_clauses.get(index as usize).copied()
    }

    fn jit_context(&self) -> JitContext {
        self.context
    }

    fn wants_debug_code(&self) -> bool {
        self.debug_code
    }
}

/// An [`ObjectHeap`] that only tracks handle liveness.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    live: Mutex<HashMap<ObjectHandle, String>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, handle: ObjectHandle) -> bool {
        self.live.lock().contains_key(&handle)
    }

    pub fn text(&self, handle: ObjectHandle) -> Option<String> {
        self.live.lock().get(&handle).cloned()
    }

    /// Registers an object created elsewhere, such as a managed resolver.
    pub fn register(&self, text: &str) -> ObjectHandle {
        let handle = ObjectHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.live.lock().insert(handle, text.to_string());
        handle
    }
}

impl ObjectHeap for HandleTable {
    fn alloc_string(&self, text: &str) -> Option<ObjectHandle> {
        Some(self.register(text))
    }

    fn release_handle(&self, handle: ObjectHandle) {
        if self.live.lock().remove(&handle).is_none() {
            tracing::warn!("released unknown object handle {:?}", handle);
        }
    }
}

/// An [`IndirectionCellCache`] that keeps recycled cells for reuse.
#[derive(Debug, Default)]
pub struct RecyclingCellCache {
    cells: Mutex<HashSet<IndirectionCell>>,
    batches: AtomicU64,
}

impl RecyclingCellCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recycled_count(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Takes a recycled cell back out for reuse.
    pub fn take(&self) -> Option<IndirectionCell> {
        let mut cells = self.cells.lock();
        let cell = cells.iter().next().copied()?;
        cells.remove(&cell);
        Some(cell)
    }
}

impl IndirectionCellCache for RecyclingCellCache {
    fn recycle(&self, cells: Vec<IndirectionCell>) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.cells.lock().extend(cells);
    }
}
