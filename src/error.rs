use crate::{
    token::MetadataToken,
    utils::{CodeAddr, MethodSlot, RegionId},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DynamicMethodError {
    #[error("Memory allocation failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Token resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Invalid dynamic method state: {0}")]
    State(#[from] StateError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Code heap region exhausted (requested {requested} bytes)")]
    RegionExhausted { requested: usize },
    #[error("No code heap region contains {0}")]
    RegionNotFound(CodeAddr),
    #[error("No live code allocation starts at {0}")]
    NotAllocated(CodeAddr),
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Token not found: {0}")]
    TokenNotFound(MetadataToken),
    #[error("Token {token} is not a {expected}")]
    UnexpectedTokenKind {
        token: MetadataToken,
        expected: &'static str,
    },
    #[error("Signature not found: {0}")]
    SignatureNotFound(MetadataToken),
    #[error("String literal not found: {0}")]
    StringLiteralNotFound(MetadataToken),
    #[error("Exception clause {index} out of range (count {count})")]
    EhClauseOutOfRange { index: u32, count: u32 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Compile-time state has already been freed")]
    CodeInfoUnavailable,
    #[error("Native code requested before compilation completed")]
    NativeCodeNotReady,
    #[error("Managed resolver has already been released")]
    ResolverDetached,
    #[error("Dynamic method has no resolver attached")]
    NoResolver,
    #[error("Dynamic method {0} is not in use")]
    SlotNotInUse(MethodSlot),
    #[error("Dynamic method {0} is awaiting delayed code heap release")]
    PendingRegionRelease(MethodSlot),
    #[error("Dynamic method {0} does not belong to this table")]
    ForeignSlot(MethodSlot),
    #[error("Dynamic method table has been destroyed")]
    TableDestroyed,
    #[error("Code heap region {0} is no longer live")]
    RegionDestroyed(RegionId),
    #[error("Code heap region {region} still has {allocations} live allocations")]
    RegionInUse { region: RegionId, allocations: u32 },
}

pub type Result<T, E = DynamicMethodError> = std::result::Result<T, E>;
