//! Token and resolution result types shared by every resolver.
use crate::chunk::ChunkSpan;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// An integer key standing in for a symbolic reference inside a method body.
///
/// The top byte is the table kind, the low 24 bits the row. Dynamic methods
/// assign rows from their private token table, so the row has no meaning
/// outside the method that issued it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetadataToken(pub u32);

impl MetadataToken {
    pub const fn new(table: u8, row: u32) -> Self {
        MetadataToken(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    pub const fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn row(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub const fn is_nil(self) -> bool {
        self.row() == 0
    }
}

impl Display for MetadataToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Opaque handles supplied by the type loader.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TypeHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MethodRef(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FieldRef(pub u64);

/// A cursor over a signature blob copied into a resolver's scratch heap.
///
/// The blob itself lives in the resolver's [`ChunkAllocator`](crate::chunk::ChunkAllocator);
/// read it back with [`DynamicResolver::sig_bytes`](crate::resolver::DynamicResolver::sig_bytes).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SigPointer {
    blob: Option<ChunkSpan>,
    cursor: usize,
}

impl SigPointer {
    pub const fn empty() -> Self {
        Self {
            blob: None,
            cursor: 0,
        }
    }

    pub fn new(blob: ChunkSpan) -> Self {
        Self {
            blob: Some(blob),
            cursor: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.blob.is_none()
    }

    /// Bytes left between the cursor and the end of the blob.
    pub fn remaining(&self) -> usize {
        self.blob.map_or(0, |b| b.len() - self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The unread part of the blob.
    pub fn span(&self) -> Option<ChunkSpan> {
        let blob = self.blob?;
        blob.sub_span(self.cursor, blob.len() - self.cursor)
    }

    /// Advances past `n` bytes. Returns `false`, leaving the cursor alone,
    /// if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> bool {
        if n > self.remaining() {
            return false;
        }
        self.cursor += n;
        true
    }
}

/// Result of resolving a type, method or field token.
///
/// Produced per call and owns nothing: the signature cursors point into the
/// resolver's scratch heap and die with it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedToken {
    pub type_handle: Option<TypeHandle>,
    pub type_signature: SigPointer,
    pub method_signature: SigPointer,
    pub method: Option<MethodRef>,
    pub field: Option<FieldRef>,
}

impl ResolvedToken {
    pub fn for_type(handle: TypeHandle) -> Self {
        Self {
            type_handle: Some(handle),
            ..Default::default()
        }
    }
}
