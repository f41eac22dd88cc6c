use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::ops::{Add, Sub};

/// Stable identity of a descriptor slot inside a
/// [`DynamicMethodTable`](crate::table::DynamicMethodTable).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MethodSlot(pub usize);

impl Display for MethodSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for MethodSlot {
    fn from(index: usize) -> Self {
        MethodSlot(index)
    }
}

impl MethodSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identity of a code heap region. Ids are never reused once a region is destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(pub usize);

impl Display for RegionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "region {}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId(pub u64);

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.0)
    }
}

/// Identity of an ordinarily loaded module hosting dynamic methods.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleId(pub u32);

impl Display for ModuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "module {}", self.0)
    }
}

/// An address inside committed code heap memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CodeAddr(pub usize);

impl Display for CodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for CodeAddr {
    fn from(addr: usize) -> Self {
        CodeAddr(addr)
    }
}

impl From<CodeAddr> for usize {
    fn from(addr: CodeAddr) -> Self {
        addr.0
    }
}

impl CodeAddr {
    pub const NULL: Self = CodeAddr(0);

    pub fn new(addr: usize) -> Self {
        CodeAddr(addr)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(CodeAddr)
    }

    /// Byte distance from `origin` up to `self`.
    pub fn offset_from(self, origin: CodeAddr) -> usize {
        debug_assert!(self >= origin);
        self.0 - origin.0
    }
}

impl Add<usize> for CodeAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        CodeAddr(self.0 + rhs)
    }
}

impl Sub<usize> for CodeAddr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self {
        CodeAddr(self.0 - rhs)
    }
}
