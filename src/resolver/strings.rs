use crate::services::{ObjectHandle, ObjectHeap, RootKind, RootVisitor};

/// One literal owned by a single dynamic method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringLiteral {
    pub text: String,
    pub handle: ObjectHandle,
}

/// Private string literal table of one resolver.
///
/// Literals here are never shared with the runtime's global intern pool: a
/// dynamic method can be collected on its own, and must neither pin nor free
/// a string some other method interned.
#[derive(Debug, Default)]
pub struct StringLiteralTable {
    entries: Vec<StringLiteral>,
}

impl StringLiteralTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, text: &str) -> Option<ObjectHandle> {
        self.entries
            .iter()
            .find(|entry| entry.text == text)
            .map(|entry| entry.handle)
    }

    /// Returns the handle for `text`, allocating a string object on first use.
    /// `None` means the object heap is out of memory.
    pub fn get_or_intern(&mut self, text: &str, heap: &dyn ObjectHeap) -> Option<ObjectHandle> {
        if let Some(handle) = self.lookup(text) {
            return Some(handle);
        }
        let handle = heap.alloc_string(text)?;
        self.entries.push(StringLiteral {
            text: text.to_string(),
            handle,
        });
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StringLiteral> {
        self.entries.iter()
    }

    /// Drops every literal and releases its handle. Returns how many were released.
    pub fn release_all(&mut self, heap: &dyn ObjectHeap) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            heap.release_handle(entry.handle);
        }
        count
    }

    pub fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        for entry in &self.entries {
            visitor.visit(RootKind::StringLiteral, entry.handle);
        }
    }

    pub fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize {
        let mut moved = 0;
        for entry in self.entries.iter_mut().filter(|e| e.handle == from) {
            entry.handle = to;
            moved += 1;
        }
        moved
    }
}
