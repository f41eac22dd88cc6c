//! Tunables for the dynamic method subsystem.
//!
//! Defaults match the sizes the runtime uses for lightweight code generation.
//! [`DynamicMethodConfig::from_env`] overlays `DOTNET_DYNMETHOD_*` environment
//! variables on top of the defaults.
use serde::Serialize;

/// Default page size of a [`ChunkAllocator`](crate::chunk::ChunkAllocator).
pub const CHUNK_SIZE: usize = 64;

/// Code heap reservations are rounded up to this many bytes.
pub const HOST_CODEHEAP_SIZE_ALIGN: usize = 64;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub const DEFAULT_CODE_HEAP_RESERVE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicMethodConfig {
    pub chunk_size: usize,
    pub code_heap_reserve: usize,
    pub code_heap_initial_commit: usize,
    pub commit_granularity: usize,
    pub code_heap_size_align: usize,
    pub executable: bool,
}

impl Default for DynamicMethodConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            code_heap_reserve: DEFAULT_CODE_HEAP_RESERVE,
            code_heap_initial_commit: DEFAULT_PAGE_SIZE,
            commit_granularity: DEFAULT_PAGE_SIZE,
            code_heap_size_align: HOST_CODEHEAP_SIZE_ALIGN,
            executable: true,
        }
    }
}

impl DynamicMethodConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("DOTNET_DYNMETHOD_CHUNK_SIZE") {
            config.chunk_size = v;
        }
        if let Some(v) = env_usize("DOTNET_DYNMETHOD_CODE_HEAP_RESERVE") {
            config.code_heap_reserve = v;
        }
        if let Some(v) = env_usize("DOTNET_DYNMETHOD_COMMIT_GRANULARITY") {
            config.commit_granularity = v;
        }
        config.normalized()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_code_heap_reserve(mut self, reserve: usize) -> Self {
        self.code_heap_reserve = reserve;
        self
    }

    pub fn with_initial_commit(mut self, initial_commit: usize) -> Self {
        self.code_heap_initial_commit = initial_commit;
        self
    }

    pub fn with_commit_granularity(mut self, granularity: usize) -> Self {
        self.commit_granularity = granularity;
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    /// Clamps every size to something the allocators can work with.
    ///
    /// The commit granularity and reservation alignment must be powers of two,
    /// and the initial commit can never exceed the reservation.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(std::mem::size_of::<usize>());
        self.commit_granularity = self.commit_granularity.max(1).next_power_of_two();
        self.code_heap_size_align = self.code_heap_size_align.max(1).next_power_of_two();
        self.code_heap_reserve = self.code_heap_reserve.max(self.commit_granularity);
        self.code_heap_initial_commit = self.code_heap_initial_commit.min(self.code_heap_reserve);
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a byte count", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_rounds_granularity() {
        let config = DynamicMethodConfig::new()
            .with_commit_granularity(3000)
            .with_code_heap_reserve(1000)
            .with_initial_commit(1 << 20)
            .normalized();
        assert_eq!(config.commit_granularity, 4096);
        assert_eq!(config.code_heap_reserve, 4096);
        assert_eq!(config.code_heap_initial_commit, 4096);
    }

    #[test]
    fn test_defaults() {
        let config = DynamicMethodConfig::default();
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.code_heap_size_align, HOST_CODEHEAP_SIZE_ALIGN);
        assert!(config.executable);
        assert_eq!(config.clone().normalized(), config);
    }
}
