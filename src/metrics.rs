use crate::utils::sync::{AtomicU64, Ordering};
use serde::Serialize;

/// Counters for the dynamic method subsystem.
///
/// All counters use `Ordering::Relaxed`: they are independent tallies and never
/// publish other memory.
#[derive(Debug, Default)]
pub struct DynamicMethodMetrics {
    /// Descriptors carved fresh from the synthetic declaring type
    pub methods_carved: AtomicU64,
    /// Descriptors handed out again from a free list
    pub methods_reused: AtomicU64,
    pub teardowns_completed: AtomicU64,
    /// Teardowns parked on the delayed-cleanup queue because the code heap lock was busy
    pub teardowns_deferred: AtomicU64,
    pub delayed_cleanup_retries: AtomicU64,
    pub code_bytes_allocated: AtomicU64,
    pub code_bytes_freed: AtomicU64,
    pub regions_created: AtomicU64,
    pub regions_destroyed: AtomicU64,
    pub scratch_pages_allocated: AtomicU64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub methods_carved: u64,
    pub methods_reused: u64,
    pub teardowns_completed: u64,
    pub teardowns_deferred: u64,
    pub delayed_cleanup_retries: u64,
    pub code_bytes_allocated: u64,
    pub code_bytes_freed: u64,
    pub regions_created: u64,
    pub regions_destroyed: u64,
    pub scratch_pages_allocated: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dynamic Method Statistics:")?;
        writeln!(
            f,
            "  Descriptors:     carved {:>8}, reused {:>8}",
            self.methods_carved, self.methods_reused
        )?;
        writeln!(
            f,
            "  Teardowns:       done {:>8}, deferred {:>8}, retries {:>8}",
            self.teardowns_completed, self.teardowns_deferred, self.delayed_cleanup_retries
        )?;
        writeln!(
            f,
            "  Code bytes:      allocated {:>10}, freed {:>10}",
            self.code_bytes_allocated, self.code_bytes_freed
        )?;
        writeln!(
            f,
            "  Regions:         created {:>8}, destroyed {:>8}",
            self.regions_created, self.regions_destroyed
        )?;
        writeln!(f, "  Scratch pages:   {:>8}", self.scratch_pages_allocated)?;
        Ok(())
    }
}

impl DynamicMethodMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_method_carved(&self) {
        self.methods_carved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_method_reused(&self) {
        self.methods_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_teardown_completed(&self) {
        self.teardowns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_teardown_deferred(&self) {
        self.teardowns_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delayed_cleanup_retry(&self) {
        self.delayed_cleanup_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_code_allocated(&self, bytes: usize) {
        self.code_bytes_allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_code_freed(&self, bytes: usize) {
        self.code_bytes_freed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_region_created(&self) {
        self.regions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_region_destroyed(&self) {
        self.regions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scratch_pages(&self, pages: u64) {
        self.scratch_pages_allocated
            .fetch_add(pages, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            methods_carved: self.methods_carved.load(Ordering::Relaxed),
            methods_reused: self.methods_reused.load(Ordering::Relaxed),
            teardowns_completed: self.teardowns_completed.load(Ordering::Relaxed),
            teardowns_deferred: self.teardowns_deferred.load(Ordering::Relaxed),
            delayed_cleanup_retries: self.delayed_cleanup_retries.load(Ordering::Relaxed),
            code_bytes_allocated: self.code_bytes_allocated.load(Ordering::Relaxed),
            code_bytes_freed: self.code_bytes_freed.load(Ordering::Relaxed),
            regions_created: self.regions_created.load(Ordering::Relaxed),
            regions_destroyed: self.regions_destroyed.load(Ordering::Relaxed),
            scratch_pages_allocated: self.scratch_pages_allocated.load(Ordering::Relaxed),
        }
    }
}
