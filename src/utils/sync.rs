//! Synchronization primitives.
//!
//! Pool and code heap locks are short, non-reentrant `parking_lot` mutexes.
//! Teardown paths rely on `try_lock` so they can defer instead of blocking.
pub use parking_lot::{Mutex, MutexGuard};
pub use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Weak,
};
