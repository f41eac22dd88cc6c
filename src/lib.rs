//! # dotnet-dynmethod
//!
//! Dynamic methods for the `dotnet-rs` runtime: methods whose bytecode and
//! symbolic references are supplied at run time instead of loaded from an
//! assembly.
//!
//! ## Subsystems
//!
//! - **Method Pool** (`table`, `method`): Per-scope pool of reusable method
//!   descriptors, with staged teardown and a delayed-cleanup queue.
//! - **Resolvers** (`resolver/`): Answer the JIT's token, signature and code
//!   queries for methods with no metadata scope.
//! - **Scratch Memory** (`chunk`): Bump allocator for resolver-owned blobs.
//! - **Code Heap** (`code_heap/`): First-fit executable memory for compiled
//!   method bodies, released region by region.
//! - **Collaborators** (`services`): Interfaces to the managed token table,
//!   object heap, stub cache and garbage collector.
//!
//! The JIT itself, metadata parsing and the garbage collector live elsewhere.
//! This crate never installs a `tracing` subscriber.

#[macro_use]
pub mod utils;

pub mod chunk;
pub mod code_heap;
pub mod config;
pub mod error;
pub mod method;
pub mod metrics;
pub mod resolver;
pub mod scope;
pub mod services;
pub mod table;
pub mod token;

pub use code_heap::{CodeHeapManager, HostCodeHeap, TrackAllocation};
pub use config::DynamicMethodConfig;
pub use error::{DynamicMethodError, Result};
pub use method::{DynamicMethodDesc, SlotState};
pub use metrics::DynamicMethodMetrics;
pub use resolver::{AnyResolver, DynamicResolver, ResolverLifecycle};
pub use scope::ScopeHandle;
pub use table::{DynamicMethodTable, PoolStats, TeardownOutcome};
