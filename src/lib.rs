//! NodePort allocator - cluster-wide NodePort assignment for Kubernetes
//!
//! Operators partition the NodePort interval (30000-32767) into named ranges,
//! each bound to a set of namespaces or a label selector. A mutating admission
//! webhook intercepts Service-of-type-NodePort submissions, assigns a free port
//! from the matching range (or validates a user-specified one), and guarantees
//! no two live Services hold the same port. A deletion controller releases
//! ports back to their range.
//!
//! # Architecture
//!
//! - Allocation state lives in per-range packed bitmaps, persisted to a single
//!   ConfigMap with optimistic concurrency, so the webhook may run on every
//!   replica concurrently.
//! - The deletion controller runs on exactly one replica, gated by Lease-based
//!   leader election.
//! - At startup each replica reconstructs its bitmaps from the live Service
//!   set before admission opens.
//!
//! # Modules
//!
//! - [`bitset`] - Packed bit array over a contiguous port interval
//! - [`config`] - YAML configuration loading and validation
//! - [`policy`] - Range selection for a Service (labels, namespaces, default)
//! - [`store`] - ConfigMap-backed persistence with conflict retry
//! - [`range`] - One port range: bitmap plus write-through persistence
//! - [`manager`] - Range map construction, startup scan, validation
//! - [`allocator`] - Per-Service allocation transaction with rollback
//! - [`webhook`] - Mutating admission endpoint (AdmissionReview over HTTPS)
//! - [`controller`] - Service deletion reconciler with finalizer handling
//! - [`leader`] - Lease-based leader election
//! - [`retry`] - Conflict retry with exponential backoff and jitter
//! - [`error`] - Error types for the allocator

#![deny(missing_docs)]

pub mod allocator;
pub mod bitset;
pub mod config;
pub mod controller;
pub mod error;
pub mod leader;
pub mod manager;
pub mod policy;
pub mod range;
pub mod retry;
pub mod store;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Smallest port number a NodePort Service may expose
pub const NODE_PORT_MIN: i32 = 30000;

/// Largest port number a NodePort Service may expose
pub const NODE_PORT_MAX: i32 = 32767;

/// Finalizer attached to NodePort Services so ports are released even when
/// the controller is briefly offline. Must stay identical across versions or
/// ports leak.
pub const FINALIZER: &str = "nodeport-allocator.example.com/finalizer";

/// Namespace a Service with empty metadata.namespace is treated as living in
pub const DEFAULT_NAMESPACE: &str = "default";
