//! Training VM provisioner.
//!
//! Drives provisioning requests for student training machines to exactly one
//! terminal outcome (ready or failed). Machines come from a small static pool
//! first and from an elastic cloud backend when the pool is exhausted.
//!
//! Several independent loops share the declarative store as ground truth:
//!
//! - [`reconciler::LifecycleReconciler`] per intake path
//! - [`bridge::PropagationBridge`] projecting ready requests onto platform
//!   machine records
//! - [`cleanup::GarbageCollector`] enforcing timeouts and elastic TTLs
//!
//! Each loop is wrapped by [`worker::LoopWorker`] and restarted by
//! [`supervisor::supervise`].

pub mod backend;
pub mod bridge;
pub mod cleanup;
pub mod config;
pub mod model;
pub mod provision;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod worker;
