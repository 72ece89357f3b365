// External Capabilities
//
// Interfaces the kernel drives but does not implement: replica RPC and
// storage usage measurement. The in-memory implementations back tests and
// local runs.

pub mod replica;
pub mod usage;

pub use replica::{InMemoryReplicas, ReplicaClient, ReplicaError};
pub use usage::{InMemoryUsage, UsageError, UsageSource};
