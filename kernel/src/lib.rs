// Keel Kernel
//
// Frontend coordination for a distributed analytical store: storage quota
// admission, load transactions with quorum publish, fenced schema changes
// and the leader-only daemons that keep them moving.

pub mod adapters;
pub mod backoff;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod frontend;
pub mod ids;
pub mod invariants;
pub mod log;
pub mod quota;
pub mod replay;
pub mod schema;
pub mod state;
pub mod txn;

pub use config::KernelConfig;
pub use frontend::{Frontend, FrontendError, FrontendParts};
