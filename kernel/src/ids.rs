// Identifiers
//
// Plain numeric newtypes shared by every component. They serialize
// transparently so log records stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Database identifier.
    DbId,
    "db-"
);
id_type!(
    /// Table identifier, unique across databases.
    TableId,
    "table-"
);
id_type!(
    /// Partition identifier, unique across tables.
    PartitionId,
    "partition-"
);
id_type!(
    /// Storage node holding a replica.
    ReplicaId,
    "replica-"
);
id_type!(
    /// Load transaction id. Assigned from a single cluster-wide sequence.
    TxnId,
    "txn-"
);
id_type!(
    /// Schema-change job id.
    JobId,
    "job-"
);
