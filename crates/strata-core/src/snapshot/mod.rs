pub mod categorizer;
pub mod definition;
pub mod fingerprint;
pub mod intervals;

pub use categorizer::{categorize_change, AutoCategorizationMode, Categorizer, CategorizerConfig};
pub use definition::{Snapshot, SnapshotChangeCategory, SnapshotId};
pub use fingerprint::{fingerprint_all, fingerprint_model, hash_values, Fingerprint};
pub use intervals::{merge_intervals, Interval, Intervals};
