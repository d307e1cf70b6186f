pub mod definition;
pub mod kind;

pub use definition::{Computation, ModelDefinition, Projection, DEFAULT_CRON};
pub use kind::{KindCapabilities, ModelKind, ModelKindName};
