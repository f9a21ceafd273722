pub mod clock;
pub mod entity;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod merge;
pub mod mutation;
pub mod patch;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{Entity, Snapshot, UpdatedAt};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use merge::DecimalStyle;
pub use mutation::{BatchOp, Mutation, MutationKind};
pub use patch::{FieldPatch, Patch};
