pub mod assignment;
pub mod event;
pub mod experiment;
pub mod variant;

pub use assignment::{Assignment, AssignmentSource};
pub use event::{Event, NewEvent};
pub use experiment::{Experiment, ExperimentStatus};
pub use variant::{validate_variant_set, Variant};
