//! HTTP handlers for the experiment lifecycle, assignment resolution,
//! event ingestion, and results surfaces.

pub mod assignments;
pub mod events;
pub mod experiments;
pub mod results;

pub use assignments::{bulk_get_for_experiment, bulk_get_for_user, get_assignment};
pub use events::{record_event, record_event_batch, BatchLimits};
pub use experiments::{
    activate_experiment, archive_experiment, complete_experiment, create_experiment,
    get_experiment, get_experiment_by_key, pause_experiment, update_variant_allocations,
};
pub use results::get_results;
