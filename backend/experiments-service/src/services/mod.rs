pub mod assignment_engine;
pub mod bulk;
pub mod cdc;
pub mod event_ingestor;
pub mod results_engine;

pub use assignment_engine::AssignmentEngine;
pub use bulk::BulkService;
pub use cdc::{CdcConsumer, CdcConsumerConfig};
pub use event_ingestor::EventIngestor;
pub use results_engine::ResultsEngine;
