pub mod maintenance;
pub mod outbox_publisher;

pub use maintenance::{MaintenanceConfig, MaintenanceJob};
pub use outbox_publisher::{build_processor, OutboxPublisherConfig};
