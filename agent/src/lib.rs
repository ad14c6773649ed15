pub mod desired;
pub mod ownership;
pub mod plan;
pub mod reconciler;
pub mod scheduler;
pub mod settings;
pub mod snapshot;

pub use reconciler::{PassReport, Reconciler};
pub use settings::Settings;
pub use snapshot::MappingSnapshot;
