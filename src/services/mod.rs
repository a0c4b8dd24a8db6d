//! Query federation services

pub mod derived;
pub mod derived_metrics;
pub mod filter_values;
pub mod formula;
pub mod mappings;
pub mod merger;
pub mod normalizer;
pub mod orchestrator;

pub use derived_metrics::{DerivedMetricRepository, DerivedMetricStore};
pub use filter_values::FilterValuesService;
pub use mappings::{MappingRepository, PropertyMappingStore};
pub use normalizer::QueryNormalizer;
pub use orchestrator::{GroupState, QueryGroupEngine, QueryGroupOutcome};
