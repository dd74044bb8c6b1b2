pub mod documents;
pub mod metrics;
pub mod query;
