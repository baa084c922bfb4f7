pub mod assignment;
pub mod audience;
pub mod bucketing;
pub mod conversion;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod reporting;
pub mod stats;
pub mod store;
pub mod validation;
