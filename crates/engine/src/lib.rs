pub mod analytics;
pub mod clock;
pub mod condition;
pub mod ingest;
pub mod matcher;
pub mod postgres;
pub mod processor;
pub mod rules;
pub mod store;
pub mod subscription;
pub mod template;
