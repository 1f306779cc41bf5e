pub mod config;
pub mod dashboard;
pub mod error;
pub mod shutdown;
pub mod store;
pub mod worker;
