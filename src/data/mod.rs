pub mod cache;
pub mod gamma_api;
pub mod observations;
pub mod sources;
pub mod types;
