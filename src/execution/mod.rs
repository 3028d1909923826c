pub mod ledger;
pub mod persistence;
pub mod types;
