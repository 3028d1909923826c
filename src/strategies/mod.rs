pub mod bias;
pub mod detector;
pub mod guard;
pub mod types;
