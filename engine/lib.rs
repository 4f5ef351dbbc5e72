#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adjust;
pub mod algebra;
pub mod combine;
pub mod config;
pub mod crossval;
pub mod pairwise;
pub mod passenger;
pub mod priors;
pub mod progress;
pub mod results;
pub mod search;
pub mod stats;
pub mod types;
pub mod validate;

// The feature store sits beside the engine because the engine treats it as its only
// input contract.
#[path = "../store/mod.rs"]
pub mod store;
