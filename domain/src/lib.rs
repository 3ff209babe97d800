//! Domain values consumed by the Knitfab cluster orchestration engine.
//!
//! These types are the narrow view of Plans, Runs and Data the engine needs
//! in order to build cluster resources. The system of record for them lives
//! elsewhere.

mod config;
mod data;
mod run;

pub use config::*;
pub use data::*;
pub use run::*;
