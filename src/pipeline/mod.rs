//! Project file handling and the run driver.

pub mod executor;
pub mod parser;

pub use executor::{run, validate};
