//! Plan construction and process execution

pub mod executor;
pub mod plan;
pub mod process;
pub mod summary;

pub use executor::*;
pub use plan::*;
pub use process::*;
pub use summary::*;
