//! Launch descriptions, argument declarations and substitution

mod args;
mod description;
mod launch_file;
mod locate;
mod substitution;

pub use args::*;
pub use description::*;
pub use launch_file::*;
pub use locate::*;
pub use substitution::*;
