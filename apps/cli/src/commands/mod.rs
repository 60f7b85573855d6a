//! Command implementations for the Spindle CLI.

pub mod clean;
pub mod generate;
pub mod ls;
pub mod run;
