pub mod amount;
pub mod run;

pub use run::*;
