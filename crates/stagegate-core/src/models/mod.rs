pub mod artefact;
pub mod run;
pub mod verdict;

pub use artefact::*;
pub use run::*;
pub use verdict::*;
