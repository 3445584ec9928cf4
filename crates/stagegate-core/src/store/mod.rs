pub mod run_store;
pub mod verdict_store;

pub use run_store::RunStore;
pub use verdict_store::VerdictStore;
