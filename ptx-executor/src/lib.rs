//! Partition executors, their helper threads, and an in-process site that drives them.

pub mod executor;
pub mod helper_pool;
pub mod procedure;
pub mod site;
pub mod sysprocs;

#[cfg(test)]
mod test_support;

pub use executor::{ExecutorParts, PartitionExecutor};
pub use procedure::{ProcedureCatalog, ProcedurePool};
pub use site::{LocalMessenger, LocalSite, SiteBuilder};
