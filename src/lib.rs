pub mod audit;
pub mod cleanup;
pub mod config;
pub mod errors;
pub mod exec;
pub mod gc;
pub mod git;
pub mod github;
pub mod guard_config;
pub mod inspector;
pub mod janitor;
pub mod layout;
pub mod lock;
pub mod queue;
pub mod reconcile;
pub mod report;
pub mod rescue;
pub mod util;

#[cfg(test)]
mod test_support;
