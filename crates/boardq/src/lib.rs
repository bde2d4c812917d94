pub mod common;
pub mod machine;
pub mod server;
pub mod worker;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::BoardqError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = fxhash::FxHashMap<K, V>;
pub type Set<T> = fxhash::FxHashSet<T>;

/// Identifier of a job, assigned by the upstream queue.
pub type JobId = u64;

pub const BOARDQ_VERSION: &str = env!("CARGO_PKG_VERSION");
