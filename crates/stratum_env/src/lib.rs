//! # Stratum Environment
//!
//! Transactional core of the Stratum append-only storage engine.
//!
//! An [`Environment`] coordinates one append-only log, a meta tree mapping
//! store names to their roots, the set of live transactions, a garbage
//! collection collaborator and a queue of transaction-safe deferred tasks.
//!
//! Transactions get snapshot isolation: each pins the meta tree published
//! at its begin and never observes later commits until it reverts. Writers
//! serialize through a single commit point while readers stay unblocked.
//!
//! ```rust,ignore
//! use stratum_env::{Environment, EnvironmentConfig, StoreConfig};
//!
//! let env = Environment::open("my-data", EnvironmentConfig::default())?;
//! env.execute_in_transaction(|txn| {
//!     let store = env.open_store("users", StoreConfig::WITHOUT_DUPLICATES, txn)?;
//!     store.put(txn, b"alice".to_vec(), b"42".to_vec())
//! })?;
//! env.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod deferred;
mod environment;
mod error;
mod gc;
mod location;
mod meta_tree;
mod monitor;
mod store;
mod transaction;
mod tree;
mod txn_set;

pub use config::{EnvironmentConfig, PROPERTIES_FILE};
pub use environment::Environment;
pub use error::{EnvError, EnvResult};
pub use gc::{is_utilization_profile, GarbageCollector, UTILIZATION_PROFILE_NAME};
pub use meta_tree::{MetaTree, TreeMetaInfo, META_TREE_ID};
pub use store::{Store, StoreConfig};
pub use transaction::Transaction;
pub use tree::{ExpiredLoggable, MutableTree, Tree, TreeCommit};
