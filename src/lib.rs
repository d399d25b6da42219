pub mod asset;
pub mod changes;
pub mod config;
pub mod digest;
pub mod error;
pub mod local_index;
pub mod login;
pub mod logging;
pub mod pathutil;
pub mod project;
pub mod remote_project;
pub mod session;
pub mod token_store;
pub mod transfer;

pub use asset::{Asset, Index, Kind};
pub use error::{Error, Result};
pub use local_index::IndexError;
pub use project::{Project, SyncReport};
