//! nestfs - nested-archive package resolution cache
//!
//! Opens archives inside archives through flat paths such as
//! `outer.zip/lib/inner.tar.gz/inner.tar/README`, keeps opened packages
//! while they are referenced and evicts them once idle.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispose;
pub mod error;
pub mod loader;
pub mod provider;
pub mod reference;
pub mod temp;
pub mod ui;

pub use cache::{CacheOptions, PackageFileProvider, PackageHandle, PackageState};
pub use error::{NestError, NestResult};
pub use provider::FileProvider;
pub use reference::PackageReference;
