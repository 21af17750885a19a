//! Business logic services.

pub mod file_store;
pub mod metadata_store;
pub mod migration_service;
pub mod recovery_service;
pub mod retention_service;
pub mod sql_store;
pub mod store_factory;

pub use file_store::FileStore;
pub use metadata_store::{list_page, MetadataStore, PaginatedQuery};
pub use sql_store::SqlStore;
pub use store_factory::open_store;
