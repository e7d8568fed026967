//! Database module for PostgreSQL connectivity
//! 
//! Connection pooling for query execution and catalog introspection for the schema descriptor.

pub mod connection;
pub mod introspect;

pub use connection::init_pool;
pub use introspect::{introspect, CatalogSnapshot};
