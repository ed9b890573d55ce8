pub mod contexts;
pub mod error;
pub mod migration_trait;
pub mod registry;
pub mod resolver;
#[cfg(test)]
pub(crate) mod testing;

pub use contexts::MigrationContext;
pub use error::{Error, Operation};
pub use migration_trait::{Migration, MigrationDescriptor};
pub use registry::MigrationCatalog;
pub use resolver::SchemaVersionResolver;
