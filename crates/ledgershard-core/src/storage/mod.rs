//! Storage layer: main database, chain rows, derived tables and the global lock.

pub mod chain;
pub mod database;
pub mod derived;
pub mod export;
pub mod schema;
pub mod sync;

pub use chain::{BlockRow, TransactionRow};
pub use database::DatabaseManager;
pub use derived::{DerivedTable, DerivedTablesRegistry, MinMaxDbId, VersionedEntityTable};
pub use export::{CsvExporter, ExportStats};
pub use schema::{init_main_schema, IndexDef};
pub use sync::GlobalSync;
