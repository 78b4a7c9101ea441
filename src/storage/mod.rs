pub mod clickhouse;
pub mod duckdb;
pub mod memory;
pub mod schema;
pub mod traits;

pub use self::clickhouse::ClickHouseStore;
pub use self::duckdb::DuckDbStore;
pub use memory::{MemoryStore, WriteRecord};
pub use schema::{is_valid_identifier, LogTable};
pub use traits::{LogQuery, LogStore, StoreError, DEFAULT_QUERY_LIMIT};
