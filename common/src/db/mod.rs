// Database layer module
// PostgreSQL connection pool backing the entity store

pub mod pool;

pub use pool::DbPool;
