pub mod connection;
pub mod error;
pub mod schema;

pub use connection::{Database, DatabaseConfig};
pub use error::{DatabaseError, Result};
