//! Asynchronous PostgreSQL client using Tokio.

mod conn;
mod pool;
mod stream;

pub use conn::Conn;
pub use pool::{Pool, PoolStatus, PooledConn};
