pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod gateway;
pub mod redis;
pub mod schema;
pub mod store;
pub mod types;

pub use config::Config;
pub use context::AppContext;
pub use db::DbPool;
pub use error::{Error, Result};
pub use redis::RedisPool;
