//! 基础设施层：PostgreSQL 持久化适配器

pub mod db;
pub mod repository;

pub use db::create_pg_pool;
pub use repository::{PgConversationRepository, PgMessageRepository};
