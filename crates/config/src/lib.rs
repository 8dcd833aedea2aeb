//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 数据库连接
//! - JWT认证
//! - WebSocket 心跳与断连扇出
//! - 过期消息清扫
//! - 服务设置

use serde::{Deserialize, Serialize};
use std::env;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// JWT认证配置
    pub jwt: JwtConfig,
    /// WebSocket 配置
    pub websocket: WebSocketConfig,
    /// 过期清扫配置
    pub sweep: SweepConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

/// WebSocket 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// 心跳 ping 间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 心跳超时（秒），超时未收到任何帧即判定连接死亡
    pub heartbeat_timeout_secs: u64,
    /// 断连离线广播的并发房间数上限
    pub disconnect_fanout_limit: usize,
}

/// 过期消息清扫配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置
    /// 对于关键安全配置（DATABASE_URL, JWT_SECRET），如果环境变量不存在将会 panic
    /// 这确保了生产环境中不会使用不安全的默认值
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parsed("SERVER_PORT", 8080),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .expect("DATABASE_URL environment variable is required for production safety"),
                max_connections: env_parsed("DB_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .expect("JWT_SECRET environment variable is required for production safety"),
                expiration_hours: env_parsed("JWT_EXPIRATION_HOURS", 24),
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: env_parsed("WS_HEARTBEAT_INTERVAL_SECS", 30),
                heartbeat_timeout_secs: env_parsed("WS_HEARTBEAT_TIMEOUT_SECS", 90),
                disconnect_fanout_limit: env_parsed("WS_DISCONNECT_FANOUT_LIMIT", 16),
            },
            sweep: SweepConfig {
                interval_secs: env_parsed("SWEEP_INTERVAL_SECS", 60),
            },
        }
    }

    /// 测试/本地运行用的默认配置，不触碰环境变量中的必填项
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/chat_test".to_string(),
                max_connections: 2,
            },
            jwt: JwtConfig {
                secret: "test-secret".to_string(),
                expiration_hours: 1,
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 90,
                disconnect_fanout_limit: 8,
            },
            sweep: SweepConfig { interval_secs: 60 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::for_tests();
        assert!(config.websocket.heartbeat_timeout_secs > config.websocket.heartbeat_interval_secs);
        assert!(config.websocket.disconnect_fanout_limit > 0);
    }
}
