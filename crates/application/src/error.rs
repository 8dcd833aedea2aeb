//! 应用层错误定义
//!
//! 按照错误分类学划分：认证、鉴权、验证、不存在、领域规则、存储瞬时故障。
//! 单个事件处理器的失败在边界处被捕获并转换为面向连接的 `error` 事件，
//! 绝不终止连接，也不影响其他连接。

use domain::{DomainError, RepositoryError};
use thiserror::Error;

/// 应用层错误类型
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// 凭据无效或缺失，连接在注册前被拒绝
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// 身份有效但房间/角色权限不足
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// 载荷不合法
    #[error("validation failed: {0}")]
    Validation(String),

    /// 引用的会话/消息不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// 领域层错误
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// 仓储层错误（存储故障在本层不重试，由更高层决定）
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// 基础设施错误
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure(message.into())
    }
}

/// 应用层结果类型
pub type ApplicationResult<T> = Result<T, ApplicationError>;
