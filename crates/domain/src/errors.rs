//! 领域模型错误定义
//!
//! 定义实体层所有可能的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("validation failed: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 权限错误
    #[error("permission denied: {action}")]
    PermissionDenied { action: String },

    /// 业务规则违反错误
    #[error("business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    /// 资源不存在错误
    #[error("not found: {resource_type} {resource_id}")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建权限错误
    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }

    /// 创建业务规则违反错误
    pub fn business_rule_violation(rule: impl Into<String>) -> Self {
        Self::BusinessRuleViolation { rule: rule.into() }
    }

    /// 创建资源不存在错误
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储层错误类型
///
/// 持久化适配器统一返回该类型，应用层据此区分「不存在」与「存储故障」。
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// 资源不存在
    #[error("record not found")]
    NotFound,

    /// 唯一性冲突
    #[error("record conflict")]
    Conflict,

    /// 存储故障（连接失败、查询失败等瞬时错误）
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
