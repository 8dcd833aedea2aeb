//! 聊天系统核心领域模型
//!
//! 包含会话、消息、成员关系等核心实体，以及状态机和业务规则。
//! 该层不做任何 I/O，所有不变量在构造和变更方法中强制执行。

pub mod conversation;
pub mod errors;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use message::*;
pub use value_objects::*;
