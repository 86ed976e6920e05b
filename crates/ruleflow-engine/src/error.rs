//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("路径不存在: {0}")]
    PathNotFound(String),

    #[error("无效的路径表达式: {0}")]
    InvalidPath(String),

    #[error("无效的条件: {0}")]
    InvalidCondition(String),

    #[error("无效的操作: {0}")]
    InvalidAction(String),

    #[error("命中策略冲突: {0}")]
    HitPolicyViolation(String),

    #[error("类型转换失败: 期望 {expected}, 实际值 {actual}")]
    CoercionFailure { expected: String, actual: String },

    #[error("脚本编译失败: {0}")]
    CompilationFailure(String),

    #[error("执行超时: 超过 {0} 毫秒预算")]
    ExecutionTimeout(u64),

    #[error("脚本执行失败: {0}")]
    ExecutionError(String),

    #[error("外部调用失败: {0}")]
    ExternalCallFailure(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;
