//! 答题上下文
//!
//! 一次答题运行的标识信息，供流程层打日志用。
//! 流程层不持有资源，也不关心这些字段的来源。

use crate::services::ProviderId;

/// 答题运行上下文
#[derive(Debug, Clone)]
pub struct QuizCtx {
    /// 发起用户
    pub user_id: String,
    /// 解析后的提供商
    pub provider: ProviderId,
    /// 模型名
    pub model: String,
}

impl QuizCtx {
    pub fn new(user_id: impl Into<String>, provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            model: model.into(),
        }
    }
}
