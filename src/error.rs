//! 应用错误类型
//!
//! 错误分类法：
//! - 容量类（会话上限）：唯一向调用方硬失败的错误
//! - 限流类（429）：退避重试，耗尽后降级为逐题 null
//! - 暂时不可用类（过载）：一次长暂停后按普通退避重试
//! - 响应结构类：防御式解析，转为逐题 null
//! - 校验类：形状不符，转为 null + shape_note，永不抛出
//!
//! 批处理/派发/归一化/校验管线内部不允许错误越过自身边界。

use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    /// 会话容量已满（对调用方硬失败，不重试）
    #[error("会话容量已满: 活跃 {active}/{max}")]
    Capacity { active: usize, max: usize },

    /// 鉴权失败（token 无效）
    #[error("鉴权失败: token 无效")]
    Unauthorized,

    /// 提供商限流（429）
    #[error("请求频率受限 ({provider}): {message}")]
    RateLimited { provider: String, message: String },

    /// 提供商暂时不可用（过载 / 503）
    #[error("服务暂时不可用 ({provider}): {message}")]
    Overloaded { provider: String, message: String },

    /// 提供商返回结构异常（缺字段 / 非 JSON）
    #[error("响应结构异常 ({provider}): {detail}")]
    MalformedResponse { provider: String, detail: String },

    /// LLM API 调用失败（网络或其他）
    #[error("LLM API 调用失败 ({provider}): {source}")]
    Api {
        provider: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 会话不存在或已过期
    #[error("会话不存在或已过期: {id}")]
    SessionNotFound { id: String },

    /// 会话内部状态异常（questions/answers 不平行等）
    #[error("会话状态异常: {0}")]
    SessionCorrupt(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl RelayError {
    /// 创建 API 调用错误
    pub fn api(
        provider: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RelayError::Api {
            provider: provider.into(),
            source: Box::new(source),
        }
    }

    /// 创建响应结构错误
    pub fn malformed(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        RelayError::MalformedResponse {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    /// 是否为限流错误
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RelayError::RateLimited { .. })
    }

    /// 是否为暂时不可用错误
    pub fn is_overloaded(&self) -> bool {
        matches!(self, RelayError::Overloaded { .. })
    }
}

/// 应用程序结果类型
pub type Result<T> = std::result::Result<T, RelayError>;

/// 根据错误文本对提供商错误做分类
///
/// 提供商 SDK 往往把 HTTP 状态埋在错误消息里，这里按文本特征归类，
/// 与 retry-after 提示解析（rate_governor）配合使用。
pub fn classify_provider_error(
    provider: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> RelayError {
    let text = source.to_string();
    let lowered = text.to_lowercase();

    if lowered.contains("429")
        || lowered.contains("rate limit")
        || lowered.contains("too many requests")
        || lowered.contains("resource_exhausted")
        || lowered.contains("quota")
    {
        return RelayError::RateLimited {
            provider: provider.to_string(),
            message: text,
        };
    }

    if lowered.contains("503")
        || lowered.contains("overloaded")
        || lowered.contains("unavailable")
        || lowered.contains("server is busy")
    {
        return RelayError::Overloaded {
            provider: provider.to_string(),
            message: text,
        };
    }

    RelayError::api(provider, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeError(String);

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for FakeError {}

    #[test]
    fn test_classify_rate_limited() {
        let e = classify_provider_error("gemini", FakeError("HTTP 429 Too Many Requests".into()));
        assert!(e.is_rate_limited());

        let e =
            classify_provider_error("openai", FakeError("Rate limit reached for tokens".into()));
        assert!(e.is_rate_limited());

        let e = classify_provider_error("gemini", FakeError("RESOURCE_EXHAUSTED: quota".into()));
        assert!(e.is_rate_limited());
    }

    #[test]
    fn test_classify_overloaded() {
        let e = classify_provider_error("claude", FakeError("Overloaded".into()));
        assert!(e.is_overloaded());

        let e =
            classify_provider_error("deepseek", FakeError("HTTP 503 Service Unavailable".into()));
        assert!(e.is_overloaded());
    }

    #[test]
    fn test_classify_other() {
        let e = classify_provider_error("openai", FakeError("connection reset by peer".into()));
        assert!(!e.is_rate_limited());
        assert!(!e.is_overloaded());
    }
}
