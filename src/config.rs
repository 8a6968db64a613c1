use serde::Deserialize;

use crate::error::{RelayError, Result};

/// 程序配置
///
/// 所有字段都有默认值，可被环境变量或 TOML 配置文件覆盖。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP 监听地址
    pub bind_addr: String,
    /// 管理接口共享密钥（x-admin-secret 请求头）
    pub admin_secret: String,
    // --- 速率治理 ---
    /// 滑动 60 秒窗口内的 token 预算
    pub token_limit_per_minute: u32,
    /// 近限带宽度（used >= limit - near 即进入近限带）
    pub near_threshold: u32,
    /// 近限带内超预算时的固定预等待（毫秒）
    pub pre_wait_ms: u64,
    /// 近限带内放行后的固定后延（毫秒）
    pub post_delay_ms: u64,
    /// 429 后冷却的默认秒数（无 retry-after 提示时）
    pub cooldown_default_secs: f64,
    /// 冷却增长系数
    pub cooldown_growth: f64,
    /// 首次尝试即失败时的激进增长系数
    pub cooldown_aggressive_growth: f64,
    /// 冷却下限（毫秒）
    pub cooldown_min_ms: u64,
    /// 冷却上限（毫秒）
    pub cooldown_max_ms: u64,
    /// 降级窗口（秒）
    pub degrade_window_secs: u64,
    /// 降级恢复所需连续成功次数
    pub degrade_success_threshold: u32,
    // --- 分批 ---
    /// 单批最大题目数
    pub max_batch_size: usize,
    /// 单批估算 token 上限
    pub batch_token_ceiling: u32,
    // --- 派发 ---
    /// 单批最大尝试次数
    pub max_attempts: u32,
    /// 暂时不可用时的一次性长暂停（秒）
    pub unavailable_pause_secs: u64,
    /// 普通退避基数（毫秒）
    pub backoff_base_ms: u64,
    /// 发给 LLM 的系统提示词
    pub system_prompt: String,
    // --- 会话 ---
    /// 全局并发会话上限
    pub max_sessions: usize,
    /// 会话存活时间（秒）
    pub session_ttl_secs: u64,
    /// 过期会话后台清扫间隔（秒）
    pub sweep_interval_secs: u64,
    // --- 答案后处理 ---
    /// 单个答案字符串的最大长度（超出截断并加省略号）
    pub answer_max_len: usize,
    /// 截图超过该字节数时先经压缩协作者处理
    pub image_shrink_threshold_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            admin_secret: "change-me".to_string(),
            token_limit_per_minute: 15_000,
            near_threshold: 1_500,
            pre_wait_ms: 2_200,
            post_delay_ms: 2_000,
            cooldown_default_secs: 3.0,
            cooldown_growth: 1.0,
            cooldown_aggressive_growth: 1.5,
            cooldown_min_ms: 1_500,
            cooldown_max_ms: 15_000,
            degrade_window_secs: 60,
            degrade_success_threshold: 5,
            max_batch_size: 3,
            batch_token_ceiling: 3_500,
            max_attempts: 3,
            unavailable_pause_secs: 30,
            backoff_base_ms: 1_000,
            system_prompt: default_system_prompt(),
            max_sessions: 100,
            session_ttl_secs: 1_800,
            sweep_interval_secs: 300,
            answer_max_len: 2_000,
            image_shrink_threshold_bytes: 1_000_000,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a quiz answering assistant. For every question you receive, reply with a single JSON object of the form {\"answers\": [{\"question_number\": <n>, \"answer\": <answer>}]}. Return ONLY the JSON, no explanations and no markdown fences.".to_string()
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(default.bind_addr),
            admin_secret: std::env::var("ADMIN_SECRET").unwrap_or(default.admin_secret),
            token_limit_per_minute: env_parse("TOKEN_LIMIT_PER_MINUTE", default.token_limit_per_minute),
            near_threshold: env_parse("NEAR_THRESHOLD", default.near_threshold),
            pre_wait_ms: env_parse("PRE_WAIT_MS", default.pre_wait_ms),
            post_delay_ms: env_parse("POST_DELAY_MS", default.post_delay_ms),
            cooldown_default_secs: env_parse("COOLDOWN_DEFAULT_SECS", default.cooldown_default_secs),
            cooldown_growth: env_parse("COOLDOWN_GROWTH", default.cooldown_growth),
            cooldown_aggressive_growth: env_parse("COOLDOWN_AGGRESSIVE_GROWTH", default.cooldown_aggressive_growth),
            cooldown_min_ms: env_parse("COOLDOWN_MIN_MS", default.cooldown_min_ms),
            cooldown_max_ms: env_parse("COOLDOWN_MAX_MS", default.cooldown_max_ms),
            degrade_window_secs: env_parse("DEGRADE_WINDOW_SECS", default.degrade_window_secs),
            degrade_success_threshold: env_parse("DEGRADE_SUCCESS_THRESHOLD", default.degrade_success_threshold),
            max_batch_size: env_parse("MAX_BATCH_SIZE", default.max_batch_size),
            batch_token_ceiling: env_parse("BATCH_TOKEN_CEILING", default.batch_token_ceiling),
            max_attempts: env_parse("MAX_ATTEMPTS", default.max_attempts),
            unavailable_pause_secs: env_parse("UNAVAILABLE_PAUSE_SECS", default.unavailable_pause_secs),
            backoff_base_ms: env_parse("BACKOFF_BASE_MS", default.backoff_base_ms),
            system_prompt: std::env::var("SYSTEM_PROMPT").unwrap_or(default.system_prompt),
            max_sessions: env_parse("MAX_SESSIONS", default.max_sessions),
            session_ttl_secs: env_parse("SESSION_TTL_SECS", default.session_ttl_secs),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", default.sweep_interval_secs),
            answer_max_len: env_parse("ANSWER_MAX_LEN", default.answer_max_len),
            image_shrink_threshold_bytes: env_parse("IMAGE_SHRINK_THRESHOLD_BYTES", default.image_shrink_threshold_bytes),
        }
    }

    /// 从 TOML 配置文件加载
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("读取配置文件失败 ({}): {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("TOML 解析失败 ({}): {}", path, e)))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.batch_token_ceiling, 3_500);
        assert_eq!(config.degrade_success_threshold, 5);
    }

    #[test]
    fn test_from_toml_str() {
        let config: Config =
            toml::from_str("max_sessions = 7\ntoken_limit_per_minute = 9000").unwrap();
        assert_eq!(config.max_sessions, 7);
        assert_eq!(config.token_limit_per_minute, 9_000);
        // 未覆盖的字段保持默认
        assert_eq!(config.max_batch_size, 3);
    }
}
