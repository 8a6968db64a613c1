//! 提供商描述与 payload 构建 - 业务能力层
//!
//! 每个提供商族由显式的能力描述符定义：端点、认证方式、输出 token
//! 上限、请求构建与响应提取。提供商标识随模型名一并传入
//! （[`ProviderId`]），不再靠模型名猜测——名字推断仅作为缺省回退保留，
//! 未命中时打 warn 并落到 OpenAI 兼容族。
//!
//! ## 三种线上格式
//! - OpenAI 兼容（OpenAI / Grok / DeepSeek）：`async-openai` 客户端，
//!   自定义 api_base；取 `choices[0].message.content`
//! - Gemini：reqwest 直连 `generateContent`；取
//!   `candidates[0].content.parts[0].text`
//! - Claude：reqwest 直连 `/v1/messages`（`x-api-key` 认证）；取
//!   `content[0].text`
//!
//! 嵌套字段缺失一律转为带定位信息的结构错误，不抛裸异常。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{classify_provider_error, RelayError, Result};
use crate::models::Question;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const CLAUDE_API_BASE: &str = "https://api.anthropic.com";
const CLAUDE_API_VERSION: &str = "2023-06-01";

/// 提供商标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Gemini,
    Claude,
    Grok,
    DeepSeek,
}

/// 线上格式族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiCompatible,
    Gemini,
    Claude,
}

/// 提供商能力描述符
#[derive(Debug, Clone, Copy)]
pub struct ProviderCaps {
    pub label: &'static str,
    pub api_base: &'static str,
    pub wire: WireFormat,
    /// 输出 token 预算（按族配置，非全局常数）
    pub max_output_tokens: u32,
}

impl ProviderId {
    pub fn caps(&self) -> ProviderCaps {
        match self {
            ProviderId::OpenAi => ProviderCaps {
                label: "openai",
                api_base: "https://api.openai.com/v1",
                wire: WireFormat::OpenAiCompatible,
                max_output_tokens: 4_096,
            },
            ProviderId::Grok => ProviderCaps {
                label: "grok",
                api_base: "https://api.x.ai/v1",
                wire: WireFormat::OpenAiCompatible,
                max_output_tokens: 4_096,
            },
            ProviderId::DeepSeek => ProviderCaps {
                label: "deepseek",
                api_base: "https://api.deepseek.com/v1",
                wire: WireFormat::OpenAiCompatible,
                max_output_tokens: 8_192,
            },
            ProviderId::Gemini => ProviderCaps {
                label: "gemini",
                api_base: GEMINI_API_BASE,
                wire: WireFormat::Gemini,
                max_output_tokens: 8_192,
            },
            ProviderId::Claude => ProviderCaps {
                label: "claude",
                api_base: CLAUDE_API_BASE,
                wire: WireFormat::Claude,
                max_output_tokens: 8_192,
            },
        }
    }

    /// 模型名子串回退推断
    ///
    /// 未命中任何已知子串时假定 OpenAI 兼容族并打 warn——
    /// 依赖命名约定是脆弱的，优先在配置里显式指定 provider。
    pub fn infer(model: &str) -> Self {
        let m = model.to_lowercase();
        if m.contains("gemini") {
            ProviderId::Gemini
        } else if m.contains("claude") {
            ProviderId::Claude
        } else if m.contains("grok") {
            ProviderId::Grok
        } else if m.contains("deepseek") {
            ProviderId::DeepSeek
        } else {
            if !m.contains("gpt") && !m.starts_with("o1") && !m.starts_with("o3") {
                warn!("模型名 '{}' 未命中任何已知提供商，回退 OpenAI 兼容族", model);
            }
            ProviderId::OpenAi
        }
    }
}

/// 每次请求携带的提供商配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// 显式提供商标识；缺省时按模型名回退推断
    #[serde(default)]
    pub provider: Option<ProviderId>,
    pub api_key: String,
    pub model: String,
}

impl ProviderConfig {
    pub fn resolved_provider(&self) -> ProviderId {
        self.provider.unwrap_or_else(|| ProviderId::infer(&self.model))
    }
}

/// 构建批次的用户提示词
///
/// 题目序列化为 JSON，并按题型说明期望的答案容器形状。
pub fn build_user_prompt(questions: &[Question]) -> String {
    let question_list: Vec<Value> = questions
        .iter()
        .map(|q| {
            json!({
                "number": q.number,
                "type": q.qtype,
                "text": q.text,
                "options": q.options,
                "placeholders": q.placeholders,
            })
        })
        .collect();
    let questions_json = serde_json::to_string_pretty(&question_list).unwrap_or_default();

    format!(
        r#"Answer the quiz questions below. Reply with exactly one JSON object:
{{"answers": [{{"question_number": <n>, "answer": <answer>}}]}}

Answer shape per question type:
- multichoice/checkbox: array of the selected option texts
- radio/truefalse/shortanswer: a single string
- ordering: the options as an array in correct order
- matching: array of {{"sub_question_text": "...", "sub_answer_text": "..."}}
- gapselect/ddwtos: array with exactly one string per placeholder, in order
- cloze: array of {{"placeholder_number": <n>, "answer_text": "..."}}

Questions:
{}"#,
        questions_json
    )
}

/// 调用提供商，返回原始文本内容
///
/// 只负责一次 HTTP 往返和内容提取；重试与限流由派发器处理。
pub async fn call_provider(
    http: &reqwest::Client,
    provider: ProviderId,
    cfg: &ProviderConfig,
    system_prompt: &str,
    user_prompt: &str,
    images: &[String],
) -> Result<String> {
    let caps = provider.caps();
    debug!(
        "调用 {} (模型: {}, 图片: {})",
        caps.label,
        cfg.model,
        images.len()
    );

    match caps.wire {
        WireFormat::OpenAiCompatible => {
            call_openai_compatible(caps, cfg, system_prompt, user_prompt, images).await
        }
        WireFormat::Gemini => {
            call_gemini(http, caps, cfg, system_prompt, user_prompt, images).await
        }
        WireFormat::Claude => {
            call_claude(http, caps, cfg, system_prompt, user_prompt, images).await
        }
    }
}

/// OpenAI 兼容族（OpenAI / Grok / DeepSeek）
async fn call_openai_compatible(
    caps: ProviderCaps,
    cfg: &ProviderConfig,
    system_prompt: &str,
    user_prompt: &str,
    images: &[String],
) -> Result<String> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(&cfg.api_key)
        .with_api_base(caps.api_base);
    let client = Client::with_config(openai_config);

    let mut messages = Vec::new();

    let system_msg = ChatCompletionRequestSystemMessageArgs::default()
        .content(system_prompt)
        .build()
        .map_err(|e| RelayError::api(caps.label, e))?;
    messages.push(ChatCompletionRequestMessage::System(system_msg));

    // 带图片时走 Vision 形式的多部分内容
    let user_msg = if images.is_empty() {
        ChatCompletionRequestUserMessageArgs::default()
            .content(user_prompt)
            .build()
            .map_err(|e| RelayError::api(caps.label, e))?
    } else {
        let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
        content_parts.push(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText {
                text: user_prompt.to_string(),
            },
        ));
        for img in images {
            content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: to_data_url(img),
                        detail: Some(ImageDetail::Auto),
                    },
                },
            ));
        }
        ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(|e| RelayError::api(caps.label, e))?
    };
    messages.push(ChatCompletionRequestMessage::User(user_msg));

    let request = CreateChatCompletionRequestArgs::default()
        .model(&cfg.model)
        .messages(messages)
        .temperature(0.3)
        .max_tokens(caps.max_output_tokens)
        .build()
        .map_err(|e| RelayError::api(caps.label, e))?;

    let response = client
        .chat()
        .create(request)
        .await
        .map_err(|e| classify_provider_error(caps.label, e))?;

    let content = response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| RelayError::malformed(caps.label, "choices[0].message.content 缺失"))?;

    Ok(content.trim().to_string())
}

/// Gemini 族
async fn call_gemini(
    http: &reqwest::Client,
    caps: ProviderCaps,
    cfg: &ProviderConfig,
    system_prompt: &str,
    user_prompt: &str,
    images: &[String],
) -> Result<String> {
    let url = format!(
        "{}/models/{}:generateContent?key={}",
        caps.api_base, cfg.model, cfg.api_key
    );

    let mut parts = vec![json!({"text": user_prompt})];
    for img in images {
        let (mime, data) = split_data_url(img);
        parts.push(json!({"inline_data": {"mime_type": mime, "data": data}}));
    }

    let body = json!({
        "system_instruction": {"parts": [{"text": system_prompt}]},
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": {
            "temperature": 0.3,
            "maxOutputTokens": caps.max_output_tokens,
        },
    });

    let response = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::api(caps.label, e))?;
    let value = check_http_response(caps.label, response).await?;

    let text = value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| {
            RelayError::malformed(caps.label, "candidates[0].content.parts[0].text 缺失")
        })?;

    Ok(text.trim().to_string())
}

/// Claude 族
async fn call_claude(
    http: &reqwest::Client,
    caps: ProviderCaps,
    cfg: &ProviderConfig,
    system_prompt: &str,
    user_prompt: &str,
    images: &[String],
) -> Result<String> {
    let url = format!("{}/v1/messages", caps.api_base);

    let mut content = vec![json!({"type": "text", "text": user_prompt})];
    for img in images {
        let (mime, data) = split_data_url(img);
        content.push(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime, "data": data},
        }));
    }

    let body = json!({
        "model": cfg.model,
        "max_tokens": caps.max_output_tokens,
        "system": system_prompt,
        "messages": [{"role": "user", "content": content}],
    });

    let response = http
        .post(&url)
        .header("x-api-key", &cfg.api_key)
        .header("anthropic-version", CLAUDE_API_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::api(caps.label, e))?;
    let value = check_http_response(caps.label, response).await?;

    let text = value
        .get("content")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| RelayError::malformed(caps.label, "content[0].text 缺失"))?;

    Ok(text.trim().to_string())
}

/// 按 HTTP 状态分类响应；成功时解析为 JSON
async fn check_http_response(label: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| RelayError::api(label, e))?;

    if status.as_u16() == 429 {
        return Err(RelayError::RateLimited {
            provider: label.to_string(),
            message: text,
        });
    }
    // 503/529 以及明示过载的 5xx 视为暂时不可用
    if status.as_u16() == 503
        || status.as_u16() == 529
        || (status.is_server_error() && text.to_lowercase().contains("overloaded"))
    {
        return Err(RelayError::Overloaded {
            provider: label.to_string(),
            message: text,
        });
    }
    if !status.is_success() {
        return Err(RelayError::malformed(
            label,
            format!("HTTP {}: {}", status.as_u16(), crate::utils::logging::truncate_text(&text, 200)),
        ));
    }

    serde_json::from_str(&text)
        .map_err(|e| RelayError::malformed(label, format!("响应非 JSON: {}", e)))
}

/// data URL 拆成 (mime, base64)；无前缀时按 image/png 处理
fn split_data_url(image: &str) -> (&str, &str) {
    if let Some(rest) = image.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return (meta, data);
        }
    }
    ("image/png", image)
}

/// 保证是 data URL（OpenAI 兼容族的 image_url 需要）
fn to_data_url(image: &str) -> String {
    if image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/png;base64,{}", image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_provider_from_model() {
        assert_eq!(ProviderId::infer("gemini-2.0-flash"), ProviderId::Gemini);
        assert_eq!(ProviderId::infer("claude-sonnet-4-5"), ProviderId::Claude);
        assert_eq!(ProviderId::infer("grok-3"), ProviderId::Grok);
        assert_eq!(ProviderId::infer("deepseek-chat"), ProviderId::DeepSeek);
        assert_eq!(ProviderId::infer("gpt-4o-mini"), ProviderId::OpenAi);
        // 未知模型名回退默认族
        assert_eq!(ProviderId::infer("mystery-model"), ProviderId::OpenAi);
    }

    #[test]
    fn test_explicit_provider_wins_over_model_name() {
        let cfg = ProviderConfig {
            provider: Some(ProviderId::Grok),
            api_key: "k".to_string(),
            model: "gemini-like-name".to_string(),
        };
        assert_eq!(cfg.resolved_provider(), ProviderId::Grok);
    }

    #[test]
    fn test_caps_output_budget_per_family() {
        assert_eq!(ProviderId::OpenAi.caps().max_output_tokens, 4_096);
        assert_eq!(ProviderId::Claude.caps().max_output_tokens, 8_192);
        assert_eq!(ProviderId::DeepSeek.caps().max_output_tokens, 8_192);
    }

    #[test]
    fn test_split_data_url() {
        let (mime, data) = split_data_url("data:image/jpeg;base64,AAAA");
        assert_eq!(mime, "image/jpeg");
        assert_eq!(data, "AAAA");

        let (mime, data) = split_data_url("BBBB");
        assert_eq!(mime, "image/png");
        assert_eq!(data, "BBBB");
    }

    #[test]
    fn test_build_user_prompt_lists_questions() {
        let q = Question {
            number: 2,
            qtype: "multichoice".to_string(),
            text: "Pick two".to_string(),
            options: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            images: vec![],
            placeholders: vec![],
        };
        let prompt = build_user_prompt(&[q]);
        assert!(prompt.contains("\"number\": 2"));
        assert!(prompt.contains("Pick two"));
        assert!(prompt.contains("question_number"));
    }

    #[test]
    fn test_provider_config_deserialization() {
        let cfg: ProviderConfig = serde_json::from_str(
            r#"{"provider": "gemini", "api_key": "k", "model": "gemini-2.0-flash"}"#,
        )
        .unwrap();
        assert_eq!(cfg.provider, Some(ProviderId::Gemini));

        // provider 可省略
        let cfg: ProviderConfig =
            serde_json::from_str(r#"{"api_key": "k", "model": "gpt-4o"}"#).unwrap();
        assert_eq!(cfg.provider, None);
        assert_eq!(cfg.resolved_provider(), ProviderId::OpenAi);
    }
}
