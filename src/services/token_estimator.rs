//! Token 估算服务 - 业务能力层
//!
//! 估算一次外呼的 token 成本（提示词 + 题目 + 图片 + 结构开销），
//! 供分批与限流门控使用。
//!
//! 估算是粗粒度的：文本走模型感知的 tokenizer（不可用时退回
//! `ceil(字符数 / 4)`），图片按编码字节长度分档。本服务永不失败——
//! 内部异常时返回保守的兜底常数，让下游门控优雅降级而不是卡死。

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};
use tracing::debug;

use crate::models::Question;

/// 内部失败时的兜底估算值
pub const FALLBACK_TOKENS: u32 = 1_000;

/// 每道题附加的结构开销
pub const PER_QUESTION_OVERHEAD: u32 = 50;

/// 整次请求附加的结构开销（JSON 包装、指令等）
pub const REQUEST_OVERHEAD: u32 = 300;

/// 图片 token 分档：(编码字节上限, token 数)
const IMAGE_BUCKETS: [(usize, u32); 3] = [
    (100 * 1024, 500),
    (200 * 1024, 1_000),
    (400 * 1024, 1_500),
];

/// 超出最大分档后的图片 token 数
const IMAGE_TOKENS_MAX: u32 = 2_000;

/// Token 估算服务
///
/// 职责：
/// - 估算 提示词 + 题目列表 + 可选图片 的 token 成本
/// - 只做估算，不做网络调用
/// - 永不返回错误
#[derive(Debug, Clone, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// 估算 token 成本（永不失败）
    ///
    /// # 参数
    /// - `prompt`: 提示词文本
    /// - `questions`: 题目列表
    /// - `image`: 可选的 base64 编码图片
    /// - `model`: 模型名（决定 tokenizer 选择）
    /// - `overhead`: 调用点自带的固定结构开销
    pub fn estimate(
        &self,
        prompt: &str,
        questions: &[Question],
        image: Option<&str>,
        model: &str,
        overhead: u32,
    ) -> u32 {
        match self.try_estimate(prompt, questions, image, model, overhead) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!("token 估算失败，使用兜底值 {}: {}", FALLBACK_TOKENS, e);
                FALLBACK_TOKENS
            }
        }
    }

    /// 可失败的估算（供分批器判断是否退回定长分块）
    pub fn try_estimate(
        &self,
        prompt: &str,
        questions: &[Question],
        image: Option<&str>,
        model: &str,
        overhead: u32,
    ) -> anyhow::Result<u32> {
        let mut total = overhead;

        total += self.text_tokens(prompt, model);

        for q in questions {
            total += self.question_tokens(q, model);
        }

        if let Some(img) = image {
            total += image_tokens(img.len());
        }

        Ok(total)
    }

    /// 单道题的 token 成本（题干 + 选项 + 占位符 + 每题开销）
    pub fn question_tokens(&self, question: &Question, model: &str) -> u32 {
        let mut tokens = PER_QUESTION_OVERHEAD;
        tokens += self.text_tokens(&question.text, model);
        for opt in &question.options {
            tokens += self.text_tokens(opt, model);
        }
        for ph in &question.placeholders {
            tokens += self.text_tokens(ph, model);
        }
        tokens
    }

    /// 文本 token 数：tokenizer 优先，失败退回字符数/4
    fn text_tokens(&self, text: &str, model: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        match encoder_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
            None => (text.chars().count() as u32).div_ceil(4),
        }
    }
}

/// 图片 token：按编码字节长度分档
fn image_tokens(encoded_len: usize) -> u32 {
    for (limit, tokens) in IMAGE_BUCKETS {
        if encoded_len < limit {
            return tokens;
        }
    }
    IMAGE_TOKENS_MAX
}

/// 按模型名选择 tokenizer
///
/// gpt-4o / o1 / o3 系列使用 o200k，其余使用 cl100k。
/// 编码器加载失败时返回 None（调用方退回字符估算）。
fn encoder_for(model: &str) -> Option<&'static CoreBPE> {
    static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
    static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

    let use_o200k = model.contains("gpt-4o") || model.contains("o1") || model.contains("o3");
    if use_o200k {
        O200K.get_or_init(|| o200k_base().ok()).as_ref()
    } else {
        CL100K.get_or_init(|| cl100k_base().ok()).as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(number: u32, text: &str) -> Question {
        Question {
            number,
            qtype: "radio".to_string(),
            text: text.to_string(),
            options: vec!["A".to_string(), "B".to_string()],
            images: vec![],
            placeholders: vec![],
        }
    }

    #[test]
    fn test_estimate_includes_overhead() {
        let estimator = TokenEstimator::new();
        let empty = estimator.estimate("", &[], None, "gpt-4o-mini", 300);
        assert_eq!(empty, 300);
    }

    #[test]
    fn test_estimate_grows_with_questions() {
        let estimator = TokenEstimator::new();
        let one = estimator.estimate("prompt", &[question(1, "What is 2+2?")], None, "gpt-4o", 0);
        let two = estimator.estimate(
            "prompt",
            &[question(1, "What is 2+2?"), question(2, "What is 3+3?")],
            None,
            "gpt-4o",
            0,
        );
        assert!(two > one);
    }

    #[test]
    fn test_image_buckets() {
        assert_eq!(image_tokens(50 * 1024), 500);
        assert_eq!(image_tokens(150 * 1024), 1_000);
        assert_eq!(image_tokens(300 * 1024), 1_500);
        assert_eq!(image_tokens(800 * 1024), 2_000);
    }

    #[test]
    fn test_estimate_with_image() {
        let estimator = TokenEstimator::new();
        let img = "x".repeat(150 * 1024);
        let with_img = estimator.estimate("p", &[], Some(&img), "gemini-2.0-flash", 0);
        let without = estimator.estimate("p", &[], None, "gemini-2.0-flash", 0);
        assert_eq!(with_img - without, 1_000);
    }

    #[test]
    fn test_unknown_model_still_estimates() {
        let estimator = TokenEstimator::new();
        let tokens = estimator.estimate("hello world, this is text", &[], None, "mystery-model", 0);
        assert!(tokens > 0);
    }
}
