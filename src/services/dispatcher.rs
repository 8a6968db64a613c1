//! 批次派发服务 - 业务能力层
//!
//! 对一个批次发起一次提供商调用，并处理完整的失败谱系：
//!
//! - **限流 (429)**：经速率治理器重排冷却；多题批次首次尝试即 429 时
//!   返回降级哨兵，由调用方把题目改排为单题批次；单题批次连续 ≥2 次
//!   限流则等完剩余速率窗口再试
//! - **暂时不可用**：首次出现时一次性长暂停（30s），之后走普通退避
//! - **其他错误**：指数退避 `base × 2^(attempt-1)`
//!
//! 重试耗尽后给批内每题补 `{answer: null, error}`——派发绝不把异常
//! 抛出边界，调用方拿到的永远是良构结果。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Batch, NormalizedAnswer, Question};
use crate::services::normalizer;
use crate::services::providers::{build_user_prompt, call_provider, ProviderConfig};
use crate::services::rate_governor::RateGovernor;

/// 派发结果
#[derive(Debug)]
pub enum DispatchOutcome {
    /// 归一化后的逐题答案（可能全为 null）
    Answers(Vec<NormalizedAnswer>),
    /// 降级哨兵：这些题目需要改排为单题批次重新入队
    Degraded(Vec<Question>),
}

/// 批次派发能力（流程层经由此接缝注入，测试可脚本化提供商行为）
pub trait BatchDispatch: Send + Sync {
    fn dispatch(
        &self,
        batch: &Batch,
        image: Option<&str>,
        provider_cfg: &ProviderConfig,
        batch_index: usize,
        personalization: Option<&[String]>,
    ) -> impl Future<Output = DispatchOutcome> + Send;
}

/// 批次派发服务
pub struct Dispatcher {
    http: reqwest::Client,
    governor: Arc<RateGovernor>,
    system_prompt: String,
    max_attempts: u32,
    unavailable_pause: Duration,
    backoff_base: Duration,
}

impl Dispatcher {
    pub fn new(config: &Config, governor: Arc<RateGovernor>) -> Self {
        Self {
            http: reqwest::Client::new(),
            governor,
            system_prompt: config.system_prompt.clone(),
            max_attempts: config.max_attempts.max(1),
            unavailable_pause: Duration::from_secs(config.unavailable_pause_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    async fn dispatch_inner(
        &self,
        batch: &Batch,
        image: Option<&str>,
        provider_cfg: &ProviderConfig,
        batch_index: usize,
        personalization: Option<&[String]>,
    ) -> DispatchOutcome {
        let provider = provider_cfg.resolved_provider();
        let user_prompt = build_user_prompt(&batch.questions);

        // 截图进每个批次；个性化图片只随首批发送
        let mut images: Vec<String> = Vec::new();
        if let Some(img) = image {
            images.push(img.to_string());
        }
        if batch_index == 0 {
            if let Some(extra) = personalization {
                images.extend(extra.iter().cloned());
            }
        }

        let estimated = batch.estimated_tokens;
        let mut rate_limit_streak: u32 = 0;
        let mut long_pause_used = false;
        let mut last_error = String::from("dispatch failed");

        for attempt in 1..=self.max_attempts {
            let admission = self.governor.admit(estimated).await;

            let result = call_provider(
                &self.http,
                provider,
                provider_cfg,
                &self.system_prompt,
                &user_prompt,
                &images,
            )
            .await;

            // 近限带放行的请求，完成后压一拍
            if admission.post_delay {
                self.governor.apply_post_delay().await;
            }

            match result {
                Ok(raw) => {
                    self.governor.on_success(estimated).await;
                    info!(
                        "[批次 {}] ✓ 派发成功 ({} 题, 尝试 {}/{})",
                        batch_index + 1,
                        batch.len(),
                        attempt,
                        self.max_attempts
                    );
                    let answers = normalizer::normalize_text(&raw, &batch.questions);
                    return DispatchOutcome::Answers(answers);
                }
                Err(e) if e.is_rate_limited() => {
                    rate_limit_streak += 1;
                    last_error = e.to_string();
                    let degraded = self
                        .governor
                        .on_rate_limit(&last_error, attempt == 1, batch.len() > 1)
                        .await;
                    if degraded {
                        info!(
                            "[批次 {}] 多题批次被限流，降级为单题重新入队",
                            batch_index + 1
                        );
                        return DispatchOutcome::Degraded(batch.questions.clone());
                    }
                    // 单题批次连续限流：等完剩余窗口，别再撞了
                    if batch.len() == 1 && rate_limit_streak >= 2 {
                        let wait = self.governor.remaining_window_wait().await;
                        if !wait.is_zero() {
                            warn!(
                                "[批次 {}] 单题批次连续 {} 次限流，等待窗口清空 {:?}",
                                batch_index + 1,
                                rate_limit_streak,
                                wait
                            );
                            sleep(wait).await;
                        }
                    }
                }
                Err(e) if e.is_overloaded() => {
                    rate_limit_streak = 0;
                    last_error = e.to_string();
                    if !long_pause_used {
                        long_pause_used = true;
                        warn!(
                            "[批次 {}] 提供商过载，长暂停 {:?} 后重试",
                            batch_index + 1,
                            self.unavailable_pause
                        );
                        sleep(self.unavailable_pause).await;
                    } else if attempt < self.max_attempts {
                        sleep(self.backoff(attempt)).await;
                    }
                }
                Err(e) => {
                    rate_limit_streak = 0;
                    last_error = e.to_string();
                    debug!("[批次 {}] 尝试 {} 失败: {}", batch_index + 1, attempt, last_error);
                    if attempt < self.max_attempts {
                        sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        // 重试耗尽：批内每题补 null + 错误
        warn!(
            "[批次 {}] ❌ 重试 {} 次后仍失败，逐题置 null: {}",
            batch_index + 1,
            self.max_attempts,
            crate::utils::logging::truncate_text(&last_error, 160)
        );
        DispatchOutcome::Answers(
            batch
                .questions
                .iter()
                .map(|q| NormalizedAnswer::null_with_error(q.number, last_error.clone()))
                .collect(),
        )
    }

    /// 指数退避: base × 2^(attempt-1)
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl BatchDispatch for Dispatcher {
    fn dispatch(
        &self,
        batch: &Batch,
        image: Option<&str>,
        provider_cfg: &ProviderConfig,
        batch_index: usize,
        personalization: Option<&[String]>,
    ) -> impl Future<Output = DispatchOutcome> + Send {
        self.dispatch_inner(batch, image, provider_cfg, batch_index, personalization)
    }
}
