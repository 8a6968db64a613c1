//! 分批计划服务 - 业务能力层
//!
//! 把题目列表切成提供商可接受的批次：
//! 单批不超过最大题数，且累计估算 token 不超过上限。
//!
//! 分批永不失败——估算器异常时退回按题数定长分块。

use tracing::{debug, warn};

use crate::models::{Batch, Question};
use crate::services::token_estimator::{TokenEstimator, REQUEST_OVERHEAD};

/// 分批计划服务
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    estimator: TokenEstimator,
    max_batch_size: usize,
    token_ceiling: u32,
}

impl BatchPlanner {
    pub fn new(max_batch_size: usize, token_ceiling: u32) -> Self {
        Self {
            estimator: TokenEstimator::new(),
            max_batch_size: max_batch_size.max(1),
            token_ceiling,
        }
    }

    /// 贪心分批
    ///
    /// 规则：当前批 `题数 < max_batch_size` 且
    /// `累计估算 + 下一题估算 <= token 上限` 时继续装入，否则封批另起。
    /// 单题输入直接成单批；估算器异常退回定长分块。
    pub fn plan(
        &self,
        questions: &[Question],
        model: &str,
        prompt: &str,
        image: Option<&str>,
    ) -> Vec<Batch> {
        if questions.is_empty() {
            return Vec::new();
        }

        // 单题请求不走分批逻辑
        if questions.len() == 1 {
            let tokens = self
                .estimator
                .estimate(prompt, questions, image, model, REQUEST_OVERHEAD);
            return vec![Batch {
                questions: questions.to_vec(),
                estimated_tokens: tokens,
            }];
        }

        match self.try_plan(questions, model, prompt, image) {
            Ok(batches) => batches,
            Err(e) => {
                warn!("token 估算失败，退回定长分块: {}", e);
                self.plan_fixed_chunks(questions)
            }
        }
    }

    fn try_plan(
        &self,
        questions: &[Question],
        model: &str,
        prompt: &str,
        image: Option<&str>,
    ) -> anyhow::Result<Vec<Batch>> {
        // 基础成本：提示词 + 图片 + 整体结构开销，每个批次都要承担
        let base_tokens = self
            .estimator
            .try_estimate(prompt, &[], image, model, REQUEST_OVERHEAD)?;

        let mut batches = Vec::new();
        let mut current: Vec<Question> = Vec::new();
        let mut running = base_tokens;

        for q in questions {
            let q_tokens = self.estimator.question_tokens(q, model);

            let fits_count = current.len() < self.max_batch_size;
            let fits_tokens = running + q_tokens <= self.token_ceiling;

            if !current.is_empty() && !(fits_count && fits_tokens) {
                batches.push(Batch {
                    questions: std::mem::take(&mut current),
                    estimated_tokens: running,
                });
                running = base_tokens;
            }

            running += q_tokens;
            current.push(q.clone());
        }

        if !current.is_empty() {
            batches.push(Batch {
                questions: current,
                estimated_tokens: running,
            });
        }

        debug!(
            "分批完成: {} 题 -> {} 批 {:?}",
            questions.len(),
            batches.len(),
            batches.iter().map(|b| b.len()).collect::<Vec<_>>()
        );

        Ok(batches)
    }

    /// 兜底：按题数定长分块，估算值统一取兜底常数
    fn plan_fixed_chunks(&self, questions: &[Question]) -> Vec<Batch> {
        questions
            .chunks(self.max_batch_size)
            .map(|chunk| Batch {
                questions: chunk.to_vec(),
                estimated_tokens: crate::services::token_estimator::FALLBACK_TOKENS,
            })
            .collect()
    }

    /// 把一个批次拆成单题批次（降级模式下使用）
    ///
    /// 每个单题批分摊原批次的估算值，避免重复承担整批成本。
    pub fn split_singletons(&self, batch: Batch) -> Vec<Batch> {
        let count = batch.len().max(1) as u32;
        let per_question = (batch.estimated_tokens / count).max(1);
        batch
            .questions
            .into_iter()
            .map(|q| Batch::singleton(q, per_question))
            .collect()
    }
}
