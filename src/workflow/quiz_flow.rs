//! 答题处理流程 - 流程层
//!
//! 核心职责：定义"一次答题请求"的完整处理流程
//!
//! 流程顺序：
//! 1. 分批（估算 token，按上限切批）
//! 2. 逐批派发（出队时复查降级，降级中把多题批拆成单题）
//! 3. 归一化答案过题型校验器
//! 4. 按原题号顺序组装，保证每题恰好一条
//!
//! 批次按计划顺序派发；降级哨兵返回的题目改排为单题批次并插到队列
//! **前端**（优先于尚未尝试的大批次），用顺序换更快的恢复。
//! 本层任何路径都不抛错——结果最差也是逐题 null。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{info, warn};

use crate::models::{Batch, NormalizedAnswer, Question};
use crate::services::dispatcher::{BatchDispatch, DispatchOutcome};
use crate::services::{AnswerValidator, BatchPlanner, ProviderConfig, RateGovernor};
use crate::workflow::quiz_ctx::QuizCtx;

/// 答题处理流程
///
/// - 编排完整的答题管线
/// - 不持有任何资源，只依赖业务能力（services）
/// - 经 [`BatchDispatch`] 接缝注入派发实现，测试可脚本化
pub struct QuizFlow<D: BatchDispatch> {
    planner: BatchPlanner,
    validator: AnswerValidator,
    dispatcher: D,
    governor: Arc<RateGovernor>,
}

impl<D: BatchDispatch> QuizFlow<D> {
    pub fn new(
        planner: BatchPlanner,
        validator: AnswerValidator,
        dispatcher: D,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            planner,
            validator,
            dispatcher,
            governor,
        }
    }

    /// 跑完一次答题请求，返回与输入题目等长、同序的答案列表
    pub async fn run(
        &self,
        ctx: &QuizCtx,
        questions: &[Question],
        image: Option<&str>,
        provider_cfg: &ProviderConfig,
        personalization: Option<&[String]>,
    ) -> Vec<NormalizedAnswer> {
        if questions.is_empty() {
            return Vec::new();
        }

        let batches = self.planner.plan(
            questions,
            &provider_cfg.model,
            &crate::services::providers::build_user_prompt(questions),
            image,
        );
        info!(
            "[用户 {}] 📦 {} 题分为 {} 批 (提供商 {:?})",
            ctx.user_id,
            questions.len(),
            batches.len(),
            ctx.provider
        );

        let mut queue: VecDeque<Batch> = batches.into();
        let mut collected: Vec<NormalizedAnswer> = Vec::new();
        let mut batch_index = 0usize;

        while let Some(batch) = queue.pop_front() {
            // 出队时复查降级：激活晚于分批的降级也要让待发多题批碎裂
            if batch.len() > 1 && self.governor.is_degraded().await {
                info!(
                    "[用户 {}] 降级模式生效，{} 题批次拆为单题",
                    ctx.user_id,
                    batch.len()
                );
                let singles = self.planner.split_singletons(batch);
                for single in singles.into_iter().rev() {
                    queue.push_front(single);
                }
                continue;
            }

            let outcome = self
                .dispatcher
                .dispatch(&batch, image, provider_cfg, batch_index, personalization)
                .await;
            batch_index += 1;

            match outcome {
                DispatchOutcome::Answers(answers) => {
                    collected.extend(answers);
                }
                DispatchOutcome::Degraded(degraded) => {
                    // 降级哨兵：单题批次插到队列前端，优先重发
                    warn!(
                        "[用户 {}] ⚠️ 批次被限流降级，{} 题改排单题并前插",
                        ctx.user_id,
                        degraded.len()
                    );
                    let requeued = self.planner.split_singletons(Batch {
                        questions: degraded,
                        estimated_tokens: batch.estimated_tokens,
                    });
                    for single in requeued.into_iter().rev() {
                        queue.push_front(single);
                    }
                }
            }
        }

        self.assemble(ctx, questions, collected)
    }

    /// 校验 + 按原题号顺序组装
    ///
    /// 不变量：输出与输入题目等长同序；重复条目取首见，缺失条目补 null。
    fn assemble(
        &self,
        ctx: &QuizCtx,
        questions: &[Question],
        collected: Vec<NormalizedAnswer>,
    ) -> Vec<NormalizedAnswer> {
        let by_number: HashMap<u32, &Question> =
            questions.iter().map(|q| (q.number, q)).collect();

        let mut validated: HashMap<u32, NormalizedAnswer> = HashMap::new();
        for answer in collected {
            let number = answer.question_number;
            let entry = match by_number.get(&number) {
                Some(q) => self.validator.validate(q, answer),
                None => continue, // 不在本次请求内的题号直接丢弃
            };
            validated.entry(number).or_insert(entry);
        }

        let answers: Vec<NormalizedAnswer> = questions
            .iter()
            .map(|q| {
                validated.remove(&q.number).unwrap_or_else(|| {
                    warn!("[用户 {}] 题 {} 无任何答案，补 null", ctx.user_id, q.number);
                    NormalizedAnswer::null_with_error(q.number, "missing from response")
                })
            })
            .collect();

        let answered = answers.iter().filter(|a| !a.answer.is_null()).count();
        info!(
            "[用户 {}] ✓ 答题完成: {}/{} 题有效",
            ctx.user_id,
            answered,
            answers.len()
        );
        answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::AnswerValue;
    use crate::services::providers::ProviderId;
    use crate::services::RateGovernorConfig;
    use std::future::Future;
    use std::sync::Mutex;

    fn questions(n: u32) -> Vec<Question> {
        (1..=n)
            .map(|i| Question {
                number: i,
                qtype: "shortanswer".to_string(),
                text: format!("Q{}", i),
                options: vec![],
                images: vec![],
                placeholders: vec![],
            })
            .collect()
    }

    fn provider_cfg() -> ProviderConfig {
        ProviderConfig {
            provider: Some(ProviderId::OpenAi),
            api_key: "test-key".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    fn ctx() -> QuizCtx {
        QuizCtx::new("u1", ProviderId::OpenAi, "gpt-4o-mini")
    }

    fn flow<D: BatchDispatch>(dispatcher: D) -> QuizFlow<D> {
        let config = Config::default();
        QuizFlow::new(
            BatchPlanner::new(config.max_batch_size, config.batch_token_ceiling),
            AnswerValidator::new(config.answer_max_len),
            dispatcher,
            Arc::new(RateGovernor::new(RateGovernorConfig::from(&config))),
        )
    }

    /// 记录批次大小并逐题回显答案
    struct EchoDispatch {
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl EchoDispatch {
        fn new() -> Self {
            Self {
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    impl BatchDispatch for EchoDispatch {
        fn dispatch(
            &self,
            batch: &Batch,
            _image: Option<&str>,
            _provider_cfg: &ProviderConfig,
            _batch_index: usize,
            _personalization: Option<&[String]>,
        ) -> impl Future<Output = DispatchOutcome> + Send {
            self.batch_sizes.lock().unwrap().push(batch.len());
            let answers: Vec<NormalizedAnswer> = batch
                .questions
                .iter()
                .map(|q| NormalizedAnswer {
                    question_number: q.number,
                    answer: AnswerValue::Text(format!("A{}", q.number)),
                    error: None,
                    shape_note: None,
                })
                .collect();
            async move { DispatchOutcome::Answers(answers) }
        }
    }

    /// 多题批次一律返回降级哨兵，单题批次正常应答
    struct DegradeMultiDispatch {
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl BatchDispatch for DegradeMultiDispatch {
        fn dispatch(
            &self,
            batch: &Batch,
            _image: Option<&str>,
            _provider_cfg: &ProviderConfig,
            _batch_index: usize,
            _personalization: Option<&[String]>,
        ) -> impl Future<Output = DispatchOutcome> + Send {
            self.batch_sizes.lock().unwrap().push(batch.len());
            let outcome = if batch.len() > 1 {
                DispatchOutcome::Degraded(batch.questions.clone())
            } else {
                DispatchOutcome::Answers(
                    batch
                        .questions
                        .iter()
                        .map(|q| NormalizedAnswer {
                            question_number: q.number,
                            answer: AnswerValue::Text("ok".to_string()),
                            error: None,
                            shape_note: None,
                        })
                        .collect(),
                )
            };
            async move { outcome }
        }
    }

    #[tokio::test]
    async fn test_seven_questions_all_answered_in_order() {
        let flow = flow(EchoDispatch::new());
        let qs = questions(7);

        let answers = flow.run(&ctx(), &qs, None, &provider_cfg(), None).await;

        assert_eq!(answers.len(), 7);
        let numbers: Vec<u32> = answers.iter().map(|a| a.question_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(flow.dispatcher.batch_sizes.lock().unwrap().clone(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_degraded_batches_requeue_as_singletons() {
        let flow = flow(DegradeMultiDispatch {
            batch_sizes: Mutex::new(Vec::new()),
        });
        let qs = questions(7);

        let answers = flow.run(&ctx(), &qs, None, &provider_cfg(), None).await;

        // 每题恰好一条，原序
        assert_eq!(answers.len(), 7);
        let numbers: Vec<u32> = answers.iter().map(|a| a.question_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7]);
        for a in &answers {
            assert!(!a.answer.is_null());
        }

        // 降级的批次以单题形式前插：首个多题批 [1,2,3] 之后紧跟其单题
        let sizes = flow.dispatcher.batch_sizes.lock().unwrap().clone();
        assert_eq!(sizes[0], 3);
        assert_eq!(&sizes[1..4], &[1, 1, 1]);
    }

    #[tokio::test]
    async fn test_active_degrade_splits_pending_batches_at_pop() {
        let flow = flow(EchoDispatch::new());
        // 分批之后、出队之前激活降级（模拟迟到的降级信号）
        flow.governor.on_rate_limit("429", true, true).await;

        let qs = questions(5);
        let answers = flow.run(&ctx(), &qs, None, &provider_cfg(), None).await;

        assert_eq!(answers.len(), 5);
        // 所有批次都应以单题派发
        let sizes = flow.dispatcher.batch_sizes.lock().unwrap().clone();
        assert_eq!(sizes, vec![1, 1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_missing_answers_filled_with_null() {
        /// 只回答奇数题
        struct OddOnlyDispatch;

        impl BatchDispatch for OddOnlyDispatch {
            fn dispatch(
                &self,
                batch: &Batch,
                _image: Option<&str>,
                _provider_cfg: &ProviderConfig,
                _batch_index: usize,
                _personalization: Option<&[String]>,
            ) -> impl Future<Output = DispatchOutcome> + Send {
                let answers: Vec<NormalizedAnswer> = batch
                    .questions
                    .iter()
                    .filter(|q| q.number % 2 == 1)
                    .map(|q| NormalizedAnswer {
                        question_number: q.number,
                        answer: AnswerValue::Text("odd".to_string()),
                        error: None,
                        shape_note: None,
                    })
                    .collect();
                async move { DispatchOutcome::Answers(answers) }
            }
        }

        let flow = flow(OddOnlyDispatch);
        let qs = questions(4);
        let answers = flow.run(&ctx(), &qs, None, &provider_cfg(), None).await;

        assert_eq!(answers.len(), 4);
        assert!(!answers[0].answer.is_null());
        assert!(answers[1].answer.is_null());
        assert!(answers[1].error.is_some());
        assert!(!answers[2].answer.is_null());
        assert!(answers[3].answer.is_null());
    }

    #[tokio::test]
    async fn test_empty_questions() {
        let flow = flow(EchoDispatch::new());
        let answers = flow.run(&ctx(), &[], None, &provider_cfg(), None).await;
        assert!(answers.is_empty());
    }
}
