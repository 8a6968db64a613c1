//! # Quiz Answer Relay
//!
//! 浏览器扩展与多家 LLM 提供商之间的多租户中转层：
//! 接收一批答题题目（可带截图），切成提供商可接受的批次，
//! 经速率治理调用配置的 LLM，把形态各异的响应归一成规范的
//! 逐题答案，再通过轮询会话协议交回。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，单一能力，不关心流程
//! - `TokenEstimator` - token 成本估算
//! - `BatchPlanner` - 贪心分批
//! - `RateGovernor` - 滑动窗口预算 / 全局冷却 / 降级状态机
//! - `Dispatcher` - 单批派发（重试、错误分类、降级哨兵）
//! - `normalizer` / `AnswerValidator` - 响应归一化与题型形状校验
//! - `SessionManager` - 轮询会话存储
//! - `collaborators` - 外部协作者接口（凭据 / 报表 / 图片压缩）
//!
//! ### ② 流程层（Workflow）
//! - `workflow/` - 定义"一次答题请求"的完整处理流程
//! - `QuizCtx` - 运行上下文
//! - `QuizFlow` - 流程编排（分批 → 派发 → 归一 → 校验 → 组装）
//!
//! ### ③ 编排层（Orchestration）
//! - `orchestrator/app` - 应用门面，持有资源与后台任务
//!
//! ### ④ 接口层（API）
//! - `api/` - axum HTTP 薄层（会话 / 轮询 / 指标 / 管理）

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{RelayError, Result};
pub use models::{AnswerValue, Batch, NormalizedAnswer, PollReply, Question, QuestionKind};
pub use orchestrator::{App, StartQuizRequest};
pub use services::{
    AnswerValidator, BatchPlanner, Dispatcher, ProviderConfig, ProviderId, RateGovernor,
    RateGovernorConfig, SessionManager, TokenEstimator,
};
pub use workflow::{QuizCtx, QuizFlow};
