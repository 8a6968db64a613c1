//! 应用门面 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：构建各业务能力服务，注入外部协作者，启动后台清扫
//! 2. **答题入口**：鉴权 → 容量预检 → 图片压缩 → 流程层跑管线 → 建会话
//! 3. **轮询/指标/管理**：转发到会话管理器与速率治理器的快照
//! 4. **资源所有者**：唯一持有各服务 Arc 的模块
//!
//! 速率治理状态是进程级共享的（不按用户/密钥分片），
//! 某个用户的重负载会影响其他会话的节奏——这是刻意的简化。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::models::{PollReply, Question, SessionSummary};
use crate::services::collaborators::{
    CredentialLookup, ImageShrinker, MemoryReportStore, PassthroughShrinker, ReportStore,
    StaticCredentials,
};
use crate::services::{
    AnswerValidator, BatchPlanner, Dispatcher, RateGovernor, RateGovernorConfig, RateUsage,
    SessionManager,
};
use crate::workflow::{QuizCtx, QuizFlow};

/// 答题开始请求
#[derive(Debug, Deserialize)]
pub struct StartQuizRequest {
    pub questions: Vec<Question>,
    #[serde(default)]
    pub screenshot_image: Option<String>,
    pub provider_config: crate::services::ProviderConfig,
    #[serde(default)]
    pub personalization: Option<Vec<String>>,
}

/// 指标快照
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub rate: RateUsage,
    pub uptime_secs: u64,
    /// 进程常驻内存（KiB），读不到时为 None
    pub process_rss_kib: Option<u64>,
}

/// 应用主结构
pub struct App {
    config: Config,
    sessions: Arc<SessionManager>,
    governor: Arc<RateGovernor>,
    flow: QuizFlow<Dispatcher>,
    credentials: Arc<dyn CredentialLookup>,
    reports: Arc<dyn ReportStore>,
    shrinker: Arc<dyn ImageShrinker>,
    started_at: Instant,
}

impl App {
    /// 初始化应用（默认协作者：内存凭据表 / 内存报表 / 透传压缩）
    pub fn initialize(config: Config) -> Arc<Self> {
        let credentials: Arc<dyn CredentialLookup> = Arc::new(
            StaticCredentials::new().with_user(
                "dev-token",
                crate::services::collaborators::UserRecord {
                    id: "dev".to_string(),
                    name: "dev".to_string(),
                },
            ),
        );
        Self::with_collaborators(
            config,
            credentials,
            Arc::new(MemoryReportStore::new()),
            Arc::new(PassthroughShrinker),
        )
    }

    /// 注入外部协作者的初始化入口
    pub fn with_collaborators(
        config: Config,
        credentials: Arc<dyn CredentialLookup>,
        reports: Arc<dyn ReportStore>,
        shrinker: Arc<dyn ImageShrinker>,
    ) -> Arc<Self> {
        let governor = Arc::new(RateGovernor::new(RateGovernorConfig::from(&config)));
        let sessions = Arc::new(SessionManager::new(&config));
        let flow = QuizFlow::new(
            BatchPlanner::new(config.max_batch_size, config.batch_token_ceiling),
            AnswerValidator::new(config.answer_max_len),
            Dispatcher::new(&config, governor.clone()),
            governor.clone(),
        );

        sessions.spawn_sweeper();

        info!("{}", "=".repeat(60));
        info!("🚀 答题中转服务启动");
        info!(
            "📊 会话上限: {}, token 预算: {}/分钟, 批大小: {}",
            config.max_sessions, config.token_limit_per_minute, config.max_batch_size
        );
        info!("{}", "=".repeat(60));

        Arc::new(Self {
            config,
            sessions,
            governor,
            flow,
            credentials,
            reports,
            shrinker,
            started_at: Instant::now(),
        })
    }

    /// 一次答题运行：鉴权 → 容量预检 → 管线 → 建会话
    ///
    /// 容量是唯一的硬失败；管线内部一切异常都已降级为逐题 null。
    pub async fn start_quiz(&self, token: &str, req: StartQuizRequest) -> Result<String> {
        let user = self
            .credentials
            .lookup(token)
            .ok_or(RelayError::Unauthorized)?;

        // 容量预检：上限已满就别浪费一轮 LLM 调用
        let active = self.sessions.active_count().await;
        if active >= self.config.max_sessions {
            return Err(RelayError::Capacity {
                active,
                max: self.config.max_sessions,
            });
        }

        // 超限截图交给压缩协作者
        let image = req.screenshot_image.map(|img| {
            if img.len() > self.config.image_shrink_threshold_bytes {
                self.shrinker.shrink(&img)
            } else {
                img
            }
        });

        let provider = req.provider_config.resolved_provider();
        let ctx = QuizCtx::new(&user.id, provider, &req.provider_config.model);

        let answers = self
            .flow
            .run(
                &ctx,
                &req.questions,
                image.as_deref(),
                &req.provider_config,
                req.personalization.as_deref(),
            )
            .await;

        let session_id = self
            .sessions
            .create_session(&user.id, req.questions, answers)
            .await?;

        self.reports.create(
            &session_id,
            json!({
                "user_id": user.id,
                "model": ctx.model,
                "created_at": chrono::Utc::now().to_rfc3339(),
            }),
        );

        Ok(session_id)
    }

    /// 轮询下一条指令
    pub async fn poll(&self, session_id: &str) -> Result<PollReply> {
        self.sessions.next_command(session_id).await
    }

    /// 只读指标快照
    pub async fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.sessions.active_count().await,
            total_sessions: self.sessions.total_created(),
            rate: self.governor.usage().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
            process_rss_kib: read_process_rss_kib(),
        }
    }

    /// 管理接口：列出会话
    pub async fn admin_list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list_summaries().await
    }

    /// 管理接口：删除会话
    pub async fn admin_delete_session(&self, id: &str) -> bool {
        self.sessions.delete_session(id).await
    }

    /// 管理接口共享密钥校验
    pub fn check_admin_secret(&self, secret: &str) -> bool {
        !secret.is_empty() && secret == self.config.admin_secret
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// 读 /proc/self/statm 的常驻页数（仅 Linux，失败返回 None）
fn read_process_rss_kib() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4)
}
