//! 会话管理服务 - 业务能力层
//!
//! 持有轮询取数协议的内存会话状态。会话在答案组装完成后创建，
//! 由扩展端逐条轮询消费；到达全局并发上限时创建失败（容量错误，
//! 唯一对外硬失败）。
//!
//! 过期策略双保险：读取时惰性过期 + 后台定时清扫（默认 5 分钟），
//! 无人轮询的会话也不会把内存越堆越高。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::models::{NormalizedAnswer, PollReply, Question, Session, SessionSummary};

/// 会话管理服务
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    max_sessions: usize,
    ttl: Duration,
    sweep_interval: Duration,
    total_created: AtomicU64,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: config.max_sessions,
            ttl: Duration::from_secs(config.session_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            total_created: AtomicU64::new(0),
        }
    }

    /// 创建会话
    ///
    /// `questions` 与 `answers` 必须平行同序。达到全局上限时返回容量错误。
    pub async fn create_session(
        &self,
        user_id: &str,
        questions: Vec<Question>,
        answers: Vec<NormalizedAnswer>,
    ) -> Result<String> {
        if questions.len() != answers.len() {
            return Err(RelayError::SessionCorrupt(format!(
                "questions ({}) 与 answers ({}) 不平行",
                questions.len(),
                answers.len()
            )));
        }

        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, s| !s.is_expired(now));

        if sessions.len() >= self.max_sessions {
            warn!("会话容量已满: {}/{}", sessions.len(), self.max_sessions);
            return Err(RelayError::Capacity {
                active: sessions.len(),
                max: self.max_sessions,
            });
        }

        let id = Uuid::new_v4().simple().to_string();
        let session = Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            questions,
            answers,
            current_index: 0,
            created_at: Utc::now(),
            expires_at: now + self.ttl,
            last_access: now,
        };

        info!(
            "✓ 会话创建: {} (用户 {}, {} 题, 活跃 {}/{})",
            id,
            user_id,
            session.questions.len(),
            sessions.len() + 1,
            self.max_sessions
        );
        sessions.insert(id.clone(), session);
        self.total_created.fetch_add(1, Ordering::Relaxed);

        Ok(id)
    }

    /// 取下一条未消费的答案指令（`current_index` 单调前进）
    ///
    /// 全部消费完返回完成信号；会话缺失/过期或题目缺失返回错误。
    pub async fn next_command(&self, id: &str) -> Result<PollReply> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();

        // 读取时惰性过期
        if sessions.get(id).map(|s| s.is_expired(now)).unwrap_or(false) {
            sessions.remove(id);
            debug!("会话 {} 已过期（惰性清理）", id);
        }

        let session = sessions.get_mut(id).ok_or_else(|| RelayError::SessionNotFound {
            id: id.to_string(),
        })?;
        session.last_access = now;

        if session.is_drained() {
            return Ok(PollReply::Completed);
        }

        let idx = session.current_index;
        let answer = session
            .answers
            .get(idx)
            .cloned()
            .ok_or_else(|| RelayError::SessionCorrupt(format!("答案 {} 缺失", idx)))?;
        let question = session
            .questions
            .get(idx)
            .ok_or_else(|| RelayError::SessionCorrupt(format!("题目 {} 缺失", idx)))?;

        let reply = PollReply::Command {
            number: question.number,
            qtype: question.qtype.clone(),
            selected_answer: answer.answer,
            error: answer.error,
        };
        session.current_index += 1;

        Ok(reply)
    }

    /// 管理接口：列出活跃会话摘要
    pub async fn list_summaries(&self) -> Vec<SessionSummary> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, s| !s.is_expired(now));
        sessions.values().map(SessionSummary::from).collect()
    }

    /// 管理接口：删除会话
    pub async fn delete_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id).is_some();
        if removed {
            info!("会话 {} 已删除", id);
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, s| !s.is_expired(now));
        sessions.len()
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    /// 启动后台清扫任务：定期移除已过期会话，约束内存增长
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(manager.sweep_interval);
            ticker.tick().await; // 第一个 tick 立即返回，跳过
            loop {
                ticker.tick().await;
                let mut sessions = manager.sessions.lock().await;
                let now = Instant::now();
                let before = sessions.len();
                sessions.retain(|_, s| !s.is_expired(now));
                let swept = before - sessions.len();
                if swept > 0 {
                    info!("🧹 清扫过期会话: {} 个 (剩余 {})", swept, sessions.len());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnswerValue;

    fn config(max_sessions: usize, ttl_secs: u64) -> Config {
        Config {
            max_sessions,
            session_ttl_secs: ttl_secs,
            sweep_interval_secs: 300,
            ..Config::default()
        }
    }

    fn qa(n: u32) -> (Vec<Question>, Vec<NormalizedAnswer>) {
        let questions: Vec<Question> = (1..=n)
            .map(|i| Question {
                number: i,
                qtype: "radio".to_string(),
                text: format!("Q{}", i),
                options: vec![],
                images: vec![],
                placeholders: vec![],
            })
            .collect();
        let answers = questions
            .iter()
            .map(|q| NormalizedAnswer {
                question_number: q.number,
                answer: AnswerValue::Text(format!("A{}", q.number)),
                error: None,
                shape_note: None,
            })
            .collect();
        (questions, answers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_error_at_limit() {
        let manager = SessionManager::new(&config(2, 600));

        let (q, a) = qa(1);
        manager.create_session("u1", q.clone(), a.clone()).await.unwrap();
        manager.create_session("u2", q.clone(), a.clone()).await.unwrap();

        let err = manager.create_session("u3", q, a).await.unwrap_err();
        assert!(matches!(err, RelayError::Capacity { active: 2, max: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_consumes_in_order_then_completes() {
        let manager = SessionManager::new(&config(10, 600));
        let (q, a) = qa(2);
        let id = manager.create_session("u", q, a).await.unwrap();

        match manager.next_command(&id).await.unwrap() {
            PollReply::Command { number, .. } => assert_eq!(number, 1),
            other => panic!("期望 Command，得到 {:?}", other),
        }
        match manager.next_command(&id).await.unwrap() {
            PollReply::Command { number, .. } => assert_eq!(number, 2),
            other => panic!("期望 Command，得到 {:?}", other),
        }
        // 消费完毕后是完成信号，不是错误
        assert!(matches!(
            manager.next_command(&id).await.unwrap(),
            PollReply::Completed
        ));
        assert!(matches!(
            manager.next_command(&id).await.unwrap(),
            PollReply::Completed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_read() {
        let manager = SessionManager::new(&config(10, 60));
        let (q, a) = qa(1);
        let id = manager.create_session("u", q, a).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let err = manager.next_command(&id).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sessions_free_capacity() {
        let manager = SessionManager::new(&config(1, 60));
        let (q, a) = qa(1);
        manager.create_session("u1", q.clone(), a.clone()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        // 过期会话不再占用容量
        manager.create_session("u2", q, a).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_parallel_arrays_rejected() {
        let manager = SessionManager::new(&config(10, 600));
        let (q, _) = qa(2);
        let (_, a) = qa(1);
        let err = manager.create_session("u", q, a).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionCorrupt(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_session() {
        let manager = SessionManager::new(&config(10, 600));
        let (q, a) = qa(1);
        let id = manager.create_session("u", q, a).await.unwrap();

        assert!(manager.delete_session(&id).await);
        assert!(!manager.delete_session(&id).await);
        assert_eq!(manager.active_count().await, 0);
    }
}
