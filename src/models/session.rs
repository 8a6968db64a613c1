//! 会话数据模型
//!
//! 会话为一次答题运行的服务端状态，由轮询协议顺序消费。
//! 状态机：Active → Expired | Deleted（终态）。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::question::{AnswerValue, NormalizedAnswer, Question};

/// 会话
///
/// `questions` 与 `answers` 平行且同序；`current_index` 只会单调前进
/// （单消费者假设，见并发模型）。
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub questions: Vec<Question>,
    pub answers: Vec<NormalizedAnswer>,
    pub current_index: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub last_access: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// 是否所有答案都已被消费
    pub fn is_drained(&self) -> bool {
        self.current_index >= self.answers.len()
    }
}

/// 轮询应答：下一条指令或完成信号
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollReply {
    /// 下一条未消费的答案指令
    Command {
        number: u32,
        #[serde(rename = "type")]
        qtype: String,
        selected_answer: AnswerValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 所有答案均已消费
    Completed,
}

/// 管理接口用的会话摘要
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub question_count: usize,
    pub current_index: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            question_count: s.questions.len(),
            current_index: s.current_index,
            created_at: s.created_at,
        }
    }
}
