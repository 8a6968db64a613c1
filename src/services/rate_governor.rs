//! 速率治理服务 - 业务能力层
//!
//! 进程级的出站调用节流器，三个机制协同：
//!
//! 1. **Token 预算门控**：滑动 60 秒窗口记录已花费的估算 token。
//!    进入近限带且本次会超预算时阻塞等待；近限带内未超预算则放行，
//!    但在请求完成后安排一次固定后延。
//! 2. **全局冷却**：所有派发共享一个"下次允许时刻"。429 时按
//!    retry-after 提示（缺省 3 秒）乘增长系数重排冷却，并夹在
//!    [下限, 上限] 之间。
//! 3. **降级模式**：多题批次首次尝试即 429 时激活，60 秒窗口内
//!    后续批次拆成单题；连续 5 次成功或窗口到期即恢复。
//!
//! 状态机（进程级，非会话级）：`Normal ⇄ Degraded`。
//!
//! ## 并发
//!
//! 窗口、冷却时刻、降级标志全部在一把异步互斥锁之后；`admit` 在持锁
//! 状态下完成"检查 + 等待"，同一时刻只有一个临界区在途，避免两个并发
//! 派发基于过期的 token 计数同时判定"可以放行"。
//!
//! 作为可注入的服务对象而非模块级单例，测试可以按用例实例化隔离的
//! 治理器。

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;

/// 滑动窗口长度
const WINDOW: Duration = Duration::from_secs(60);

/// 速率治理配置
#[derive(Debug, Clone)]
pub struct RateGovernorConfig {
    pub token_limit: u32,
    pub near_threshold: u32,
    pub pre_wait: Duration,
    pub post_delay: Duration,
    pub cooldown_default_secs: f64,
    pub cooldown_growth: f64,
    pub cooldown_aggressive_growth: f64,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    pub degrade_window: Duration,
    pub degrade_success_threshold: u32,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RateGovernorConfig {
    fn from(c: &Config) -> Self {
        Self {
            token_limit: c.token_limit_per_minute,
            near_threshold: c.near_threshold,
            pre_wait: Duration::from_millis(c.pre_wait_ms),
            post_delay: Duration::from_millis(c.post_delay_ms),
            cooldown_default_secs: c.cooldown_default_secs,
            cooldown_growth: c.cooldown_growth,
            cooldown_aggressive_growth: c.cooldown_aggressive_growth,
            cooldown_min: Duration::from_millis(c.cooldown_min_ms),
            cooldown_max: Duration::from_millis(c.cooldown_max_ms),
            degrade_window: Duration::from_secs(c.degrade_window_secs),
            degrade_success_threshold: c.degrade_success_threshold,
        }
    }
}

/// 窗口条目：某一时刻登记的 token 花费
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: Instant,
    tokens: u32,
}

/// 互斥锁保护的共享状态
#[derive(Debug)]
struct GovernorState {
    window: VecDeque<WindowEntry>,
    next_allowed: Instant,
    degrade_until: Option<Instant>,
    consecutive_failures: u32,
    successes_since_degrade: u32,
}

impl GovernorState {
    /// 剔除 60 秒前的条目；窗口总和超过 3 倍预算视为脏数据并清空
    fn prune(&mut self, now: Instant, limit: u32) {
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let sum = self.window_sum();
        if sum > limit.saturating_mul(3) {
            warn!("速率窗口总和 {} 超过 3 倍预算，视为脏数据并重置", sum);
            self.window.clear();
        }
    }

    fn window_sum(&self) -> u32 {
        self.window.iter().map(|e| e.tokens).sum()
    }

    /// 窗口完全清空所需的等待时长
    fn window_reset_wait(&self, now: Instant) -> Duration {
        match self.window.back() {
            Some(newest) => WINDOW.saturating_sub(now.duration_since(newest.at)),
            None => Duration::ZERO,
        }
    }
}

/// 放行凭据
///
/// `post_delay` 为真表示近限带内放行，请求完成后需要调用
/// [`RateGovernor::apply_post_delay`] 安排固定后延。
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub post_delay: bool,
}

/// 速率状态快照（指标接口）
#[derive(Debug, Clone, Serialize)]
pub struct RateUsage {
    pub used_tokens: u32,
    pub token_limit: u32,
    pub remaining_tokens: u32,
    pub consecutive_failures: u32,
    pub degrade_active: bool,
    pub degrade_remaining_secs: u64,
    pub cooldown_remaining_ms: u64,
}

/// 速率治理服务
#[derive(Debug)]
pub struct RateGovernor {
    cfg: RateGovernorConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(cfg: RateGovernorConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(GovernorState {
                window: VecDeque::new(),
                next_allowed: Instant::now(),
                degrade_until: None,
                consecutive_failures: 0,
                successes_since_degrade: 0,
            }),
        }
    }

    /// 门控：等全局冷却，再按预算决策表放行
    ///
    /// 决策表（以配置的近限带为准）：
    /// - `used < limit - near`：直接放行，无延迟
    /// - 带内且 `used + estimated > limit`：阻塞——已达/超预算且窗口清空
    ///   比固定预等待更快时等窗口清空，否则等固定预等待（2.2s）
    /// - 带内但不会超预算：立即放行，请求完成后安排固定后延（2s）
    pub async fn admit(&self, estimated_tokens: u32) -> Admission {
        let mut st = self.state.lock().await;

        // 全局冷却：每次派发都要等过"下次允许时刻"
        let now = Instant::now();
        if st.next_allowed > now {
            let wait = st.next_allowed - now;
            debug!("等待全局冷却 {:?}", wait);
            sleep_until(st.next_allowed).await;
        }

        let now = Instant::now();
        st.prune(now, self.cfg.token_limit);
        let used = st.window_sum();
        let limit = self.cfg.token_limit;
        let near_floor = limit.saturating_sub(self.cfg.near_threshold);

        let mut post_delay = false;

        if used >= near_floor {
            if used + estimated_tokens > limit {
                // 会超预算：阻塞等待
                let wait = if used >= limit {
                    let reset = st.window_reset_wait(now);
                    if reset < self.cfg.pre_wait {
                        reset
                    } else {
                        self.cfg.pre_wait
                    }
                } else {
                    self.cfg.pre_wait
                };
                info!(
                    "token 预算临界 (已用 {}/{}，本次约 {})，预等待 {:?}",
                    used, limit, estimated_tokens, wait
                );
                sleep(wait).await;
                st.prune(Instant::now(), self.cfg.token_limit);
            } else {
                // 近限但不超：放行，完成后再压一拍
                debug!("token 预算近限 (已用 {}/{})，安排请求后延", used, limit);
                post_delay = true;
            }
        }

        Admission { post_delay }
    }

    /// 近限带放行的请求完成后调用：把下次允许时刻推后固定后延
    pub async fn apply_post_delay(&self) {
        let mut st = self.state.lock().await;
        let candidate = Instant::now() + self.cfg.post_delay;
        if candidate > st.next_allowed {
            st.next_allowed = candidate;
        }
    }

    /// 登记一次成功派发
    ///
    /// 只有成功才计入窗口（429 不登记，避免幻影成本）。
    /// 降级中则累计成功数，达到阈值立即恢复。
    pub async fn on_success(&self, estimated_tokens: u32) {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.prune(now, self.cfg.token_limit);
        st.window.push_back(WindowEntry {
            at: now,
            tokens: estimated_tokens,
        });
        st.consecutive_failures = 0;

        if st.degrade_until.is_some() {
            st.successes_since_degrade += 1;
            if st.successes_since_degrade >= self.cfg.degrade_success_threshold {
                info!(
                    "降级模式恢复: 连续 {} 次成功",
                    st.successes_since_degrade
                );
                st.degrade_until = None;
                st.successes_since_degrade = 0;
            }
        }
    }

    /// 登记一次 429
    ///
    /// 重排全局冷却；多题批次的首次尝试失败时激活降级并返回 true，
    /// 调用方据此把批内题目改排为单题批次而不是原样重试。
    pub async fn on_rate_limit(
        &self,
        error_text: &str,
        first_attempt: bool,
        multi_question: bool,
    ) -> bool {
        let mut st = self.state.lock().await;
        let now = Instant::now();

        let hint_secs = parse_retry_after_hint(error_text).unwrap_or(self.cfg.cooldown_default_secs);
        let growth = if first_attempt {
            self.cfg.cooldown_aggressive_growth
        } else {
            self.cfg.cooldown_growth
        };
        let multiplier = (st.consecutive_failures + 1) as f64 * growth;
        st.consecutive_failures += 1;

        let cooldown = Duration::from_secs_f64(hint_secs * multiplier)
            .clamp(self.cfg.cooldown_min, self.cfg.cooldown_max);
        let candidate = now + cooldown;
        if candidate > st.next_allowed {
            st.next_allowed = candidate;
        }
        warn!(
            "429 限流 (连续 {} 次)，冷却 {:?}: {}",
            st.consecutive_failures,
            cooldown,
            crate::utils::logging::truncate_text(error_text, 120)
        );

        if first_attempt && multi_question {
            if st.degrade_until.is_none() {
                st.degrade_until = Some(now + self.cfg.degrade_window);
                st.successes_since_degrade = 0;
                warn!(
                    "激活降级模式 {:?}: 多题批次首次尝试即被限流，改为单题派发",
                    self.cfg.degrade_window
                );
            }
            // 降级已生效时在途的多题批次同样改排单题，不原样重试
            return true;
        }
        false
    }

    /// 当前是否处于降级模式（窗口到期则惰性恢复）
    pub async fn is_degraded(&self) -> bool {
        let mut st = self.state.lock().await;
        match st.degrade_until {
            Some(until) if Instant::now() >= until => {
                info!("降级窗口到期，恢复正常分批");
                st.degrade_until = None;
                st.successes_since_degrade = 0;
                st.consecutive_failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// 窗口完全清空还需等待的时长（单题批次连续限流时整窗等待用）
    pub async fn remaining_window_wait(&self) -> Duration {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.prune(now, self.cfg.token_limit);
        st.window_reset_wait(now)
    }

    /// 速率状态快照
    pub async fn usage(&self) -> RateUsage {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.prune(now, self.cfg.token_limit);
        let used = st.window_sum();
        let degrade_remaining = st
            .degrade_until
            .map(|u| u.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        RateUsage {
            used_tokens: used,
            token_limit: self.cfg.token_limit,
            remaining_tokens: self.cfg.token_limit.saturating_sub(used),
            consecutive_failures: st.consecutive_failures,
            degrade_active: st.degrade_until.is_some(),
            degrade_remaining_secs: degrade_remaining.as_secs(),
            cooldown_remaining_ms: st
                .next_allowed
                .saturating_duration_since(now)
                .as_millis() as u64,
        }
    }
}

/// 从错误文本解析 retry-after 提示（秒）
///
/// 兼容 `Retry-After: 7`、`"retryDelay": "3s"`、`try again in 20s` 等写法。
fn parse_retry_after_hint(text: &str) -> Option<f64> {
    static AFTER: OnceLock<Regex> = OnceLock::new();
    static AGAIN: OnceLock<Regex> = OnceLock::new();

    let after = AFTER.get_or_init(|| {
        Regex::new(r"(?i)retry[\s_-]*(?:after|delay)[^0-9]{0,10}([0-9]+(?:\.[0-9]+)?)").unwrap()
    });
    let again = AGAIN.get_or_init(|| {
        Regex::new(r"(?i)try again in[^0-9]{0,5}([0-9]+(?:\.[0-9]+)?)\s*s").unwrap()
    });

    for re in [after, again] {
        if let Some(caps) = re.captures(text) {
            if let Ok(secs) = caps[1].parse::<f64>() {
                if secs > 0.0 {
                    return Some(secs);
                }
            }
        }
    }
    None
}
