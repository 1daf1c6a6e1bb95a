//! 协议层配置
//!
//! 分块大小对应 libvirt 对单条 Guest Agent 消息的长度限制，不是性能调优参数。

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::trace;

use crate::{AgentError, Result};

/// 每次 guest-file-write 的最大 Base64 字符数
pub const WRITE_CHUNK_CHARS: usize = 131072;

/// 每次 guest-file-read 请求的字节数
pub const READ_CHUNK_BYTES: usize = 131072;

/// libvirt 单条 Agent 消息的长度上限
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

/// Guest Agent 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 写入分块（Base64 字符数），必须是 4 的倍数
    #[serde(default = "default_write_chunk_chars")]
    pub write_chunk_chars: usize,

    /// 读取分块（字节数）
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// 轮询策略（进程退出、Agent 上线）
    #[serde(default)]
    pub poll: PollPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            write_chunk_chars: default_write_chunk_chars(),
            read_chunk_bytes: default_read_chunk_bytes(),
            poll: PollPolicy::default(),
        }
    }
}

impl AgentConfig {
    /// 校验分块大小
    pub fn validate(&self) -> Result<()> {
        if self.write_chunk_chars == 0 || self.write_chunk_chars % 4 != 0 {
            return Err(AgentError::Config(format!(
                "write_chunk_chars 必须是 4 的正整数倍: {}",
                self.write_chunk_chars
            )));
        }
        if self.write_chunk_chars >= MAX_MESSAGE_LEN {
            return Err(AgentError::Config(format!(
                "write_chunk_chars 超出消息上限 {}: {}",
                MAX_MESSAGE_LEN, self.write_chunk_chars
            )));
        }
        // 读取结果经 Base64 编码后返回，长度约为原始字节的 4/3
        if self.read_chunk_bytes == 0 || self.read_chunk_bytes.saturating_mul(4) / 3 >= MAX_MESSAGE_LEN {
            return Err(AgentError::Config(format!(
                "read_chunk_bytes 无效: {}",
                self.read_chunk_bytes
            )));
        }
        if self.poll.max_attempts == 0 {
            return Err(AgentError::Config("poll.max_attempts 不能为 0".to_string()));
        }
        Ok(())
    }
}

/// 有界轮询策略
///
/// 第 n 次尝试失败后等待 `min(initial_delay * backoff_multiplier^n, max_delay)`，
/// 达到 `max_attempts` 后返回 [`AgentError::Timeout`]。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// 最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 初始间隔
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// 最大间隔
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// 退避倍数
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl PollPolicy {
    /// 不等待、只限制次数的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// 计算第 `attempt` 次尝试之后的等待时间（指数退避）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;

        // 超过上限的有限值也可能超出 Duration 的表示范围，先与上限比较再转换
        if !delay.is_finite() || delay < 0.0 || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }

    /// 反复执行 `check` 直到返回 `Some`
    ///
    /// `check` 的错误直接返回；最后一次尝试之后不再等待。
    pub fn poll<T, F>(&self, operation: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        for attempt in 0..self.max_attempts {
            if let Some(value) = check()? {
                return Ok(value);
            }

            if attempt + 1 < self.max_attempts {
                let delay = self.calculate_delay(attempt);
                trace!(operation, attempt, ?delay, "轮询未完成，等待后重试");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }

        Err(AgentError::Timeout {
            operation: operation.to_string(),
            attempts: self.max_attempts,
        })
    }
}

// 默认值函数
fn default_write_chunk_chars() -> usize {
    WRITE_CHUNK_CHARS
}

fn default_read_chunk_bytes() -> usize {
    READ_CHUNK_BYTES
}

fn default_max_attempts() -> u32 {
    1800
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
