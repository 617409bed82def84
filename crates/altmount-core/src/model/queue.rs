use core::fmt;

use serde::{Deserialize, Serialize};

/// 导入任务的优先级；数值越大越先被工作者认领。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    Normal,
    High,
}

impl QueuePriority {
    /// SQL 持久化用的整数表示。
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// 从整数恢复；未知值回退为 `Normal`。
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Low,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

/// 队列行的状态机。`Completed`/`Failed`/`Cancelled` 为终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// SQL 持久化用的字符串表示。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// 从持久化字符串恢复。
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// 是否终态：终态行才允许被同路径的重新入队刷新。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 导入队列中的一行。
///
/// # 不变式（Invariants）
/// - `nzb_path` 唯一：同路径重复入队是按键的 upsert；
/// - 任意时刻至多一个工作者观察到 `status == Running`；
/// - 进程崩溃后，启动清扫把遗留的 `Running` 行复位为 `Pending`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportQueueItem {
    pub id: i64,
    pub nzb_path: String,
    pub relative_path: Option<String>,
    pub category: Option<String>,
    pub priority: QueuePriority,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
    pub original_release_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roundtrip_and_unknown_fallback() {
        for p in [QueuePriority::Low, QueuePriority::Normal, QueuePriority::High] {
            assert_eq!(QueuePriority::from_i64(p.as_i64()), p);
        }
        assert_eq!(QueuePriority::from_i64(99), QueuePriority::Normal);
    }

    #[test]
    fn terminal_states_are_exactly_three() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Running.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            QueueStatus::Pending,
            QueueStatus::Running,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::Cancelled,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueStatus::parse("exploded"), None);
    }
}
