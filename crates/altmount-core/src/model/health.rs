use core::fmt;

use serde::{Deserialize, Serialize};

/// 健康记录的状态机。
///
/// # 契约说明（What）
/// - `Pending`：等待下一次检查；
/// - `Checking`：检查在途的瞬态标记，崩溃恢复时清回 `Pending`；
/// - `RepairTriggered`：缺段重试耗尽，已委托外部媒体管理重新获取；
/// - `Corrupted`：修复重试也已耗尽的终态，不再自动复查；
/// - `Healthy`：最近一次抽样全部命中。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Pending,
    RepairTriggered,
    Corrupted,
    Checking,
}

impl HealthStatus {
    /// SQL 持久化用的字符串表示。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Pending => "pending",
            Self::RepairTriggered => "repair_triggered",
            Self::Corrupted => "corrupted",
            Self::Checking => "checking",
        }
    }

    /// 从持久化字符串恢复。
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "healthy" => Self::Healthy,
            "pending" => Self::Pending,
            "repair_triggered" => Self::RepairTriggered,
            "corrupted" => Self::Corrupted,
            "checking" => Self::Checking,
            _ => return None,
        })
    }

    /// 终态不再被调度器自动复查。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Corrupted)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个虚拟文件的健康记录。
///
/// # 不变式（Invariants）
/// - 每条 `file_path` 至多一条记录；
/// - `scheduled_check_at` 在每次状态迁移时单调推进；
/// - 同一 `file_path` 不允许并发检查（由调度器的在途守卫保证）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthRecord {
    pub file_path: String,
    pub library_path: Option<String>,
    pub status: HealthStatus,
    pub last_checked: Option<i64>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub repair_retry_count: u32,
    pub max_repair_retries: u32,
    pub source_nzb_path: Option<String>,
    pub error_details: Option<String>,
    pub release_date: Option<i64>,
    pub scheduled_check_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl HealthRecord {
    /// 以缺省计数器创建一条待检记录。
    pub fn pending(
        file_path: impl Into<String>,
        release_date: Option<i64>,
        max_retries: u32,
        max_repair_retries: u32,
        now: i64,
        scheduled_check_at: i64,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            library_path: None,
            status: HealthStatus::Pending,
            last_checked: None,
            last_error: None,
            retry_count: 0,
            max_retries,
            repair_retry_count: 0,
            max_repair_retries,
            source_nzb_path: None,
            error_details: None,
            release_date,
            scheduled_check_at,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            HealthStatus::Healthy,
            HealthStatus::Pending,
            HealthStatus::RepairTriggered,
            HealthStatus::Corrupted,
            HealthStatus::Checking,
        ] {
            assert_eq!(HealthStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn only_corrupted_is_terminal() {
        assert!(HealthStatus::Corrupted.is_terminal());
        assert!(!HealthStatus::RepairTriggered.is_terminal());
        assert!(!HealthStatus::Healthy.is_terminal());
    }
}
