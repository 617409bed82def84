use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result, codes};

/// 文件的一个分段：一条报文承载的连续字节区间。
///
/// # 契约说明（What）
/// - `id`：新闻组限定的报文标识，视为不透明 ASCII，不含尖括号；
/// - `bytes`：解码后的期望字节数；文件内的顺序由描述符分段列表的位置决定；
/// - `groups`：取回该报文时按序尝试的新闻组提示。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub bytes: u64,
    pub groups: Vec<String>,
}

impl Segment {
    /// 构造不带组提示的分段。
    pub fn new(id: impl Into<String>, bytes: u64) -> Self {
        Self {
            id: id.into(),
            bytes,
            groups: Vec::new(),
        }
    }
}

/// 描述符状态：整文件粒度的可用性结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Healthy,
    Partial,
    Corrupted,
}

/// 内容加密模式。
///
/// - `None`：分段解码结果即明文；
/// - `Rclone`：解码结果是 rclone 风格的分块加密流（64 KiB 块 + 认证标签），
///   读取时按块解密并丢弃前导冗余。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    None,
    Rclone,
}

/// 每文件描述符：把一条虚拟路径绑定到其分段清单与读取所需的全部元信息。
///
/// # 设计背景（Why）
/// - 描述符是虚拟文件系统的唯一事实来源：大小、分段顺序、加密参数与健康状态
///   全部内聚于一个记录，读路径不需要回查任何外部表；
/// - `size` 与分段字节和解耦：yEnc 载荷存在填充，末段允许超出声明大小。
///
/// # 不变式（Invariants）
/// - `Σ segments[i].bytes ≥ size`；
/// - 分段顺序即文件内字节顺序；
/// - `encryption == Rclone` 时 `password` 必须存在（`salt` 允许为空串派生）。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub size: u64,
    pub source_nzb_path: String,
    pub status: FileStatus,
    pub created_at: i64,
    pub release_date: Option<i64>,
    pub password: Option<String>,
    pub salt: Option<String>,
    pub encryption: Encryption,
    pub segments: Vec<Segment>,
    /// 磁盘格式的未知尾部字节，重写时原样保留以维持向后兼容。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trailing: Vec<u8>,
}

impl FileDescriptor {
    /// 分段字节总和。
    pub fn total_segment_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.bytes).sum()
    }

    /// 校验结构不变式；违反视为上游缺陷而不是可恢复错误。
    pub fn validate(&self) -> Result<()> {
        if self.size > 0 && self.segments.is_empty() {
            return Err(CoreError::new(
                codes::MALFORMED_DESCRIPTOR,
                "non-empty file without segments",
            ));
        }
        if self.total_segment_bytes() < self.size {
            return Err(CoreError::new(
                codes::MALFORMED_DESCRIPTOR,
                format!(
                    "segment bytes {} cover less than declared size {}",
                    self.total_segment_bytes(),
                    self.size
                ),
            ));
        }
        if self.encryption == Encryption::Rclone && self.password.is_none() {
            return Err(CoreError::new(
                codes::MALFORMED_DESCRIPTOR,
                "encrypted descriptor without password",
            ));
        }
        Ok(())
    }
}

/// 列目录返回的单个条目。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    /// 文件为描述符的 `created_at`；目录为其下所有描述符的最大 `created_at`。
    pub mtime: i64,
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(size: u64, segment_bytes: &[u64]) -> FileDescriptor {
        FileDescriptor {
            size,
            source_nzb_path: "/nzbs/a.nzb".into(),
            status: FileStatus::Healthy,
            created_at: 1_700_000_000,
            release_date: None,
            password: None,
            salt: None,
            encryption: Encryption::None,
            segments: segment_bytes
                .iter()
                .enumerate()
                .map(|(idx, bytes)| Segment::new(format!("seg{idx}@example"), *bytes))
                .collect(),
            trailing: Vec::new(),
        }
    }

    #[test]
    fn last_segment_may_overshoot_declared_size() {
        let d = descriptor(2_097_152, &[716_800, 716_800, 716_800]);
        assert!(d.validate().is_ok());
        assert!(d.total_segment_bytes() >= d.size);
    }

    #[test]
    fn undersized_segments_are_rejected() {
        let d = descriptor(2_097_152, &[716_800, 716_800]);
        assert_eq!(
            d.validate().unwrap_err().code(),
            codes::MALFORMED_DESCRIPTOR
        );
    }

    #[test]
    fn encrypted_descriptor_requires_password() {
        let mut d = descriptor(1024, &[1024]);
        d.encryption = Encryption::Rclone;
        assert!(d.validate().is_err());
        d.password = Some("hunter2".into());
        assert!(d.validate().is_ok());
    }
}
