use std::sync::Arc;

use async_trait::async_trait;

use crate::contract::CallContext;
use crate::error::Result;
use crate::model::{DirEntry, FileDescriptor, FileStatus, HealthRecord, VirtualPath};

/// 解码载荷的接收端：`ArticleSource::body` 把线序字节推入该接口。
///
/// # 契约说明（What）
/// - `write` 按文件内顺序被调用，每次携带一段已解码字节；
/// - 返回错误会中止本次取回并向调用方传播；
/// - 实现无须线程安全，单次请求内只有一个生产者。
pub trait BodySink: Send {
    /// 接收一段解码后的载荷。
    fn write(&mut self, chunk: &[u8]) -> Result<()>;
}

impl BodySink for Vec<u8> {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// 单篇报文的编码头摘要，导入器用它恢复真实文件名与大小。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArticleProbe {
    /// 编码头里声明的文件名。
    pub name: Option<String>,
    /// 本分段声明的载荷字节数。
    pub declared_part_size: Option<u64>,
    /// 多分段文件声明的整文件大小。
    pub declared_total_size: Option<u64>,
    /// 实际解码得到的载荷字节数。
    pub payload_len: u64,
}

/// 报文来源能力：连接池对上层暴露的唯一接口。
///
/// # 设计背景（Why）
/// - 虚拟文件系统、导入探测与健康检查只需要“取正文”“探活”“探头”三个动作；
///   以能力接口为界，上层既可接真实连接池，也可在测试中注入脚本化桩。
///
/// # 契约说明（What）
/// - `body`：对给定报文标识与组提示的有序偏好取回解码正文，流式写入 `sink`，
///   返回写入的载荷字节数；报文在所有提供方都缺失时以
///   `nntp.provider_exhausted` 失败；
/// - `stat`：只探测可用性不传输正文；`Ok(false)` 表示确定性缺失；
/// - `probe`：取回并解码一篇报文但只返回编码头摘要，载荷被丢弃；
/// - 三者都必须尊重 `ctx` 的取消与截止语义。
#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn body(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
        sink: &mut dyn BodySink,
    ) -> Result<u64>;

    async fn stat(&self, ctx: &CallContext, article: &str, groups: &[String]) -> Result<bool>;

    async fn probe(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
    ) -> Result<ArticleProbe>;
}

/// 描述符存储能力：内容寻址的每文件元数据。
///
/// # 契约说明（What）
/// - `write` 原子替换：读者要么看到前像要么看到后像；
/// - `read` 对缺失路径返回 `meta.not_found`；
/// - `list` 枚举直接子项：挂描述符的是文件，其下存在描述符的前缀是目录；
/// - `update_status` 只改状态位，不重写分段清单的语义内容。
pub trait DescriptorStore: Send + Sync {
    fn write(&self, path: &VirtualPath, descriptor: &FileDescriptor) -> Result<()>;

    fn read(&self, path: &VirtualPath) -> Result<Arc<FileDescriptor>>;

    fn delete(&self, path: &VirtualPath) -> Result<()>;

    fn list(&self, prefix: &VirtualPath) -> Result<Vec<DirEntry>>;

    fn update_status(&self, path: &VirtualPath, status: FileStatus) -> Result<()>;
}

/// 健康登记能力：导入与读路径向健康子系统暴露事实的窄接口。
///
/// # 设计背景（Why）
/// - 导入器、调度器与连接池之间存在间接环（导入登记健康，健康探测连接，
///   读失败又要反馈健康）；以小能力接口切开环，装配只在组合根发生一次。
pub trait HealthRepo: Send + Sync {
    /// 新文件落盘后登记待检记录；同路径已存在时保持其计数器只刷新调度时间。
    fn upsert_pending(&self, record: HealthRecord) -> Result<()>;

    /// 读路径观察到缺段后的反馈：把下一次检查提前到现在。
    fn request_check(&self, file_path: &str, reason: &str) -> Result<()>;

    /// 描述符删除后的清理。
    fn remove(&self, file_path: &str) -> Result<()>;
}

/// 修复分发能力：把虚拟路径映射到外部媒体管理实例并发起重扫。
///
/// # 契约说明（What）
/// - 目标不属于任何实例时返回 `repair.path_match_failed` 哨兵错误，
///   调度器据此把记录与描述符按孤儿清理；其余错误视为上游瞬态故障。
#[async_trait]
pub trait RescanDispatcher: Send + Sync {
    async fn trigger_rescan(
        &self,
        ctx: &CallContext,
        path_for_rescan: &str,
        relative_path: &str,
    ) -> Result<()>;
}

/// 外部 VFS 刷新通知；失败只记录日志，不影响主流程。
pub trait VfsRefresher: Send + Sync {
    fn refresh_dir(&self, name: &str, dirs: &[String]);
}

/// 库路径解析能力：把虚拟路径翻译为媒体管理实例可识别的路径。
pub trait LibraryPathResolver: Send + Sync {
    fn resolve(&self, path: &VirtualPath) -> Option<String>;
}

/// NZBLNK 解析能力：通过索引站搜索把链接还原为 NZB 文档字节。
#[async_trait]
pub trait NzbResolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &CallContext,
        title: &str,
        header: &str,
        group: Option<&str>,
    ) -> Result<Vec<u8>>;
}
