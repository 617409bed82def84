#![deny(unsafe_code)]
#![doc = "altmount-core: AltMount 虚拟文件系统的核心契约层。"]
#![doc = ""]
#![doc = "== 定位 =="]
#![doc = "AltMount 把 Usenet 二进制新闻网络伪装成一棵只读文件树：NZB 索引声明分段序列，"]
#![doc = "读请求按需取回报文并解码拼接。本 crate 不做任何 I/O，只沉淀跨子系统共享的契约："]
#![doc = "稳定错误域、取消/截止原语、可注入时钟、配置快照与能力接口。"]
#![doc = ""]
#![doc = "== 分层约定 =="]
#![doc = "实现 crate（连接池、解码器、元数据存储、虚拟文件系统、导入队列、健康调度、修复分发）"]
#![doc = "只允许依赖本 crate 的契约互相协作；组合根（altmount-hosting）负责一次性装配，"]
#![doc = "避免子系统之间出现环状引用。"]

pub mod configuration;
pub mod contract;
pub mod error;
pub mod model;
pub mod prelude;
pub mod test_stubs;
pub mod time;
pub mod traits;

pub use configuration::{ConfigHandle, ConfigSnapshot};
pub use contract::{CallContext, Cancellation, Deadline};
pub use error::{CoreError, ErrorCategory, ErrorCause, Result, RetryAdvice};
pub use model::{
    DirEntry, Encryption, FileDescriptor, FileStatus, HealthRecord, HealthStatus, ImportQueueItem,
    ProviderConfig, ProviderId, QueuePriority, QueueStatus, Segment, VirtualPath,
};
pub use time::{Clock, MockClock, Sleep, SystemClock};
pub use traits::{
    ArticleProbe, ArticleSource, BodySink, DescriptorStore, HealthRepo, LibraryPathResolver,
    NzbResolver, RescanDispatcher, VfsRefresher,
};
