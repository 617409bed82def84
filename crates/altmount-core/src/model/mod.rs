//! AltMount 的领域模型：虚拟路径、分段与描述符、提供方身份、队列行与健康记录。
//!
//! 模型类型只承载数据与不变式校验，不做任何 I/O；持久化编码（描述符二进制、
//! SQL 行映射）由各实现 crate 负责。

mod descriptor;
mod health;
mod path;
mod provider;
mod queue;

pub use descriptor::{DirEntry, Encryption, FileDescriptor, FileStatus, Segment};
pub use health::{HealthRecord, HealthStatus};
pub use path::VirtualPath;
pub use provider::{ProviderConfig, ProviderId};
pub use queue::{ImportQueueItem, QueuePriority, QueueStatus};
