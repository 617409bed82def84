//! 常用契约的一站式导入：`use altmount_core::prelude::*;`。

pub use crate::configuration::{ConfigHandle, ConfigSnapshot};
pub use crate::contract::{CallContext, Cancellation, Deadline};
pub use crate::error::{CoreError, ErrorCategory, Result, RetryAdvice, codes};
pub use crate::model::{
    DirEntry, Encryption, FileDescriptor, FileStatus, HealthRecord, HealthStatus, ImportQueueItem,
    ProviderConfig, ProviderId, QueuePriority, QueueStatus, Segment, VirtualPath,
};
pub use crate::time::{Clock, MockClock, SystemClock};
pub use crate::traits::{
    ArticleProbe, ArticleSource, BodySink, DescriptorStore, HealthRepo, LibraryPathResolver,
    NzbResolver, RescanDispatcher, VfsRefresher,
};
