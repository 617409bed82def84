#![doc = r#"
# altmount-meta

## 设计动机（Why）
- **定位**：每个虚拟文件的描述符（大小、分段清单、加密参数、健康状态）以
  紧凑二进制落在本地目录树上；本 crate 负责编码、原子替换与缓存。
- **架构角色**：虚拟文件系统按请求取只读快照，导入器是唯一写入方，健康
  调度只触碰状态位。目录在磁盘上真实存在，文件以 `.meta` 后缀区分。

## 核心契约（What）
- **原子性**：写入走“同目录临时文件 + fsync + rename”，读者要么看到前像
  要么看到后像；LRU 在 rename 可见之前失效；
- **兼容性**：磁盘格式带版本号，未知尾部字节在重写时原样保留；
- **列目录**：挂描述符的是文件，其下存在描述符的前缀是目录，名字冲突时
  文件胜出。

## 注意事项（Trade-offs）
- 写入方从不原地截断；删除后的空目录清理是调用方的显式动作。
"#]

mod format;
mod segcache;
mod store;

pub use format::{FORMAT_VERSION, decode_descriptor, encode_descriptor};
pub use segcache::SegmentCache;
pub use store::MetadataStore;
