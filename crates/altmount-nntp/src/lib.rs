#![doc = r#"
# altmount-nntp

## 设计动机（Why）
- **定位**：在一组不可靠、限速的 NNTP 提供方之上维持连接复用，向上只暴露
  “取正文”“探活”两个动作；报文缺失与瞬态故障的区分、同提供方重试与
  跨提供方滚动全部收敛在本层。
- **架构角色**：实现 `altmount-core` 的 [`ArticleSource`](altmount_core::ArticleSource)
  能力接口；虚拟文件系统、导入探测与健康检查共用同一个池实例。

## 核心契约（What）
- **调度**：请求按声明顺序选择提供方（主提供方在前，备援在后）；同一提供方
  内先借空闲连接，不足且未达 `max_connections` 时新建，否则在信号量上等待；
- **失败分级**：430 族响应对该提供方终局，滚动到下一提供方；I/O 与协议瞬态
  故障关闭连接、短退避后在同提供方重试至上限；全部提供方耗尽映射为
  `nntp.provider_exhausted`；
- **生命周期**：配置替换原子生效，身份未变的提供方保留健康连接；被移除的
  提供方排空后销毁；后台清扫关闭超龄与超时空闲连接。

## 注意事项（Trade-offs）
- 取消采用定时轮询注入（毫秒级延迟），换取不在每次 I/O 上挂额外任务；
- 单篇报文的解码输出先在尝试缓冲内聚齐、成功后一次性交付 sink，
  保证跨提供方重试不会向调用方漏出半截载荷。
"#]

mod conn;
mod error;
mod pool;
mod provider;
mod util;

pub use pool::{NntpPool, PoolStats, ProviderStats};
