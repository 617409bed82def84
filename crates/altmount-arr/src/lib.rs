#![doc = r#"
# altmount-arr

## 设计动机（Why）
- **定位**：当健康调度把一个文件判为“修复”时，真正能补救的是外部媒体
  管理（重新搜索并获取该释出）。本 crate 负责回答两个问题：这个路径归
  哪个实例管？该实例上对应哪个条目？然后发出重扫/重获取命令。
- **架构角色**：实现 `altmount-core` 的
  [`RescanDispatcher`](altmount_core::RescanDispatcher) 能力接口；实例清单
  来自配置快照，每次分发都读取最新值。

## 核心契约（What）
- 根目录前缀（最长匹配）决定实例归属；电影类按路径匹配条目，剧集类在
  路径匹配失败后回退到 `SxxEyy` 季/集匹配；
- “无人认领”用 `repair.path_match_failed` 哨兵表达，调用方据此清理孤儿；
  其余上游故障映射为可重试的 `repair.upstream`。
"#]

mod client;
mod dispatcher;

pub use client::{ArrClient, Episode, MediaItem, RootFolder};
pub use dispatcher::{ArrDispatcher, parse_season_episode};
