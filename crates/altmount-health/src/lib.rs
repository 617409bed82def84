#![doc = r#"
# altmount-health

## 设计动机（Why）
- **定位**：Usenet 上的缺文是常态：报文随年龄流失，提供方之间覆盖不均。
  本 crate 周期性抽样每个受管文件的分段可用性，重试耗尽后把修复委托给
  外部媒体管理（重新获取释出），而不是让读路径独自面对空洞。
- **架构角色**：健康表与导入队列共用嵌入式数据库；登记入口走
  `altmount-core` 的 [`HealthRepo`](altmount_core::HealthRepo) 窄接口，
  调度器消费仓库的完整 API；修复出口是
  [`RescanDispatcher`](altmount_core::RescanDispatcher) 能力。

## 核心契约（What）
- **调度**：`scheduled_check_at ≤ now` 且不在 `checking`/`corrupted` 的记录
  按到期时刻升序取出，至多 `max_concurrent_jobs` 并发；
- **分档**：下一次检查按文件年龄分档（<7d → min(age,6h)；<30d → 24h；
  ≥30d → 90d ± 7d 抖动；下限 1h），无发布日期的记录在 24h 内随机铺开；
- **状态机**：缺段按 `15min * 2^retry_count` 退避，重试耗尽进入
  `repair_triggered` 并恰好调用一次修复分发；修复重试也耗尽则 `corrupted`
  终态；“路径无人认领”触发描述符与记录的孤儿清理；
- **同步**：库同步器把描述符树、健康表与 `.strm` 指针目录对齐。

## 注意事项（Trade-offs）
- 同一路径的检查由在途守卫与条件更新双重去并发；
- 时间全部经 [`Clock`](altmount_core::Clock) 注入，调度语义可在虚拟时钟
  下逐秒复现。
"#]

mod policy;
mod repo;
mod scheduler;
mod sync;

pub use policy::{CHECK_FLOOR, RETRY_BACKOFF_BASE, next_check_interval, retry_backoff, schedule_from_release};
pub use repo::HealthStore;
pub use scheduler::{CheckOutcome, HealthScheduler, HealthStats};
pub use sync::{LibrarySync, SyncReport};
