#![doc = r#"
# altmount-import

## 设计动机（Why）
- **定位**：把 NZB 文档（监视目录、HTTP 投递、批量导入或 NZBLNK 链接）
  持久、可恢复地转化为描述符树：队列行落在嵌入式数据库里，工作者崩溃后
  启动清扫即可续跑。
- **架构角色**：队列与健康表共用同一个 [`Database`]；描述符写入、健康登记
  与报文探测都经 `altmount-core` 的能力接口，组合根一次装配。

## 核心契约（What）
- **去重**：入队按 `nzb_path` upsert，仅终态行会被重新激活；
- **互斥**：`pending → running` 的条件更新保证每行至多一个工作者；
- **重试**：瞬态失败按 `base * 2^retry_count` 退避重排至上限，格式错误
  直接终态；
- **取消**：在途条目经取消令牌打断，本轮写入的描述符全部回滚。

## 注意事项（Trade-offs）
- SQLite 连接互斥串行化，所有 SQL 都是不跨 await 的短事务；
- 监视目录用“两轮大小一致”判稳而不是文件事件，牺牲延迟换可移植性。
"#]

mod db;
mod nzb;
mod queue;
mod sanitize;
mod watch;
mod worker;

pub use db::Database;
pub use nzb::{NzbDocument, NzbFile, NzbLink, is_nzblnk, parse_nzb, parse_nzblnk};
pub use queue::{EnqueueRequest, ListFilter, QueueStats, QueueStore};
pub use sanitize::{
    filename_from_subject, rar_first, rar_sort_key, release_name_from_path, sanitize_component,
};
pub use worker::ImportWorkers;
