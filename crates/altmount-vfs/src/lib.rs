#![doc = r#"
# altmount-vfs

## 设计动机（Why）
- **定位**：把“路径 + 字节区间”的读请求翻译为描述符分段清单上的有序取回，
  经连接池与解码器装配出调用方要的那一段字节。目录、大小、mtime 全部由
  描述符树推导，对外是一棵只读文件树。
- **架构角色**：面向 WebDAV 前端暴露 `open/stat/read_at/list`；向下只依赖
  `altmount-core` 的能力接口（报文来源、描述符存储、健康登记），因此可以
  整体接在脚本化桩上测试。

## 核心契约（What）
- **区间映射**：分段累计偏移 `c[0]=0, c[i+1]=c[i]+bytes[i]`；读 `[off, off+len)`
  触及 `lo = max{i: c[i] ≤ off}` 到 `hi = max{i: c[i] < off+len}`；
- **流水线**：规划器给出分段序号区间，受 `download_workers` 约束的取回工作者
  把解码结果填入按字节预算封顶的环形缓冲，缝合器按序消费并裁剪首尾；
- **缺段语义**：严格模式交付失败分段之前的所有字节并以 `vfs.short_read`
  标记截断；宽容模式按零填充继续。两种路径都把描述符降级为 `partial`
  并通知健康子系统（尽力而为，不阻塞读）；
- **上限**：单次 `read_at` 至多 `max_range_size` 字节；流式（length = -1）
  单次至多 `streaming_chunk_size` 字节。

## 注意事项（Trade-offs）
- 句柄持有打开时刻的描述符快照：读期间的重写不影响在途请求；
- 加密文件的区间按 64 KiB 块对齐扩张后取密文，解密后丢弃前导冗余。
"#]

mod crypto;
mod fs;
mod plan;
mod read;

pub use fs::{FileHandle, FileStat, ReadOutcome, VirtualFs};
