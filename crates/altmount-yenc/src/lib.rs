#![doc = r#"
# altmount-yenc

## 设计动机（Why）
- **定位**：Usenet 报文以 yEnc 文本编码承载 8-bit 载荷。本 crate 提供单报文的
  流式解码（`=ybegin`/`=ypart`/`=yend` 帧识别、转义处理、part-CRC 校验），
  以及可选的 rclone 风格分块加密层。
- **架构角色**：连接池在读取点阵终止的正文时逐行喂入 [`YencDecoder`]，
  解码字节直接流向调用方的 sink，不在本层累积整段；导入器复用解码摘要
  （[`DecodeSummary`]）恢复真实文件名与偏移。

## 核心契约（What）
- **输入条件**：行已去除 CRLF 与点填充（传输层职责）；
- **输出保障**：载荷按线序写入 sink；`pcrc32` 存在时校验失败映射为
  `yenc.decode_failed`，绝不交付损坏字节；
- **加密层**：64 KiB 明文块 + 16 字节认证标签，块级随机访问，偏移映射为
  纯函数，便于上层把明文区间换算为需要取回的密文区间。

## 注意事项（Trade-offs）
- 转义符不允许悬挂在行尾（编码规范如此），出现即按帧破损处理；
- 密钥派生采用迭代 HMAC-SHA-256 而非 scrypt，分块布局保持可寻址。
"#]

mod cipher;
mod decode;
mod error;

pub use cipher::{
    CHUNK_SIZE, ChunkCipher, FileKey, HEADER_SIZE, MAGIC, TAG_SIZE, ciphertext_len, ciphertext_span,
    chunk_of, derive_key, plaintext_len, seal_stream,
};
pub use decode::{DecodeSummary, YencDecoder, decode_block, encode_article, encode_part};
