use altmount_core::Result;
use altmount_core::traits::BodySink;

use crate::error::frame;

/// 单报文解码完成后的摘要。
///
/// # 契约说明（What）
/// - `part_begin`：该分段在整文件内的起始偏移（0 基）；单分段报文恒为 0；
/// - `payload_len`：实际写入 sink 的载荷字节数；
/// - `declared_part_size`：`=ypart` 的 `end-begin+1`，单分段取 `=ybegin size`；
/// - `declared_total_size`：多分段时 `=ybegin size` 声明的整文件大小；
/// - `crc_checked`：`=yend` 携带 `pcrc32`/`crc32` 且校验通过时为真。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub name: Option<String>,
    pub part_begin: u64,
    pub payload_len: u64,
    pub declared_part_size: Option<u64>,
    pub declared_total_size: Option<u64>,
    pub crc_checked: bool,
}

enum State {
    AwaitBegin,
    AwaitPart,
    Data,
    Done,
}

/// 流式 yEnc 解码器：逐行喂入、载荷直接流向 sink。
///
/// # 设计背景（Why）
/// - 读路径的内存预算按“环形缓冲里的解码字节”计量，解码器自身绝不积累整段；
/// - 行是传输层的自然单位（点阵终止正文本就按行读取），按行喂入免去二次切分。
///
/// # 契约说明（What）
/// - **前置条件**：行已去除 CRLF 与 NNTP 点填充；
/// - **后置条件**：`finish` 返回摘要当且仅当帧完整（见过 `=yend`）且 CRC/长度
///   声明全部吻合；任何破损以 `yenc.decode_failed` 报告，已写入 sink 的字节
///   由调用方丢弃。
///
/// # 注意事项（Trade-offs）
/// - `=ybegin` 之前的行（报文头残留）全部忽略；`=yend` 之后的行同样忽略；
/// - 转义符悬挂在行尾按帧破损处理，编码规范不允许这种形态。
pub struct YencDecoder<'a> {
    sink: &'a mut dyn BodySink,
    state: State,
    crc: crc32fast::Hasher,
    summary: DecodeSummary,
    declared_yend_size: Option<u64>,
    line_buf: Vec<u8>,
}

impl<'a> YencDecoder<'a> {
    /// 以给定 sink 创建解码器。
    pub fn new(sink: &'a mut dyn BodySink) -> Self {
        Self {
            sink,
            state: State::AwaitBegin,
            crc: crc32fast::Hasher::new(),
            summary: DecodeSummary::default(),
            declared_yend_size: None,
            line_buf: Vec::with_capacity(256),
        }
    }

    /// 喂入一行（不含行终止符）。
    pub fn push_line(&mut self, line: &[u8]) -> Result<()> {
        match self.state {
            State::AwaitBegin => {
                if line.starts_with(b"=ybegin ") {
                    self.on_begin(&String::from_utf8_lossy(line))?;
                }
                Ok(())
            }
            State::AwaitPart => {
                let text = String::from_utf8_lossy(line);
                if let Some(rest) = text.strip_prefix("=ypart ") {
                    self.on_part(rest)
                } else {
                    Err(frame("multipart article without =ypart header"))
                }
            }
            State::Data => {
                if line.starts_with(b"=yend") {
                    self.on_end(&String::from_utf8_lossy(line))
                } else {
                    self.on_data(line)
                }
            }
            State::Done => Ok(()),
        }
    }

    /// 结束解码并返回摘要。
    pub fn finish(self) -> Result<DecodeSummary> {
        match self.state {
            State::Done => Ok(self.summary),
            _ => Err(frame("article body ended before =yend trailer")),
        }
    }

    fn on_begin(&mut self, header: &str) -> Result<()> {
        let multipart = attr_u64(header, "part").is_some();
        let size = attr_u64(header, "size");
        self.summary.name = attr_name(header);
        if multipart {
            self.summary.declared_total_size = size;
            self.state = State::AwaitPart;
        } else {
            self.summary.declared_part_size = size;
            self.summary.part_begin = 0;
            self.state = State::Data;
        }
        Ok(())
    }

    fn on_part(&mut self, rest: &str) -> Result<()> {
        let begin =
            attr_u64(rest, "begin").ok_or_else(|| frame("=ypart without begin attribute"))?;
        let end = attr_u64(rest, "end").ok_or_else(|| frame("=ypart without end attribute"))?;
        if begin == 0 || end < begin {
            return Err(frame(format!("=ypart with invalid range {begin}..={end}")));
        }
        // yEnc 的 begin/end 是 1 基、双闭区间。
        self.summary.part_begin = begin - 1;
        self.summary.declared_part_size = Some(end - begin + 1);
        self.state = State::Data;
        Ok(())
    }

    fn on_data(&mut self, line: &[u8]) -> Result<()> {
        self.line_buf.clear();
        let mut idx = 0;
        while idx < line.len() {
            let byte = line[idx];
            if byte == b'=' {
                idx += 1;
                let Some(&escaped) = line.get(idx) else {
                    return Err(frame("escape byte dangling at end of line"));
                };
                self.line_buf
                    .push(escaped.wrapping_sub(64).wrapping_sub(42));
            } else {
                self.line_buf.push(byte.wrapping_sub(42));
            }
            idx += 1;
        }
        self.crc.update(&self.line_buf);
        self.summary.payload_len += self.line_buf.len() as u64;
        self.sink.write(&self.line_buf)
    }

    fn on_end(&mut self, trailer: &str) -> Result<()> {
        self.declared_yend_size = attr_u64(trailer, "size");
        if let Some(declared) = self.declared_yend_size {
            if declared != self.summary.payload_len {
                return Err(frame(format!(
                    "=yend declares {declared} bytes but {} were decoded",
                    self.summary.payload_len
                )));
            }
        }
        let expected_crc = attr_hex32(trailer, "pcrc32").or_else(|| attr_hex32(trailer, "crc32"));
        if let Some(expected) = expected_crc {
            let actual = self.crc.clone().finalize();
            if actual != expected {
                return Err(frame(format!(
                    "part CRC mismatch: expected {expected:08x}, computed {actual:08x}"
                )));
            }
            self.summary.crc_checked = true;
        }
        self.state = State::Done;
        Ok(())
    }
}

/// 一次性解码完整正文（按 LF 切行、容忍 CRLF）。导入探测与测试的便捷入口。
pub fn decode_block(body: &[u8], sink: &mut dyn BodySink) -> Result<DecodeSummary> {
    let mut decoder = YencDecoder::new(sink);
    for raw_line in body.split(|&b| b == b'\n') {
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        if line.is_empty() {
            continue;
        }
        decoder.push_line(line)?;
    }
    decoder.finish()
}

/// 在头部文本中按 `key=` 取无符号整数属性。
fn attr_u64(header: &str, key: &str) -> Option<u64> {
    attr_raw(header, key)?.parse().ok()
}

/// 按 `key=` 取十六进制 32 位属性（`pcrc32=`/`crc32=`）。
fn attr_hex32(header: &str, key: &str) -> Option<u32> {
    u32::from_str_radix(attr_raw(header, key)?, 16).ok()
}

/// `name=` 吃掉行尾全部内容（文件名允许包含空格）。
fn attr_name(header: &str) -> Option<String> {
    let idx = header.find("name=")?;
    let value = header[idx + 5..].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn attr_raw<'h>(header: &'h str, key: &str) -> Option<&'h str> {
    let needle = format!("{key}=");
    let mut search = 0;
    while let Some(found) = header[search..].find(&needle) {
        let start = search + found;
        // 必须位于词首，避免 `pcrc32=` 命中 `crc32=` 的查找。
        if start == 0 || header.as_bytes()[start - 1] == b' ' {
            let value = &header[start + needle.len()..];
            return Some(value.split(' ').next().unwrap_or(value).trim());
        }
        search = start + needle.len();
    }
    None
}

/// 把载荷编码为单分段 yEnc 正文。
///
/// 生产路径只解码不编码；该函数服务于全仓的测试夹具（脚本化报文来源、
/// 进程内 NNTP 服务器），与解码器独立实现以免共享缺陷。
pub fn encode_article(data: &[u8], name: &str) -> Vec<u8> {
    let mut crc = crc32fast::Hasher::new();
    crc.update(data);
    let mut body = format!("=ybegin line=128 size={} name={}\r\n", data.len(), name).into_bytes();
    body.extend_from_slice(&encode_payload(data, 128));
    body.extend_from_slice(
        format!("=yend size={} crc32={:08x}\r\n", data.len(), crc.finalize()).as_bytes(),
    );
    body
}

/// 把载荷编码为多分段文件中的一段（`begin1` 为 1 基起始偏移）。
pub fn encode_part(data: &[u8], begin1: u64, part: u32, total_size: u64, name: &str) -> Vec<u8> {
    let mut crc = crc32fast::Hasher::new();
    crc.update(data);
    let end1 = begin1 + data.len() as u64 - 1;
    let mut body = format!(
        "=ybegin part={part} line=128 size={total_size} name={name}\r\n=ypart begin={begin1} end={end1}\r\n"
    )
    .into_bytes();
    body.extend_from_slice(&encode_payload(data, 128));
    body.extend_from_slice(
        format!(
            "=yend size={} part={part} pcrc32={:08x}\r\n",
            data.len(),
            crc.finalize()
        )
        .as_bytes(),
    );
    body
}

fn encode_payload(data: &[u8], line_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut col = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let critical = matches!(encoded, 0x00 | 0x0A | 0x0D | 0x3D);
        if critical {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            col += 2;
        } else {
            out.push(encoded);
            col += 1;
        }
        if col >= line_len {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_single(data: &[u8], name: &str) -> Vec<u8> {
        encode_article(data, name)
    }

    fn frame_part(data: &[u8], begin1: u64, total: u64, name: &str) -> Vec<u8> {
        encode_part(data, begin1, 1, total, name)
    }

    #[test]
    fn roundtrip_with_critical_bytes() {
        let data: Vec<u8> = vec![0x00, 0x0A, 0x0D, 0x3D, 0xE3, 0xD0, 0xD6, 0xFF, 0x13];
        let mut sink = Vec::new();
        let summary = decode_block(&frame_single(&data, "crit.bin"), &mut sink).expect("decode");
        assert_eq!(sink, data);
        assert_eq!(summary.payload_len, data.len() as u64);
        assert_eq!(summary.name.as_deref(), Some("crit.bin"));
        assert!(summary.crc_checked);
    }

    #[test]
    fn part_header_yields_zero_based_offset() {
        let data = vec![7u8; 512];
        let body = frame_part(&data, 716_801, 2_097_152, "movie.mkv");
        let mut sink = Vec::new();
        let summary = decode_block(&body, &mut sink).expect("decode");
        assert_eq!(summary.part_begin, 716_800);
        assert_eq!(summary.declared_part_size, Some(512));
        assert_eq!(summary.declared_total_size, Some(2_097_152));
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let data = b"payload bytes".to_vec();
        let mut body = frame_single(&data, "a.bin");
        // 就地篡改 trailer 里的 8 位十六进制 CRC。
        let text = String::from_utf8(body.clone()).unwrap();
        let at = text.find("crc32=").unwrap() + "crc32=".len();
        body[at..at + 8].copy_from_slice(b"deadbeef");
        let mut sink = Vec::new();
        let err = decode_block(&body, &mut sink).unwrap_err();
        assert_eq!(err.code(), altmount_core::error::codes::DECODE_FAILED);
    }

    #[test]
    fn missing_trailer_is_rejected() {
        let body = b"=ybegin line=128 size=3 name=x\r\nabc\r\n".to_vec();
        let mut sink = Vec::new();
        assert!(decode_block(&body, &mut sink).is_err());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let data = b"four".to_vec();
        let mut crc = crc32fast::Hasher::new();
        crc.update(&data);
        let mut body = "=ybegin line=128 size=4 name=x\r\n".as_bytes().to_vec();
        body.extend_from_slice(&encode_payload(&data, 128));
        body.extend_from_slice(format!("=yend size=5 crc32={:08x}\r\n", crc.finalize()).as_bytes());
        let mut sink = Vec::new();
        assert!(decode_block(&body, &mut sink).is_err());
    }

    #[test]
    fn junk_before_ybegin_is_ignored() {
        let data = b"hello world".to_vec();
        let mut body = b"X-Header: residue\r\n\r\n".to_vec();
        body.extend_from_slice(&frame_single(&data, "h.bin"));
        let mut sink = Vec::new();
        decode_block(&body, &mut sink).expect("decode");
        assert_eq!(sink, data);
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_payloads(data in proptest::collection::vec(any::<u8>(), 1..4096)) {
            let body = frame_single(&data, "prop.bin");
            let mut sink = Vec::new();
            let summary = decode_block(&body, &mut sink).unwrap();
            prop_assert_eq!(sink, data);
            prop_assert!(summary.crc_checked);
        }
    }
}
