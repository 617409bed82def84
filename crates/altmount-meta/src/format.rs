use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{Encryption, FileDescriptor, FileStatus, Segment};

/// 当前磁盘格式版本。
pub const FORMAT_VERSION: u8 = 1;

const FLAG_ENCRYPTED: u16 = 1 << 0;
const FLAG_PARTIAL: u16 = 1 << 1;
const FLAG_CORRUPTED: u16 = 1 << 2;

/// 把描述符编码为磁盘字节。
///
/// # 契约说明（What）
/// 字段顺序固定：version(u8)、flags(u16 LE)、total_size(varint)、
/// created_at(i64 LE)、release_date(i64 LE，缺失写 0)、source_nzb_path(lp)、
/// password(lp，缺失写空)、salt(lp)、segment_count(varint)，随后逐段
/// `{bytes: varint, id: lp, group_count: varint, groups: [lp]}`，
/// 最后原样追加未知尾部字节。`lp` 为 varint 长度前缀的 UTF-8。
pub fn encode_descriptor(descriptor: &FileDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + descriptor.segments.len() * 48);
    out.push(FORMAT_VERSION);

    let mut flags = 0u16;
    if descriptor.encryption == Encryption::Rclone {
        flags |= FLAG_ENCRYPTED;
    }
    match descriptor.status {
        FileStatus::Healthy => {}
        FileStatus::Partial => flags |= FLAG_PARTIAL,
        FileStatus::Corrupted => flags |= FLAG_CORRUPTED,
    }
    out.extend_from_slice(&flags.to_le_bytes());

    put_varint(&mut out, descriptor.size);
    out.extend_from_slice(&descriptor.created_at.to_le_bytes());
    out.extend_from_slice(&descriptor.release_date.unwrap_or(0).to_le_bytes());
    put_str(&mut out, &descriptor.source_nzb_path);
    put_str(&mut out, descriptor.password.as_deref().unwrap_or(""));
    put_str(&mut out, descriptor.salt.as_deref().unwrap_or(""));

    put_varint(&mut out, descriptor.segments.len() as u64);
    for segment in &descriptor.segments {
        put_varint(&mut out, segment.bytes);
        put_str(&mut out, &segment.id);
        put_varint(&mut out, segment.groups.len() as u64);
        for group in &segment.groups {
            put_str(&mut out, group);
        }
    }

    out.extend_from_slice(&descriptor.trailing);
    out
}

/// 从磁盘字节解码描述符；任何结构破损映射为 `meta.malformed_descriptor`。
pub fn decode_descriptor(bytes: &[u8]) -> Result<FileDescriptor> {
    let mut input = bytes;
    let version = take_u8(&mut input)?;
    if version != FORMAT_VERSION {
        return Err(malformed(format!("unsupported descriptor version {version}")));
    }
    let flags = u16::from_le_bytes(take_array::<2>(&mut input)?);
    let size = get_varint(&mut input)?;
    let created_at = i64::from_le_bytes(take_array::<8>(&mut input)?);
    let release_raw = i64::from_le_bytes(take_array::<8>(&mut input)?);
    let source_nzb_path = get_str(&mut input)?;
    let password = get_str(&mut input)?;
    let salt = get_str(&mut input)?;

    let segment_count = get_varint(&mut input)?;
    if segment_count > (bytes.len() as u64) {
        // 每段至少占 3 字节，声明数超过输入长度必是破损。
        return Err(malformed(format!("implausible segment count {segment_count}")));
    }
    let mut segments = Vec::with_capacity(segment_count as usize);
    for _ in 0..segment_count {
        let seg_bytes = get_varint(&mut input)?;
        let id = get_str(&mut input)?;
        let group_count = get_varint(&mut input)?;
        if group_count > (bytes.len() as u64) {
            return Err(malformed(format!("implausible group count {group_count}")));
        }
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            groups.push(get_str(&mut input)?);
        }
        segments.push(Segment {
            id,
            bytes: seg_bytes,
            groups,
        });
    }

    let status = if flags & FLAG_CORRUPTED != 0 {
        FileStatus::Corrupted
    } else if flags & FLAG_PARTIAL != 0 {
        FileStatus::Partial
    } else {
        FileStatus::Healthy
    };
    let encryption = if flags & FLAG_ENCRYPTED != 0 {
        Encryption::Rclone
    } else {
        Encryption::None
    };

    Ok(FileDescriptor {
        size,
        source_nzb_path,
        status,
        created_at,
        release_date: (release_raw != 0).then_some(release_raw),
        password: (!password.is_empty()).then_some(password),
        salt: (!salt.is_empty()).then_some(salt),
        encryption,
        segments,
        trailing: input.to_vec(),
    })
}

/// 只解析头部前缀取 `created_at`，供列目录聚合 mtime 时避免整段解码。
pub(crate) fn peek_created_at(bytes: &[u8]) -> Result<i64> {
    let mut input = bytes;
    let version = take_u8(&mut input)?;
    if version != FORMAT_VERSION {
        return Err(malformed(format!("unsupported descriptor version {version}")));
    }
    let _flags = take_array::<2>(&mut input)?;
    let _size = get_varint(&mut input)?;
    Ok(i64::from_le_bytes(take_array::<8>(&mut input)?))
}

fn malformed(message: String) -> CoreError {
    CoreError::new(codes::MALFORMED_DESCRIPTOR, message)
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(input: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = take_u8(input)?;
        if shift == 63 && byte > 1 {
            return Err(malformed("varint overflows 64 bits".into()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(malformed("varint longer than 10 bytes".into()));
        }
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn get_str(input: &mut &[u8]) -> Result<String> {
    let len = get_varint(input)? as usize;
    if input.len() < len {
        return Err(malformed(format!(
            "string of {len} bytes exceeds remaining {}",
            input.len()
        )));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    String::from_utf8(head.to_vec())
        .map_err(|_| malformed("string field is not valid UTF-8".into()))
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| malformed("unexpected end of descriptor".into()))?;
    *input = rest;
    Ok(first)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    if input.len() < N {
        return Err(malformed("unexpected end of descriptor".into()));
    }
    let (head, rest) = input.split_at(N);
    *input = rest;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}
