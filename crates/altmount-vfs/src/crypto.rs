use altmount_core::error::{CoreError, Result, codes};
use altmount_yenc::{CHUNK_SIZE, ChunkCipher, TAG_SIZE, chunk_of};

/// 把取回的密文窗口解密为明文区间。
///
/// # 契约说明（What）
/// - `cipher_window` 是 [`altmount_yenc::ciphertext_span`] 对应区间的字节，
///   允许因流尾或缺段而短于规划长度；
/// - 严格模式：首个无法完整解密的块即停，返回已解密前缀与失败原因；
/// - 宽容模式：失败块按其明文尺寸零填充，继续后续块；
/// - 返回值已裁剪前导冗余并截断到 `len`。
pub(crate) struct DecryptOutcome {
    pub bytes: Vec<u8>,
    pub failure: Option<CoreError>,
}

pub(crate) fn decrypt_window(
    cipher: &ChunkCipher,
    cipher_window: &[u8],
    plain_size: u64,
    plain_offset: u64,
    len: u64,
    permissive: bool,
) -> Result<DecryptOutcome> {
    if len == 0 {
        return Ok(DecryptOutcome {
            bytes: Vec::new(),
            failure: None,
        });
    }
    let first_chunk = chunk_of(plain_offset);
    let last_chunk = chunk_of((plain_offset + len - 1).min(plain_size.saturating_sub(1)));
    let chunk_span = (CHUNK_SIZE + TAG_SIZE) as usize;

    let mut plain: Vec<u8> = Vec::with_capacity(len as usize);
    let mut failure: Option<CoreError> = None;

    for chunk_index in first_chunk..=last_chunk {
        let chunk_plain_start = chunk_index * CHUNK_SIZE;
        let chunk_plain_len = CHUNK_SIZE.min(plain_size - chunk_plain_start) as usize;

        let window_offset = ((chunk_index - first_chunk) as usize) * chunk_span;
        let expected_cipher = chunk_plain_len + TAG_SIZE as usize;
        let available = cipher_window.len().saturating_sub(window_offset);

        let opened: Result<Vec<u8>> = if available < expected_cipher {
            Err(CoreError::new(
                codes::SHORT_READ,
                format!("ciphertext for chunk {chunk_index} truncated"),
            ))
        } else {
            let block = &cipher_window[window_offset..window_offset + expected_cipher];
            cipher.open_chunk(chunk_index, block)
        };

        match opened {
            Ok(block_plain) => plain.extend(block_plain),
            Err(err) => {
                if permissive {
                    failure.get_or_insert(err);
                    plain.extend(std::iter::repeat_n(0u8, chunk_plain_len));
                } else {
                    failure = Some(err);
                    break;
                }
            }
        }
    }

    let slack = (plain_offset - first_chunk * CHUNK_SIZE) as usize;
    let bytes = if slack >= plain.len() {
        Vec::new()
    } else {
        let mut out = plain.split_off(slack);
        out.truncate(len as usize);
        out
    };
    Ok(DecryptOutcome { bytes, failure })
}
