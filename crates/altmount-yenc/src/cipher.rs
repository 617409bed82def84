use chacha20poly1305::aead::{Aead, KeyInit as AeadKeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use altmount_core::Result;

use crate::error::decrypt;

/// 明文分块大小：64 KiB。块级对齐是随机访问的最小单位。
pub const CHUNK_SIZE: u64 = 64 * 1024;
/// 每块附带的 Poly1305 认证标签字节数。
pub const TAG_SIZE: u64 = 16;
/// 文件头：8 字节魔数 + 24 字节基准 nonce。
pub const HEADER_SIZE: u64 = 32;
/// 布局魔数，识别非加密流被误判的情况。
pub const MAGIC: &[u8; 8] = b"AMCRYPT1";

const KDF_ROUNDS: usize = 16_384;

/// 从 `(password, salt)` 派生出的 32 字节文件密钥。
#[derive(Clone)]
pub struct FileKey([u8; 32]);

impl FileKey {
    /// 以原始字节构造（仅测试与格式迁移使用）。
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// 迭代 HMAC-SHA-256 密钥派生。
///
/// # 设计背景（Why）
/// - 密钥只在打开文件时派生一次，之后按块解密均为对称开销；
/// - 迭代次数固定写进布局常量：改动即是另一种磁盘格式，必须换魔数。
pub fn derive_key(password: &str, salt: &str) -> FileKey {
    type HmacSha256 = Hmac<Sha256>;
    let mut state = {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(salt.as_bytes());
        mac.finalize().into_bytes()
    };
    for _ in 1..KDF_ROUNDS {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(&state);
        state = mac.finalize().into_bytes();
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&state);
    FileKey(key)
}

/// 明文长度 → 密文总长（含文件头与逐块标签）。
pub fn ciphertext_len(plain_len: u64) -> u64 {
    if plain_len == 0 {
        return HEADER_SIZE;
    }
    let full_chunks = plain_len / CHUNK_SIZE;
    let remainder = plain_len % CHUNK_SIZE;
    let tagged = full_chunks * (CHUNK_SIZE + TAG_SIZE)
        + if remainder > 0 { remainder + TAG_SIZE } else { 0 };
    HEADER_SIZE + tagged
}

/// 密文总长 → 明文长度；长度非法（截断的块）时报错。
pub fn plaintext_len(cipher_len: u64) -> Result<u64> {
    if cipher_len < HEADER_SIZE {
        return Err(decrypt("ciphertext shorter than layout header"));
    }
    let body = cipher_len - HEADER_SIZE;
    let chunk_span = CHUNK_SIZE + TAG_SIZE;
    let full_chunks = body / chunk_span;
    let remainder = body % chunk_span;
    if remainder == 0 {
        return Ok(full_chunks * CHUNK_SIZE);
    }
    if remainder <= TAG_SIZE {
        return Err(decrypt("trailing ciphertext shorter than its tag"));
    }
    Ok(full_chunks * CHUNK_SIZE + remainder - TAG_SIZE)
}

/// 明文偏移所属的块号。
pub fn chunk_of(plain_offset: u64) -> u64 {
    plain_offset / CHUNK_SIZE
}

/// 明文区间 `[offset, offset+len)` 对应的密文字节区间（含所需的整块与文件头之后的偏移）。
///
/// # 契约说明（What）
/// - 返回 `(cipher_start, cipher_len)`，调用方据此取回密文；
/// - 区间按块对齐扩张：起点回退到所在块的块首，终点推进到末块块尾；
/// - `len == 0` 返回零长区间。
pub fn ciphertext_span(plain_offset: u64, len: u64) -> (u64, u64) {
    if len == 0 {
        return (HEADER_SIZE, 0);
    }
    let first_chunk = chunk_of(plain_offset);
    let last_chunk = chunk_of(plain_offset + len - 1);
    let chunk_span = CHUNK_SIZE + TAG_SIZE;
    let start = HEADER_SIZE + first_chunk * chunk_span;
    let end = HEADER_SIZE + (last_chunk + 1) * chunk_span;
    (start, end - start)
}

/// 分块认证加密：XChaCha20-Poly1305，块号混入 nonce。
///
/// # 契约说明（What）
/// - 每块独立加解密，支持 64 KiB 对齐的随机访问；
/// - 块 nonce = 基准 nonce 的低 8 字节与块号（小端）异或，块间绝不复用；
/// - 认证失败（标签不匹配）映射为 `yenc.decrypt_failed`，绝不交付未认证明文。
pub struct ChunkCipher {
    aead: XChaCha20Poly1305,
    base_nonce: [u8; 24],
}

impl ChunkCipher {
    /// 以派生密钥与基准 nonce 构造。
    pub fn new(key: &FileKey, base_nonce: [u8; 24]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            base_nonce,
        }
    }

    /// 从 32 字节文件头恢复（校验魔数）。
    pub fn from_header(key: &FileKey, header: &[u8]) -> Result<Self> {
        if header.len() < HEADER_SIZE as usize {
            return Err(decrypt("file header truncated"));
        }
        if &header[..8] != MAGIC {
            return Err(decrypt("file header magic mismatch"));
        }
        let mut base_nonce = [0u8; 24];
        base_nonce.copy_from_slice(&header[8..32]);
        Ok(Self::new(key, base_nonce))
    }

    /// 生成文件头字节。
    pub fn header(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..8].copy_from_slice(MAGIC);
        out[8..].copy_from_slice(&self.base_nonce);
        out
    }

    fn nonce_for(&self, chunk_index: u64) -> XNonce {
        let mut nonce = self.base_nonce;
        for (idx, byte) in chunk_index.to_le_bytes().iter().enumerate() {
            nonce[16 + idx] ^= byte;
        }
        *XNonce::from_slice(&nonce)
    }

    /// 加密一块明文（≤ 64 KiB），输出带标签的密文。
    pub fn seal_chunk(&self, chunk_index: u64, plain: &[u8]) -> Result<Vec<u8>> {
        debug_assert!(plain.len() as u64 <= CHUNK_SIZE);
        self.aead
            .encrypt(&self.nonce_for(chunk_index), plain)
            .map_err(|_| decrypt("chunk seal failed"))
    }

    /// 解密一块带标签的密文。
    pub fn open_chunk(&self, chunk_index: u64, cipher: &[u8]) -> Result<Vec<u8>> {
        if (cipher.len() as u64) <= TAG_SIZE {
            return Err(decrypt("chunk shorter than its tag"));
        }
        self.aead
            .decrypt(&self.nonce_for(chunk_index), cipher)
            .map_err(|_| decrypt("chunk authentication failed"))
    }

    /// 解密覆盖明文区间 `[plain_offset, plain_offset+len)` 的整块序列并裁剪冗余。
    ///
    /// # 契约说明（What）
    /// - `cipher` 必须恰好是 [`ciphertext_span`] 给出的区间字节；
    /// - 返回值长度 ≤ `len`：末块落在文件尾之内时按实际明文截断。
    pub fn open_range(&self, cipher: &[u8], plain_offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let chunk_span = (CHUNK_SIZE + TAG_SIZE) as usize;
        let first_chunk = chunk_of(plain_offset);
        let mut plain = Vec::with_capacity(len as usize);
        for (offset_in_span, block) in cipher.chunks(chunk_span).enumerate() {
            plain.extend(self.open_chunk(first_chunk + offset_in_span as u64, block)?);
        }
        let slack = (plain_offset - first_chunk * CHUNK_SIZE) as usize;
        if slack >= plain.len() {
            return Ok(Vec::new());
        }
        let mut out = plain.split_off(slack);
        out.truncate(len as usize);
        Ok(out)
    }
}

/// 加密整段明文为完整密文流（文件头 + 逐块密文）。导入与测试用。
pub fn seal_stream(cipher: &ChunkCipher, plain: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ciphertext_len(plain.len() as u64) as usize);
    out.extend_from_slice(&cipher.header());
    for (index, chunk) in plain.chunks(CHUNK_SIZE as usize).enumerate() {
        out.extend(cipher.seal_chunk(index as u64, chunk)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> ChunkCipher {
        let key = derive_key("hunter2", "pepper");
        ChunkCipher::new(&key, [9u8; 24])
    }

    #[test]
    fn derive_key_is_deterministic_and_salt_sensitive() {
        let a = derive_key("pw", "salt");
        let b = derive_key("pw", "salt");
        let c = derive_key("pw", "other");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn length_maps_roundtrip() {
        for plain_len in [0u64, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 5 * CHUNK_SIZE + 17]
        {
            assert_eq!(plaintext_len(ciphertext_len(plain_len)).unwrap(), plain_len);
        }
        assert!(plaintext_len(HEADER_SIZE + TAG_SIZE).is_err());
    }

    #[test]
    fn span_is_chunk_aligned() {
        let (start, len) = ciphertext_span(CHUNK_SIZE + 5, 10);
        assert_eq!(start, HEADER_SIZE + (CHUNK_SIZE + TAG_SIZE));
        assert_eq!(len, CHUNK_SIZE + TAG_SIZE);

        let (start, len) = ciphertext_span(CHUNK_SIZE - 1, 2);
        assert_eq!(start, HEADER_SIZE);
        assert_eq!(len, 2 * (CHUNK_SIZE + TAG_SIZE));
    }

    #[test]
    fn seal_then_open_range_recovers_interior_bytes() {
        let cipher = test_cipher();
        let plain: Vec<u8> = (0..(2 * CHUNK_SIZE + 100)).map(|i| (i % 251) as u8).collect();
        let stream = seal_stream(&cipher, &plain).expect("seal");
        assert_eq!(stream.len() as u64, ciphertext_len(plain.len() as u64));

        let offset = CHUNK_SIZE + 17;
        let len = CHUNK_SIZE; // 跨越两个块
        let (span_start, span_len) = ciphertext_span(offset, len);
        let window = &stream[span_start as usize..(span_start + span_len) as usize];
        let out = cipher.open_range(window, offset, len).expect("open");
        assert_eq!(out, &plain[offset as usize..(offset + len) as usize]);
    }

    #[test]
    fn tampered_chunk_fails_authentication() {
        let cipher = test_cipher();
        let plain = vec![0xAB; CHUNK_SIZE as usize];
        let mut stream = seal_stream(&cipher, &plain).expect("seal");
        let flip_at = HEADER_SIZE as usize + 10;
        stream[flip_at] ^= 0x01;
        let (span_start, span_len) = ciphertext_span(0, CHUNK_SIZE);
        let window = &stream[span_start as usize..(span_start + span_len as u64) as usize];
        let err = cipher.open_range(window, 0, CHUNK_SIZE).unwrap_err();
        assert_eq!(err.code(), altmount_core::error::codes::DECRYPT_FAILED);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let key = derive_key("pw", "s");
        let mut header = [0u8; 32];
        header[..8].copy_from_slice(b"NOTMAGIC");
        assert!(ChunkCipher::from_header(&key, &header).is_err());
    }
}
