use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use altmount_core::configuration::ConfigHandle;
use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{DirEntry, Encryption, FileDescriptor, FileStatus, VirtualPath};
use altmount_core::traits::{ArticleSource, DescriptorStore, HealthRepo};
use altmount_yenc::{ChunkCipher, HEADER_SIZE, ciphertext_len, ciphertext_span, derive_key};

use crate::crypto::decrypt_window;
use crate::read::{FetchParams, FetchResult, fetch_stream_range};

/// 一次 `read_at` 的结果。
///
/// # 契约说明（What）
/// - `bytes`：按文件序交付的字节；
/// - `interrupted`：分段缺失导致的截断原因（`vfs.short_read`）。`None` 表示
///   请求区间完整交付。宽容模式下字节被零填充补齐，`interrupted` 仍为
///   `None`，但文件已被降级为 `partial`。
#[derive(Debug)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    pub interrupted: Option<CoreError>,
}

/// `stat` 的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime: i64,
    pub is_dir: bool,
}

/// 打开的文件句柄：持有打开时刻的描述符快照。
///
/// 句柄之间相互独立；同一句柄不要求支持并发 `read_at`，组件整体是并发安全的。
pub struct FileHandle {
    path: VirtualPath,
    descriptor: Arc<FileDescriptor>,
    cipher: Mutex<Option<Arc<ChunkCipher>>>,
}

impl FileHandle {
    /// 句柄对应的虚拟路径。
    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    /// 打开时刻的文件大小（加密文件为明文大小）。
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// 打开时刻的描述符快照。
    pub fn descriptor(&self) -> &Arc<FileDescriptor> {
        &self.descriptor
    }
}

/// 只读虚拟文件系统。
///
/// # 设计背景（Why）
/// - WebDAV 前端只需要 `open/stat/read_at/list` 四个动作；写操作一律拒绝；
/// - 依赖全部走 `altmount-core` 能力接口，组合根装配一次，测试注入桩。
pub struct VirtualFs {
    store: Arc<dyn DescriptorStore>,
    source: Arc<dyn ArticleSource>,
    health: Arc<dyn HealthRepo>,
    config: Arc<ConfigHandle>,
}

impl VirtualFs {
    pub fn new(
        store: Arc<dyn DescriptorStore>,
        source: Arc<dyn ArticleSource>,
        health: Arc<dyn HealthRepo>,
        config: Arc<ConfigHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            health,
            config,
        })
    }

    /// 打开文件，返回持有描述符快照的句柄。
    pub fn open(&self, path: &VirtualPath) -> Result<FileHandle> {
        let descriptor = self.store.read(path).map_err(|err| to_vfs_not_found(path, err))?;
        Ok(FileHandle {
            path: path.clone(),
            descriptor,
            cipher: Mutex::new(None),
        })
    }

    /// 查询文件或目录属性。
    pub fn stat(&self, path: &VirtualPath) -> Result<FileStat> {
        match self.store.read(path) {
            Ok(descriptor) => Ok(FileStat {
                size: descriptor.size,
                mtime: descriptor.created_at,
                is_dir: false,
            }),
            Err(err) if err.is_not_found() => {
                let entries = self
                    .store
                    .list(path)
                    .map_err(|err| to_vfs_not_found(path, err))?;
                let mtime = entries.iter().map(|e| e.mtime).max().unwrap_or(0);
                Ok(FileStat {
                    size: 0,
                    mtime,
                    is_dir: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// 列目录：子项按名字典序返回。
    pub fn list(&self, path: &VirtualPath) -> Result<Vec<DirEntry>> {
        self.store.list(path).map_err(|err| to_vfs_not_found(path, err))
    }

    /// 读取 `[offset, offset+length)`；`length = -1` 表示流式读。
    ///
    /// # 契约说明（What）
    /// - 单次交付上限：显式长度受 `max_range_size` 封顶，流式读受
    ///   `streaming_chunk_size` 封顶；
    /// - `offset ≥ size` 返回空结果；区间尾部越界自动截到文件尾；
    /// - 缺段处理见 [`ReadOutcome`]。
    pub async fn read_at(
        &self,
        ctx: &CallContext,
        handle: &FileHandle,
        offset: u64,
        length: i64,
    ) -> Result<ReadOutcome> {
        let settings = self.config.current().vfs.clone();
        let size = handle.descriptor.size;
        if offset >= size {
            return Ok(ReadOutcome {
                bytes: Vec::new(),
                interrupted: None,
            });
        }
        let remaining = size - offset;
        let len = if length < 0 {
            remaining.min(settings.streaming_chunk_size)
        } else {
            remaining.min(length as u64).min(settings.max_range_size)
        };
        if len == 0 {
            return Ok(ReadOutcome {
                bytes: Vec::new(),
                interrupted: None,
            });
        }

        let params = FetchParams {
            workers: settings.download_workers,
            ring_budget_bytes: settings.ring_budget_bytes,
            permissive: settings.permissive_reads,
        };

        let result = match handle.descriptor.encryption {
            Encryption::None => {
                let fetched = fetch_stream_range(
                    &self.source,
                    ctx,
                    &handle.descriptor,
                    offset,
                    len,
                    &params,
                )
                .await?;
                self.finish_plain(handle, fetched, params.permissive)
            }
            Encryption::Rclone => {
                self.read_encrypted(ctx, handle, offset, len, &params).await
            }
        }?;
        Ok(result)
    }

    /// 明文路径收尾：把取回结果翻译为读结果并按需降级。
    fn finish_plain(
        &self,
        handle: &FileHandle,
        fetched: FetchResult,
        permissive: bool,
    ) -> Result<ReadOutcome> {
        let FetchResult { bytes, failure } = fetched;
        match failure {
            None => Ok(ReadOutcome {
                bytes,
                interrupted: None,
            }),
            Some((idx, cause)) => {
                self.demote_to_partial(handle, idx, &cause);
                if permissive {
                    Ok(ReadOutcome {
                        bytes,
                        interrupted: None,
                    })
                } else {
                    Ok(ReadOutcome {
                        bytes,
                        interrupted: Some(
                            CoreError::new(
                                codes::SHORT_READ,
                                format!("read truncated at segment {idx}"),
                            )
                            .with_cause(cause),
                        ),
                    })
                }
            }
        }
    }

    /// 加密路径：明文区间 → 块对齐密文窗口 → 逐块解密。
    async fn read_encrypted(
        &self,
        ctx: &CallContext,
        handle: &FileHandle,
        offset: u64,
        len: u64,
        params: &FetchParams,
    ) -> Result<ReadOutcome> {
        let descriptor = &handle.descriptor;
        let cipher = self.cipher_for(ctx, handle, params).await?;

        let (span_start, span_len) = ciphertext_span(offset, len);
        let cipher_total = ciphertext_len(descriptor.size);
        let clamped_len = span_len.min(cipher_total.saturating_sub(span_start));

        let fetched = fetch_stream_range(
            &self.source,
            ctx,
            descriptor,
            span_start,
            clamped_len,
            params,
        )
        .await?;
        if let Some((idx, cause)) = &fetched.failure {
            self.demote_to_partial(handle, *idx, cause);
        }

        let outcome = decrypt_window(
            &cipher,
            &fetched.bytes,
            descriptor.size,
            offset,
            len,
            params.permissive,
        )?;
        let interrupted = match outcome.failure {
            Some(cause) if (outcome.bytes.len() as u64) < len => Some(
                CoreError::new(codes::SHORT_READ, "encrypted read truncated").with_cause(cause),
            ),
            _ => None,
        };
        Ok(ReadOutcome {
            bytes: outcome.bytes,
            interrupted,
        })
    }

    /// 惰性装配并缓存本句柄的块密钥（密文头只取一次）。
    async fn cipher_for(
        &self,
        ctx: &CallContext,
        handle: &FileHandle,
        params: &FetchParams,
    ) -> Result<Arc<ChunkCipher>> {
        if let Some(cipher) = handle.cipher.lock().as_ref() {
            return Ok(Arc::clone(cipher));
        }
        let descriptor = &handle.descriptor;
        let password = descriptor.password.as_deref().ok_or_else(|| {
            CoreError::new(codes::DECRYPT_FAILED, "encrypted descriptor without password")
        })?;
        let key = derive_key(password, descriptor.salt.as_deref().unwrap_or(""));

        // 头部取回始终走严格模式：零填充的头没有任何意义。
        let strict = FetchParams {
            workers: 1,
            ring_budget_bytes: params.ring_budget_bytes,
            permissive: false,
        };
        let fetched =
            fetch_stream_range(&self.source, ctx, descriptor, 0, HEADER_SIZE, &strict).await?;
        if (fetched.bytes.len() as u64) < HEADER_SIZE {
            let base = CoreError::new(codes::SHORT_READ, "cipher header unavailable");
            return Err(match fetched.failure {
                Some((_, cause)) => base.with_cause(cause),
                None => base,
            });
        }
        let cipher = Arc::new(ChunkCipher::from_header(&key, &fetched.bytes)?);
        *handle.cipher.lock() = Some(Arc::clone(&cipher));
        Ok(cipher)
    }

    /// 尽力而为的降级：描述符状态置 `partial` 并请求健康复查，失败只记日志。
    fn demote_to_partial(&self, handle: &FileHandle, idx: usize, cause: &CoreError) {
        if handle.descriptor.status != FileStatus::Healthy {
            return;
        }
        debug!(path = %handle.path, segment = idx, cause = %cause, "demoting file to partial");
        if let Err(err) = self.store.update_status(&handle.path, FileStatus::Partial) {
            warn!(path = %handle.path, error = %err, "failed to persist partial status");
        }
        if let Err(err) = self
            .health
            .request_check(handle.path.as_str(), "missing segment observed during read")
        {
            warn!(path = %handle.path, error = %err, "failed to request health check");
        }
    }

    /// 写操作一律拒绝：创建。
    pub fn create(&self, _path: &VirtualPath) -> Result<()> {
        Err(read_only())
    }

    /// 写操作一律拒绝：删除。
    pub fn remove(&self, _path: &VirtualPath) -> Result<()> {
        Err(read_only())
    }

    /// 写操作一律拒绝：重命名。
    pub fn rename(&self, _from: &VirtualPath, _to: &VirtualPath) -> Result<()> {
        Err(read_only())
    }

    /// 写操作一律拒绝：建目录。
    pub fn mkdir(&self, _path: &VirtualPath) -> Result<()> {
        Err(read_only())
    }
}

fn read_only() -> CoreError {
    CoreError::new(codes::READ_ONLY, "the virtual tree is read-only")
}

fn to_vfs_not_found(path: &VirtualPath, err: CoreError) -> CoreError {
    if err.is_not_found() {
        CoreError::new(codes::PATH_NOT_FOUND, format!("no entry at {path}")).with_cause(err)
    } else {
        err
    }
}
