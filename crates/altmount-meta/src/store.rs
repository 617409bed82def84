use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{DirEntry, FileDescriptor, FileStatus, VirtualPath};
use altmount_core::traits::DescriptorStore;

use crate::format::{decode_descriptor, encode_descriptor, peek_created_at};

/// 描述符文件的磁盘后缀；目录名与文件名因此天然不冲突。
const META_SUFFIX: &str = ".meta";

/// 描述符存储：本地目录树 + 有界 LRU。
///
/// # 设计背景（Why）
/// - 描述符是读路径的热点：同一文件的顺序读会反复取快照，LRU 把解码成本
///   摊平；容量有界，防止海量小文件把内存拖垮；
/// - 写入方唯一（导入器）且写读可并发，原子替换让读者永远看到完整映像。
///
/// # 契约说明（What）
/// - `write`：同目录临时文件 + fsync + rename；rename 可见之前 LRU 先失效；
/// - `read`：缺失路径返回 `meta.not_found`；命中缓存直接返回共享快照；
/// - `list`：枚举直接子项，文件与目录同名时文件胜出；
/// - `update_status`：读-改-写整个文件，分段清单语义不变，尾部字节保留。
pub struct MetadataStore {
    root: PathBuf,
    cache: Mutex<LruCache<String, Arc<FileDescriptor>>>,
}

impl MetadataStore {
    /// 打开（必要时创建）描述符根目录。
    pub fn new(root: impl Into<PathBuf>, lru_capacity: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_error)?;
        let capacity = NonZeroUsize::new(lru_capacity.max(1)).expect("capacity >= 1");
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// 描述符根目录。
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn descriptor_fs_path(&self, path: &VirtualPath) -> Result<PathBuf> {
        if path.is_root() {
            return Err(CoreError::new(
                codes::DESCRIPTOR_NOT_FOUND,
                "the mount root cannot host a descriptor",
            ));
        }
        let mut fs_path = self.root.clone();
        let parent = path.parent();
        for component in parent.components() {
            fs_path.push(component);
        }
        fs_path.push(format!("{}{}", path.file_name(), META_SUFFIX));
        Ok(fs_path)
    }

    fn directory_fs_path(&self, path: &VirtualPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn invalidate(&self, path: &VirtualPath) {
        self.cache.lock().pop(path.as_str());
    }

    /// 自下而上删除空目录，直到根或遇到非空目录为止。
    ///
    /// 删除描述符后目录可能悬空；调用方在确认不再需要该前缀时显式调用。
    pub fn prune_empty_dirs(&self, from: &VirtualPath) {
        let mut current = from.clone();
        while !current.is_root() {
            let fs_path = self.directory_fs_path(&current);
            match fs::remove_dir(&fs_path) {
                Ok(()) => {
                    debug!(path = %current, "pruned empty metadata directory");
                    current = current.parent();
                }
                // 非空或并发写入：到此为止。
                Err(_) => break,
            }
        }
    }

    fn read_uncached(&self, path: &VirtualPath) -> Result<FileDescriptor> {
        let fs_path = self.descriptor_fs_path(path)?;
        let bytes = fs::read(&fs_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::new(
                    codes::DESCRIPTOR_NOT_FOUND,
                    format!("no descriptor at {path}"),
                )
            } else {
                io_error(err)
            }
        })?;
        decode_descriptor(&bytes)
    }

    fn list_directory(&self, prefix: &VirtualPath) -> Result<Vec<DirEntry>> {
        let dir = self.directory_fs_path(prefix);
        let reader = fs::read_dir(&dir).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::new(codes::PATH_NOT_FOUND, format!("no directory at {prefix}"))
            } else {
                io_error(err)
            }
        })?;

        let mut files: Vec<DirEntry> = Vec::new();
        let mut dirs: Vec<DirEntry> = Vec::new();
        for entry in reader {
            let entry = entry.map_err(io_error)?;
            let file_type = entry.file_type().map_err(io_error)?;
            let raw_name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_file() {
                let Some(name) = raw_name.strip_suffix(META_SUFFIX) else {
                    continue; // 临时文件或外来杂物
                };
                let child = prefix.join(name)?;
                let descriptor = self.read(&child)?;
                files.push(DirEntry {
                    name: name.to_string(),
                    size: descriptor.size,
                    mtime: descriptor.created_at,
                    is_dir: false,
                });
            } else if file_type.is_dir() {
                if let Some(max_created) = subtree_max_created(&entry.path()) {
                    dirs.push(DirEntry {
                        name: raw_name,
                        size: 0,
                        mtime: max_created,
                        is_dir: true,
                    });
                }
            }
        }

        // 文件与目录同名时文件胜出。
        let mut entries = files;
        for dir_entry in dirs {
            if !entries.iter().any(|e| e.name == dir_entry.name) {
                entries.push(dir_entry);
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

impl DescriptorStore for MetadataStore {
    fn write(&self, path: &VirtualPath, descriptor: &FileDescriptor) -> Result<()> {
        descriptor.validate()?;
        let fs_path = self.descriptor_fs_path(path)?;
        let parent = fs_path
            .parent()
            .ok_or_else(|| CoreError::new(codes::META_IO, "descriptor path without parent"))?;
        fs::create_dir_all(parent).map_err(io_error)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_error)?;
        temp.write_all(&encode_descriptor(descriptor))
            .map_err(io_error)?;
        temp.as_file().sync_all().map_err(io_error)?;

        // 失效先于 rename 可见，读者不可能命中陈旧快照。
        self.invalidate(path);
        temp.persist(&fs_path)
            .map_err(|err| io_error(err.error))?;
        debug!(path = %path, size = descriptor.size, "descriptor written");
        Ok(())
    }

    fn read(&self, path: &VirtualPath) -> Result<Arc<FileDescriptor>> {
        if let Some(hit) = self.cache.lock().get(path.as_str()) {
            return Ok(Arc::clone(hit));
        }
        let descriptor = Arc::new(self.read_uncached(path)?);
        self.cache
            .lock()
            .put(path.as_str().to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    fn delete(&self, path: &VirtualPath) -> Result<()> {
        let fs_path = self.descriptor_fs_path(path)?;
        self.invalidate(path);
        fs::remove_file(&fs_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::new(
                    codes::DESCRIPTOR_NOT_FOUND,
                    format!("no descriptor at {path}"),
                )
            } else {
                io_error(err)
            }
        })
    }

    fn list(&self, prefix: &VirtualPath) -> Result<Vec<DirEntry>> {
        self.list_directory(prefix)
    }

    fn update_status(&self, path: &VirtualPath, status: FileStatus) -> Result<()> {
        let mut descriptor = (*self.read(path)?).clone();
        if descriptor.status == status {
            return Ok(());
        }
        descriptor.status = status;
        self.write(path, &descriptor)
    }
}

/// 递归求子树里所有描述符的最大 `created_at`；子树没有描述符时返回 `None`。
fn subtree_max_created(dir: &Path) -> Option<i64> {
    let reader = fs::read_dir(dir).ok()?;
    let mut max_created: Option<i64> = None;
    for entry in reader.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let candidate = if file_type.is_dir() {
            subtree_max_created(&entry.path())
        } else if entry.file_name().to_string_lossy().ends_with(META_SUFFIX) {
            match fs::read(entry.path()).map(|bytes| peek_created_at(&bytes)) {
                Ok(Ok(created)) => Some(created),
                Ok(Err(err)) => {
                    warn!(file = %entry.path().display(), error = %err, "unreadable descriptor header");
                    None
                }
                Err(_) => None,
            }
        } else {
            None
        };
        max_created = match (max_created, candidate) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
    max_created
}

fn io_error(err: std::io::Error) -> CoreError {
    CoreError::new(codes::META_IO, "metadata directory I/O failed").with_cause(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use altmount_core::model::{Encryption, Segment};

    fn descriptor(size: u64, created_at: i64) -> FileDescriptor {
        FileDescriptor {
            size,
            source_nzb_path: "/nzbs/x.nzb".into(),
            status: FileStatus::Healthy,
            created_at,
            release_date: None,
            password: None,
            salt: None,
            encryption: Encryption::None,
            segments: vec![Segment::new("a@b", size)],
            trailing: Vec::new(),
        }
    }

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = MetadataStore::new(dir.path().join("meta"), 16).expect("store");
        (dir, store)
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (_dir, store) = store();
        let path = VirtualPath::parse("/movies/film.mkv").unwrap();
        let d = descriptor(1024, 100);
        store.write(&path, &d).expect("write");
        assert_eq!(*store.read(&path).expect("read"), d);
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, store) = store();
        let path = VirtualPath::parse("/nope.bin").unwrap();
        let err = store.read(&path).unwrap_err();
        assert_eq!(err.code(), codes::DESCRIPTOR_NOT_FOUND);
    }

    #[test]
    fn rewrite_invalidates_cache() {
        let (_dir, store) = store();
        let path = VirtualPath::parse("/a/b.bin").unwrap();
        store.write(&path, &descriptor(10, 1)).unwrap();
        let _warm = store.read(&path).unwrap();
        store.write(&path, &descriptor(20, 2)).unwrap();
        assert_eq!(store.read(&path).unwrap().size, 20);
    }

    #[test]
    fn update_status_preserves_segments_and_trailing() {
        let (_dir, store) = store();
        let path = VirtualPath::parse("/a/c.bin").unwrap();
        let mut d = descriptor(10, 1);
        d.trailing = vec![1, 2, 3];
        store.write(&path, &d).unwrap();
        store.update_status(&path, FileStatus::Partial).unwrap();
        let read_back = store.read(&path).unwrap();
        assert_eq!(read_back.status, FileStatus::Partial);
        assert_eq!(read_back.segments, d.segments);
        assert_eq!(read_back.trailing, vec![1, 2, 3]);
    }

    #[test]
    fn listing_merges_files_and_directories_sorted() {
        let (_dir, store) = store();
        store
            .write(&VirtualPath::parse("/tv/show/s01e01.mkv").unwrap(), &descriptor(5, 7))
            .unwrap();
        store
            .write(&VirtualPath::parse("/tv/show/s01e02.mkv").unwrap(), &descriptor(5, 9))
            .unwrap();
        store
            .write(&VirtualPath::parse("/tv/alpha.mkv").unwrap(), &descriptor(3, 4))
            .unwrap();

        let entries = store.list(&VirtualPath::parse("/tv").unwrap()).expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.mkv", "show"]);
        assert!(!entries[0].is_dir);
        assert!(entries[1].is_dir);
        // 目录 mtime 取子树内最大 created_at。
        assert_eq!(entries[1].mtime, 9);
    }

    #[test]
    fn listing_missing_directory_is_not_found() {
        let (_dir, store) = store();
        let err = store.list(&VirtualPath::parse("/ghost").unwrap()).unwrap_err();
        assert_eq!(err.code(), codes::PATH_NOT_FOUND);
    }

    #[test]
    fn delete_then_prune_removes_empty_parents() {
        let (_dir, store) = store();
        let path = VirtualPath::parse("/deep/nest/file.bin").unwrap();
        store.write(&path, &descriptor(1, 1)).unwrap();
        store.delete(&path).unwrap();
        store.prune_empty_dirs(&path.parent());
        let err = store.list(&VirtualPath::parse("/deep").unwrap()).unwrap_err();
        assert_eq!(err.code(), codes::PATH_NOT_FOUND);
    }
}
