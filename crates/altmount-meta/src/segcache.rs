use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// 导入期分段缓存：按字节预算约束的小型 LRU。
///
/// # 设计背景（Why）
/// - 导入器解析 NZB 时会对每个文件的首段做 yEnc 头探测；同一段随后又要写
///   描述符校验，缓存避免了几秒内的重复取回；
/// - 预算按字节而非条目计：分段大小差异巨大，条目数无法约束内存。
///
/// # 契约说明（What）
/// - `insert` 在放入前逐出最久未用的条目直到预算容得下新值；单条超过预算
///   的值直接拒收（缓存对调用方而言只是加速器，不承诺保留）；
/// - 返回的载荷以 `Arc` 共享，逐出不影响在途引用。
pub struct SegmentCache {
    inner: Mutex<Inner>,
}

struct Inner {
    map: LruCache<String, Arc<Vec<u8>>>,
    used: u64,
    budget: u64,
}

impl SegmentCache {
    /// 以字节预算创建缓存。
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                used: 0,
                budget: budget_bytes,
            }),
        }
    }

    /// 放入一段解码后的载荷。
    pub fn insert(&self, article: impl Into<String>, payload: Vec<u8>) {
        let size = payload.len() as u64;
        let mut inner = self.inner.lock();
        if size > inner.budget {
            return;
        }
        while inner.used + size > inner.budget {
            match inner.map.pop_lru() {
                Some((_, evicted)) => inner.used -= evicted.len() as u64,
                None => break,
            }
        }
        let key = article.into();
        if let Some(previous) = inner.map.put(key, Arc::new(payload)) {
            inner.used -= previous.len() as u64;
        }
        inner.used += size;
    }

    /// 查询载荷；命中会刷新其 LRU 位置。
    pub fn get(&self, article: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().map.get(article).map(Arc::clone)
    }

    /// 当前驻留字节数。
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }
}
