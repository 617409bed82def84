//! 框架官方维护的测试桩，供跨 crate 的集成测试复用。
//!
//! # 设计背景（Why）
//! - 虚拟文件系统、导入器与健康调度的测试都需要脚本化的报文来源与记录型
//!   协作方；集中维护避免各处重复定义，契约演进时单点更新。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::contract::CallContext;
use crate::error::{CoreError, Result, codes};
use crate::model::HealthRecord;
use crate::traits::{
    ArticleProbe, ArticleSource, BodySink, HealthRepo, RescanDispatcher, VfsRefresher,
};

/// 单个报文的脚本化行为。
#[derive(Clone, Debug)]
pub enum StubArticle {
    /// 正常返回给定载荷。
    Body(Vec<u8>),
    /// 所有提供方都报告 430（确定性缺失）。
    Missing,
    /// 前 `failures` 次调用返回瞬态错误，之后返回载荷。
    FlakyThen { failures: usize, payload: Vec<u8>},
}

/// 脚本化的报文来源。
///
/// # 契约说明（What）
/// - 未登记的报文一律按 `Missing` 处理；
/// - `body_calls`/`stat_calls` 记录调用次数，便于断言重试与抽样行为。
pub struct StubArticleSource {
    articles: Mutex<HashMap<String, StubArticle>>,
    names: Mutex<HashMap<String, String>>,
    attempts: Mutex<HashMap<String, usize>>,
    body_calls: AtomicUsize,
    stat_calls: AtomicUsize,
}

impl Default for StubArticleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StubArticleSource {
    pub fn new() -> Self {
        Self {
            articles: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            body_calls: AtomicUsize::new(0),
            stat_calls: AtomicUsize::new(0),
        }
    }

    /// 登记一个报文的行为脚本。
    pub fn script(&self, article: impl Into<String>, behaviour: StubArticle) {
        self.articles.lock().insert(article.into(), behaviour);
    }

    /// 登记探头摘要里返回的文件名。
    pub fn script_name(&self, article: impl Into<String>, name: impl Into<String>) {
        self.names.lock().insert(article.into(), name.into());
    }

    pub fn body_calls(&self) -> usize {
        self.body_calls.load(Ordering::SeqCst)
    }

    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    fn resolve(&self, article: &str) -> Result<Option<Vec<u8>>> {
        let behaviour = self.articles.lock().get(article).cloned();
        match behaviour {
            None | Some(StubArticle::Missing) => Ok(None),
            Some(StubArticle::Body(payload)) => Ok(Some(payload)),
            Some(StubArticle::FlakyThen { failures, payload }) => {
                let mut attempts = self.attempts.lock();
                let seen = attempts.entry(article.to_string()).or_insert(0);
                *seen += 1;
                if *seen <= failures {
                    Err(CoreError::new(codes::TRANSIENT, "scripted transient failure"))
                } else {
                    Ok(Some(payload))
                }
            }
        }
    }
}

#[async_trait]
impl ArticleSource for StubArticleSource {
    async fn body(
        &self,
        ctx: &CallContext,
        article: &str,
        _groups: &[String],
        sink: &mut dyn BodySink,
    ) -> Result<u64> {
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        ctx.ensure_active(std::time::Instant::now())?;
        match self.resolve(article)? {
            Some(payload) => {
                sink.write(&payload)?;
                Ok(payload.len() as u64)
            }
            None => Err(CoreError::new(
                codes::PROVIDER_EXHAUSTED,
                format!("article {article} unavailable on all providers"),
            )),
        }
    }

    async fn stat(&self, ctx: &CallContext, article: &str, _groups: &[String]) -> Result<bool> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        ctx.ensure_active(std::time::Instant::now())?;
        Ok(self.resolve(article)?.is_some())
    }

    async fn probe(
        &self,
        ctx: &CallContext,
        article: &str,
        _groups: &[String],
    ) -> Result<ArticleProbe> {
        ctx.ensure_active(std::time::Instant::now())?;
        match self.resolve(article)? {
            Some(payload) => Ok(ArticleProbe {
                name: self.names.lock().get(article).cloned(),
                declared_part_size: Some(payload.len() as u64),
                declared_total_size: None,
                payload_len: payload.len() as u64,
            }),
            None => Err(CoreError::new(
                codes::PROVIDER_EXHAUSTED,
                format!("article {article} unavailable on all providers"),
            )),
        }
    }
}

/// 什么都不做的刷新通知桩。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRefresher;

impl VfsRefresher for NoopRefresher {
    fn refresh_dir(&self, _name: &str, _dirs: &[String]) {}
}

/// 记录型刷新桩：保存每次通知的目录参数。
#[derive(Default)]
pub struct RecordingRefresher {
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl VfsRefresher for RecordingRefresher {
    fn refresh_dir(&self, name: &str, dirs: &[String]) {
        self.calls.lock().push((name.to_string(), dirs.to_vec()));
    }
}

/// 记录型健康登记桩。
#[derive(Default)]
pub struct RecordingHealthRepo {
    pub upserts: Mutex<Vec<HealthRecord>>,
    pub check_requests: Mutex<Vec<(String, String)>>,
    pub removals: Mutex<Vec<String>>,
}

impl HealthRepo for RecordingHealthRepo {
    fn upsert_pending(&self, record: HealthRecord) -> Result<()> {
        self.upserts.lock().push(record);
        Ok(())
    }

    fn request_check(&self, file_path: &str, reason: &str) -> Result<()> {
        self.check_requests
            .lock()
            .push((file_path.to_string(), reason.to_string()));
        Ok(())
    }

    fn remove(&self, file_path: &str) -> Result<()> {
        self.removals.lock().push(file_path.to_string());
        Ok(())
    }
}

/// 记录型修复分发桩：可脚本化返回值并记录全部调用。
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<(String, String)>>,
    outcome: Mutex<Option<&'static str>>,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        }
    }

    /// 让后续调用返回指定错误码（例如 `repair.path_match_failed`）。
    pub fn fail_with(&self, code: &'static str) {
        *self.outcome.lock() = Some(code);
    }

    /// 恢复成功返回。
    pub fn succeed(&self) {
        *self.outcome.lock() = None;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RescanDispatcher for RecordingDispatcher {
    async fn trigger_rescan(
        &self,
        _ctx: &CallContext,
        path_for_rescan: &str,
        relative_path: &str,
    ) -> Result<()> {
        self.calls
            .lock()
            .push((path_for_rescan.to_string(), relative_path.to_string()));
        match *self.outcome.lock() {
            Some(code) => Err(CoreError::new(code, "scripted dispatcher failure")),
            None => Ok(()),
        }
    }
}

/// 便捷别名：测试里常以 `Arc` 共享桩对象。
pub type SharedStubSource = Arc<StubArticleSource>;
