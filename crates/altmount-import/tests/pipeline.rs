//! 摄取管线端到端测试：真实临时目录 + 脚本化报文来源。

use std::sync::Arc;
use std::time::Duration;

use altmount_core::configuration::{ConfigHandle, ConfigSnapshot};
use altmount_core::model::{HealthStatus, QueuePriority, QueueStatus, VirtualPath};
use altmount_core::test_stubs::{RecordingHealthRepo, StubArticle, StubArticleSource};
use altmount_core::time::{Clock, SystemClock};
use altmount_core::traits::DescriptorStore;
use altmount_import::{Database, EnqueueRequest, ImportWorkers, QueueStore};
use altmount_meta::MetadataStore;

const NZB: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="p@example" date="1699000000" subject="[1/3] &quot;movie.mkv&quot; yEnc (1/3)">
    <groups><group>alt.binaries.example</group></groups>
    <segments>
      <segment bytes="716800" number="1">m1@news</segment>
      <segment bytes="716800" number="2">m2@news</segment>
      <segment bytes="716800" number="3">m3@news</segment>
    </segments>
  </file>
</nzb>"#;

struct Rig {
    _dir: tempfile::TempDir,
    workers: ImportWorkers,
    queue: Arc<QueueStore>,
    store: Arc<MetadataStore>,
    source: Arc<StubArticleSource>,
    health: Arc<RecordingHealthRepo>,
    watch_dir: std::path::PathBuf,
    nzb_dir: std::path::PathBuf,
}

fn rig() -> Rig {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let watch_dir = dir.path().join("watch");
    let nzb_dir = dir.path().join("managed");
    std::fs::create_dir_all(&watch_dir).unwrap();

    let mut snapshot = ConfigSnapshot::default();
    snapshot.metadata.root = dir.path().join("meta");
    snapshot.metadata.nzb_dir = nzb_dir.clone();
    snapshot.import.db_path = dir.path().join("alt.db");
    snapshot.import.max_processor_workers = 1;
    snapshot.import.poll_interval_secs = 1;
    let config = ConfigHandle::new(snapshot);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(Database::open_in_memory().expect("db"));
    let queue = Arc::new(QueueStore::new(db, Arc::clone(&clock)));
    let store = Arc::new(MetadataStore::new(dir.path().join("meta"), 64).expect("store"));
    let source = Arc::new(StubArticleSource::new());
    let health = Arc::new(RecordingHealthRepo::default());

    let workers = ImportWorkers::new(
        Arc::clone(&queue),
        Arc::clone(&store) as Arc<dyn DescriptorStore>,
        Arc::clone(&health) as _,
        Arc::clone(&source) as _,
        None,
        config,
        clock,
    );
    Rig {
        _dir: dir,
        workers,
        queue,
        store,
        source,
        health,
        watch_dir,
        nzb_dir,
    }
}

async fn await_status(queue: &QueueStore, id: i64, expected: QueueStatus) {
    for _ in 0..100 {
        let item = queue.get(id).expect("get").expect("row");
        if item.status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let item = queue.get(id).expect("get").expect("row");
    panic!(
        "queue row {id} stuck in {:?} (error: {:?})",
        item.status, item.error_message
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_nzb_happy_path() {
    let rig = rig();
    for id in ["m1@news", "m2@news", "m3@news"] {
        rig.source
            .script(id, StubArticle::Body(vec![0xAB; 716_800]));
    }
    let nzb_path = rig.watch_dir.join("movie.nzb");
    std::fs::write(&nzb_path, NZB).unwrap();

    let id = rig
        .queue
        .enqueue(
            EnqueueRequest {
                nzb_path: nzb_path.display().to_string(),
                relative_path: None,
                category: Some("movies".into()),
                priority: QueuePriority::Normal,
            },
            3,
        )
        .expect("enqueue");
    rig.workers.start().expect("start");
    await_status(&rig.queue, id, QueueStatus::Completed).await;
    rig.workers.stop();

    // 描述符落在 (category, 文件名) 下。
    let path = VirtualPath::parse("/movies/movie.mkv").unwrap();
    let descriptor = rig.store.read(&path).expect("descriptor");
    assert_eq!(descriptor.size, 3 * 716_800);
    assert_eq!(descriptor.segments.len(), 3);
    assert_eq!(descriptor.release_date, Some(1_699_000_000));

    // 健康登记：status=pending。
    let upserts = rig.health.upserts.lock();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].file_path, "/movies/movie.mkv");
    assert_eq!(upserts[0].status, HealthStatus::Pending);

    // NZB 字节已迁入托管目录，监视目录清空。
    assert!(!nzb_path.exists());
    let managed: Vec<_> = std::fs::read_dir(&rig.nzb_dir)
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(managed.len(), 1);
    assert!(
        managed[0]
            .file_name()
            .to_string_lossy()
            .ends_with("_movie.nzb")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_nzb_fails_without_retry() {
    let rig = rig();
    let nzb_path = rig.watch_dir.join("broken.nzb");
    std::fs::write(&nzb_path, "this is not xml").unwrap();

    let id = rig
        .queue
        .enqueue(
            EnqueueRequest {
                nzb_path: nzb_path.display().to_string(),
                relative_path: None,
                category: None,
                priority: QueuePriority::Normal,
            },
            3,
        )
        .expect("enqueue");
    rig.workers.start().expect("start");
    await_status(&rig.queue, id, QueueStatus::Failed).await;
    rig.workers.stop();

    let item = rig.queue.get(id).unwrap().unwrap();
    // 格式错误不重试。
    assert_eq!(item.retry_count, 1);
    assert!(item.error_message.is_some());
    assert!(rig.health.upserts.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn obfuscated_subject_falls_back_to_probe() {
    let rig = rig();
    let nzb = NZB.replace(
        "[1/3] &quot;movie.mkv&quot; yEnc (1/3)",
        "a9f3c2e1b4d5 yEnc",
    );
    rig.source
        .script("m1@news", StubArticle::Body(vec![1; 1024]));
    rig.source.script("m2@news", StubArticle::Body(vec![2; 1024]));
    rig.source.script("m3@news", StubArticle::Body(vec![3; 1024]));
    rig.source.script_name("m1@news", "Real.Name.2024.mkv");

    let nzb_path = rig.watch_dir.join("obfuscated.nzb");
    std::fs::write(&nzb_path, nzb).unwrap();
    let id = rig
        .queue
        .enqueue(
            EnqueueRequest {
                nzb_path: nzb_path.display().to_string(),
                relative_path: Some("incoming".into()),
                category: Some("tv".into()),
                priority: QueuePriority::High,
            },
            3,
        )
        .expect("enqueue");
    rig.workers.start().expect("start");
    await_status(&rig.queue, id, QueueStatus::Completed).await;
    rig.workers.stop();

    let path = VirtualPath::parse("/tv/incoming/Real.Name.2024.mkv").unwrap();
    assert!(rig.store.read(&path).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_directory_feeds_the_queue() {
    let rig = rig();
    for id in ["m1@news", "m2@news", "m3@news"] {
        rig.source.script(id, StubArticle::Body(vec![7; 2048]));
    }
    // 先启动工作者，再投文件：扫描两轮判稳后入队。
    {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.metadata.root = rig._dir.path().join("meta");
        snapshot.metadata.nzb_dir = rig.nzb_dir.clone();
        snapshot.import.watch_dir = Some(rig.watch_dir.clone());
        snapshot.import.watch_interval_secs = 1;
        snapshot.import.poll_interval_secs = 1;
        snapshot.import.max_processor_workers = 1;
        // rig() 的句柄是同一个 Arc；重装快照即可热启用监视目录。
        rig.workers_config_handle().install(snapshot);
    }
    rig.workers.start().expect("start");

    let nzb_path = rig.watch_dir.join("drop.nzb");
    std::fs::write(&nzb_path, NZB).unwrap();

    for _ in 0..200 {
        if rig.queue.stats().expect("stats").completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    rig.workers.stop();
    assert_eq!(rig.queue.stats().expect("stats").completed, 1);
}

impl Rig {
    fn workers_config_handle(&self) -> Arc<ConfigHandle> {
        self.workers.config_handle()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_pending_item_before_any_worker_runs() {
    let rig = rig();
    let id = rig
        .queue
        .enqueue(
            EnqueueRequest {
                nzb_path: "/nowhere/x.nzb".into(),
                relative_path: None,
                category: None,
                priority: QueuePriority::Low,
            },
            3,
        )
        .expect("enqueue");
    rig.workers.cancel(id).expect("cancel");
    assert_eq!(
        rig.queue.get(id).unwrap().unwrap().status,
        QueueStatus::Cancelled
    );
}
