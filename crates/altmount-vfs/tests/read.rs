//! 读路径契约测试：区间装配、边界行为、缺段语义与加密区间。
//!
//! 依赖注入全部走 `altmount-core` 的官方桩：报文来源是脚本化的
//! `StubArticleSource`，描述符存储用真实的 `MetadataStore`（临时目录）。

use std::sync::Arc;

use altmount_core::configuration::{ConfigHandle, ConfigSnapshot};
use altmount_core::contract::CallContext;
use altmount_core::error::codes;
use altmount_core::model::{
    Encryption, FileDescriptor, FileStatus, Segment, VirtualPath,
};
use altmount_core::test_stubs::{RecordingHealthRepo, StubArticle, StubArticleSource};
use altmount_core::traits::DescriptorStore;
use altmount_meta::MetadataStore;
use altmount_vfs::VirtualFs;
use altmount_yenc::{ChunkCipher, derive_key, seal_stream};

struct Rig {
    _dir: tempfile::TempDir,
    fs: Arc<VirtualFs>,
    source: Arc<StubArticleSource>,
    health: Arc<RecordingHealthRepo>,
    store: Arc<MetadataStore>,
}

fn rig_with(mutate: impl FnOnce(&mut ConfigSnapshot)) -> Rig {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut snapshot = ConfigSnapshot::default();
    snapshot.vfs.download_workers = 4;
    mutate(&mut snapshot);
    let config = ConfigHandle::new(snapshot);

    let store = Arc::new(MetadataStore::new(dir.path().join("meta"), 64).expect("store"));
    let source = Arc::new(StubArticleSource::new());
    let health = Arc::new(RecordingHealthRepo::default());
    let fs = VirtualFs::new(
        Arc::clone(&store) as Arc<dyn DescriptorStore>,
        Arc::clone(&source) as _,
        Arc::clone(&health) as _,
        config,
    );
    Rig {
        _dir: dir,
        fs,
        source,
        health,
        store,
    }
}

fn rig() -> Rig {
    rig_with(|_| {})
}

/// 三段各 700 字节、总大小 2100 的标准样本。
fn seed_three_segments(rig: &Rig) -> (VirtualPath, Vec<u8>) {
    let mut payload = Vec::with_capacity(2100);
    for segment in 0u8..3 {
        payload.extend(std::iter::repeat_n(segment + 1, 700));
    }
    let path = VirtualPath::parse("/movies/film.bin").unwrap();
    let descriptor = FileDescriptor {
        size: 2100,
        source_nzb_path: "/nzbs/film.nzb".into(),
        status: FileStatus::Healthy,
        created_at: 1_700_000_000,
        release_date: None,
        password: None,
        salt: None,
        encryption: Encryption::None,
        segments: (0..3)
            .map(|i| Segment::new(format!("seg{i}@test"), 700))
            .collect(),
        trailing: Vec::new(),
    };
    rig.store.write(&path, &descriptor).expect("seed descriptor");
    for i in 0..3 {
        rig.source.script(
            format!("seg{i}@test"),
            StubArticle::Body(payload[i * 700..(i + 1) * 700].to_vec()),
        );
    }
    (path, payload)
}

#[tokio::test]
async fn full_read_equals_segment_concatenation() {
    let rig = rig();
    let (path, payload) = seed_three_segments(&rig);
    let handle = rig.fs.open(&path).expect("open");
    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, 2100)
        .await
        .expect("read");
    assert!(out.interrupted.is_none());
    assert_eq!(out.bytes, payload);
}

#[tokio::test]
async fn boundary_reads_behave_exactly() {
    let rig = rig();
    let (path, payload) = seed_three_segments(&rig);
    let handle = rig.fs.open(&path).expect("open");
    let ctx = CallContext::new();

    // 恰在分段边界：返回下一段的第一个字节。
    let out = rig.fs.read_at(&ctx, &handle, 700, 1).await.expect("read");
    assert_eq!(out.bytes, vec![payload[700]]);

    // 最后一个字节。
    let out = rig.fs.read_at(&ctx, &handle, 2099, 1).await.expect("read");
    assert_eq!(out.bytes, vec![payload[2099]]);

    // offset == size：零字节。
    let out = rig.fs.read_at(&ctx, &handle, 2100, 1).await.expect("read");
    assert!(out.bytes.is_empty());

    // 跨段读取。
    let out = rig.fs.read_at(&ctx, &handle, 650, 100).await.expect("read");
    assert_eq!(out.bytes, &payload[650..750]);
}

#[tokio::test]
async fn streaming_read_is_capped_by_chunk_size() {
    let rig = rig_with(|snapshot| snapshot.vfs.streaming_chunk_size = 1000);
    let (path, payload) = seed_three_segments(&rig);
    let handle = rig.fs.open(&path).expect("open");

    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, -1)
        .await
        .expect("read");
    assert_eq!(out.bytes, &payload[..1000]);

    // 尾部不足一个块时交付剩余字节。
    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 1800, -1)
        .await
        .expect("read");
    assert_eq!(out.bytes, &payload[1800..]);
}

#[tokio::test]
async fn explicit_read_is_capped_by_max_range_size() {
    let rig = rig_with(|snapshot| snapshot.vfs.max_range_size = 500);
    let (path, payload) = seed_three_segments(&rig);
    let handle = rig.fs.open(&path).expect("open");

    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, 2100)
        .await
        .expect("read");
    assert_eq!(out.bytes, &payload[..500]);
    assert!(out.interrupted.is_none());
}

#[tokio::test]
async fn missing_middle_segment_strict_short_read() {
    let rig = rig();
    let (path, payload) = seed_three_segments(&rig);
    rig.source.script("seg1@test", StubArticle::Missing);

    let handle = rig.fs.open(&path).expect("open");
    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, 2100)
        .await
        .expect("read");

    // 恰好交付失败分段之前的 700 字节。
    assert_eq!(out.bytes, &payload[..700]);
    let interrupted = out.interrupted.expect("short read");
    assert_eq!(interrupted.code(), codes::SHORT_READ);

    // 描述符被降级，健康复查被请求。
    assert_eq!(rig.store.read(&path).unwrap().status, FileStatus::Partial);
    assert_eq!(rig.health.check_requests.lock().len(), 1);
}

#[tokio::test]
async fn missing_middle_segment_permissive_zero_fills() {
    let rig = rig_with(|snapshot| snapshot.vfs.permissive_reads = true);
    let (path, payload) = seed_three_segments(&rig);
    rig.source.script("seg1@test", StubArticle::Missing);

    let handle = rig.fs.open(&path).expect("open");
    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, 2100)
        .await
        .expect("read");

    assert!(out.interrupted.is_none());
    assert_eq!(out.bytes.len(), 2100);
    assert_eq!(&out.bytes[..700], &payload[..700]);
    assert!(out.bytes[700..1400].iter().all(|&b| b == 0));
    assert_eq!(&out.bytes[1400..], &payload[1400..]);
    assert_eq!(rig.store.read(&path).unwrap().status, FileStatus::Partial);
}

#[tokio::test]
async fn short_segment_is_detected() {
    let rig = rig();
    let (path, payload) = seed_three_segments(&rig);
    // 第二段只给一半字节。
    rig.source.script(
        "seg1@test",
        StubArticle::Body(payload[700..1050].to_vec()),
    );

    let handle = rig.fs.open(&path).expect("open");
    let out = rig
        .fs
        .read_at(&CallContext::new(), &handle, 0, 2100)
        .await
        .expect("read");
    assert_eq!(out.bytes, &payload[..700]);
    assert_eq!(out.interrupted.expect("short").code(), codes::SHORT_READ);
}

#[tokio::test]
async fn concurrent_disjoint_reads_return_correct_bytes() {
    let rig = rig();
    let (path, payload) = seed_three_segments(&rig);
    let fs = Arc::clone(&rig.fs);
    let handle_a = Arc::new(fs.open(&path).expect("open"));
    let handle_b = Arc::new(fs.open(&path).expect("open"));

    let fs_a = Arc::clone(&fs);
    let a = tokio::spawn({
        let handle = Arc::clone(&handle_a);
        async move {
            fs_a.read_at(&CallContext::new(), &handle, 0, 700)
                .await
                .expect("read a")
        }
    });
    let fs_b = Arc::clone(&fs);
    let b = tokio::spawn({
        let handle = Arc::clone(&handle_b);
        async move {
            fs_b.read_at(&CallContext::new(), &handle, 1400, 700)
                .await
                .expect("read b")
        }
    });

    assert_eq!(a.await.unwrap().bytes, &payload[..700]);
    assert_eq!(b.await.unwrap().bytes, &payload[1400..2100]);
}

#[tokio::test]
async fn cancelled_context_aborts_read() {
    let rig = rig();
    let (path, _) = seed_three_segments(&rig);
    let handle = rig.fs.open(&path).expect("open");
    let ctx = CallContext::new();
    ctx.cancellation().cancel();

    let err = rig.fs.read_at(&ctx, &handle, 0, 2100).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn stat_and_list_reflect_the_tree() {
    let rig = rig();
    let (path, _) = seed_three_segments(&rig);

    let file = rig.fs.stat(&path).expect("file stat");
    assert!(!file.is_dir);
    assert_eq!(file.size, 2100);

    let dir = rig
        .fs
        .stat(&VirtualPath::parse("/movies").unwrap())
        .expect("dir stat");
    assert!(dir.is_dir);
    assert_eq!(dir.mtime, 1_700_000_000);

    let entries = rig
        .fs
        .list(&VirtualPath::parse("/movies").unwrap())
        .expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "film.bin");

    let err = rig
        .fs
        .stat(&VirtualPath::parse("/nope").unwrap())
        .unwrap_err();
    assert_eq!(err.code(), codes::PATH_NOT_FOUND);
}

#[tokio::test]
async fn writes_are_rejected() {
    let rig = rig();
    let path = VirtualPath::parse("/new.bin").unwrap();
    assert_eq!(rig.fs.create(&path).unwrap_err().code(), codes::READ_ONLY);
    assert_eq!(rig.fs.remove(&path).unwrap_err().code(), codes::READ_ONLY);
    assert_eq!(rig.fs.mkdir(&path).unwrap_err().code(), codes::READ_ONLY);
    assert_eq!(
        rig.fs
            .rename(&path, &VirtualPath::parse("/other.bin").unwrap())
            .unwrap_err()
            .code(),
        codes::READ_ONLY
    );
}

#[tokio::test]
async fn encrypted_file_roundtrips_through_chunk_cipher() {
    let rig = rig();

    // 明文跨三个 64 KiB 块。
    let plain: Vec<u8> = (0..150_000u32).map(|i| (i % 233) as u8).collect();
    let key = derive_key("hunter2", "sel");
    let cipher = ChunkCipher::new(&key, [7u8; 24]);
    let stream = seal_stream(&cipher, &plain).expect("seal");

    // 密文流切成三个不等长分段。
    let cuts = [0usize, 70_000, 140_000, stream.len()];
    let mut segments = Vec::new();
    for i in 0..3 {
        let part = &stream[cuts[i]..cuts[i + 1]];
        let id = format!("enc{i}@test");
        rig.source.script(id.clone(), StubArticle::Body(part.to_vec()));
        segments.push(Segment::new(id, part.len() as u64));
    }

    let path = VirtualPath::parse("/crypt/secret.bin").unwrap();
    let descriptor = FileDescriptor {
        size: plain.len() as u64,
        source_nzb_path: "/nzbs/secret.nzb".into(),
        status: FileStatus::Healthy,
        created_at: 1_700_000_000,
        release_date: None,
        password: Some("hunter2".into()),
        salt: Some("sel".into()),
        encryption: Encryption::Rclone,
        segments,
        trailing: Vec::new(),
    };
    rig.store.write(&path, &descriptor).expect("seed");

    let handle = rig.fs.open(&path).expect("open");
    let ctx = CallContext::new();

    let out = rig
        .fs
        .read_at(&ctx, &handle, 0, plain.len() as i64)
        .await
        .expect("read all");
    assert!(out.interrupted.is_none());
    assert_eq!(out.bytes, plain);

    // 跨块的内部区间。
    let out = rig
        .fs
        .read_at(&ctx, &handle, 65_530, 20)
        .await
        .expect("read window");
    assert_eq!(out.bytes, &plain[65_530..65_550]);
}
