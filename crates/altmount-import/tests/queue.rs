//! 队列契约测试：去重、行级互斥、退避重排与崩溃恢复。

use std::sync::Arc;
use std::time::Duration;

use altmount_core::error::codes;
use altmount_core::model::{QueuePriority, QueueStatus};
use altmount_core::time::{Clock, MockClock};
use altmount_import::{Database, EnqueueRequest, ListFilter, QueueStore};

fn request(path: &str) -> EnqueueRequest {
    EnqueueRequest {
        nzb_path: path.to_string(),
        relative_path: None,
        category: Some("movies".into()),
        priority: QueuePriority::Normal,
    }
}

fn store() -> (Arc<MockClock>, QueueStore) {
    let clock = Arc::new(MockClock::new());
    let db = Arc::new(Database::open_in_memory().expect("db"));
    let queue = QueueStore::new(db, Arc::clone(&clock) as Arc<dyn Clock>);
    (clock, queue)
}

#[test]
fn enqueue_is_deduplicated_by_path() {
    let (_clock, queue) = store();
    let first = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    let second = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    assert_eq!(first, second);

    let stats = queue.stats().expect("stats");
    assert_eq!(stats.pending, 1);
}

#[test]
fn claim_is_exclusive() {
    let (_clock, queue) = store();
    queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");

    let claimed = queue.claim_next().expect("claim").expect("item");
    assert_eq!(claimed.status, QueueStatus::Running);
    assert!(queue.claim_next().expect("claim").is_none());
}

#[test]
fn dedup_while_running_returns_existing_row() {
    let (_clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");

    // 运行中再次投递：同一行，不会出现第二个可认领条目。
    let again = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    assert_eq!(id, again);
    assert!(queue.claim_next().expect("claim").is_none());
    assert_eq!(queue.stats().expect("stats").running, 1);
}

#[test]
fn priority_orders_claims() {
    let (_clock, queue) = store();
    queue.enqueue(request("/watch/low.nzb"), 3).expect("enqueue");
    let mut high = request("/watch/high.nzb");
    high.priority = QueuePriority::High;
    queue.enqueue(high, 3).expect("enqueue");

    let first = queue.claim_next().expect("claim").expect("item");
    assert_eq!(first.nzb_path, "/watch/high.nzb");
}

#[test]
fn transient_failure_backs_off_exponentially() {
    let (clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");

    let err = altmount_core::CoreError::new(codes::TRANSIENT, "wire glitch");
    queue.fail(id, &err, true, 30).expect("fail");

    // 退避窗口内不可认领。
    assert!(queue.claim_next().expect("claim").is_none());
    let item = queue.get(id).expect("get").expect("row");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 1);

    clock.advance(Duration::from_secs(31));
    let reclaimed = queue.claim_next().expect("claim").expect("item");
    assert_eq!(reclaimed.id, id);

    // 第二次退避翻倍。
    queue.fail(id, &err, true, 30).expect("fail");
    clock.advance(Duration::from_secs(31));
    assert!(queue.claim_next().expect("claim").is_none());
    clock.advance(Duration::from_secs(30));
    assert!(queue.claim_next().expect("claim").is_some());
}

#[test]
fn exhausted_retries_become_failed() {
    let (clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 2).expect("enqueue");
    let err = altmount_core::CoreError::new(codes::TRANSIENT, "wire glitch");

    let _ = queue.claim_next().expect("claim").expect("item");
    queue.fail(id, &err, true, 1).expect("fail");
    clock.advance(Duration::from_secs(2));
    let _ = queue.claim_next().expect("claim").expect("item");
    queue.fail(id, &err, true, 1).expect("fail");

    let item = queue.get(id).expect("get").expect("row");
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.error_message.unwrap().contains("wire glitch"));

    // 手工重试复活。
    queue.retry_failed(id).expect("retry");
    assert_eq!(
        queue.get(id).unwrap().unwrap().status,
        QueueStatus::Pending
    );
}

#[test]
fn non_retryable_failure_is_terminal_immediately() {
    let (_clock, queue) = store();
    let id = queue.enqueue(request("/watch/bad.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");

    let err = altmount_core::CoreError::new(codes::MALFORMED_NZB, "not xml");
    queue.fail(id, &err, false, 30).expect("fail");
    assert_eq!(
        queue.get(id).unwrap().unwrap().status,
        QueueStatus::Failed
    );
}

#[test]
fn reset_orphans_restores_recent_crash_with_retry_bump() {
    let (clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");

    // “进程重启”：最近更新过的 running 行复位并记一次重试。
    let reset = queue.reset_orphans(60).expect("reset");
    assert_eq!(reset, 1);
    let item = queue.get(id).expect("get").expect("row");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 1);

    // 复位后的行可以再次被认领并完成。
    let reclaimed = queue.claim_next().expect("claim").expect("item");
    queue.complete(reclaimed.id).expect("complete");
    assert_eq!(queue.stats().expect("stats").completed, 1);

    // 老化的 running 行复位时不递增重试计数。
    let id2 = queue.enqueue(request("/watch/b.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");
    clock.advance(Duration::from_secs(3_600));
    queue.reset_orphans(60).expect("reset");
    assert_eq!(queue.get(id2).unwrap().unwrap().retry_count, 0);
}

#[test]
fn terminal_rows_are_reactivated_by_enqueue() {
    let (_clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    let _ = queue.claim_next().expect("claim").expect("item");
    queue.complete(id).expect("complete");

    let again = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    assert_eq!(id, again);
    assert_eq!(
        queue.get(id).unwrap().unwrap().status,
        QueueStatus::Pending
    );
}

#[test]
fn batch_inserts_in_one_transaction() {
    let (_clock, queue) = store();
    queue.enqueue(request("/watch/dup.nzb"), 3).expect("enqueue");

    let ids = queue
        .batch(
            &[
                request("/watch/dup.nzb"),
                request("/watch/new1.nzb"),
                request("/watch/new2.nzb"),
            ],
            3,
        )
        .expect("batch");
    // 已存在的路径被跳过。
    assert_eq!(ids.len(), 2);
    assert_eq!(queue.stats().expect("stats").pending, 3);
}

#[test]
fn cancel_pending_and_conflict_semantics() {
    let (_clock, queue) = store();
    let id = queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    queue.cancel_pending(id).expect("cancel");
    assert_eq!(
        queue.get(id).unwrap().unwrap().status,
        QueueStatus::Cancelled
    );

    // 状态机冲突以 store.conflict 报告。
    let err = queue.cancel_pending(id).unwrap_err();
    assert_eq!(err.code(), codes::CONFLICT);
}

#[test]
fn list_filters_by_status() {
    let (_clock, queue) = store();
    queue.enqueue(request("/watch/a.nzb"), 3).expect("enqueue");
    queue.enqueue(request("/watch/b.nzb"), 3).expect("enqueue");
    let claimed = queue.claim_next().expect("claim").expect("item");

    let running = queue
        .list(&ListFilter {
            status: Some(QueueStatus::Running),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, claimed.id);

    let all = queue.list(&ListFilter::default()).expect("list");
    assert_eq!(all.len(), 2);
}
