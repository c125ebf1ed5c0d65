mod support;

use chrono::{Duration, Utc};
use pacsvault_core::database::ports::{StudyStorageRepository, WorkQueueRepository};
use pacsvault_core::processing::LockingQueue;
use pacsvault_core::work_queue::{FailureType, ItemLifecycle, PostProcessing, WorkQueueQueue};
use pacsvault_model::{QueueStudyState, WorkQueueStatus};
use support::{Fixture, PROCESSOR_ID};

fn lifecycle(fx: &Fixture) -> ItemLifecycle {
    ItemLifecycle::new(fx.store.clone(), fx.config.clone())
}

async fn mark_study_busy(fx: &Fixture) {
    fx.store
        .set_queue_state(fx.storage.id, QueueStudyState::ProcessingScheduled)
        .await
        .unwrap();
}

#[tokio::test]
async fn postpone_delays_without_counting_a_failure() {
    let fx = Fixture::new().await;
    let mut item = fx.locked_item().await;

    lifecycle(&fx)
        .postpone(&mut item, "study is locked")
        .await
        .unwrap();

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Pending);
    assert_eq!(stored.failure_count, 0);
    assert!(stored.processor_id.is_none());
    assert_eq!(stored.failure_description.as_deref(), Some("study is locked"));
    assert!(stored.scheduled_time > Utc::now() + Duration::seconds(25));
    assert_eq!(
        stored.expiration_time - stored.scheduled_time,
        fx.config.postpone_expiry()
    );
}

#[tokio::test]
async fn expired_idle_item_completes_and_releases_study() {
    let fx = Fixture::new().await;
    mark_study_busy(&fx).await;
    let mut item = fx.locked_item().await;
    item.expiration_time = Utc::now() - Duration::seconds(1);

    let applied = lifecycle(&fx)
        .post_process(&mut item, PostProcessing::Idle)
        .await
        .unwrap();

    assert_eq!(applied, PostProcessing::Complete);
    assert!(fx.store.get_item(item.id).await.unwrap().is_none());
    assert_eq!(fx.current_storage().await.queue_state, QueueStudyState::Idle);
}

#[tokio::test]
async fn expired_item_is_kept_when_idle_no_delete() {
    let fx = Fixture::new().await;
    let mut item = fx.locked_item().await;
    item.expiration_time = Utc::now() - Duration::seconds(1);

    let applied = lifecycle(&fx)
        .post_process(&mut item, PostProcessing::IdleNoDelete)
        .await
        .unwrap();

    assert_eq!(applied, PostProcessing::IdleNoDelete);
    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Idle);
    assert!(stored.processor_id.is_none());
}

#[tokio::test]
async fn pending_pushes_expiration_past_the_next_run() {
    let fx = Fixture::new().await;
    let mut item = fx.locked_item().await;

    lifecycle(&fx)
        .post_process(&mut item, PostProcessing::Pending)
        .await
        .unwrap();

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Pending);
    assert_eq!(
        stored.expiration_time - stored.scheduled_time,
        fx.config.expiration()
    );
}

#[tokio::test]
async fn non_fatal_failures_retry_until_the_limit() {
    let fx = Fixture::new().await;
    mark_study_busy(&fx).await;
    let mut item = fx.locked_item().await;
    let lifecycle = lifecycle(&fx);

    for attempt in 1..fx.config.max_failure_count {
        lifecycle
            .fail(&mut item, FailureType::NonFatal, "disk hiccup")
            .await
            .unwrap();
        let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkQueueStatus::Pending);
        assert_eq!(stored.failure_count, attempt);
    }
    assert_eq!(
        fx.current_storage().await.queue_state,
        QueueStudyState::ProcessingScheduled
    );

    lifecycle
        .fail(&mut item, FailureType::NonFatal, "disk hiccup")
        .await
        .unwrap();
    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Failed);
    assert_eq!(stored.failure_count, fx.config.max_failure_count);
    assert_eq!(fx.current_storage().await.queue_state, QueueStudyState::Idle);
}

#[tokio::test]
async fn fatal_failure_is_terminal_immediately() {
    let fx = Fixture::new().await;
    mark_study_busy(&fx).await;
    let mut item = fx.locked_item().await;

    lifecycle(&fx)
        .fail(&mut item, FailureType::Fatal, "archive is lossless")
        .await
        .unwrap();

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Failed);
    assert_eq!(stored.failure_count, 0);
    assert_eq!(
        stored.failure_description.as_deref(),
        Some("archive is lossless")
    );
    assert_eq!(fx.current_storage().await.queue_state, QueueStudyState::Idle);
}

#[tokio::test]
async fn queue_counts_a_processor_failure_against_the_item() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    let queue = WorkQueueQueue::new(fx.store.clone(), fx.config.clone());

    queue.release_failed(&item, "Io: broken pipe").await.unwrap();

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Pending);
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.failure_description.as_deref(), Some("Io: broken pipe"));
}

#[tokio::test]
async fn queue_leaves_items_the_processor_already_moved_on() {
    let fx = Fixture::new().await;
    let mut item = fx.locked_item().await;
    lifecycle(&fx)
        .post_process(&mut item, PostProcessing::Pending)
        .await
        .unwrap();
    let queue = WorkQueueQueue::new(fx.store.clone(), fx.config.clone());

    queue.release_failed(&item, "late failure").await.unwrap();

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 0);
    assert!(stored.failure_description.is_none());
}

#[tokio::test]
async fn orphaned_items_return_to_the_queue() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    let queue = WorkQueueQueue::new(fx.store.clone(), fx.config.clone());

    assert_eq!(queue.reset_orphaned(PROCESSOR_ID).await.unwrap(), 1);
    assert_eq!(queue.reset_orphaned("another-node").await.unwrap(), 0);

    let stored = fx.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkQueueStatus::Pending);
    assert!(stored.processor_id.is_none());
    assert!(
        queue
            .select_and_lock(PROCESSOR_ID)
            .await
            .unwrap()
            .is_some_and(|locked| locked.id == item.id)
    );
}
