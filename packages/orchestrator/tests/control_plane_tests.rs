//! Control-plane operations racing the pipeline: pause, resume, cancel,
//! restarts, priority changes, and the admin listing.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use orchestrator::config::UrlNormalizeSettings;
use orchestrator::domains::hosts::actions::{self as host_actions, HostSettings};
use orchestrator::domains::tasks::actions::{
    self, BulkRestartFilter, RestartOptions,
};
use orchestrator::domains::tasks::query::{self, TaskFilter, TaskSort};
use orchestrator::domains::tasks::{CrawlTask, CreateTaskOptions, TaskStatus};

fn normalize() -> UrlNormalizeSettings {
    UrlNormalizeSettings::default()
}

async fn submit(pool: &sqlx::PgPool, host: &orchestrator::domains::hosts::Host) -> CrawlTask {
    actions::submit(
        host.id,
        &common::unique_url("ctl"),
        CreateTaskOptions::default(),
        &normalize(),
        pool,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn pause_then_resume_round_trips_without_touching_retries() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    // Give it a retry history first
    sqlx::query("UPDATE crawl_tasks SET retry_count = 2 WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let paused = actions::pause(task.id, &pool).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);

    let resumed = actions::resume(task.id, &pool).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Pending);
    assert_eq!(resumed.retry_count, 2);
    assert!(resumed.scheduled_at <= Utc::now() + ChronoDuration::seconds(2));
}

#[tokio::test]
async fn resume_of_a_non_paused_task_is_illegal() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    let err = actions::resume(task.id, &pool).await.unwrap_err();
    assert_eq!(err.kind(), "illegal_transition");
}

#[tokio::test]
async fn cancel_is_blocked_on_terminal_tasks() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    sqlx::query("UPDATE crawl_tasks SET status = 'completed', completed_at = NOW() WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let err = actions::cancel(task.id, &pool).await.unwrap_err();
    assert_eq!(err.kind(), "illegal_transition");
}

#[tokio::test]
async fn cancel_works_from_any_live_state() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    sqlx::query("UPDATE crawl_tasks SET status = 'crawling' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let cancelled = actions::cancel(task.id, &pool).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    let cancelled = actions::cancel(task.id, &pool).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // A second cancel is a harmless no-op, not an error
    let again = actions::cancel(task.id, &pool).await.unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn restart_full_resets_the_row_to_a_fresh_submission() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    sqlx::query(
        "UPDATE crawl_tasks SET status = 'failed', started_at = NOW(), completed_at = NOW(),
         error = 'boom', retry_count = 3, blob_ref = 'blob/3.html', http_code = 500,
         latency_ms = 900 WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .unwrap();

    let restarted = actions::restart_full(
        task.id,
        RestartOptions {
            reset_retries: true,
            ..Default::default()
        },
        &pool,
    )
    .await
    .unwrap();

    assert_eq!(restarted.status, TaskStatus::Pending);
    assert_eq!(restarted.retry_count, 0);
    assert!(restarted.started_at.is_none());
    assert!(restarted.completed_at.is_none());
    assert!(restarted.error.is_none());
    assert!(restarted.blob_ref.is_none());
    assert!(restarted.http_code.is_none());
    assert!(restarted.latency_ms.is_none());
    assert!(restarted.next_run_at.is_none());
}

#[tokio::test]
async fn restart_full_can_override_priority_and_schedule() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;
    sqlx::query("UPDATE crawl_tasks SET status = 'failed', completed_at = NOW() WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let later = Utc::now() + ChronoDuration::hours(2);
    let restarted = actions::restart_full(
        task.id,
        RestartOptions {
            reset_retries: false,
            priority: Some(1),
            scheduled_at: Some(later),
        },
        &pool,
    )
    .await
    .unwrap();
    assert_eq!(restarted.priority, 1);
    assert_eq!(restarted.scheduled_at.timestamp(), later.timestamp());
}

#[tokio::test]
async fn restart_parse_only_requires_a_blob() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    sqlx::query("UPDATE crawl_tasks SET status = 'failed', completed_at = NOW() WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let err = actions::restart_parse_only(task.id, &pool).await.unwrap_err();
    assert_eq!(err.kind(), "html_not_available");

    sqlx::query("UPDATE crawl_tasks SET blob_ref = 'blob/1.html' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let restarted = actions::restart_parse_only(task.id, &pool).await.unwrap();
    assert_eq!(restarted.status, TaskStatus::Downloaded);
    assert_eq!(restarted.blob_ref.as_deref(), Some("blob/1.html"));
}

#[tokio::test]
async fn bulk_restart_failed_honors_the_inclusive_cutoff() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let cutoff = Utc::now();

    let old = submit(&pool, &host).await;
    let at_cutoff = submit(&pool, &host).await;
    let newer = submit(&pool, &host).await;
    sqlx::query("UPDATE crawl_tasks SET status = 'failed', completed_at = $2 WHERE id = $1")
        .bind(old.id)
        .bind(cutoff - ChronoDuration::hours(1))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE crawl_tasks SET status = 'failed', completed_at = $2 WHERE id = $1")
        .bind(at_cutoff.id)
        .bind(cutoff)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE crawl_tasks SET status = 'failed', completed_at = $2 WHERE id = $1")
        .bind(newer.id)
        .bind(cutoff + ChronoDuration::hours(1))
        .execute(&pool)
        .await
        .unwrap();

    let outcome = actions::bulk_restart_failed(
        BulkRestartFilter {
            host_id: Some(host.id),
            failed_after: Some(cutoff),
        },
        100,
        RestartOptions::default(),
        &pool,
    )
    .await
    .unwrap();

    // The boundary row is included, the older one is not
    assert!(outcome.restarted.contains(&at_cutoff.id));
    assert!(outcome.restarted.contains(&newer.id));
    assert!(!outcome.restarted.contains(&old.id));
}

#[tokio::test]
async fn change_priority_validates_and_updates() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let task = submit(&pool, &host).await;

    let err = actions::change_priority(task.id, 11, &pool).await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    let updated = actions::change_priority(task.id, 2, &pool).await.unwrap();
    assert_eq!(updated.priority, 2);
}

#[tokio::test]
async fn submit_rejects_missing_and_disabled_hosts() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;

    let err = actions::submit(
        uuid::Uuid::now_v7(),
        &common::unique_url("nohost"),
        CreateTaskOptions::default(),
        &normalize(),
        &pool,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    sqlx::query("UPDATE hosts SET active = FALSE WHERE id = $1")
        .bind(host.id)
        .execute(&pool)
        .await
        .unwrap();
    let err = actions::submit(
        host.id,
        &common::unique_url("disabled"),
        CreateTaskOptions::default(),
        &normalize(),
        &pool,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn host_settings_reject_non_positive_intervals() {
    let Some(pool) = common::test_pool().await else { return };

    let err = host_actions::create_host(
        &format!("bad-interval-{}.example", uuid::Uuid::new_v4()),
        "https://a.example",
        "archive",
        HostSettings {
            default_interval_secs: Some(0),
            ..Default::default()
        },
        &pool,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let host = common::create_host(&pool).await;
    let err = host_actions::update_host(
        host.id,
        HostSettings {
            default_interval_secs: Some(-86_400),
            ..Default::default()
        },
        &pool,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn listing_filters_and_paginates_with_cursors() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    for _ in 0..5 {
        submit(&pool, &host).await;
    }

    let filter = TaskFilter {
        host_id: Some(host.id),
        status: Some(TaskStatus::Pending),
        ..Default::default()
    };

    let first = query::list_tasks(&filter, TaskSort::default(), None, 3, &pool)
        .await
        .unwrap();
    assert_eq!(first.items.len(), 3);
    let cursor = first.next_cursor.expect("more pages remain");

    let second = query::list_tasks(&filter, TaskSort::default(), Some(&cursor), 3, &pool)
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);

    // No overlap between pages
    for item in &second.items {
        assert!(first.items.iter().all(|f| f.id != item.id));
    }
}

#[tokio::test]
async fn task_detail_joins_host_and_proxy() {
    let Some(pool) = common::test_pool().await else { return };
    let host = common::create_host(&pool).await;
    let proxy = common::create_proxy(&pool).await;
    let task = submit(&pool, &host).await;
    sqlx::query("UPDATE crawl_tasks SET proxy_id = $2 WHERE id = $1")
        .bind(task.id)
        .bind(proxy.id)
        .execute(&pool)
        .await
        .unwrap();

    let detail = query::get_task_detail(task.id, &pool).await.unwrap();
    assert_eq!(detail.task.id, task.id);
    assert_eq!(detail.host_name, host.name);
    assert_eq!(
        detail.proxy_endpoint.as_deref(),
        Some(format!("{}:{}", proxy.endpoint_host, proxy.endpoint_port).as_str())
    );

    let err = query::get_task_detail(uuid::Uuid::now_v7(), &pool)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
