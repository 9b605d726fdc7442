//! Admin listing of crawl tasks: filters, whitelisted sorts, and keyset
//! pagination over `(sort key, id)` cursors.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::common::pagination::{Cursor, CursorKey};
use crate::common::OrchestratorError;

use super::models::{CrawlTask, TaskStatus};

/// Filters for the task listing. All fields are conjunctive; time ranges are
/// inclusive on both ends.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub host_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub priority_min: Option<i32>,
    pub priority_max: Option<i32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub is_recurring: Option<bool>,
}

/// Whitelisted sort fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSortField {
    CreatedAt,
    UpdatedAt,
    ScheduledAt,
    CompletedAt,
    Priority,
    RetryCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSort {
    pub field: TaskSortField,
    pub order: SortOrder,
}

impl Default for TaskSort {
    fn default() -> Self {
        Self {
            field: TaskSortField::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

impl TaskSortField {
    /// SQL expression for the sort key. Nullable timestamps coalesce to the
    /// epoch so keyset comparisons stay total.
    fn sql_expr(&self) -> &'static str {
        match self {
            TaskSortField::CreatedAt => "t.created_at",
            TaskSortField::UpdatedAt => "t.updated_at",
            TaskSortField::ScheduledAt => "t.scheduled_at",
            TaskSortField::CompletedAt => "COALESCE(t.completed_at, 'epoch'::timestamptz)",
            TaskSortField::Priority => "t.priority",
            TaskSortField::RetryCount => "t.retry_count",
        }
    }

    fn key_for(&self, task: &CrawlTask) -> CursorKey {
        let epoch = Utc.timestamp_opt(0, 0).single().expect("epoch is valid");
        match self {
            TaskSortField::CreatedAt => CursorKey::Timestamp(task.created_at),
            TaskSortField::UpdatedAt => CursorKey::Timestamp(task.updated_at),
            TaskSortField::ScheduledAt => CursorKey::Timestamp(task.scheduled_at),
            TaskSortField::CompletedAt => {
                CursorKey::Timestamp(task.completed_at.unwrap_or(epoch))
            }
            TaskSortField::Priority => CursorKey::Int(task.priority as i64),
            TaskSortField::RetryCount => CursorKey::Int(task.retry_count as i64),
        }
    }
}

/// One page of results plus the cursor for the next page, when there is one.
#[derive(Debug)]
pub struct TaskPage {
    pub items: Vec<CrawlTask>,
    pub next_cursor: Option<String>,
}

/// List tasks matching `filter`, ordered by `sort`, starting after `cursor`.
///
/// `limit` is clamped to 1..=500.
pub async fn list_tasks(
    filter: &TaskFilter,
    sort: TaskSort,
    cursor: Option<&str>,
    limit: i64,
    db: &PgPool,
) -> Result<TaskPage, OrchestratorError> {
    let limit = limit.clamp(1, 500);
    let cursor = cursor.map(Cursor::decode).transpose()?;

    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT t.* FROM crawl_tasks t WHERE TRUE");

    if let Some(host_id) = filter.host_id {
        qb.push(" AND t.host_id = ").push_bind(host_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND t.status = ").push_bind(status);
    }
    if let Some(min) = filter.priority_min {
        qb.push(" AND t.priority >= ").push_bind(min);
    }
    if let Some(max) = filter.priority_max {
        qb.push(" AND t.priority <= ").push_bind(max);
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND t.created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND t.created_at <= ").push_bind(before);
    }
    if let Some(recurring) = filter.is_recurring {
        qb.push(" AND t.is_recurring = ").push_bind(recurring);
    }

    let expr = sort.field.sql_expr();
    if let Some(cursor) = &cursor {
        let cmp = match sort.order {
            SortOrder::Asc => " > ",
            SortOrder::Desc => " < ",
        };
        qb.push(" AND (").push(expr).push(", t.id)").push(cmp).push("(");
        match &cursor.key {
            CursorKey::Timestamp(ts) => {
                qb.push_bind(*ts);
            }
            CursorKey::Int(i) => {
                qb.push_bind(*i);
            }
        }
        qb.push(", ").push_bind(cursor.id).push(")");
    }

    let direction = match sort.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    qb.push(format!(
        " ORDER BY {expr} {direction}, t.id {direction} LIMIT "
    ));
    qb.push_bind(limit);

    let items: Vec<CrawlTask> = qb.build_query_as().fetch_all(db).await?;

    let next_cursor = if items.len() as i64 == limit {
        items
            .last()
            .map(|task| Cursor::new(sort.field.key_for(task), task.id).encode())
    } else {
        None
    };

    Ok(TaskPage { items, next_cursor })
}

/// Detailed view of one task for the admin surface.
#[derive(FromRow, Debug)]
pub struct TaskDetail {
    #[sqlx(flatten)]
    pub task: CrawlTask,
    pub host_name: String,
    pub proxy_endpoint: Option<String>,
}

pub async fn get_task_detail(task_id: Uuid, db: &PgPool) -> Result<TaskDetail, OrchestratorError> {
    let detail = sqlx::query_as::<_, TaskDetail>(
        "SELECT t.*, h.name AS host_name,
                p.endpoint_host || ':' || p.endpoint_port::text AS proxy_endpoint
         FROM crawl_tasks t
         JOIN hosts h ON h.id = t.host_id
         LEFT JOIN proxies p ON p.id = t.proxy_id
         WHERE t.id = $1",
    )
    .bind(task_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
    Ok(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sort_is_newest_first() {
        let sort = TaskSort::default();
        assert_eq!(sort.field, TaskSortField::CreatedAt);
        assert_eq!(sort.order, SortOrder::Desc);
    }

    #[test]
    fn priority_sort_key_is_an_int() {
        let task = CrawlTask::builder()
            .host_id(Uuid::now_v7())
            .url("https://a.example/x")
            .url_fp("fp")
            .priority(2)
            .build();
        assert_eq!(TaskSortField::Priority.key_for(&task), CursorKey::Int(2));
    }

    #[test]
    fn completed_at_key_falls_back_to_epoch() {
        let task = CrawlTask::builder()
            .host_id(Uuid::now_v7())
            .url("https://a.example/x")
            .url_fp("fp")
            .build();
        match TaskSortField::CompletedAt.key_for(&task) {
            CursorKey::Timestamp(ts) => assert_eq!(ts.timestamp(), 0),
            other => panic!("expected timestamp key, got {other:?}"),
        }
    }
}
