use std::fmt;
use std::time::Duration;

use r2d2::{ManageConnection, Pool};
use r2d2_sqlite::rusqlite::types::Value;
use r2d2_sqlite::rusqlite::{self, params, params_from_iter, Connection, OptionalExtension, Row};
use r2d2_sqlite::SqliteConnectionManager;
use tokio::task::spawn_blocking;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::config::DbConfig;
use crate::filters::{Filters, Metadata};
use crate::models::Todo;

/// Upper bound for any single repository call, pool checkout included.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS todos (
        id INTEGER PRIMARY KEY,
        created_at INTEGER NOT NULL DEFAULT (unixepoch()),
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS todos_fts USING fts5(
        title,
        description,
        content = 'todos',
        content_rowid = 'id'
    );

    CREATE TRIGGER IF NOT EXISTS todos_fts_insert AFTER INSERT ON todos BEGIN
        INSERT INTO todos_fts (rowid, title, description)
        VALUES (new.id, new.title, new.description);
    END;

    CREATE TRIGGER IF NOT EXISTS todos_fts_delete AFTER DELETE ON todos BEGIN
        INSERT INTO todos_fts (todos_fts, rowid, title, description)
        VALUES ('delete', old.id, old.title, old.description);
    END;

    CREATE TRIGGER IF NOT EXISTS todos_fts_update AFTER UPDATE ON todos BEGIN
        INSERT INTO todos_fts (todos_fts, rowid, title, description)
        VALUES ('delete', old.id, old.title, old.description);
        INSERT INTO todos_fts (rowid, title, description)
        VALUES (new.id, new.title, new.description);
    END;
";

const TODO_COLUMNS: &str = "id, created_at, title, description, status, version";

#[derive(Debug)]
pub enum DbError {
    RecordNotFound,
    EditConflict,
    Timeout,
    Pool(r2d2::Error),
    Sqlite(rusqlite::Error),
    Task(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::RecordNotFound => write!(f, "record not found"),
            DbError::EditConflict => write!(f, "edit conflict"),
            DbError::Timeout => write!(f, "database call timed out"),
            DbError::Pool(err) => write!(f, "connection pool: {err}"),
            DbError::Sqlite(err) => write!(f, "sqlite: {err}"),
            DbError::Task(msg) => write!(f, "database task failed: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Sqlite(err)
    }
}

impl From<r2d2::Error> for DbError {
    fn from(err: r2d2::Error) -> Self {
        DbError::Pool(err)
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(err: tokio::task::JoinError) -> Self {
        DbError::Task(err.to_string())
    }
}

/// Pooled SQLite connection that can be retired instead of going back idle.
struct SqliteConn {
    conn: Connection,
    retire: bool,
}

/// Wraps [`SqliteConnectionManager`] so that connections flagged with
/// `retire` are closed on return to the pool.
struct SqliteManager(SqliteConnectionManager);

impl ManageConnection for SqliteManager {
    type Connection = SqliteConn;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<SqliteConn, rusqlite::Error> {
        Ok(SqliteConn {
            conn: self.0.connect()?,
            retire: false,
        })
    }

    fn is_valid(&self, conn: &mut SqliteConn) -> Result<(), rusqlite::Error> {
        self.0.is_valid(&mut conn.conn)
    }

    fn has_broken(&self, conn: &mut SqliteConn) -> bool {
        conn.retire || self.0.has_broken(&mut conn.conn)
    }
}

#[derive(Clone)]
pub struct DbPool {
    pool: Pool<SqliteManager>,
    max_idle: u32,
    query_timeout: Duration,
}

/// Opens the pool and creates the schema.
///
/// No connection is kept warm: every idle connection is closed once it has
/// been idle for `max_idle_time`, and a connection coming back while
/// `max_idle_conns` are already idle is closed right away.
pub fn init_db(cfg: &DbConfig) -> Result<DbPool, DbError> {
    let manager = SqliteConnectionManager::file(&cfg.dsn).with_init(|conn| {
        conn.execute_batch("PRAGMA busy_timeout = 3000; PRAGMA journal_mode = WAL;")
    });

    let max_size = cfg.max_open_conns.max(1);
    let idle_timeout = Some(cfg.max_idle_time).filter(|d| !d.is_zero());
    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle(Some(0))
        .idle_timeout(idle_timeout)
        .connection_timeout(QUERY_TIMEOUT)
        .build(SqliteManager(manager))?;

    pool.get()?.conn.execute_batch(SCHEMA)?;

    Ok(DbPool {
        pool,
        max_idle: cfg.max_idle_conns.min(max_size),
        query_timeout: QUERY_TIMEOUT,
    })
}

impl DbPool {
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn idle_connections(&self) -> u32 {
        self.pool.state().idle_connections
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        self.run_with_timeout(PING_TIMEOUT, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        self.run_with_timeout(self.query_timeout, op).await
    }

    /// Runs `op` on a pooled connection off the async runtime.
    ///
    /// The deadline covers both the pool checkout and the statement. When it
    /// passes, the running statement is interrupted and the call fails with
    /// [`DbError::Timeout`].
    async fn run_with_timeout<T, F>(&self, limit: Duration, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let deadline = Instant::now() + limit;

        let pool = self.pool.clone();
        let conn = match timeout_at(deadline, spawn_blocking(move || pool.get())).await {
            Ok(joined) => joined??,
            Err(_) => {
                warn!(?limit, "timed out waiting for a database connection");
                return Err(DbError::Timeout);
            }
        };

        let interrupt = conn.conn.get_interrupt_handle();
        let (pool, max_idle) = (self.pool.clone(), self.max_idle);
        let task = spawn_blocking(move || {
            let mut conn = conn;
            let result = op(&conn.conn);
            conn.retire = pool.state().idle_connections >= max_idle;
            result
        });
        match timeout_at(deadline, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                interrupt.interrupt();
                warn!(?limit, "database call exceeded its deadline");
                Err(DbError::Timeout)
            }
        }
    }
}

fn read_todo(row: &Row<'_>, start: usize) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(start)?,
        created_at: row.get(start + 1)?,
        title: row.get(start + 2)?,
        description: row.get(start + 3)?,
        status: row.get(start + 4)?,
        version: row.get(start + 5)?,
    })
}

// Todo operations

pub async fn create_todo(pool: &DbPool, todo: Todo) -> Result<Todo, DbError> {
    pool.run(move |conn| {
        let (id, created_at, version) = conn.query_row(
            "INSERT INTO todos (title, description, status) VALUES (?1, ?2, ?3)
             RETURNING id, created_at, version",
            params![todo.title, todo.description, todo.status],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(Todo {
            id,
            created_at,
            version,
            ..todo
        })
    })
    .await
}

pub async fn get_todo(pool: &DbPool, id: i64) -> Result<Todo, DbError> {
    if id < 1 {
        return Err(DbError::RecordNotFound);
    }

    pool.run(move |conn| {
        conn.query_row(
            &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"),
            [id],
            |row| read_todo(row, 0),
        )
        .optional()?
        .ok_or(DbError::RecordNotFound)
    })
    .await
}

/// Writes `todo` back if its version still matches the stored one.
///
/// On success the returned value carries the incremented version. A missing
/// row or a version mismatch is an [`DbError::EditConflict`] and nothing is
/// written.
pub async fn update_todo(pool: &DbPool, todo: Todo) -> Result<Todo, DbError> {
    pool.run(move |conn| {
        let version = conn
            .query_row(
                "UPDATE todos
                 SET title = ?1, description = ?2, status = ?3, version = version + 1
                 WHERE id = ?4 AND version = ?5
                 RETURNING version",
                params![todo.title, todo.description, todo.status, todo.id, todo.version],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(DbError::EditConflict)?;
        Ok(Todo { version, ..todo })
    })
    .await
}

pub async fn delete_todo(pool: &DbPool, id: i64) -> Result<(), DbError> {
    if id < 1 {
        return Err(DbError::RecordNotFound);
    }

    pool.run(move |conn| {
        let rows = conn.execute("DELETE FROM todos WHERE id = ?1", [id])?;
        if rows == 0 {
            return Err(DbError::RecordNotFound);
        }
        Ok(())
    })
    .await
}

/// Builds an FTS5 query requiring every word of `text` in `column`.
///
/// Returns `None` when `text` holds no words, which callers treat as "match
/// everything".
fn match_expression(column: &str, text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("{column} : \"{word}\""))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

pub async fn list_todos(
    pool: &DbPool,
    title: &str,
    description: &str,
    status: Option<bool>,
    filters: &Filters,
) -> Result<(Vec<Todo>, Metadata), DbError> {
    let mut conditions = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    for (column, text) in [("title", title), ("description", description)] {
        if let Some(expr) = match_expression(column, text) {
            conditions.push("id IN (SELECT rowid FROM todos_fts WHERE todos_fts MATCH ?)");
            args.push(Value::Text(expr));
        }
    }
    if let Some(status) = status {
        conditions.push("status = ?");
        args.push(Value::Integer(status as i64));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let query = format!(
        "SELECT COUNT(*) OVER(), {TODO_COLUMNS}
         FROM todos
         {where_clause}
         ORDER BY {} {}, id ASC
         LIMIT ? OFFSET ?",
        filters.sort_column(),
        filters.sort_direction(),
    );
    args.push(Value::Integer(filters.limit()));
    args.push(Value::Integer(filters.offset()));

    let (page, page_size) = (filters.page, filters.page_size);
    pool.run(move |conn| {
        let mut stmt = conn.prepare(&query)?;
        let mut total_records = 0;
        let todos = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, read_todo(row, 1)?))
            })?
            .map(|row| {
                row.map(|(total, todo)| {
                    total_records = total;
                    todo
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((todos, Metadata::calculate(total_records, page, page_size)))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAFELIST: &[&str] = &["id", "title", "-id", "-title"];

    fn test_config(dir: &TempDir) -> DbConfig {
        DbConfig {
            dsn: dir.path().join("todos.db").to_string_lossy().into_owned(),
            max_open_conns: 4,
            max_idle_conns: 1,
            max_idle_time: Duration::from_secs(60),
        }
    }

    fn test_pool() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(&test_config(&dir)).unwrap();
        (dir, pool)
    }

    async fn hold_connections(pool: &DbPool, count: u64) {
        let calls = (0..count).map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(move |_conn| {
                    std::thread::sleep(Duration::from_millis(100 * (i + 1)));
                    Ok(())
                })
                .await
            })
        });
        for call in calls.collect::<Vec<_>>() {
            call.await.unwrap().unwrap();
        }
    }

    fn new_todo(title: &str, description: &str) -> Todo {
        Todo {
            title: title.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    fn filters(page: i64, page_size: i64, sort: &str) -> Filters {
        Filters {
            page,
            page_size,
            sort: sort.to_string(),
            sort_safelist: SAFELIST,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trip() {
        let (_dir, pool) = test_pool();

        let created = create_todo(&pool, new_todo("Buy groceries", "milk"))
            .await
            .unwrap();
        assert!(created.id > 0);
        assert!(created.created_at > 0);
        assert_eq!(created.version, 1);

        let fetched = get_todo(&pool, created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn get_and_delete_missing_ids() {
        let (_dir, pool) = test_pool();

        assert!(matches!(get_todo(&pool, 0).await, Err(DbError::RecordNotFound)));
        assert!(matches!(get_todo(&pool, 42).await, Err(DbError::RecordNotFound)));
        assert!(matches!(delete_todo(&pool, -1).await, Err(DbError::RecordNotFound)));
        assert!(matches!(delete_todo(&pool, 42).await, Err(DbError::RecordNotFound)));

        let created = create_todo(&pool, new_todo("a", "")).await.unwrap();
        delete_todo(&pool, created.id).await.unwrap();
        assert!(matches!(
            delete_todo(&pool, created.id).await,
            Err(DbError::RecordNotFound)
        ));
    }

    #[tokio::test]
    async fn stale_update_is_an_edit_conflict() {
        let (_dir, pool) = test_pool();
        let created = create_todo(&pool, new_todo("original", "")).await.unwrap();

        let first = Todo {
            title: "first writer".to_string(),
            ..created.clone()
        };
        let updated = update_todo(&pool, first).await.unwrap();
        assert_eq!(updated.version, 2);

        let second = Todo {
            title: "second writer".to_string(),
            ..created.clone()
        };
        assert!(matches!(
            update_todo(&pool, second).await,
            Err(DbError::EditConflict)
        ));

        let stored = get_todo(&pool, created.id).await.unwrap();
        assert_eq!(stored.title, "first writer");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn update_of_deleted_row_is_an_edit_conflict() {
        let (_dir, pool) = test_pool();
        let created = create_todo(&pool, new_todo("gone", "")).await.unwrap();
        delete_todo(&pool, created.id).await.unwrap();

        assert!(matches!(
            update_todo(&pool, created).await,
            Err(DbError::EditConflict)
        ));
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let (_dir, pool) = test_pool();
        for (title, description, status) in [
            ("Buy milk", "from the corner shop", false),
            ("Buy bread", "whole grain", true),
            ("Fix bike", "rear tyre", false),
            ("Call mom", "about the weekend", true),
        ] {
            let todo = Todo {
                status,
                ..new_todo(title, description)
            };
            create_todo(&pool, todo).await.unwrap();
        }

        let (todos, metadata) = list_todos(&pool, "", "", None, &filters(1, 3, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 3);
        assert_eq!(metadata.total_records, 4);
        assert_eq!(metadata.last_page, 2);

        let (todos, _) = list_todos(&pool, "", "", None, &filters(2, 3, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].title, "Call mom");

        let (todos, metadata) = list_todos(&pool, "buy", "", None, &filters(1, 20, "-title"))
            .await
            .unwrap();
        let titles: Vec<_> = todos.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["Buy milk", "Buy bread"]);
        assert_eq!(metadata.total_records, 2);

        let (todos, _) = list_todos(&pool, "BUY", "grain", None, &filters(1, 20, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].title, "Buy bread");

        let (todos, _) = list_todos(&pool, "", "the", Some(true), &filters(1, 20, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].title, "Call mom");

        let (todos, metadata) = list_todos(&pool, "!!", "", None, &filters(1, 20, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 4);
        assert_eq!(metadata.total_records, 4);
    }

    #[tokio::test]
    async fn list_search_follows_updates() {
        let (_dir, pool) = test_pool();
        let created = create_todo(&pool, new_todo("Water plants", "")).await.unwrap();
        update_todo(
            &pool,
            Todo {
                title: "Feed cat".to_string(),
                ..created
            },
        )
        .await
        .unwrap();

        let (todos, metadata) = list_todos(&pool, "plants", "", None, &filters(1, 20, "id"))
            .await
            .unwrap();
        assert!(todos.is_empty());
        assert_eq!(metadata, Metadata::default());

        let (todos, _) = list_todos(&pool, "cat", "", None, &filters(1, 20, "id"))
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
    }

    #[tokio::test]
    async fn ties_break_on_id() {
        let (_dir, pool) = test_pool();
        for _ in 0..5 {
            create_todo(&pool, new_todo("same", "")).await.unwrap();
        }

        let (todos, _) = list_todos(&pool, "", "", None, &filters(1, 20, "-title"))
            .await
            .unwrap();
        let ids: Vec<_> = todos.iter().map(|t| t.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let (_dir, pool) = test_pool();
        let pool = pool.with_query_timeout(Duration::from_millis(50));

        let result = pool
            .run(|_conn| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Timeout)));

        pool.ping().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_connections_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(&DbConfig {
            max_idle_conns: 2,
            ..test_config(&dir)
        })
        .unwrap();

        hold_connections(&pool, 4).await;
        assert!(pool.idle_connections() <= 2);

        let pool = init_db(&DbConfig {
            max_idle_conns: 0,
            ..test_config(&dir)
        })
        .unwrap();
        hold_connections(&pool, 3).await;
        assert_eq!(pool.idle_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_connections_are_closed_after_max_idle_time() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(&DbConfig {
            max_idle_conns: 4,
            max_idle_time: Duration::from_secs(1),
            ..test_config(&dir)
        })
        .unwrap();

        hold_connections(&pool, 3).await;
        assert!(pool.idle_connections() > 0);

        // r2d2 reaps idle connections every 30 seconds.
        let deadline = Instant::now() + Duration::from_secs(45);
        while pool.idle_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn match_expression_quotes_every_word() {
        assert_eq!(
            match_expression("title", "buy  milk!"),
            Some("title : \"buy\" AND title : \"milk\"".to_string())
        );
        assert_eq!(match_expression("title", " ,. "), None);
        assert_eq!(match_expression("title", ""), None);
    }
}
