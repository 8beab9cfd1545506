pub mod models;
pub mod schema;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use models::{FocusSession, NewAuthSession, NewFocusSession, NewTask, NewUser, Task, User};

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// The referenced row does not exist or is not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation violates a state invariant (e.g. an active focus
    /// session already exists, or the session was already ended).
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Tri-state field changes for a task update: `None` leaves the column
/// unchanged, `Some(None)` clears a nullable column, `Some(Some(v))` sets
/// it.
#[derive(Debug, Default, Clone)]
pub struct TaskChanges {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i32>>,
    pub completed: Option<bool>,
    pub scheduled_date: Option<NaiveDate>,
}

/// Per-user derived metrics, computed in one shot.
#[derive(Debug)]
pub struct UserStats {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub total_focus_minutes: i64,
    pub current_streak: i32,
    pub active_session: Option<FocusSession>,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    pub async fn create_user(
        &self,
        email: &str,
        name: &str,
        password_hash: &str,
    ) -> Result<User, StorageError> {
        use schema::users;
        let pool = self.pool.clone();
        let email_owned = email.to_string();
        let name_owned = name.to_string();
        let hash_owned = password_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<User, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let new_user = NewUser {
                email: &email_owned,
                name: &name_owned,
                password_hash: &hash_owned,
                created_at: now,
                updated_at: now,
            };
            match diesel::insert_into(users::table)
                .values(&new_user)
                .get_result::<User>(&mut conn)
            {
                Ok(u) => Ok(u),
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Err(
                    StorageError::Conflict("email already registered".to_string()),
                ),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl as u;
        let pool = self.pool.clone();
        let email_owned = email.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(u::users
                .filter(u::email.eq(&email_owned))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn get_user_by_id(&self, user_id: i32) -> Result<Option<User>, StorageError> {
        use schema::users::dsl as u;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(u::users
                .filter(u::id.eq(user_id))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn create_task(
        &self,
        user_id: i32,
        title: &str,
        description: Option<&str>,
        estimated_minutes: Option<i32>,
        scheduled_date: NaiveDate,
    ) -> Result<Task, StorageError> {
        use schema::tasks;
        let pool = self.pool.clone();
        let title_owned = title.to_string();
        let description_owned = description.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let new_task = NewTask {
                user_id,
                title: &title_owned,
                description: description_owned.as_deref(),
                estimated_minutes,
                scheduled_date,
                created_at: now,
                updated_at: now,
            };
            Ok(diesel::insert_into(tasks::table)
                .values(&new_task)
                .get_result::<Task>(&mut conn)?)
        })
        .await?
    }

    pub async fn list_tasks(
        &self,
        user_id: i32,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Task>, StorageError> {
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Task>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let mut query = t::tasks.filter(t::user_id.eq(user_id)).into_boxed();
            if let Some(d) = date {
                query = query.filter(t::scheduled_date.eq(d));
            }
            Ok(query
                .order((t::scheduled_date.asc(), t::created_at.asc()))
                .load::<Task>(&mut conn)?)
        })
        .await?
    }

    /// Partial update of an owned task. Completion transitions stamp or
    /// clear `completed_at`; a task that is already complete keeps its
    /// original completion time.
    pub async fn update_task(
        &self,
        user_id: i32,
        task_id: i32,
        changes: TaskChanges,
    ) -> Result<Task, StorageError> {
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<Task, StorageError> {
                let current: Task = t::tasks
                    .filter(t::id.eq(task_id))
                    .filter(t::user_id.eq(user_id))
                    .first::<Task>(conn)
                    .optional()?
                    .ok_or_else(|| StorageError::NotFound("task not found".to_string()))?;

                let now = Utc::now().naive_utc();
                let completed = changes.completed.unwrap_or(current.completed);
                let completed_at = match (current.completed, completed) {
                    (false, true) => Some(now),
                    (_, false) => None,
                    (true, true) => current.completed_at,
                };

                Ok(diesel::update(t::tasks.filter(t::id.eq(task_id)))
                    .set((
                        t::title.eq(changes.title.unwrap_or(current.title)),
                        t::description.eq(changes.description.unwrap_or(current.description)),
                        t::estimated_minutes
                            .eq(changes.estimated_minutes.unwrap_or(current.estimated_minutes)),
                        t::completed.eq(completed),
                        t::completed_at.eq(completed_at),
                        t::scheduled_date
                            .eq(changes.scheduled_date.unwrap_or(current.scheduled_date)),
                        t::updated_at.eq(now),
                    ))
                    .get_result::<Task>(conn)?)
            })
        })
        .await?
    }

    pub async fn delete_task(&self, user_id: i32, task_id: i32) -> Result<(), StorageError> {
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let deleted = diesel::delete(
                t::tasks
                    .filter(t::id.eq(task_id))
                    .filter(t::user_id.eq(user_id)),
            )
            .execute(&mut conn)?;
            if deleted == 0 {
                return Err(StorageError::NotFound("task not found".to_string()));
            }
            Ok(())
        })
        .await?
    }

    /// Starts a focus session. The check-then-insert runs inside an
    /// immediate transaction, and the partial unique index on
    /// `focus_sessions(user_id) WHERE ended_at IS NULL` backs the
    /// single-active-session invariant even under concurrent starts.
    pub async fn start_session(
        &self,
        user_id: i32,
        task_id: Option<i32>,
        planned_minutes: Option<i32>,
    ) -> Result<FocusSession, StorageError> {
        use schema::focus_sessions::dsl as fs;
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<FocusSession, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<FocusSession, StorageError> {
                if let Some(tid) = task_id {
                    let owned: i64 = t::tasks
                        .filter(t::id.eq(tid))
                        .filter(t::user_id.eq(user_id))
                        .count()
                        .get_result(conn)?;
                    if owned == 0 {
                        return Err(StorageError::NotFound("task not found".to_string()));
                    }
                }

                let active: i64 = fs::focus_sessions
                    .filter(fs::user_id.eq(user_id))
                    .filter(fs::ended_at.is_null())
                    .count()
                    .get_result(conn)?;
                if active > 0 {
                    return Err(StorageError::Conflict(
                        "an active focus session already exists".to_string(),
                    ));
                }

                let now = Utc::now().naive_utc();
                let new_session = NewFocusSession {
                    user_id,
                    task_id,
                    duration_minutes: planned_minutes.unwrap_or(0),
                    started_at: now,
                    created_at: now,
                };
                match diesel::insert_into(fs::focus_sessions)
                    .values(&new_session)
                    .get_result::<FocusSession>(conn)
                {
                    Ok(s) => Ok(s),
                    Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                        Err(StorageError::Conflict(
                            "an active focus session already exists".to_string(),
                        ))
                    }
                    Err(e) => Err(e.into()),
                }
            })
        })
        .await?
    }

    /// Ends a focus session and, when it completed against a task, marks
    /// that task done in the same transaction (both writes or neither).
    pub async fn end_session(
        &self,
        user_id: i32,
        session_id: i32,
        duration_minutes: Option<i32>,
        completed: bool,
    ) -> Result<FocusSession, StorageError> {
        use schema::focus_sessions::dsl as fs;
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<FocusSession, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<FocusSession, StorageError> {
                let current: FocusSession = fs::focus_sessions
                    .filter(fs::id.eq(session_id))
                    .filter(fs::user_id.eq(user_id))
                    .first::<FocusSession>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::NotFound("focus session not found".to_string())
                    })?;
                if current.ended_at.is_some() {
                    return Err(StorageError::Conflict(
                        "focus session already ended".to_string(),
                    ));
                }

                let now = Utc::now().naive_utc();
                let minutes = duration_minutes
                    .unwrap_or_else(|| (now - current.started_at).num_minutes().max(0) as i32);

                let updated = diesel::update(
                    fs::focus_sessions
                        .filter(fs::id.eq(session_id))
                        .filter(fs::ended_at.is_null()),
                )
                .set((
                    fs::ended_at.eq(Some(now)),
                    fs::duration_minutes.eq(minutes),
                    fs::completed.eq(completed),
                ))
                .get_result::<FocusSession>(conn)?;

                if completed && let Some(tid) = current.task_id {
                    diesel::update(
                        t::tasks
                            .filter(t::id.eq(tid))
                            .filter(t::completed.eq(false)),
                    )
                    .set((
                        t::completed.eq(true),
                        t::completed_at.eq(Some(now)),
                        t::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                }

                Ok(updated)
            })
        })
        .await?
    }

    pub async fn user_stats(
        &self,
        user_id: i32,
        date: Option<NaiveDate>,
    ) -> Result<UserStats, StorageError> {
        use diesel::dsl::sum;
        use schema::focus_sessions::dsl as fs;
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<UserStats, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;

            let mut flags = t::tasks
                .filter(t::user_id.eq(user_id))
                .select(t::completed)
                .into_boxed();
            if let Some(d) = date {
                flags = flags.filter(t::scheduled_date.eq(d));
            }
            let flags: Vec<bool> = flags.load(&mut conn)?;
            let total_tasks = flags.len() as i64;
            let completed_tasks = flags.iter().filter(|c| **c).count() as i64;

            // Only sessions that actually finished count toward focus time;
            // active or abandoned ones contribute nothing.
            let focus_sum: Option<i64> = fs::focus_sessions
                .filter(fs::user_id.eq(user_id))
                .filter(fs::ended_at.is_not_null())
                .filter(fs::completed.eq(true))
                .select(sum(fs::duration_minutes))
                .first::<Option<i64>>(&mut conn)?;

            let completion_times: Vec<Option<NaiveDateTime>> = t::tasks
                .filter(t::user_id.eq(user_id))
                .filter(t::completed.eq(true))
                .filter(t::completed_at.is_not_null())
                .select(t::completed_at)
                .load(&mut conn)?;
            let days: Vec<NaiveDate> = completion_times
                .into_iter()
                .flatten()
                .map(|ts| ts.date())
                .collect();
            let streak = current_streak(&days, Utc::now().date_naive());

            let active_session = fs::focus_sessions
                .filter(fs::user_id.eq(user_id))
                .filter(fs::ended_at.is_null())
                .first::<FocusSession>(&mut conn)
                .optional()?;

            Ok(UserStats {
                total_tasks,
                completed_tasks,
                total_focus_minutes: focus_sum.unwrap_or(0),
                current_streak: streak,
                active_session,
            })
        })
        .await?
    }

    // Auth session helpers for JWT inactivity windows
    pub async fn create_auth_session(&self, jti_: &str, user_id_: i32) -> Result<(), StorageError> {
        use schema::auth_sessions;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new = NewAuthSession {
                jti: &j,
                user_id: user_id_,
            };
            diesel::insert_into(auth_sessions::table)
                .values(&new)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }

    /// Touch an auth session atomically, but only if it hasn't idled out.
    /// Returns `true` if the session was found and updated.
    ///
    /// Combining the idle-timeout check and the `last_used_at` update into
    /// a single UPDATE eliminates the race between checking and updating.
    pub async fn touch_auth_session_with_cutoff(
        &self,
        jti_: &str,
        cutoff: NaiveDateTime,
    ) -> Result<bool, StorageError> {
        use schema::auth_sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let updated =
                diesel::update(auth_sessions.filter(jti.eq(&j)).filter(last_used_at.ge(cutoff)))
                    .set(last_used_at.eq(now))
                    .execute(&mut conn)?;
            Ok(updated > 0)
        })
        .await?
    }
}

/// Consecutive calendar days with at least one completed task, walking
/// backward from `today`. The walk stops at the first gap; no completion
/// today means a streak of zero. Duplicate days count once.
pub fn current_streak(completion_days: &[NaiveDate], today: NaiveDate) -> i32 {
    let mut days = completion_days.to_vec();
    days.sort_unstable();
    days.dedup();

    let mut streak = 0;
    let mut expected = today;
    for day in days.iter().rev() {
        if *day > expected {
            // Completion stamped after "today" (clock skew); ignore it.
            continue;
        }
        if *day != expected {
            break;
        }
        streak += 1;
        match expected.pred_opt() {
            Some(prev) => expected = prev,
            None => break,
        }
    }
    streak
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys=ON;").execute(conn)?;
    Ok(())
}
