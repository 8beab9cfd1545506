use crate::storage::schema::{auth_sessions, focus_sessions, tasks, users};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct Task {
    pub id: i32,
    pub user_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub estimated_minutes: Option<i32>,
    pub completed: bool,
    pub completed_at: Option<NaiveDateTime>,
    pub scheduled_date: NaiveDate,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub user_id: i32,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub estimated_minutes: Option<i32>,
    pub scheduled_date: NaiveDate,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = focus_sessions)]
#[diesel(belongs_to(User, foreign_key = user_id))]
#[diesel(belongs_to(Task, foreign_key = task_id))]
pub struct FocusSession {
    pub id: i32,
    pub user_id: i32,
    pub task_id: Option<i32>,
    pub duration_minutes: i32,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub completed: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = focus_sessions)]
pub struct NewFocusSession {
    pub user_id: i32,
    pub task_id: Option<i32>,
    pub duration_minutes: i32,
    pub started_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = auth_sessions)]
#[diesel(primary_key(jti))]
pub struct AuthSession {
    pub jti: String,
    pub user_id: i32,
    pub issued_at: NaiveDateTime,
    pub last_used_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = auth_sessions)]
pub struct NewAuthSession<'a> {
    pub jti: &'a str,
    pub user_id: i32,
}
