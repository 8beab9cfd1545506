use serde::{Deserialize, Deserializer, Serialize};

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct SignUpReq {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignInReq {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub user: UserDto,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDto {
    pub id: i32,
    pub email: String,
    pub name: String,
    pub created_at: String, // RFC3339 UTC
    pub updated_at: String, // RFC3339 UTC
}

// Tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDto {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub estimated_minutes: Option<i32>,
    pub completed: bool,
    pub completed_at: Option<String>, // RFC3339 UTC
    pub scheduled_date: String,       // YYYY-MM-DD
    pub created_at: String,           // RFC3339 UTC
    pub updated_at: String,           // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskReq {
    pub title: String,
    pub description: Option<String>,
    pub estimated_minutes: Option<i32>,
    /// YYYY-MM-DD; defaults to today (UTC) when absent.
    pub scheduled_date: Option<String>,
}

/// Partial update for a task. Each optional field is tri-state: absent
/// means "leave unchanged", explicit `null` means "clear", a value means
/// "set". The double-`Option` plus `deserialize_explicit_null` keeps the
/// absent/null distinction through serde.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_explicit_null"
    )]
    pub description: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_explicit_null"
    )]
    pub estimated_minutes: Option<Option<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>, // YYYY-MM-DD
}

fn deserialize_explicit_null<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    // A present field always yields Some(..); `null` becomes Some(None).
    Option::<T>::deserialize(de).map(Some)
}

// Focus sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusSessionDto {
    pub id: i32,
    pub task_id: Option<i32>,
    pub duration_minutes: i32,
    pub started_at: String,        // RFC3339 UTC
    pub ended_at: Option<String>,  // RFC3339 UTC; None while active
    pub completed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartSessionReq {
    pub task_id: Option<i32>,
    pub planned_minutes: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndSessionReq {
    /// Final duration; when absent the server uses the elapsed time.
    pub duration_minutes: Option<i32>,
    pub completed: bool,
}

// Statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsDto {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub total_focus_minutes: i64,
    pub current_streak: i32,
    pub active_session: Option<FocusSessionDto>,
}
