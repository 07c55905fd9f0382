use serde::{Deserialize, Serialize};

use crate::validator::Validator;

pub const MAX_TEXT_BYTES: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Todo {
    pub id: i64,
    #[serde(skip)]
    pub created_at: i64,
    pub title: String,
    pub description: String,
    pub status: bool,
    pub version: i64,
}

/// New todo; absent or null fields fall back to empty values and are left
/// for [`validate_todo`] to judge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTodo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<bool>,
}

/// Partial update; `None` (absent or null) leaves the stored value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTodo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<bool>,
}

impl From<CreateTodo> for Todo {
    fn from(input: CreateTodo) -> Self {
        Todo {
            title: input.title.unwrap_or_default(),
            description: input.description.unwrap_or_default(),
            status: input.status.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl Todo {
    pub fn apply(&mut self, changes: UpdateTodo) {
        if let Some(title) = changes.title {
            self.title = title;
        }
        if let Some(description) = changes.description {
            self.description = description;
        }
        if let Some(status) = changes.status {
            self.status = status;
        }
    }
}

pub fn validate_todo(v: &mut Validator, todo: &Todo) {
    v.check(!todo.title.is_empty(), "title", "must be provided");
    v.check(
        todo.title.len() <= MAX_TEXT_BYTES,
        "title",
        "must not be more than 250 bytes long",
    );
    v.check(
        todo.description.len() <= MAX_TEXT_BYTES,
        "description",
        "must not be more than 250 bytes long",
    );
}
