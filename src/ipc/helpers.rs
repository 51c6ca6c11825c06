use rusqlite::Connection;
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::lifecycle::LifecycleError;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

impl From<LifecycleError> for HandlerErr {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound(m) => HandlerErr {
                code: "not_found",
                message: m,
                details: None,
            },
            LifecycleError::Conflict(m) => HandlerErr {
                code: "conflict",
                message: m,
                details: None,
            },
            LifecycleError::Permission(m) => HandlerErr {
                code: "permission_denied",
                message: m,
                details: None,
            },
            LifecycleError::Validation(m) => HandlerErr {
                code: "validation_failed",
                message: m,
                details: None,
            },
            LifecycleError::InvalidInvitees(ids) => HandlerErr {
                code: "validation_failed",
                message: "invited students cannot be added".into(),
                details: Some(json!({ "invalidStudentIds": ids })),
            },
            LifecycleError::Db(e) => HandlerErr {
                code: "db_failed",
                message: e.to_string(),
                details: None,
            },
        }
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or(HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".into(),
        details: None,
    })
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_i64_array(params: &serde_json::Value, key: &str) -> Result<Vec<i64>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain integers", key)))
        })
        .collect()
}
