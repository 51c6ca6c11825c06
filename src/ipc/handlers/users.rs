use rusqlite::OptionalExtension;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_i64, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

const ROLES: [&str; 3] = ["admin", "student", "professor"];

fn digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let username = get_required_str(&req.params, "username")?;
    let password = get_required_str(&req.params, "password")?;
    let role = get_required_str(&req.params, "role")?;
    let student_id = get_opt_i64(&req.params, "studentId");
    let professor_id = get_opt_i64(&req.params, "professorId");

    if !ROLES.contains(&role.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "role must be one of {:?}",
            ROLES
        )));
    }
    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = ?", [&username], |r| {
            r.get(0)
        })
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("username {} is already taken", username),
            details: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, password_sha256, role, student_id, professor_id)
         VALUES (?, ?, ?, ?, ?, ?)",
        (
            &id,
            &username,
            digest(&password),
            &role,
            student_id,
            professor_id,
        ),
    )?;
    Ok(json!({ "userId": id }))
}

fn verify(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let username = get_required_str(&req.params, "username")?;
    let password = get_required_str(&req.params, "password")?;

    let row: Option<(String, String, Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT password_sha256, role, student_id, professor_id
             FROM users WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    // Unknown users and wrong passwords look the same to the caller.
    let Some((stored, role, student_id, professor_id)) = row else {
        return Ok(json!({ "valid": false }));
    };
    if stored != digest(&password) {
        return Ok(json!({ "valid": false }));
    }
    Ok(json!({
        "valid": true,
        "role": role,
        "studentId": student_id,
        "professorId": professor_id,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.create" => create(state, req),
        "users.verify" => verify(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
