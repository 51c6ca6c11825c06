use rusqlite::OptionalExtension;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_i64, get_required_str, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify;

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(&req.params, "id")?;
    let first_name = get_required_str(&req.params, "firstName")?;
    let last_name = get_required_str(&req.params, "lastName")?;
    let section = get_required_str(&req.params, "section")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("student {} already exists", id),
            details: None,
        });
    }

    conn.execute(
        "INSERT INTO students(id, first_name, last_name, section, created_at)
         VALUES (?, ?, ?, ?, ?)",
        (id, &first_name, &last_name, &section, notify::ts_now()),
    )?;
    Ok(json!({ "id": id }))
}

fn list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.section, gs.group_number
         FROM students s
         LEFT JOIN group_students gs ON gs.student_id = s.id
         ORDER BY s.last_name, s.first_name, s.id",
    )?;
    let students = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "firstName": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "section": row.get::<_, String>(3)?,
                "groupNumber": row.get::<_, Option<i64>>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(&req.params, "id")?;

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(v) = get_opt_str(&req.params, "firstName") {
        sets.push("first_name = ?");
        values.push(Box::new(v));
    }
    if let Some(v) = get_opt_str(&req.params, "lastName") {
        sets.push("last_name = ?");
        values.push(Box::new(v));
    }
    if let Some(v) = get_opt_str(&req.params, "section") {
        sets.push("section = ?");
        values.push(Box::new(v));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    values.push(Box::new(id));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    let changed = conn.execute(
        &sql,
        rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
    )?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".into(),
            details: None,
        });
    }
    Ok(json!({ "updated": true }))
}

/// Students with a group membership cannot be deleted; everything else
/// that references them (requests, notifications, accounts) goes first.
fn delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(&req.params, "id")?;

    let grouped: Option<i64> = conn
        .query_row(
            "SELECT group_number FROM group_students WHERE student_id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(group) = grouped {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("student still belongs to group {}", group),
            details: Some(json!({ "groupNumber": group })),
        });
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM requests WHERE sender_id = ?1 OR recipient_id = ?1",
        [id],
    )?;
    tx.execute(
        "DELETE FROM notifications
         WHERE (recipient_kind = 'student' AND recipient_id = ?1) OR origin_student_id = ?1",
        [id],
    )?;
    tx.execute("DELETE FROM users WHERE student_id = ?", [id])?;
    let changed = tx.execute("DELETE FROM students WHERE id = ?", [id])?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".into(),
            details: None,
        });
    }
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => create(state, req),
        "students.list" => list(state, req),
        "students.update" => update(state, req),
        "students.delete" => delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
