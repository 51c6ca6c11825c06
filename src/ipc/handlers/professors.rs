use rusqlite::OptionalExtension;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_i64, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, NewNotification, RECIPIENT_PROFESSOR};

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(&req.params, "id")?;
    let first_name = get_required_str(&req.params, "firstName")?;
    let last_name = get_required_str(&req.params, "lastName")?;
    let email = get_opt_str(&req.params, "email");

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM professors WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("professor {} already exists", id),
            details: None,
        });
    }

    conn.execute(
        "INSERT INTO professors(id, first_name, last_name, email) VALUES (?, ?, ?, ?)",
        (id, &first_name, &last_name, &email),
    )?;
    Ok(json!({ "id": id }))
}

fn list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let _ = req;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.first_name, p.last_name, p.email,
                (SELECT COUNT(*) FROM group_professors gp WHERE gp.professor_id = p.id)
         FROM professors p
         ORDER BY p.last_name, p.first_name, p.id",
    )?;
    let professors = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "firstName": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "email": row.get::<_, Option<String>>(3)?,
                "groupCount": row.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "professors": professors }))
}

fn delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(&req.params, "id")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM group_professors WHERE professor_id = ?", [id])?;
    tx.execute(
        "DELETE FROM notifications WHERE recipient_kind = 'professor' AND recipient_id = ?",
        [id],
    )?;
    tx.execute("DELETE FROM users WHERE professor_id = ?", [id])?;
    let changed = tx.execute("DELETE FROM professors WHERE id = ?", [id])?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "professor not found".into(),
            details: None,
        });
    }
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

/// Assigns (or re-assigns) the tutoring professor for a group. One tutor
/// per group; assigning again overwrites the previous row.
fn assign_group(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let professor = get_required_i64(&req.params, "professorId")?;

    let group_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM groups WHERE number = ?", [group], |r| {
            r.get(0)
        })
        .optional()?;
    if group_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("group {} not found", group),
            details: None,
        });
    }
    let prof_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM professors WHERE id = ?", [professor], |r| {
            r.get(0)
        })
        .optional()?;
    if prof_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("professor {} not found", professor),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT OR REPLACE INTO group_professors(group_number, professor_id, assigned_at)
         VALUES (?, ?, ?)",
        (group, professor, notify::ts_now()),
    )?;
    notify::push(
        &tx,
        &NewNotification {
            recipient_kind: RECIPIENT_PROFESSOR,
            recipient_id: professor,
            kind: "group_assigned",
            message: format!("Se te asignó el grupo {}", group),
            delivery_id: None,
            group_number: Some(group),
            origin_student_id: None,
        },
    )?;
    tx.commit()?;
    Ok(json!({ "groupNumber": group, "professorId": professor }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "professors.create" => create(state, req),
        "professors.list" => list(state, req),
        "professors.delete" => delete(state, req),
        "professors.assignGroup" => assign_group(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
