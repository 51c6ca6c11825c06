use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_i64, get_required_str, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, NewNotification, RECIPIENT_PROFESSOR, RECIPIENT_STUDENT};

const STATES: [&str; 3] = ["assigned", "submitted", "reviewed"];

fn group_members(conn: &Connection, group: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM group_students WHERE group_number = ? ORDER BY student_id",
    )?;
    let members = stmt.query_map([group], |r| r.get(0))?.collect();
    members
}

fn delivery_group(conn: &Connection, delivery_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT group_number FROM deliveries WHERE id = ?",
        [delivery_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or(HandlerErr {
        code: "not_found",
        message: "delivery not found".into(),
        details: None,
    })
}

fn notify_members(
    conn: &Connection,
    group: i64,
    kind: &str,
    message: &str,
    delivery_id: &str,
) -> rusqlite::Result<()> {
    for student in group_members(conn, group)? {
        notify::push(
            conn,
            &NewNotification {
                recipient_kind: RECIPIENT_STUDENT,
                recipient_id: student,
                kind,
                message: message.to_string(),
                delivery_id: Some(delivery_id),
                group_number: Some(group),
                origin_student_id: None,
            },
        )?;
    }
    Ok(())
}

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let title = get_required_str(&req.params, "title")?;
    let deadline = get_required_str(&req.params, "deadline")?;
    let instructions = get_opt_str(&req.params, "instructions");

    if DateTime::parse_from_rfc3339(&deadline).is_err() {
        return Err(HandlerErr::bad_params("deadline must be an RFC 3339 timestamp"));
    }
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM groups WHERE number = ?", [group], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("group {} not found", group),
            details: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO deliveries(
            id, group_number, title, instructions, deadline, state, created_at
         ) VALUES (?, ?, ?, ?, ?, 'assigned', ?)",
        (&id, group, &title, &instructions, &deadline, notify::ts_now()),
    )?;
    notify_members(
        &tx,
        group,
        "delivery_assigned",
        &format!("Nueva entrega asignada: {}", title),
        &id,
    )?;
    tx.commit()?;
    Ok(json!({ "deliveryId": id }))
}

/// Records the submitted file reference and tells the group's tutor, if
/// one is assigned. File contents live outside the workspace; only the
/// reference string is stored.
fn submit(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let delivery_id = get_required_str(&req.params, "deliveryId")?;
    let file_ref = get_required_str(&req.params, "fileRef")?;

    let group = delivery_group(conn, &delivery_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE deliveries SET submitted_file = ?, state = 'submitted' WHERE id = ?",
        (&file_ref, &delivery_id),
    )?;
    let tutor: Option<i64> = tx
        .query_row(
            "SELECT professor_id FROM group_professors WHERE group_number = ?",
            [group],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(tutor) = tutor {
        notify::push(
            &tx,
            &NewNotification {
                recipient_kind: RECIPIENT_PROFESSOR,
                recipient_id: tutor,
                kind: "delivery_submitted",
                message: format!("El grupo {} envió una entrega", group),
                delivery_id: Some(&delivery_id),
                group_number: Some(group),
                origin_student_id: None,
            },
        )?;
    }
    tx.commit()?;
    Ok(json!({ "deliveryId": delivery_id, "state": "submitted" }))
}

fn feedback(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let delivery_id = get_required_str(&req.params, "deliveryId")?;
    let text = get_required_str(&req.params, "feedback")?;

    let group = delivery_group(conn, &delivery_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE deliveries SET feedback = ? WHERE id = ?",
        (&text, &delivery_id),
    )?;
    notify_members(
        &tx,
        group,
        "delivery_feedback",
        "Tu entrega recibió retroalimentación",
        &delivery_id,
    )?;
    tx.commit()?;
    Ok(json!({ "deliveryId": delivery_id }))
}

fn set_state(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let delivery_id = get_required_str(&req.params, "deliveryId")?;
    let new_state = get_required_str(&req.params, "state")?;

    if !STATES.contains(&new_state.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "state must be one of {:?}",
            STATES
        )));
    }

    let group = delivery_group(conn, &delivery_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE deliveries SET state = ? WHERE id = ?",
        (&new_state, &delivery_id),
    )?;
    notify_members(
        &tx,
        group,
        "delivery_state_changed",
        &format!("Tu entrega cambió de estado a {}", new_state),
        &delivery_id,
    )?;
    tx.commit()?;
    Ok(json!({ "deliveryId": delivery_id, "state": new_state }))
}

fn list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;

    let mut stmt = conn.prepare(
        "SELECT id, title, instructions, deadline, state, submitted_file, feedback, created_at
         FROM deliveries WHERE group_number = ?
         ORDER BY deadline, rowid",
    )?;
    let deliveries = stmt
        .query_map([group], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "instructions": row.get::<_, Option<String>>(2)?,
                "deadline": row.get::<_, String>(3)?,
                "state": row.get::<_, String>(4)?,
                "submittedFile": row.get::<_, Option<String>>(5)?,
                "feedback": row.get::<_, Option<String>>(6)?,
                "createdAt": row.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "groupNumber": group, "deliveries": deliveries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "deliveries.create" => create(state, req),
        "deliveries.submit" => submit(state, req),
        "deliveries.feedback" => feedback(state, req),
        "deliveries.setState" => set_state(state, req),
        "deliveries.list" => list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
