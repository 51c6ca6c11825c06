use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_bool, get_required_i64, get_required_str, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;

fn join(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student = get_required_i64(&req.params, "studentId")?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let message = get_opt_str(&req.params, "message");

    let request_id = lifecycle::join_request(conn, student, group, message.as_deref())?;
    Ok(json!({ "requestId": request_id }))
}

fn respond(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let responder = get_required_i64(&req.params, "responderStudentId")?;
    let request_id = get_required_str(&req.params, "requestId")?;
    let accept = get_required_bool(&req.params, "accept")?;

    let out = lifecycle::respond_to_request(conn, responder, &request_id, accept)?;
    Ok(json!({
        "state": out.state,
        "joinedGroup": out.joined_group,
        "autoRejected": out.auto_rejected,
    }))
}

fn row_to_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "kind": row.get::<_, String>(1)?,
        "state": row.get::<_, String>(2)?,
        "senderId": row.get::<_, i64>(3)?,
        "recipientId": row.get::<_, i64>(4)?,
        "groupNumber": row.get::<_, Option<i64>>(5)?,
        "message": row.get::<_, Option<String>>(6)?,
        "createdAt": row.get::<_, String>(7)?,
        "respondedAt": row.get::<_, Option<String>>(8)?,
    }))
}

fn list_for_student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student = get_required_i64(&req.params, "studentId")?;

    let mut stmt = conn.prepare(
        "SELECT id, kind, state, sender_id, recipient_id, group_number,
                message, created_at, responded_at
         FROM requests WHERE recipient_id = ?
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let inbox = stmt
        .query_map([student], |row| row_to_json(row))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, kind, state, sender_id, recipient_id, group_number,
                message, created_at, responded_at
         FROM requests WHERE sender_id = ?
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let outbox = stmt
        .query_map([student], |row| row_to_json(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "inbox": inbox, "outbox": outbox }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "requests.join" => join(state, req),
        "requests.respond" => respond(state, req),
        "requests.listForStudent" => list_for_student(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
