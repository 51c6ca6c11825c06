use chrono::Utc;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_i64, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, RECIPIENT_PROFESSOR, RECIPIENT_STUDENT};

fn list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let kind = get_required_str(&req.params, "recipientKind")?;
    let recipient = get_required_i64(&req.params, "recipientId")?;

    if kind != RECIPIENT_STUDENT && kind != RECIPIENT_PROFESSOR {
        return Err(HandlerErr::bad_params(
            "recipientKind must be 'student' or 'professor'",
        ));
    }

    let mut stmt = conn.prepare(
        "SELECT id, kind, message, read, delivery_id, group_number, origin_student_id, created_at
         FROM notifications
         WHERE recipient_kind = ? AND recipient_id = ?
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let notifications = stmt
        .query_map((kind, recipient), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "kind": row.get::<_, String>(1)?,
                "message": row.get::<_, String>(2)?,
                "read": row.get::<_, i64>(3)? != 0,
                "deliveryId": row.get::<_, Option<String>>(4)?,
                "groupNumber": row.get::<_, Option<i64>>(5)?,
                "originStudentId": row.get::<_, Option<i64>>(6)?,
                "createdAt": row.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notifications": notifications }))
}

fn mark_read(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "notificationId")?;

    let changed = conn.execute("UPDATE notifications SET read = 1 WHERE id = ?", [&id])?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "notification not found".into(),
            details: None,
        });
    }
    Ok(json!({ "read": true }))
}

fn process_reminders(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let _ = req;
    let sent = notify::process_reminders(conn, Utc::now()).map_err(|e| HandlerErr {
        code: "db_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "sent": sent }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => list(state, req),
        "notifications.markRead" => mark_read(state, req),
        "notifications.processReminders" => process_reminders(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
