use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_i64_array, get_opt_str, get_required_i64, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let creator = get_required_i64(&req.params, "creatorStudentId")?;
    let invited = match req.params.get("invitedStudentIds") {
        Some(_) => get_i64_array(&req.params, "invitedStudentIds")?,
        None => Vec::new(),
    };
    let message = get_opt_str(&req.params, "message");

    let created = lifecycle::create_group(conn, creator, &invited, message.as_deref())?;
    Ok(json!({
        "groupNumber": created.number,
        "invitationIds": created.invitation_ids,
    }))
}

fn list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let _ = req;
    let mut stmt = conn.prepare(
        "SELECT g.number, g.leader_id,
                (SELECT COUNT(*) FROM group_students gs WHERE gs.group_number = g.number),
                gp.professor_id
         FROM groups g
         LEFT JOIN group_professors gp ON gp.group_number = g.number
         ORDER BY g.number",
    )?;
    let groups = stmt
        .query_map([], |row| {
            Ok(json!({
                "number": row.get::<_, i64>(0)?,
                "leaderId": row.get::<_, Option<i64>>(1)?,
                "memberCount": row.get::<_, i64>(2)?,
                "tutorId": row.get::<_, Option<i64>>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "groups": groups }))
}

fn members(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;

    let leader: Option<i64> = conn
        .query_row(
            "SELECT leader_id FROM groups WHERE number = ?",
            [group],
            |r| r.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr {
                code: "not_found",
                message: format!("group {} not found", group),
                details: None,
            },
            other => HandlerErr::from(other),
        })?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.section
         FROM group_students gs
         JOIN students s ON s.id = gs.student_id
         WHERE gs.group_number = ?
         ORDER BY s.id",
    )?;
    let members = stmt
        .query_map([group], |row| {
            let id: i64 = row.get(0)?;
            Ok(json!({
                "id": id,
                "firstName": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "section": row.get::<_, String>(3)?,
                "isLeader": Some(id) == leader,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "groupNumber": group,
        "leaderId": leader,
        "members": members,
    }))
}

fn remove_member(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let student = get_required_i64(&req.params, "studentId")?;

    let out = lifecycle::remove_student_from_group(conn, group, student)?;
    Ok(json!({
        "newLeaderId": out.new_leader,
        "removedRequests": out.removed_requests,
    }))
}

fn transfer_leadership(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let actor = get_required_i64(&req.params, "actorStudentId")?;
    let candidate = get_required_i64(&req.params, "newLeaderId")?;

    lifecycle::transfer_leadership(conn, group, actor, candidate)?;
    Ok(json!({ "groupNumber": group, "leaderId": candidate }))
}

fn bulk_reassign(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group = get_required_i64(&req.params, "groupNumber")?;
    let ids = get_i64_array(&req.params, "studentIds")?;

    let out = lifecycle::bulk_reassign_members(conn, group, &ids)?;
    Ok(json!({
        "assigned": out.assigned,
        "skipped": out.skipped,
        "leaderId": out.leader,
    }))
}

fn reset(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let _ = req;
    let summary = lifecycle::reset_all_groups(conn)?;
    Ok(json!({
        "groupsCreated": summary.groups_created,
        "studentsAssigned": summary.students_assigned,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "groups.create" => create(state, req),
        "groups.list" => list(state, req),
        "groups.members" => members(state, req),
        "groups.removeMember" => remove_member(state, req),
        "groups.transferLeadership" => transfer_leadership(state, req),
        "groups.bulkReassign" => bulk_reassign(state, req),
        "groups.reset" => reset(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
