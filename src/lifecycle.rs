//! Group membership, leadership, and request lifecycle.
//!
//! Every public operation runs inside one transaction so partial
//! application (membership deleted but leader not reassigned, request
//! accepted but membership missing) is never observable.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::notify::{self, NewNotification, RECIPIENT_STUDENT};

pub const KIND_JOIN_REQUEST: &str = "join_request";
pub const KIND_GROUP_INVITATION: &str = "group_invitation";

pub const STATE_PENDING: &str = "pending";
pub const STATE_ACCEPTED: &str = "accepted";
pub const STATE_REJECTED: &str = "rejected";

/// Group size used when regenerating all groups from the roster.
pub const RESET_GROUP_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    Validation(String),
    #[error("invited students cannot be added")]
    InvalidInvitees(Vec<i64>),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug)]
pub struct RemovalOutcome {
    pub new_leader: Option<i64>,
    pub removed_requests: usize,
}

#[derive(Debug)]
pub struct CreatedGroup {
    pub number: i64,
    pub invitation_ids: Vec<String>,
}

#[derive(Debug)]
pub struct ResponseOutcome {
    pub state: &'static str,
    pub joined_group: Option<i64>,
    pub auto_rejected: usize,
}

#[derive(Debug)]
pub struct BulkReassignOutcome {
    pub assigned: Vec<i64>,
    pub skipped: Vec<i64>,
    pub leader: Option<i64>,
}

#[derive(Debug)]
pub struct ResetSummary {
    pub groups_created: usize,
    pub students_assigned: usize,
}

struct RequestRow {
    kind: String,
    state: String,
    sender_id: i64,
    recipient_id: i64,
    group_number: Option<i64>,
}

fn student_exists(conn: &Connection, student: i64) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
}

/// The group a student currently belongs to, if any. The lifecycle layer
/// keeps this at most one row per student.
fn membership_of(conn: &Connection, student: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT group_number FROM group_students WHERE student_id = ? LIMIT 1",
        [student],
        |r| r.get(0),
    )
    .optional()
}

/// None means the group row does not exist; Some(None) means leaderless.
fn leader_of(conn: &Connection, group: i64) -> rusqlite::Result<Option<Option<i64>>> {
    conn.query_row(
        "SELECT leader_id FROM groups WHERE number = ?",
        [group],
        |r| r.get::<_, Option<i64>>(0),
    )
    .optional()
}

fn is_member(conn: &Connection, group: i64, student: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM group_students WHERE group_number = ? AND student_id = ?",
        (group, student),
        |_| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
}

/// Successor policy on leader loss: lowest remaining student id. The id is
/// a stable business key, so the pick is deterministic and documented
/// rather than an accident of query order.
fn lowest_member(conn: &Connection, group: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT MIN(student_id) FROM group_students WHERE group_number = ?",
        [group],
        |r| r.get::<_, Option<i64>>(0),
    )
}

/// Removes a membership. If the removed student led the group, the lowest
/// remaining member is promoted, or the group goes leaderless when empty;
/// the group row itself always survives. Requests that tie this student to
/// this group are deleted regardless of direction or state. No
/// notification fires on this path.
pub fn remove_student_from_group(
    conn: &Connection,
    group: i64,
    student: i64,
) -> Result<RemovalOutcome> {
    let tx = conn.unchecked_transaction()?;

    let Some(leader) = leader_of(&tx, group)? else {
        return Err(LifecycleError::NotFound(format!("group {} not found", group)));
    };
    if !is_member(&tx, group, student)? {
        return Err(LifecycleError::NotFound(format!(
            "student {} is not a member of group {}",
            student, group
        )));
    }

    tx.execute(
        "DELETE FROM group_students WHERE group_number = ? AND student_id = ?",
        (group, student),
    )?;

    let mut new_leader = leader;
    if leader == Some(student) {
        new_leader = lowest_member(&tx, group)?;
        tx.execute(
            "UPDATE groups SET leader_id = ? WHERE number = ?",
            (new_leader, group),
        )?;
    }

    let removed_requests = tx.execute(
        "DELETE FROM requests
         WHERE group_number = ?1 AND (sender_id = ?2 OR recipient_id = ?2)",
        (group, student),
    )?;

    tx.commit()?;
    Ok(RemovalOutcome {
        new_leader,
        removed_requests,
    })
}

/// Hands the leader pointer to another member. Membership is untouched.
pub fn transfer_leadership(
    conn: &Connection,
    group: i64,
    actor: i64,
    candidate: i64,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let Some(leader) = leader_of(&tx, group)? else {
        return Err(LifecycleError::NotFound(format!("group {} not found", group)));
    };
    if leader != Some(actor) {
        return Err(LifecycleError::Permission(
            "only the current leader can transfer leadership".into(),
        ));
    }
    if !is_member(&tx, group, candidate)? {
        return Err(LifecycleError::NotFound(format!(
            "student {} is not a member of group {}",
            candidate, group
        )));
    }

    tx.execute(
        "UPDATE groups SET leader_id = ? WHERE number = ?",
        (candidate, group),
    )?;
    tx.commit()?;
    Ok(())
}

/// Creates a group led by `creator` and issues one pending invitation per
/// invited student. Group numbers advance monotonically (max + 1) and are
/// never reused after deletion. Every invited id must resolve to an
/// existing, ungrouped student other than the creator; otherwise the whole
/// call fails with the list of offending ids and nothing is written.
pub fn create_group(
    conn: &Connection,
    creator: i64,
    invited: &[i64],
    message: Option<&str>,
) -> Result<CreatedGroup> {
    let tx = conn.unchecked_transaction()?;

    if !student_exists(&tx, creator)? {
        return Err(LifecycleError::NotFound(format!(
            "student {} not found",
            creator
        )));
    }
    if membership_of(&tx, creator)?.is_some() {
        return Err(LifecycleError::Conflict(
            "student already belongs to a group".into(),
        ));
    }

    let mut invalid = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut invitees = Vec::new();
    for &id in invited {
        if !seen.insert(id) {
            continue;
        }
        if id == creator || !student_exists(&tx, id)? || membership_of(&tx, id)?.is_some() {
            invalid.push(id);
        } else {
            invitees.push(id);
        }
    }
    if !invalid.is_empty() {
        return Err(LifecycleError::InvalidInvitees(invalid));
    }

    let number: i64 = tx.query_row("SELECT COALESCE(MAX(number), 0) + 1 FROM groups", [], |r| {
        r.get(0)
    })?;
    tx.execute(
        "INSERT INTO groups(number, leader_id) VALUES (?, ?)",
        (number, creator),
    )?;
    tx.execute(
        "INSERT INTO group_students(student_id, group_number) VALUES (?, ?)",
        (creator, number),
    )?;

    let now = notify::ts_now();
    let mut invitation_ids = Vec::with_capacity(invitees.len());
    for invitee in invitees {
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO requests(
                id, kind, state, sender_id, recipient_id, group_number, message, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                KIND_GROUP_INVITATION,
                STATE_PENDING,
                creator,
                invitee,
                number,
                message,
                &now,
            ),
        )?;
        notify::push(
            &tx,
            &NewNotification {
                recipient_kind: RECIPIENT_STUDENT,
                recipient_id: invitee,
                kind: "invitation_received",
                message: format!("Has sido invitado al grupo {}", number),
                delivery_id: None,
                group_number: Some(number),
                origin_student_id: Some(creator),
            },
        )?;
        invitation_ids.push(id);
    }

    tx.commit()?;
    Ok(CreatedGroup {
        number,
        invitation_ids,
    })
}

/// Files a join request addressed to the group's leader and notifies them.
/// A leaderless group cannot be asked: nobody could answer, so no request
/// row is ever created for one.
pub fn join_request(
    conn: &Connection,
    student: i64,
    group: i64,
    message: Option<&str>,
) -> Result<String> {
    let tx = conn.unchecked_transaction()?;

    if !student_exists(&tx, student)? {
        return Err(LifecycleError::NotFound(format!(
            "student {} not found",
            student
        )));
    }
    if membership_of(&tx, student)?.is_some() {
        return Err(LifecycleError::Conflict(
            "student already belongs to a group".into(),
        ));
    }
    let Some(leader) = leader_of(&tx, group)? else {
        return Err(LifecycleError::NotFound(format!("group {} not found", group)));
    };
    let Some(leader) = leader else {
        return Err(LifecycleError::Validation(
            "cannot request to join a leaderless group".into(),
        ));
    };

    let duplicate: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM requests
             WHERE kind = ? AND state = ? AND sender_id = ? AND group_number = ?",
            (KIND_JOIN_REQUEST, STATE_PENDING, student, group),
            |r| r.get(0),
        )
        .optional()?;
    if duplicate.is_some() {
        return Err(LifecycleError::Conflict(
            "a pending join request for this group already exists".into(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO requests(
            id, kind, state, sender_id, recipient_id, group_number, message, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            KIND_JOIN_REQUEST,
            STATE_PENDING,
            student,
            leader,
            group,
            message,
            notify::ts_now(),
        ),
    )?;
    notify::push(
        &tx,
        &NewNotification {
            recipient_kind: RECIPIENT_STUDENT,
            recipient_id: leader,
            kind: "join_request_received",
            message: format!("Nueva solicitud para unirse al grupo {}", group),
            delivery_id: None,
            group_number: Some(group),
            origin_student_id: Some(student),
        },
    )?;

    tx.commit()?;
    Ok(id)
}

/// The student a request would place into a group: the sender of a join
/// request, the recipient of an invitation.
fn joining_student(row: &RequestRow) -> i64 {
    if row.kind == KIND_JOIN_REQUEST {
        row.sender_id
    } else {
        row.recipient_id
    }
}

/// Answers a pending request. Acceptance adds the joining student to the
/// group, notifies the request's sender, and auto-rejects every other
/// pending request that would place the same student somewhere else (their
/// own join requests plus invitations addressed to them). Auto-rejections
/// carry the same response timestamp and fire no notification.
pub fn respond_to_request(
    conn: &Connection,
    responder: i64,
    request_id: &str,
    accept: bool,
) -> Result<ResponseOutcome> {
    let tx = conn.unchecked_transaction()?;

    let row = tx
        .query_row(
            "SELECT kind, state, sender_id, recipient_id, group_number
             FROM requests WHERE id = ?",
            [request_id],
            |r| {
                Ok(RequestRow {
                    kind: r.get(0)?,
                    state: r.get(1)?,
                    sender_id: r.get(2)?,
                    recipient_id: r.get(3)?,
                    group_number: r.get(4)?,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Err(LifecycleError::NotFound("request not found".into()));
    };

    if row.recipient_id != responder {
        return Err(LifecycleError::Permission(
            "only the request recipient can respond".into(),
        ));
    }
    let Some(group) = row.group_number else {
        return Err(LifecycleError::Validation(
            "request has no associated group".into(),
        ));
    };
    if row.kind == KIND_JOIN_REQUEST {
        // Leadership may have moved since the request was filed.
        let Some(leader) = leader_of(&tx, group)? else {
            return Err(LifecycleError::NotFound(format!("group {} not found", group)));
        };
        if leader != Some(responder) {
            return Err(LifecycleError::Permission(
                "only the group's current leader can respond".into(),
            ));
        }
    }
    if row.state != STATE_PENDING {
        return Err(LifecycleError::Conflict("request already responded".into()));
    }

    let now = notify::ts_now();
    if !accept {
        tx.execute(
            "UPDATE requests SET state = ?, responded_at = ? WHERE id = ?",
            (STATE_REJECTED, &now, request_id),
        )?;
        tx.commit()?;
        return Ok(ResponseOutcome {
            state: STATE_REJECTED,
            joined_group: None,
            auto_rejected: 0,
        });
    }

    let joiner = joining_student(&row);
    if leader_of(&tx, group)?.is_none() {
        return Err(LifecycleError::NotFound(format!("group {} not found", group)));
    }
    // Race guard: the student may have joined elsewhere since the request
    // was created.
    if membership_of(&tx, joiner)?.is_some() {
        return Err(LifecycleError::Conflict(
            "student already belongs to a group".into(),
        ));
    }

    tx.execute(
        "UPDATE requests SET state = ?, responded_at = ? WHERE id = ?",
        (STATE_ACCEPTED, &now, request_id),
    )?;
    tx.execute(
        "INSERT INTO group_students(student_id, group_number) VALUES (?, ?)",
        (joiner, group),
    )?;

    let auto_rejected = tx.execute(
        "UPDATE requests SET state = ?1, responded_at = ?2
         WHERE state = ?3 AND id != ?4
           AND ((kind = ?5 AND sender_id = ?6) OR (kind = ?7 AND recipient_id = ?6))",
        (
            STATE_REJECTED,
            &now,
            STATE_PENDING,
            request_id,
            KIND_JOIN_REQUEST,
            joiner,
            KIND_GROUP_INVITATION,
        ),
    )?;

    notify::push(
        &tx,
        &NewNotification {
            recipient_kind: RECIPIENT_STUDENT,
            recipient_id: row.sender_id,
            kind: "request_accepted",
            message: format!("Tu solicitud para el grupo {} fue aceptada", group),
            delivery_id: None,
            group_number: Some(group),
            origin_student_id: Some(responder),
        },
    )?;

    tx.commit()?;
    Ok(ResponseOutcome {
        state: STATE_ACCEPTED,
        joined_group: Some(group),
        auto_rejected,
    })
}

/// Replaces a group's entire membership set. Unknown ids and students
/// already grouped elsewhere are skipped rather than failing the call. If
/// the replace leaves the leader outside the group, the lowest-id new
/// member is promoted (NULL when the group emptied) -- same policy as
/// single removal, so the leader-is-a-member invariant holds afterwards.
pub fn bulk_reassign_members(
    conn: &Connection,
    group: i64,
    student_ids: &[i64],
) -> Result<BulkReassignOutcome> {
    let tx = conn.unchecked_transaction()?;

    let Some(leader) = leader_of(&tx, group)? else {
        return Err(LifecycleError::NotFound(format!("group {} not found", group)));
    };

    tx.execute("DELETE FROM group_students WHERE group_number = ?", [group])?;

    let mut seen = std::collections::HashSet::new();
    let mut assigned = Vec::new();
    let mut skipped = Vec::new();
    for &id in student_ids {
        if !seen.insert(id) {
            continue;
        }
        if !student_exists(&tx, id)? || membership_of(&tx, id)?.is_some() {
            skipped.push(id);
            continue;
        }
        tx.execute(
            "INSERT INTO group_students(student_id, group_number) VALUES (?, ?)",
            (id, group),
        )?;
        assigned.push(id);
    }

    let mut new_leader = leader;
    let still_leads = matches!(leader, Some(l) if assigned.contains(&l));
    if !still_leads {
        new_leader = assigned.iter().min().copied();
        tx.execute(
            "UPDATE groups SET leader_id = ? WHERE number = ?",
            (new_leader, group),
        )?;
    }

    tx.commit()?;
    Ok(BulkReassignOutcome {
        assigned,
        skipped,
        leader: new_leader,
    })
}

/// Wipes every group-related table and regenerates groups from the roster:
/// students ordered by name are partitioned into chunks of at most four,
/// numbered from 1, with the first student of each chunk as leader.
/// Children go before parents in the delete pass.
pub fn reset_all_groups(conn: &Connection) -> Result<ResetSummary> {
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM requests", [])?;
    tx.execute("DELETE FROM group_students", [])?;
    tx.execute("DELETE FROM deliveries", [])?;
    tx.execute("DELETE FROM group_professors", [])?;
    tx.execute("DELETE FROM notifications", [])?;
    tx.execute("DELETE FROM groups", [])?;

    let mut stmt =
        tx.prepare("SELECT id FROM students ORDER BY last_name, first_name, id")?;
    let students = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut groups_created = 0usize;
    for (i, chunk) in students.chunks(RESET_GROUP_SIZE).enumerate() {
        let number = (i + 1) as i64;
        tx.execute(
            "INSERT INTO groups(number, leader_id) VALUES (?, ?)",
            (number, chunk[0]),
        )?;
        for &student in chunk {
            tx.execute(
                "INSERT INTO group_students(student_id, group_number) VALUES (?, ?)",
                (student, number),
            )?;
        }
        groups_created += 1;
    }

    tx.commit()?;
    Ok(ResetSummary {
        groups_created,
        students_assigned: students.len(),
    })
}
