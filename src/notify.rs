use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

pub const RECIPIENT_STUDENT: &str = "student";
pub const RECIPIENT_PROFESSOR: &str = "professor";

/// Retention cap per recipient; oldest rows beyond this are pruned on insert.
pub const MAX_PER_RECIPIENT: i64 = 25;

const REMINDER_KIND: &str = "delivery_reminder";
const REMINDER_SUPPRESS_HOURS: i64 = 2;

pub const TS_FMT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn ts_at(dt: DateTime<Utc>) -> String {
    dt.format(TS_FMT).to_string()
}

pub fn ts_now() -> String {
    ts_at(Utc::now())
}

pub struct NewNotification<'a> {
    pub recipient_kind: &'a str,
    pub recipient_id: i64,
    pub kind: &'a str,
    pub message: String,
    pub delivery_id: Option<&'a str>,
    pub group_number: Option<i64>,
    pub origin_student_id: Option<i64>,
}

/// Insert one notification row and prune the recipient back to the cap.
/// Runs against whatever connection the caller hands in, so callers that
/// hold a transaction keep the insert and the prune atomic with their own
/// writes.
pub fn push(conn: &Connection, n: &NewNotification) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications(
            id, recipient_kind, recipient_id, kind, message, read,
            delivery_id, group_number, origin_student_id, created_at
         ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        (
            &id,
            n.recipient_kind,
            n.recipient_id,
            n.kind,
            &n.message,
            n.delivery_id,
            n.group_number,
            n.origin_student_id,
            ts_now(),
        ),
    )?;

    // Keep only the most recent rows per recipient. rowid breaks ties for
    // rows created within the same second.
    conn.execute(
        "DELETE FROM notifications
         WHERE recipient_kind = ?1 AND recipient_id = ?2
           AND id NOT IN (
             SELECT id FROM notifications
             WHERE recipient_kind = ?1 AND recipient_id = ?2
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3
           )",
        (n.recipient_kind, n.recipient_id, MAX_PER_RECIPIENT),
    )?;

    Ok(id)
}

/// Deadline-reminder batch: every delivery whose deadline falls 23-25 hours
/// after `now` and which has nothing submitted yet gets one reminder per
/// group member. A member who already received a reminder for the same
/// delivery within the last two hours is skipped, so re-running the batch
/// inside the window does not double-notify. Returns the number of
/// notifications sent.
pub fn process_reminders(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let window_start = now + Duration::hours(23);
    let window_end = now + Duration::hours(25);
    let suppress_after = ts_at(now - Duration::hours(REMINDER_SUPPRESS_HOURS));

    let mut stmt = conn.prepare(
        "SELECT id, group_number, title, deadline
         FROM deliveries
         WHERE submitted_file IS NULL",
    )?;
    let candidates = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut member_stmt = conn.prepare(
        "SELECT student_id FROM group_students WHERE group_number = ? ORDER BY student_id",
    )?;
    let mut recent_stmt = conn.prepare(
        "SELECT 1 FROM notifications
         WHERE recipient_kind = ? AND recipient_id = ? AND kind = ?
           AND delivery_id = ? AND created_at > ?
         LIMIT 1",
    )?;

    let mut sent = 0usize;
    for (delivery_id, group_number, title, deadline) in candidates {
        let Ok(deadline) = DateTime::parse_from_rfc3339(&deadline) else {
            continue;
        };
        let deadline = deadline.with_timezone(&Utc);
        if deadline < window_start || deadline > window_end {
            continue;
        }

        let members = member_stmt
            .query_map([group_number], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for student_id in members {
            let already = recent_stmt
                .query_row(
                    (
                        RECIPIENT_STUDENT,
                        student_id,
                        REMINDER_KIND,
                        &delivery_id,
                        &suppress_after,
                    ),
                    |_| Ok(()),
                )
                .is_ok();
            if already {
                continue;
            }
            push(
                conn,
                &NewNotification {
                    recipient_kind: RECIPIENT_STUDENT,
                    recipient_id: student_id,
                    kind: REMINDER_KIND,
                    message: format!("La entrega \"{}\" vence en 24 horas", title),
                    delivery_id: Some(&delivery_id),
                    group_number: Some(group_number),
                    origin_student_id: None,
                },
            )?;
            sent += 1;
        }
    }

    Ok(sent)
}
