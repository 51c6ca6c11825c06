use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "servicio.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Split out of `open_db` so tests can run
/// against an in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            section TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS professors(
            id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT
        )",
        [],
    )?;

    // Leader may be NULL: a group survives losing its last member.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            number INTEGER PRIMARY KEY,
            leader_id INTEGER,
            FOREIGN KEY(leader_id) REFERENCES students(id)
        )",
        [],
    )?;

    // Single-group-per-student is enforced by the lifecycle layer,
    // not by this schema.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_students(
            student_id INTEGER NOT NULL,
            group_number INTEGER NOT NULL,
            PRIMARY KEY(student_id, group_number),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(group_number) REFERENCES groups(number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_students_group ON group_students(group_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_professors(
            group_number INTEGER PRIMARY KEY,
            professor_id INTEGER NOT NULL,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY(group_number) REFERENCES groups(number),
            FOREIGN KEY(professor_id) REFERENCES professors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_professors_professor
         ON group_professors(professor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS requests(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            sender_id INTEGER NOT NULL,
            recipient_id INTEGER NOT NULL,
            group_number INTEGER,
            message TEXT,
            created_at TEXT NOT NULL,
            responded_at TEXT,
            FOREIGN KEY(sender_id) REFERENCES students(id),
            FOREIGN KEY(recipient_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_requests_message(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_sender ON requests(sender_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_recipient ON requests(recipient_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_group ON requests(group_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS deliveries(
            id TEXT PRIMARY KEY,
            group_number INTEGER NOT NULL,
            title TEXT NOT NULL,
            instructions TEXT,
            deadline TEXT NOT NULL,
            state TEXT NOT NULL,
            submitted_file TEXT,
            feedback TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(group_number) REFERENCES groups(number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_deliveries_group ON deliveries(group_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            recipient_kind TEXT NOT NULL,
            recipient_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            delivery_id TEXT,
            group_number INTEGER,
            origin_student_id INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient
         ON notifications(recipient_kind, recipient_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_delivery ON notifications(delivery_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_sha256 TEXT NOT NULL,
            role TEXT NOT NULL,
            student_id INTEGER,
            professor_id INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(professor_id) REFERENCES professors(id)
        )",
        [],
    )?;

    Ok(())
}

fn ensure_requests_message(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces stored requests without the free-text message.
    if table_has_column(conn, "requests", "message")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE requests ADD COLUMN message TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
