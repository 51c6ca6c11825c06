use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_serviciod");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serviciod");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn member_ids(result: &serde_json::Value) -> Vec<i64> {
    result
        .get("members")
        .and_then(|v| v.as_array())
        .expect("members array")
        .iter()
        .map(|m| m.get("id").and_then(|v| v.as_i64()).expect("member id"))
        .collect()
}

/// Nine students reset into groups of [4, 4, 1], numbered from 1, each
/// led by its first student in name order.
#[test]
fn reset_partitions_nine_students_into_three_groups() {
    let workspace = temp_dir("servicio-reset");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let roster = [
        (21, "Ana", "Arias"),
        (22, "Beto", "Brenes"),
        (23, "Carla", "Castro"),
        (24, "Diego", "Diaz"),
        (25, "Elena", "Esquivel"),
        (26, "Fabio", "Fallas"),
        (27, "Gina", "Gomez"),
        (28, "Hugo", "Herrera"),
        (29, "Irene", "Ibarra"),
    ];
    for (id, first, last) in roster {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("student-{}", id),
            "students.create",
            json!({ "id": id, "firstName": first, "lastName": last, "section": "10-A" }),
        );
    }
    // Pre-existing group that the reset must clear away.
    request_ok(
        &mut stdin,
        &mut reader,
        "old-group",
        "groups.create",
        json!({ "creatorStudentId": 25 }),
    );

    let summary = request_ok(&mut stdin, &mut reader, "reset", "groups.reset", json!({}));
    assert_eq!(summary.get("groupsCreated").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        summary.get("studentsAssigned").and_then(|v| v.as_i64()),
        Some(9)
    );

    let sizes_and_leaders = [
        (1, vec![21, 22, 23, 24], 21),
        (2, vec![25, 26, 27, 28], 25),
        (3, vec![29], 29),
    ];
    for (number, expected_members, expected_leader) in sizes_and_leaders {
        let members = request_ok(
            &mut stdin,
            &mut reader,
            &format!("members-{}", number),
            "groups.members",
            json!({ "groupNumber": number }),
        );
        assert_eq!(member_ids(&members), expected_members);
        assert_eq!(
            members.get("leaderId").and_then(|v| v.as_i64()),
            Some(expected_leader)
        );
    }
}

#[test]
fn bulk_reassign_replaces_membership_and_repairs_the_leader() {
    let workspace = temp_dir("servicio-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for (id, first, last) in [
        (1, "Ana", "Arias"),
        (4, "Beto", "Brenes"),
        (7, "Carla", "Castro"),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("student-{}", id),
            "students.create",
            json!({ "id": id, "firstName": first, "lastName": last, "section": "10-A" }),
        );
    }
    let group = request_ok(
        &mut stdin,
        &mut reader,
        "g",
        "groups.create",
        json!({ "creatorStudentId": 1 }),
    )
    .get("groupNumber")
    .and_then(|v| v.as_i64())
    .expect("group number");

    // The old leader is not in the new set; the lowest new id takes over.
    // Unknown ids are skipped, not fatal.
    let out = request_ok(
        &mut stdin,
        &mut reader,
        "reassign",
        "groups.bulkReassign",
        json!({ "groupNumber": group, "studentIds": [7, 4, 99] }),
    );
    assert_eq!(out.get("assigned"), Some(&json!([7, 4])));
    assert_eq!(out.get("skipped"), Some(&json!([99])));
    assert_eq!(out.get("leaderId").and_then(|v| v.as_i64()), Some(4));

    let members = request_ok(
        &mut stdin,
        &mut reader,
        "members",
        "groups.members",
        json!({ "groupNumber": group }),
    );
    assert_eq!(member_ids(&members), vec![4, 7]);
    assert_eq!(members.get("leaderId").and_then(|v| v.as_i64()), Some(4));
}
