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

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: i64,
    first: &str,
    last: &str,
) {
    request_ok(
        stdin,
        reader,
        &format!("student-{}", id),
        "students.create",
        json!({ "id": id, "firstName": first, "lastName": last, "section": "10-A" }),
    );
}

/// Student X asks to join group 1 while a competing invitation from group
/// 2 is pending; the leader's accept adds X to group 1 and auto-rejects
/// the invitation.
#[test]
fn accepting_a_join_request_rejects_competing_invitations() {
    let workspace = temp_dir("servicio-join-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    add_student(&mut stdin, &mut reader, 1, "Ana", "Arias");
    add_student(&mut stdin, &mut reader, 2, "Beto", "Brenes");
    add_student(&mut stdin, &mut reader, 3, "Ximena", "Zamora");

    let g1 = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "groups.create",
        json!({ "creatorStudentId": 1 }),
    )
    .get("groupNumber")
    .and_then(|v| v.as_i64())
    .expect("g1 number");

    // Group 2's leader invites student 3.
    let g2 = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "groups.create",
        json!({ "creatorStudentId": 2, "invitedStudentIds": [3], "message": "unite al grupo" }),
    );
    let invitation = g2
        .pointer("/invitationIds/0")
        .and_then(|v| v.as_str())
        .expect("invitation id")
        .to_string();

    let join = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "requests.join",
        json!({ "studentId": 3, "groupNumber": g1 }),
    );
    let join_id = join
        .get("requestId")
        .and_then(|v| v.as_str())
        .expect("request id")
        .to_string();

    // The leader of group 1 got notified about the new request.
    let leader_inbox = request_ok(
        &mut stdin,
        &mut reader,
        "inbox",
        "notifications.list",
        json!({ "recipientKind": "student", "recipientId": 1 }),
    );
    let kinds: Vec<&str> = leader_inbox
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications")
        .iter()
        .filter_map(|n| n.get("kind").and_then(|k| k.as_str()))
        .collect();
    assert!(kinds.contains(&"join_request_received"), "{:?}", kinds);

    let accepted = request_ok(
        &mut stdin,
        &mut reader,
        "accept",
        "requests.respond",
        json!({ "responderStudentId": 1, "requestId": join_id, "accept": true }),
    );
    assert_eq!(accepted.get("joinedGroup").and_then(|v| v.as_i64()), Some(g1));
    assert_eq!(accepted.get("autoRejected").and_then(|v| v.as_i64()), Some(1));

    // The competing invitation is now rejected, silently.
    let outbox = request_ok(
        &mut stdin,
        &mut reader,
        "requests",
        "requests.listForStudent",
        json!({ "studentId": 3 }),
    );
    let invite_state = outbox
        .get("inbox")
        .and_then(|v| v.as_array())
        .expect("inbox")
        .iter()
        .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(invitation.as_str()))
        .and_then(|r| r.get("state"))
        .and_then(|v| v.as_str())
        .expect("invitation state");
    assert_eq!(invite_state, "rejected");

    // The accepted sender was notified.
    let sender_inbox = request_ok(
        &mut stdin,
        &mut reader,
        "sender-inbox",
        "notifications.list",
        json!({ "recipientKind": "student", "recipientId": 3 }),
    );
    let kinds: Vec<&str> = sender_inbox
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications")
        .iter()
        .filter_map(|n| n.get("kind").and_then(|k| k.as_str()))
        .collect();
    assert!(kinds.contains(&"request_accepted"), "{:?}", kinds);
}

#[test]
fn leaderless_groups_reject_join_requests_without_creating_rows() {
    let workspace = temp_dir("servicio-join-leaderless");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    add_student(&mut stdin, &mut reader, 1, "Ana", "Arias");
    add_student(&mut stdin, &mut reader, 2, "Beto", "Brenes");
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
    request_ok(
        &mut stdin,
        &mut reader,
        "empty",
        "groups.removeMember",
        json!({ "groupNumber": group, "studentId": 1 }),
    );

    let denied = request(
        &mut stdin,
        &mut reader,
        "join",
        "requests.join",
        json!({ "studentId": 2, "groupNumber": group }),
    );
    assert_eq!(
        denied.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    let requests = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "requests.listForStudent",
        json!({ "studentId": 2 }),
    );
    assert_eq!(
        requests
            .get("outbox")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );
}

#[test]
fn duplicate_pending_join_requests_are_rejected() {
    let workspace = temp_dir("servicio-join-duplicate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    add_student(&mut stdin, &mut reader, 1, "Ana", "Arias");
    add_student(&mut stdin, &mut reader, 2, "Beto", "Brenes");
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

    request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "requests.join",
        json!({ "studentId": 2, "groupNumber": group }),
    );
    let again = request(
        &mut stdin,
        &mut reader,
        "join-again",
        "requests.join",
        json!({ "studentId": 2, "groupNumber": group }),
    );
    assert_eq!(
        again.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
}

#[test]
fn invalid_invitees_fail_group_creation_with_the_offending_ids() {
    let workspace = temp_dir("servicio-invitees");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    add_student(&mut stdin, &mut reader, 1, "Ana", "Arias");
    add_student(&mut stdin, &mut reader, 2, "Beto", "Brenes");
    request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "groups.create",
        json!({ "creatorStudentId": 2 }),
    );

    // 2 is already grouped and 99 does not exist.
    let denied = request(
        &mut stdin,
        &mut reader,
        "g1",
        "groups.create",
        json!({ "creatorStudentId": 1, "invitedStudentIds": [2, 99] }),
    );
    assert_eq!(
        denied.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
    assert_eq!(
        denied.pointer("/error/details/invalidStudentIds"),
        Some(&json!([2, 99]))
    );
}
