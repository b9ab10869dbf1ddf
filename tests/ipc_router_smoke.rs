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
    let exe = env!("CARGO_BIN_EXE_gradesheetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesheetd");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn malformed_request_line_gets_a_parseable_error_reply() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // Unparseable on purpose, with quotes the reply must not choke on.
    writeln!(stdin, "{{\"id\": \"x\", \"method\": nope").expect("write bad line");
    stdin.flush().expect("flush bad line");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read reply");
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).expect("error reply must itself be valid json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_json")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradesheet-router-smoke");
    let template_out = workspace.join("template.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "session.set",
        json!({ "userId": "smoke", "role": "teacher" }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "4",
        "elements.create",
        json!({ "name": "Smoke Element" }),
    );
    let element_id = created
        .get("result")
        .and_then(|v| v.get("elementId"))
        .and_then(|v| v.as_str())
        .expect("elementId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "5", "elements.list", json!({}));
    let created_student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.add",
        json!({
            "elementId": element_id,
            "lastName": "Smoke",
            "firstName": "Student",
            "studentNo": "1001"
        }),
    );
    let student_id = created_student
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "schema.get",
        json!({ "elementId": element_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "schema.validate",
        json!({ "components": [{ "name": "Test 1", "weight": 90.0 }] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "schema.save",
        json!({
            "elementId": element_id,
            "components": [{ "name": "Test 1", "weight": 90.0 }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.open",
        json!({ "elementId": element_id }),
    );
    let sheet = request(
        &mut stdin,
        &mut reader,
        "11",
        "grades.sheet",
        json!({ "elementId": element_id }),
    );
    let key = sheet
        .get("result")
        .and_then(|v| v.get("components"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("key"))
        .and_then(|v| v.as_str())
        .expect("component key")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "grades.setField",
        json!({
            "elementId": element_id,
            "studentId": student_id,
            "field": "component",
            "key": key,
            "value": "14"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "grades.saveRow",
        json!({ "elementId": element_id, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "grades.revertRow",
        json!({ "elementId": element_id, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "grades.saveAll",
        json!({ "elementId": element_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "grades.template",
        json!({
            "elementId": element_id,
            "outPath": template_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "grades.importPreview",
        json!({
            "elementId": element_id,
            "path": template_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "session.set",
        json!({ "userId": "boss", "role": "admin" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "records.setEditable",
        json!({
            "elementId": element_id,
            "studentId": student_id,
            "editable": true
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
