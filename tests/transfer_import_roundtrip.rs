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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Setup {
    element_id: String,
    component_keys: Vec<String>,
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Setup {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "session.set",
        json!({ "userId": "prof", "role": "teacher" }),
    );
    let created = request_ok(
        stdin,
        reader,
        "s3",
        "elements.create",
        json!({ "name": "Algebra I" }),
    );
    let element_id = created
        .get("elementId")
        .and_then(|v| v.as_str())
        .expect("elementId")
        .to_string();

    for (i, no) in ["1001", "1002"].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("s4-{}", i),
            "students.add",
            json!({
                "elementId": element_id,
                "lastName": format!("Last{}", i),
                "firstName": format!("First{}", i),
                "studentNo": no
            }),
        );
    }

    let saved = request_ok(
        stdin,
        reader,
        "s5",
        "schema.save",
        json!({
            "elementId": element_id,
            "components": [
                { "name": "Test1", "weight": 40.0 },
                { "name": "Test2", "weight": 50.0 }
            ]
        }),
    );
    let component_keys = saved
        .get("components")
        .and_then(|v| v.as_array())
        .expect("components")
        .iter()
        .map(|c| {
            c.get("key")
                .and_then(|v| v.as_str())
                .expect("key")
                .to_string()
        })
        .collect();

    Setup {
        element_id,
        component_keys,
    }
}

#[test]
fn template_requires_schema_components() {
    let workspace = temp_dir("gradesheet-template-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "elements.create",
        json!({ "name": "No Schema Yet" }),
    );
    let element_id = created
        .get("elementId")
        .and_then(|v| v.as_str())
        .expect("elementId");

    let out = workspace.join("template.csv");
    let resp = request(
        &mut stdin,
        &mut reader,
        "t3",
        "grades.template",
        json!({ "elementId": element_id, "outPath": out.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), "no_components");
    assert!(!out.exists());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_requires_confirmation_naming_the_student_count() {
    let workspace = temp_dir("gradesheet-import-confirm");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = setup(&mut stdin, &mut reader, &workspace);

    let template = workspace.join("template.csv");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "grades.template",
        json!({
            "elementId": s.element_id,
            "outPath": template.to_string_lossy()
        }),
    );

    // Fill in grades for both students.
    let text = std::fs::read_to_string(&template).expect("read template");
    let mut lines = text.lines();
    let header = lines.next().expect("header").to_string();
    let filled: Vec<String> = lines
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let mut cells: Vec<&str> = l.split(',').collect();
            let n = cells.len();
            cells[n - 3] = "15"; // participation
            cells[n - 2] = "11"; // Test1
            cells[n - 1] = "13"; // Test2
            cells.join(",")
        })
        .collect();
    let import_path = workspace.join("grades.csv");
    std::fs::write(
        &import_path,
        format!("{}\n{}\n", header, filled.join("\n")),
    )
    .expect("write import file");

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "i2",
        "grades.importPreview",
        json!({
            "elementId": s.element_id,
            "path": import_path.to_string_lossy()
        }),
    );
    assert_eq!(preview.get("students").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        preview
            .get("problems")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // Wrong confirmation count refuses and writes nothing.
    let resp = request(
        &mut stdin,
        &mut reader,
        "i3",
        "grades.import",
        json!({
            "elementId": s.element_id,
            "path": import_path.to_string_lossy(),
            "confirmCount": 1
        }),
    );
    assert_eq!(error_code(&resp), "confirm_mismatch");

    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "i4",
        "grades.import",
        json!({
            "elementId": s.element_id,
            "path": import_path.to_string_lossy(),
            "confirmCount": 2
        }),
    );
    let summary = resp.get("summary").expect("summary");
    assert_eq!(summary.get("students").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("created").and_then(|v| v.as_u64()), Some(2));

    // Imported values are visible on a freshly opened sheet.
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "i5",
        "grades.open",
        json!({ "elementId": s.element_id }),
    );
    let rows = sheet.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(
            row.get("effective")
                .and_then(|e| e.get("participation"))
                .and_then(|v| v.as_str()),
            Some("15")
        );
        assert_eq!(
            row.get("effective")
                .and_then(|e| e.get("evaluations"))
                .and_then(|e| e.get(s.component_keys[0].as_str()))
                .and_then(|v| v.as_str()),
            Some("11")
        );
        // 0.05*15 + 0.4*11 + 0.5*13 = 0.75 + 4.4 + 6.5
        assert_eq!(row.get("finalGrade").and_then(|v| v.as_f64()), Some(11.65));
    }
    // The sheet is locked for schema edits now that grades exist.
    assert_eq!(sheet.get("locked").and_then(|v| v.as_str()), Some("locked"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_with_bad_lines_previews_problems_and_refuses() {
    let workspace = temp_dir("gradesheet-import-problems");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = setup(&mut stdin, &mut reader, &workspace);

    let import_path = workspace.join("grades.csv");
    let header = format!(
        "student_no,participation,Test1 [{}],Test2 [{}]",
        s.component_keys[0], s.component_keys[1]
    );
    // Unknown student and an out-of-range grade.
    std::fs::write(
        &import_path,
        format!("{}\n9999,10,10,10\n1001,25,10,10\n", header),
    )
    .expect("write import file");

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "grades.importPreview",
        json!({
            "elementId": s.element_id,
            "path": import_path.to_string_lossy()
        }),
    );
    assert_eq!(preview.get("students").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        preview
            .get("problems")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "p2",
        "grades.import",
        json!({
            "elementId": s.element_id,
            "path": import_path.to_string_lossy(),
            "confirmCount": 0
        }),
    );
    assert_eq!(error_code(&resp), "invalid_grades");

    let _ = std::fs::remove_dir_all(workspace);
}
