use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{GradeStore, SqliteStore, StoreError};
use crate::transfer::{parse_import, write_template, ImportParse};
use serde_json::json;
use std::fs::File;
use std::path::Path;

fn handle_grades_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(out_path) = req.params.get("outPath").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.outPath", None);
    };

    let schema = match store.fetch_schema(element_id) {
        Ok(p) => p,
        Err(StoreError::NotFound(what)) => return err(&req.id, "not_found", what, None),
        Err(e) => return err(&req.id, "store_failed", e.to_string(), None),
    };
    if schema.components.is_empty() {
        return err(
            &req.id,
            "no_components",
            "define evaluation components before downloading a template",
            None,
        );
    }

    let grades = match store.fetch_grades(element_id) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "store_failed", e.to_string(), None),
    };

    let file = match File::create(Path::new(out_path)) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
    };
    if let Err(e) = write_template(file, &schema.components, &grades.rows) {
        return err(&req.id, "io_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "outPath": out_path,
            "students": grades.rows.len(),
            "components": schema.components.len(),
        }),
    )
}

fn parse_import_file(
    store: &SqliteStore,
    element_id: &str,
    path: &str,
) -> Result<ImportParse, (String, String)> {
    let schema = store
        .fetch_schema(element_id)
        .map_err(|e| match e {
            StoreError::NotFound(what) => ("not_found".to_string(), what),
            other => ("store_failed".to_string(), other.to_string()),
        })?;
    let index = store
        .student_no_index(element_id)
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?;
    let file = File::open(Path::new(path))
        .map_err(|e| ("io_failed".to_string(), e.to_string()))?;
    parse_import(file, element_id, &schema.components, &index)
        .map_err(|e| ("bad_import_file".to_string(), e.to_string()))
}

fn handle_import_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(path) = req.params.get("path").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match parse_import_file(store, element_id, path) {
        Ok(parsed) => ok(
            &req.id,
            json!({
                "students": parsed.payloads.len(),
                "problems": parsed.problems,
            }),
        ),
        Err((code, message)) => err(&req.id, &code, message, None),
    }
}

/// Bulk overwrite. The caller must echo the preview's affected-student
/// count back as `confirmCount`; a stale or absent confirmation refuses.
fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if state.identity.is_none() {
        return err(&req.id, "no_session", "set a session identity first", None);
    }
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(path) = req.params.get("path").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };
    let Some(confirm_count) = req.params.get("confirmCount").and_then(|v| v.as_u64()) else {
        return err(
            &req.id,
            "bad_params",
            "missing params.confirmCount; run grades.importPreview first",
            None,
        );
    };

    let parsed = match parse_import_file(store, element_id, path) {
        Ok(p) => p,
        Err((code, message)) => return err(&req.id, &code, message, None),
    };
    if !parsed.is_clean() {
        return err(
            &req.id,
            "invalid_grades",
            format!("{} line(s) failed validation; nothing was imported", parsed.problems.len()),
            Some(json!({ "problems": parsed.problems })),
        );
    }
    if confirm_count as usize != parsed.payloads.len() {
        return err(
            &req.id,
            "confirm_mismatch",
            format!(
                "import would overwrite grades for {} student(s); confirm that number to proceed",
                parsed.payloads.len()
            ),
            Some(json!({ "students": parsed.payloads.len() })),
        );
    }

    let summary = match store.import_grades(element_id, &parsed.payloads) {
        Ok(s) => s,
        Err(StoreError::NotFound(what)) => return err(&req.id, "not_found", what, None),
        Err(e) => return err(&req.id, "store_failed", e.to_string(), None),
    };

    // Imported values supersede anything fetched or typed before.
    if let Some(sheet) = state.sheets.get_mut(element_id) {
        if let Err(e) = sheet.reload(store) {
            return err(&req.id, "store_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "summary": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.template" => Some(handle_grades_template(state, req)),
        "grades.importPreview" => Some(handle_import_preview(state, req)),
        "grades.import" => Some(handle_import(state, req)),
        _ => None,
    }
}
