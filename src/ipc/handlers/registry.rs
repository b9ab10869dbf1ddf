use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::StoreError;
use serde_json::json;

fn handle_elements_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.name", None);
    };
    match store.create_element(name) {
        Ok(id) => ok(&req.id, json!({ "elementId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_elements_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match store.list_elements() {
        Ok(elements) => ok(&req.id, json!({ "elements": elements })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(last_name) = req.params.get("lastName").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.lastName", None);
    };
    let Some(first_name) = req.params.get("firstName").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.firstName", None);
    };
    let student_no = req.params.get("studentNo").and_then(|v| v.as_str());

    match store.add_student(element_id, last_name, first_name, student_no) {
        Ok(id) => ok(&req.id, json!({ "studentId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

/// Admin-only row lock toggle. This is the override path for rows the store
/// refuses with `Forbidden`.
fn handle_records_set_editable(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(identity) = state.identity.as_ref() else {
        return err(&req.id, "no_session", "set a session identity first", None);
    };
    if !identity.is_admin() {
        return err(
            &req.id,
            "forbidden",
            "only an administrator may lock or unlock rows",
            None,
        );
    }
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.studentId", None);
    };
    let Some(editable) = req.params.get("editable").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing params.editable", None);
    };

    match store.set_editable(element_id, student_id, editable) {
        Ok(()) => {
            // Keep any open sheet's view of the lock current. The store may
            // have materialized a record for a previously unscored student,
            // so the row is refetched rather than patched field-by-field.
            if let Some(sheet) = state.sheets.get_mut(element_id) {
                if let Some(row) = sheet.row_mut(student_id) {
                    match store.fetch_record(element_id, student_id) {
                        Ok(record) => row.grade = record,
                        Err(e) => return err(&req.id, "store_failed", e.to_string(), None),
                    }
                }
            }
            ok(&req.id, json!({ "editable": editable }))
        }
        Err(StoreError::NotFound(what)) => err(&req.id, "not_found", what, None),
        Err(e) => err(&req.id, "store_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "elements.create" => Some(handle_elements_create(state, req)),
        "elements.list" => Some(handle_elements_list(state, req)),
        "students.add" => Some(handle_students_add(state, req)),
        "records.setEditable" => Some(handle_records_set_editable(state, req)),
        _ => None,
    }
}
