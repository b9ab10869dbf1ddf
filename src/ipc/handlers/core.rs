use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{Identity, Role};
use crate::store::SqliteStore;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "session": state.identity.clone(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match SqliteStore::open(&path) {
        Ok(store) => {
            state.workspace = Some(path.clone());
            state.store = Some(store);
            // Open sheets belong to the previous workspace.
            state.sheets.clear();
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_session_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(user_id) = req.params.get("userId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.userId", None);
    };
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some("teacher") => Role::Teacher,
        Some("admin") => Role::Admin,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "params.role must be teacher or admin",
                None,
            )
        }
    };

    state.identity = Some(Identity {
        user_id: user_id.to_string(),
        role,
    });
    ok(&req.id, json!({ "session": state.identity.clone() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.set" => Some(handle_session_set(state, req)),
        _ => None,
    }
}
