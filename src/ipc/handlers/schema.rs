use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schema::{
    gate_write, resolve_components, validate, weight_total, ComponentDraft, LockState, WriteGate,
};
use crate::store::{GradeStore, StoreError};
use serde_json::json;

fn parse_drafts(req: &Request) -> Result<Vec<ComponentDraft>, serde_json::Value> {
    let Some(raw) = req.params.get("components") else {
        return Err(err(&req.id, "bad_params", "missing params.components", None));
    };
    serde_json::from_value(raw.clone())
        .map_err(|e| err(&req.id, "bad_params", format!("bad components: {}", e), None))
}

fn handle_schema_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };

    match store.fetch_schema(element_id) {
        Ok(payload) => ok(
            &req.id,
            json!({
                "components": payload.components,
                "locked": payload.locked,
            }),
        ),
        Err(StoreError::NotFound(what)) => err(&req.id, "not_found", what, None),
        Err(e) => err(&req.id, "store_failed", e.to_string(), None),
    }
}

/// Pure dry-run used by the editor on every keystroke: always returns the
/// running weight total so the user never submits blind.
fn handle_schema_validate(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let drafts = match parse_drafts(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let total = weight_total(&drafts);
    match validate(&drafts) {
        Ok(()) => ok(&req.id, json!({ "valid": true, "weightTotal": total })),
        Err(e) => ok(
            &req.id,
            json!({
                "valid": false,
                "weightTotal": total,
                "error": {
                    "code": e.code(),
                    "message": e.message(),
                    "details": e.details(),
                },
            }),
        ),
    }
}

fn handle_schema_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(identity) = state.identity.as_ref() else {
        return err(&req.id, "no_session", "set a session identity first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let drafts = match parse_drafts(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let confirmed = req
        .params
        .get("confirmRecalculate")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // Lock state comes from the store, not from any open sheet: grades may
    // have appeared since the last fetch.
    let locked = match store.fetch_schema(element_id) {
        Ok(p) => LockState::from_has_grades(p.locked),
        Err(StoreError::NotFound(what)) => return err(&req.id, "not_found", what, None),
        Err(e) => return err(&req.id, "store_failed", e.to_string(), None),
    };

    match gate_write(locked, identity, confirmed) {
        WriteGate::Allowed => {}
        WriteGate::Denied => {
            return err(
                &req.id,
                "schema_locked",
                "grades exist for this element; only an administrator may change its schema",
                None,
            );
        }
        WriteGate::ConfirmRequired => {
            return err(
                &req.id,
                "confirm_required",
                "saving will recalculate every final grade for this element; \
                 repeat with confirmRecalculate=true to proceed",
                Some(json!({ "recalculatesFinalGrades": true })),
            );
        }
    }

    if let Err(e) = validate(&drafts) {
        return err(&req.id, e.code(), e.message(), e.details());
    }

    let components = resolve_components(&drafts);
    if let Err(e) = store.save_schema(element_id, &components) {
        return match e {
            StoreError::NotFound(what) => err(&req.id, "not_found", what, None),
            other => err(&req.id, "store_failed", other.to_string(), None),
        };
    }

    // The store recomputed final grades; an open sheet must refetch rather
    // than keep stale records and a buffer keyed to dead components.
    if let Some(sheet) = state.sheets.get_mut(element_id) {
        if let Err(e) = sheet.reload(store) {
            return err(&req.id, "store_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({
            "components": components,
            "recalculated": locked == LockState::Locked,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schema.get" => Some(handle_schema_get(state, req)),
        "schema.validate" => Some(handle_schema_validate(state, req)),
        "schema.save" => Some(handle_schema_save(state, req)),
        _ => None,
    }
}
