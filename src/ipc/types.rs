use std::collections::HashMap;
use std::path::PathBuf;

use crate::model::Identity;
use crate::sheet::GradeSheet;
use crate::store::SqliteStore;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// All engine state, owned by the single request loop. `sheets` holds one
/// open grade sheet per course element; the store is only reachable through
/// the `GradeStore` trait from there on.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<SqliteStore>,
    pub identity: Option<Identity>,
    pub sheets: HashMap<String, GradeSheet>,
}
