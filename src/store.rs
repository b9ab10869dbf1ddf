use crate::model::{
    ComponentScore, CourseElement, EvaluationComponent, GradePayload, GradeRecord, Student,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Store-side failure kinds the orchestration boundary must distinguish.
/// Everything coming back from the store is one of these; raw driver errors
/// never cross the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The targeted record is administratively locked.
    Forbidden,
    NotFound(String),
    Transport(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Forbidden => write!(f, "record is locked"),
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Transport(msg) => write!(f, "store failure: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPayload {
    pub components: Vec<EvaluationComponent>,
    /// True as soon as any grade exists for the element.
    pub locked: bool,
}

#[derive(Debug, Clone)]
pub struct StudentGrade {
    pub student: Student,
    pub grade: Option<GradeRecord>,
}

#[derive(Debug, Clone)]
pub struct GradesPayload {
    pub element: CourseElement,
    pub rows: Vec<StudentGrade>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub students: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped_locked: usize,
}

/// The authoritative grade record store. The engine only ever talks to the
/// remote service through this interface; `SqliteStore` below is the bundled
/// stand-in that makes the daemon runnable and testable end to end.
pub trait GradeStore {
    fn fetch_schema(&self, element_id: &str) -> Result<SchemaPayload, StoreError>;
    fn fetch_grades(&self, element_id: &str) -> Result<GradesPayload, StoreError>;
    /// Replaces the element's schema and recalculates every dependent final
    /// grade. Scores for removed components are orphaned, not deleted.
    fn save_schema(
        &self,
        element_id: &str,
        components: &[EvaluationComponent],
    ) -> Result<(), StoreError>;
    /// Full-payload upsert of one student's record. `Forbidden` when the
    /// record is administratively locked.
    fn save_grade(&self, payload: &GradePayload) -> Result<GradeRecord, StoreError>;
    /// Bulk overwrite used by the CSV import path. Locked rows are skipped
    /// and counted, not treated as a failure.
    fn import_grades(
        &self,
        element_id: &str,
        rows: &[GradePayload],
    ) -> Result<ImportSummary, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(workspace)?;
        let db_path = workspace.join("gradesheet.sqlite3");
        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS course_elements(
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS students(
                id TEXT PRIMARY KEY,
                element_id TEXT NOT NULL,
                last_name TEXT NOT NULL,
                first_name TEXT NOT NULL,
                student_no TEXT,
                sort_order INTEGER NOT NULL,
                FOREIGN KEY(element_id) REFERENCES course_elements(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_students_element ON students(element_id, sort_order)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_components(
                element_id TEXT NOT NULL,
                key TEXT NOT NULL,
                name TEXT NOT NULL,
                weight REAL NOT NULL,
                sort_order INTEGER NOT NULL,
                PRIMARY KEY(element_id, key),
                FOREIGN KEY(element_id) REFERENCES course_elements(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grade_records(
                element_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                presence REAL,
                participation REAL,
                evaluation REAL,
                final_grade REAL,
                is_editable INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT,
                PRIMARY KEY(element_id, student_id),
                FOREIGN KEY(element_id) REFERENCES course_elements(id),
                FOREIGN KEY(student_id) REFERENCES students(id)
            )",
            [],
        )?;

        // Scores live apart from the record row so scores for components
        // removed from the schema survive as orphans.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS component_scores(
                element_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                key TEXT NOT NULL,
                score REAL,
                PRIMARY KEY(element_id, student_id, key),
                FOREIGN KEY(element_id) REFERENCES course_elements(id),
                FOREIGN KEY(student_id) REFERENCES students(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_component_scores_student
             ON component_scores(element_id, student_id)",
            [],
        )?;

        Ok(SqliteStore { conn })
    }

    // Registry surface: the minimal element/roster management the engine
    // needs. Full academic-structure CRUD lives elsewhere.

    pub fn create_element(&self, name: &str) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO course_elements(id, name) VALUES(?, ?)",
            (&id, name),
        )?;
        Ok(id)
    }

    pub fn list_elements(&self) -> anyhow::Result<Vec<CourseElement>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM course_elements ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CourseElement {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_student(
        &self,
        element_id: &str,
        last_name: &str,
        first_name: &str,
        student_no: Option<&str>,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE element_id = ?",
            [element_id],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO students(id, element_id, last_name, first_name, student_no, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, element_id, last_name, first_name, student_no, next),
        )?;
        Ok(id)
    }

    /// Admin row-lock toggle. Locking a row makes every subsequent
    /// `save_grade` for it come back `Forbidden`.
    pub fn set_editable(
        &self,
        element_id: &str,
        student_id: &str,
        editable: bool,
    ) -> Result<(), StoreError> {
        let n = self.conn.execute(
            "UPDATE grade_records SET is_editable = ? WHERE element_id = ? AND student_id = ?",
            (editable as i64, element_id, student_id),
        )?;
        if n == 0 {
            // No record yet: materialize one so the lock holds before the
            // first grade submission.
            self.ensure_student(element_id, student_id)?;
            self.conn.execute(
                "INSERT INTO grade_records(element_id, student_id, is_editable, updated_at)
                 VALUES(?, ?, ?, ?)",
                (
                    element_id,
                    student_id,
                    editable as i64,
                    Utc::now().to_rfc3339(),
                ),
            )?;
        }
        Ok(())
    }

    /// One student's record as the store currently holds it, aligned to the
    /// current schema. `None` when no record exists yet.
    pub fn fetch_record(
        &self,
        element_id: &str,
        student_id: &str,
    ) -> Result<Option<GradeRecord>, StoreError> {
        self.ensure_element(element_id)?;
        self.ensure_student(element_id, student_id)?;
        let components = self.components(element_id)?;
        self.load_record(element_id, student_id, &components)
    }

    pub fn student_no_index(&self, element_id: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_no, id FROM students
             WHERE element_id = ? AND student_no IS NOT NULL
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([element_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn ensure_element(&self, element_id: &str) -> Result<(), StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM course_elements WHERE id = ?",
                [element_id],
                |r| r.get(0),
            )
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!(
                "course element {}",
                element_id
            ))),
        }
    }

    fn ensure_student(&self, element_id: &str, student_id: &str) -> Result<(), StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM students WHERE id = ? AND element_id = ?",
                [student_id, element_id],
                |r| r.get(0),
            )
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("student {}", student_id))),
        }
    }

    fn components(&self, element_id: &str) -> Result<Vec<EvaluationComponent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, name, weight FROM schema_components
             WHERE element_id = ? ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([element_id], |row| {
                Ok(EvaluationComponent {
                    key: row.get(0)?,
                    name: row.get(1)?,
                    weight: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn has_grades(&self, element_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM grade_records WHERE element_id = ?",
            [element_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn load_record(
        &self,
        element_id: &str,
        student_id: &str,
        components: &[EvaluationComponent],
    ) -> Result<Option<GradeRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT presence, participation, evaluation, final_grade, is_editable
                 FROM grade_records WHERE element_id = ? AND student_id = ?",
                [element_id, student_id],
                |r| {
                    Ok((
                        r.get::<_, Option<f64>>(0)?,
                        r.get::<_, Option<f64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                        r.get::<_, Option<f64>>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((presence, participation, evaluation, final_grade, editable)) = row else {
            return Ok(None);
        };

        // Align to the current schema: one slot per component, in schema
        // order; orphaned scores simply do not appear.
        let mut evaluations = Vec::with_capacity(components.len());
        for c in components {
            let score: Option<f64> = self
                .conn
                .query_row(
                    "SELECT score FROM component_scores
                     WHERE element_id = ? AND student_id = ? AND key = ?",
                    [element_id, student_id, c.key.as_str()],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            evaluations.push(ComponentScore {
                key: c.key.clone(),
                score,
            });
        }

        Ok(Some(GradeRecord {
            student_id: student_id.to_string(),
            presence,
            participation,
            evaluation,
            evaluations,
            final_grade,
            is_editable: editable != 0,
        }))
    }

    /// Presence and participation carry 5% each; the component set (or the
    /// legacy single evaluation) carries the remaining 90. Missing values
    /// count as zero.
    fn compute_final(
        &self,
        element_id: &str,
        student_id: &str,
        components: &[EvaluationComponent],
    ) -> Result<f64, StoreError> {
        let (presence, participation, evaluation): (Option<f64>, Option<f64>, Option<f64>) =
            self.conn.query_row(
                "SELECT presence, participation, evaluation
                 FROM grade_records WHERE element_id = ? AND student_id = ?",
                [element_id, student_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;

        let mut total = 0.05 * presence.unwrap_or(0.0) + 0.05 * participation.unwrap_or(0.0);
        if components.is_empty() {
            total += 0.90 * evaluation.unwrap_or(0.0);
        } else {
            for c in components {
                let score: Option<f64> = self
                    .conn
                    .query_row(
                        "SELECT score FROM component_scores
                         WHERE element_id = ? AND student_id = ? AND key = ?",
                        [element_id, student_id, c.key.as_str()],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten();
                total += score.unwrap_or(0.0) * c.weight / 100.0;
            }
        }
        Ok((total * 100.0).round() / 100.0)
    }

    fn recompute_final(
        &self,
        element_id: &str,
        student_id: &str,
        components: &[EvaluationComponent],
    ) -> Result<(), StoreError> {
        let final_grade = self.compute_final(element_id, student_id, components)?;
        self.conn.execute(
            "UPDATE grade_records SET final_grade = ?, updated_at = ?
             WHERE element_id = ? AND student_id = ?",
            (
                final_grade,
                Utc::now().to_rfc3339(),
                element_id,
                student_id,
            ),
        )?;
        Ok(())
    }

    fn apply_payload(&self, payload: &GradePayload) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO grade_records(element_id, student_id, participation, evaluation, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(element_id, student_id) DO UPDATE SET
               participation = excluded.participation,
               evaluation = excluded.evaluation,
               updated_at = excluded.updated_at",
            (
                &payload.element_id,
                &payload.student_id,
                payload.participation,
                payload.evaluation,
                Utc::now().to_rfc3339(),
            ),
        )?;

        if let Some(evaluations) = &payload.evaluations {
            for cs in evaluations {
                self.conn.execute(
                    "INSERT INTO component_scores(element_id, student_id, key, score)
                     VALUES(?, ?, ?, ?)
                     ON CONFLICT(element_id, student_id, key) DO UPDATE SET
                       score = excluded.score",
                    (
                        &payload.element_id,
                        &payload.student_id,
                        &cs.key,
                        cs.score,
                    ),
                )?;
            }
        }
        Ok(())
    }

    fn record_is_locked(&self, element_id: &str, student_id: &str) -> Result<bool, StoreError> {
        let editable: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_editable FROM grade_records
                 WHERE element_id = ? AND student_id = ?",
                [element_id, student_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(editable == Some(0))
    }
}

impl GradeStore for SqliteStore {
    fn fetch_schema(&self, element_id: &str) -> Result<SchemaPayload, StoreError> {
        self.ensure_element(element_id)?;
        Ok(SchemaPayload {
            components: self.components(element_id)?,
            locked: self.has_grades(element_id)?,
        })
    }

    fn fetch_grades(&self, element_id: &str) -> Result<GradesPayload, StoreError> {
        self.ensure_element(element_id)?;
        let name: String = self.conn.query_row(
            "SELECT name FROM course_elements WHERE id = ?",
            [element_id],
            |r| r.get(0),
        )?;
        let components = self.components(element_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, last_name, first_name, student_no FROM students
             WHERE element_id = ? ORDER BY sort_order",
        )?;
        let students = stmt
            .query_map([element_id], |row| {
                Ok(Student {
                    id: row.get(0)?,
                    last_name: row.get(1)?,
                    first_name: row.get(2)?,
                    student_no: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(students.len());
        for student in students {
            let grade = self.load_record(element_id, &student.id, &components)?;
            rows.push(StudentGrade { student, grade });
        }

        Ok(GradesPayload {
            element: CourseElement {
                id: element_id.to_string(),
                name,
            },
            rows,
        })
    }

    fn save_schema(
        &self,
        element_id: &str,
        components: &[EvaluationComponent],
    ) -> Result<(), StoreError> {
        self.ensure_element(element_id)?;

        // Replace-and-recompute is all-or-nothing: a failure mid-insert must
        // not leave the element with a partial schema.
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM schema_components WHERE element_id = ?",
            [element_id],
        )?;
        for (i, c) in components.iter().enumerate() {
            tx.execute(
                "INSERT INTO schema_components(element_id, key, name, weight, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (element_id, &c.key, &c.name, c.weight, i as i64),
            )?;
        }

        // A schema change invalidates every cached final grade.
        let student_ids = {
            let mut stmt =
                tx.prepare("SELECT student_id FROM grade_records WHERE element_id = ?")?;
            let ids = stmt
                .query_map([element_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        for sid in student_ids {
            self.recompute_final(element_id, &sid, components)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_grade(&self, payload: &GradePayload) -> Result<GradeRecord, StoreError> {
        self.ensure_element(&payload.element_id)?;
        self.ensure_student(&payload.element_id, &payload.student_id)?;
        if self.record_is_locked(&payload.element_id, &payload.student_id)? {
            return Err(StoreError::Forbidden);
        }

        let components = self.components(&payload.element_id)?;
        self.apply_payload(payload)?;
        self.recompute_final(&payload.element_id, &payload.student_id, &components)?;

        self.load_record(&payload.element_id, &payload.student_id, &components)?
            .ok_or_else(|| StoreError::Transport("record vanished after save".to_string()))
    }

    fn import_grades(
        &self,
        element_id: &str,
        rows: &[GradePayload],
    ) -> Result<ImportSummary, StoreError> {
        self.ensure_element(element_id)?;
        let components = self.components(element_id)?;

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut skipped_locked = 0usize;

        for payload in rows {
            self.ensure_student(element_id, &payload.student_id)?;
            if self.record_is_locked(element_id, &payload.student_id)? {
                skipped_locked += 1;
                continue;
            }
            let existed: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM grade_records WHERE element_id = ? AND student_id = ?",
                    [element_id, payload.student_id.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            self.apply_payload(payload)?;
            self.recompute_final(element_id, &payload.student_id, &components)?;
            if existed.is_some() {
                updated += 1;
            } else {
                created += 1;
            }
        }

        Ok(ImportSummary {
            students: rows.len(),
            created,
            updated,
            skipped_locked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(prefix: &str) -> (SqliteStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            Uuid::new_v4().simple()
        ));
        let store = SqliteStore::open(&dir).expect("open store");
        (store, dir)
    }

    fn component(key: &str, name: &str, weight: f64) -> EvaluationComponent {
        EvaluationComponent {
            key: key.to_string(),
            name: name.to_string(),
            weight,
        }
    }

    #[test]
    fn failed_schema_save_leaves_previous_schema_intact() {
        let (store, dir) = temp_store("gradesheet-store-rollback");
        let el = store.create_element("Algebra").expect("element");
        store
            .save_schema(
                &el,
                &[
                    component("k1", "Test 1", 40.0),
                    component("k2", "Test 2", 50.0),
                ],
            )
            .expect("save schema");

        // A repeated key violates the primary key partway through the
        // insert loop; the whole replacement must roll back.
        let dup = [component("kX", "A", 40.0), component("kX", "B", 50.0)];
        assert!(store.save_schema(&el, &dup).is_err());

        let schema = store.fetch_schema(&el).expect("fetch schema");
        let keys: Vec<&str> = schema.components.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn schema_save_recomputes_existing_final_grades() {
        let (store, dir) = temp_store("gradesheet-store-recompute");
        let el = store.create_element("Algebra").expect("element");
        let sid = store
            .add_student(&el, "Doe", "Jane", Some("1001"))
            .expect("student");
        store
            .save_schema(&el, &[component("k1", "Test 1", 90.0)])
            .expect("save schema");

        store
            .save_grade(&GradePayload {
                student_id: sid.clone(),
                element_id: el.clone(),
                participation: Some(10.0),
                evaluation: None,
                evaluations: Some(vec![ComponentScore {
                    key: "k1".into(),
                    score: Some(10.0),
                }]),
            })
            .expect("save grade");

        // Shifting the weight onto a second component zeroes k1's share.
        store
            .save_schema(
                &el,
                &[
                    component("k1", "Test 1", 0.0),
                    component("k2", "Test 2", 90.0),
                ],
            )
            .expect("resave schema");

        let grades = store.fetch_grades(&el).expect("fetch grades");
        let record = grades.rows[0].grade.as_ref().expect("record");
        // 0.05 * 10 participation is all that remains.
        assert_eq!(record.final_grade, Some(0.5));

        let _ = std::fs::remove_dir_all(dir);
    }
}
