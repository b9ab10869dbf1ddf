use crate::buffer::EditBuffer;
use crate::model::{CourseElement, EvaluationComponent, ScoringMode};
use crate::schema::LockState;
use crate::store::{GradeStore, StoreError, StudentGrade};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// How long a row keeps its cosmetic "recently saved" marker.
const SAVED_MARKER_WINDOW_SECS: i64 = 3;

/// The engine's in-memory view of one course element: the last fetched
/// schema and record set, the unsaved-edit overlay, and transient UI
/// markers. One sheet per open element, owned by the request loop.
pub struct GradeSheet {
    pub element: CourseElement,
    pub components: Vec<EvaluationComponent>,
    pub lock: LockState,
    pub mode: ScoringMode,
    pub rows: Vec<StudentGrade>,
    pub buffer: EditBuffer,
    saved_markers: HashMap<String, DateTime<Utc>>,
}

impl GradeSheet {
    pub fn open(store: &dyn GradeStore, element_id: &str) -> Result<Self, StoreError> {
        let schema = store.fetch_schema(element_id)?;
        let grades = store.fetch_grades(element_id)?;
        Ok(GradeSheet {
            element: grades.element,
            mode: ScoringMode::from_components(&schema.components),
            components: schema.components,
            lock: LockState::from_has_grades(schema.locked),
            rows: grades.rows,
            buffer: EditBuffer::default(),
            saved_markers: HashMap::new(),
        })
    }

    /// Full refetch. Replaces schema and rows and drops the entire buffer,
    /// so the sheet equals a fresh open.
    pub fn reload(&mut self, store: &dyn GradeStore) -> Result<(), StoreError> {
        let fresh = GradeSheet::open(store, &self.element.id.clone())?;
        self.element = fresh.element;
        self.components = fresh.components;
        self.lock = fresh.lock;
        self.mode = fresh.mode;
        self.rows = fresh.rows;
        self.buffer.clear_all();
        Ok(())
    }

    pub fn row(&self, student_id: &str) -> Option<&StudentGrade> {
        self.rows.iter().find(|r| r.student.id == student_id)
    }

    pub fn row_mut(&mut self, student_id: &str) -> Option<&mut StudentGrade> {
        self.rows.iter_mut().find(|r| r.student.id == student_id)
    }

    /// A row is editable unless its record has been administratively
    /// locked; students without a record yet are always editable.
    pub fn row_is_editable(&self, student_id: &str) -> bool {
        match self.row(student_id) {
            Some(r) => r.grade.as_ref().map(|g| g.is_editable).unwrap_or(true),
            None => false,
        }
    }

    pub fn mark_saved(&mut self, student_id: &str) {
        self.saved_markers
            .insert(student_id.to_string(), Utc::now());
    }

    /// Students still inside the 3-second "recently saved" window. Expired
    /// markers are pruned on read; purely cosmetic state.
    pub fn recently_saved(&mut self) -> Vec<String> {
        let cutoff = Utc::now() - Duration::seconds(SAVED_MARKER_WINDOW_SECS);
        self.saved_markers.retain(|_, t| *t > cutoff);
        let mut ids: Vec<String> = self.saved_markers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
