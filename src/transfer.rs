use crate::buffer::parse_grade;
use crate::model::{ComponentScore, EvaluationComponent, GradePayload};
use crate::store::StudentGrade;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};

const COL_STUDENT_NO: &str = "student_no";
const COL_LAST_NAME: &str = "last_name";
const COL_FIRST_NAME: &str = "first_name";
const COL_PARTICIPATION: &str = "participation";

/// Grade columns are headed "Name [key]" so the sheet stays readable while
/// the import maps cells back to immutable component keys.
fn component_header(c: &EvaluationComponent) -> String {
    format!("{} [{}]", c.name, c.key)
}

fn header_key(header: &str) -> Option<&str> {
    let start = header.rfind('[')?;
    let end = header.rfind(']')?;
    if end <= start + 1 {
        return None;
    }
    Some(&header[start + 1..end])
}

/// CSV template for offline grade entry: roster columns filled in, grade
/// cells left blank. Callers must refuse before this point when the element
/// has no schema components.
pub fn write_template<W: Write>(
    out: W,
    components: &[EvaluationComponent],
    rows: &[StudentGrade],
) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(out);

    let mut header = vec![
        COL_STUDENT_NO.to_string(),
        COL_LAST_NAME.to_string(),
        COL_FIRST_NAME.to_string(),
        COL_PARTICIPATION.to_string(),
    ];
    header.extend(components.iter().map(component_header));
    wtr.write_record(&header)?;

    for row in rows {
        let mut line = vec![
            row.student.student_no.clone().unwrap_or_default(),
            row.student.last_name.clone(),
            row.student.first_name.clone(),
            String::new(),
        ];
        line.extend(std::iter::repeat(String::new()).take(components.len()));
        wtr.write_record(&line)?;
    }

    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProblem {
    /// 1-based data line, header excluded.
    pub line: usize,
    pub message: String,
}

#[derive(Debug)]
pub struct ImportParse {
    pub payloads: Vec<GradePayload>,
    pub problems: Vec<ImportProblem>,
}

impl ImportParse {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Parses an import file against the current schema and roster. Never
/// writes; the caller decides what to do with problems. Import semantics are
/// overwrite: a blank cell clears the score.
pub fn parse_import<R: Read>(
    input: R,
    element_id: &str,
    components: &[EvaluationComponent],
    student_no_index: &[(String, String)],
) -> anyhow::Result<ImportParse> {
    let index: HashMap<&str, &str> = student_no_index
        .iter()
        .map(|(no, id)| (no.as_str(), id.as_str()))
        .collect();

    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(input);
    let headers = rdr.headers()?.clone();

    let mut no_col = None;
    let mut participation_col = None;
    let mut component_cols: Vec<(usize, String)> = Vec::new();
    for (i, h) in headers.iter().enumerate() {
        let h = h.trim();
        if h.eq_ignore_ascii_case(COL_STUDENT_NO) {
            no_col = Some(i);
        } else if h.eq_ignore_ascii_case(COL_PARTICIPATION) {
            participation_col = Some(i);
        } else if let Some(key) = header_key(h) {
            if components.iter().any(|c| c.key == key) {
                component_cols.push((i, key.to_string()));
            }
        }
    }
    let Some(no_col) = no_col else {
        anyhow::bail!("import file has no {} column", COL_STUDENT_NO);
    };

    let mut payloads = Vec::new();
    let mut problems = Vec::new();

    for (line_idx, result) in rdr.records().enumerate() {
        let line = line_idx + 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                problems.push(ImportProblem {
                    line,
                    message: format!("unreadable line: {}", e),
                });
                continue;
            }
        };

        let student_no = record.get(no_col).unwrap_or("").trim();
        if student_no.is_empty() {
            problems.push(ImportProblem {
                line,
                message: "missing student number".to_string(),
            });
            continue;
        }
        let Some(student_id) = index.get(student_no) else {
            problems.push(ImportProblem {
                line,
                message: format!("unknown student number {}", student_no),
            });
            continue;
        };

        let mut line_ok = true;
        let participation = match participation_col
            .and_then(|i| record.get(i))
            .map(parse_grade)
        {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                problems.push(ImportProblem {
                    line,
                    message: format!("participation '{}': {}", e.raw, e.reason),
                });
                line_ok = false;
                None
            }
            None => None,
        };

        let mut scores: HashMap<String, Option<f64>> = HashMap::new();
        for (col, key) in &component_cols {
            match parse_grade(record.get(*col).unwrap_or("")) {
                Ok(v) => {
                    scores.insert(key.clone(), v);
                }
                Err(e) => {
                    problems.push(ImportProblem {
                        line,
                        message: format!("{} '{}': {}", key, e.raw, e.reason),
                    });
                    line_ok = false;
                }
            }
        }
        if !line_ok {
            continue;
        }

        // Overwrite semantics: the payload covers the full component list,
        // absent columns and blank cells clear to null.
        let evaluations: Vec<ComponentScore> = components
            .iter()
            .map(|c| ComponentScore {
                key: c.key.clone(),
                score: scores.get(&c.key).copied().flatten(),
            })
            .collect();

        payloads.push(GradePayload {
            student_id: (*student_id).to_string(),
            element_id: element_id.to_string(),
            participation,
            evaluation: None,
            evaluations: Some(evaluations),
        });
    }

    Ok(ImportParse { payloads, problems })
}
