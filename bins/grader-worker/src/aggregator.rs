/// Result Aggregator
///
/// Turns a runner's report into the caller-facing grade of one criterion and
/// collects per-criterion results into the submission outcome.
///
/// ## Semantics
/// - every file path becomes `submissionRef/relativePath`
/// - ignored files = criterion input files the runner did not report
/// - scores are clamped into [0, 100]
use crate::error::CriterionError;
use grader_common::{CriterionFailure, CriterionGrade, CriterionOutcome, FeedbackItem};
use std::collections::HashSet;

/// What a runner hands back for one criterion
///
/// Feedback file references and `scanned_files` are relative to the
/// criterion's working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerReport {
    pub score: f64,
    pub feedback: Vec<FeedbackItem>,
    pub scanned_files: Vec<String>,
    pub summary: Option<String>,
}

pub fn to_file_ref(submission_ref: &str, relative_path: &str) -> String {
    let relative_path = relative_path.trim_start_matches('/');
    if submission_ref.is_empty() {
        relative_path.to_string()
    } else {
        format!("{}/{}", submission_ref, relative_path)
    }
}

/// Input files missing from `scanned`, in input order
pub fn ignored_files(file_list: &[String], scanned: &[String]) -> Vec<String> {
    let scanned: HashSet<&str> = scanned.iter().map(String::as_str).collect();
    file_list
        .iter()
        .filter(|path| !scanned.contains(path.as_str()))
        .cloned()
        .collect()
}

pub fn finalize(
    criterion: &str,
    file_list: &[String],
    report: RunnerReport,
    submission_ref: &str,
) -> CriterionGrade {
    let ignored = ignored_files(file_list, &report.scanned_files)
        .iter()
        .map(|path| to_file_ref(submission_ref, path))
        .collect();

    let feedback = report
        .feedback
        .into_iter()
        .map(|mut item| {
            item.file_ref = item
                .file_ref
                .map(|path| to_file_ref(submission_ref, &path));
            item
        })
        .collect();

    CriterionGrade {
        criterion: criterion.to_string(),
        score: report.score.clamp(0.0, 100.0),
        feedback,
        ignored_files: ignored,
        summary: report.summary,
    }
}

/// Collapse one criterion's result into its outcome entry
pub fn into_outcome(result: Result<CriterionGrade, CriterionError>) -> CriterionOutcome {
    match result {
        Ok(grade) => CriterionOutcome::Graded(grade),
        Err(err) => CriterionOutcome::Failed(CriterionFailure {
            criterion: err.criterion.clone(),
            error: err.source.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GradingError;
    use grader_common::{Location, Marker};

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ignored_files_complement() {
        let files = paths(&["main.py", "lib/util.py", "README.md"]);
        assert_eq!(
            ignored_files(&files, &paths(&["lib/util.py", "main.py"])),
            vec!["README.md"]
        );
        assert!(ignored_files(&files, &files).is_empty());
    }

    #[test]
    fn test_finalize_rewrites_paths() {
        let report = RunnerReport {
            score: 120.0,
            feedback: vec![FeedbackItem {
                file_ref: Some("lib/util.py".to_string()),
                location: Location::Text {
                    from_line: 1,
                    from_col: 1,
                    to_line: 1,
                    to_col: 2,
                },
                marker: Marker::Severity {
                    severity: "WARNING".to_string(),
                },
                message: None,
            }],
            scanned_files: paths(&["lib/util.py"]),
            summary: None,
        };

        let grade = finalize("style", &paths(&["lib/util.py", "notes.txt"]), report, "sub-1");
        assert_eq!(grade.criterion, "style");
        assert_eq!(grade.score, 100.0);
        assert_eq!(grade.feedback[0].file_ref.as_deref(), Some("sub-1/lib/util.py"));
        assert_eq!(grade.ignored_files, vec!["sub-1/notes.txt"]);
    }

    #[test]
    fn test_into_outcome_failure() {
        let outcome = into_outcome(Err(CriterionError::new("tests", GradingError::EmptyInput)));
        match outcome {
            CriterionOutcome::Failed(failure) => {
                assert_eq!(failure.criterion, "tests");
                assert_eq!(failure.error, "No files to run");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
