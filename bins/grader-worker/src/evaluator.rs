/// Test Evaluator - Judge-Agnostic Scoring Logic
///
/// **Core Responsibility:**
/// Compare judge outputs against expected outputs and score a test-runner
/// criterion.
///
/// **Critical Properties:**
/// - Knows nothing about the judge transport
/// - Knows nothing about Redis
/// - Pure function: (test cases, run results, comparison options) → report
///
/// **Scoring Rules:**
/// - a test case passes when the judge accepted it and its stdout matches
/// - score = round(passed / total × 100)
/// - feedback lists passed test cases first, each group in test-case order
use crate::aggregator::RunnerReport;
use crate::judge::RunResult;
use crate::plugin_config::{OutputComparison, TestCase};
use grader_common::{FeedbackItem, Location, Marker};

/// Compare expected and actual output under `options`
///
/// Transforms apply in fixed order: whitespace collapse (which also trims),
/// line-ending normalisation, trim, lowercase.
pub fn compare_output(expected: &str, actual: &str, options: &OutputComparison) -> bool {
    normalize(expected, options) == normalize(actual, options)
}

fn normalize(text: &str, options: &OutputComparison) -> String {
    let mut text = text.to_string();
    if options.ignore_whitespace {
        text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    if options.ignore_line_endings {
        text = text.replace("\r\n", "\n").replace('\r', "\n");
    }
    if options.trim {
        text = text.trim().to_string();
    }
    if options.ignore_case {
        text = text.to_lowercase();
    }
    text
}

/// Evaluate RUN results, one per test case in order
pub fn evaluate(
    test_cases: &[TestCase],
    results: &[RunResult],
    options: &OutputComparison,
) -> RunnerReport {
    let mut feedback = Vec::with_capacity(test_cases.len());
    let mut passed = 0usize;

    for (idx, test_case) in test_cases.iter().enumerate() {
        let result = results.get(idx);
        let ok = result
            .map(|r| r.is_accepted() && compare_output(&test_case.output, r.stdout(), options))
            .unwrap_or(false);
        if ok {
            passed += 1;
        }

        tracing::debug!(
            test_case = idx + 1,
            status = result.map(|r| r.status.as_str()).unwrap_or("missing"),
            passed = ok,
            "Evaluated test case"
        );

        feedback.push(FeedbackItem {
            file_ref: None,
            location: Location::TestCase { index: idx + 1 },
            marker: if ok { Marker::Passed } else { Marker::Failed },
            message: Some(describe(test_case, result)),
        });
    }

    // stable: each group keeps test-case order
    feedback.sort_by_key(|item| item.marker != Marker::Passed);

    let total = test_cases.len();
    let score = if total == 0 {
        0.0
    } else {
        (passed as f64 / total as f64 * 100.0).round()
    };

    RunnerReport {
        score,
        feedback,
        scanned_files: Vec::new(),
        summary: Some(format!("{}/{} test cases passed", passed, total)),
    }
}

fn describe(test_case: &TestCase, result: Option<&RunResult>) -> String {
    let mut message = String::new();
    if let Some(description) = &test_case.description {
        message.push_str(description);
        message.push_str("\n\n");
    }
    message.push_str(&format!(
        "Input:\n{}\n\nExpected output:\n{}",
        test_case.input, test_case.output
    ));

    match result {
        Some(result) => {
            message.push_str(&format!("\n\nActual output:\n{}", result.stdout()));
            if !result.stderr().is_empty() {
                message.push_str(&format!("\n\nStderr:\n{}", result.stderr()));
            }
            if !result.is_accepted() {
                message.push_str(&format!(
                    "\n\nStatus: {} (exit status {})",
                    result.status, result.exit_status
                ));
                if let Some(error) = &result.error {
                    message.push_str(&format!(": {}", error));
                }
            }
        }
        None => message.push_str("\n\nNo result was reported for this test case"),
    }
    message
}
