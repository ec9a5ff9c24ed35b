/// Programming-Question Grader - Points and Feedback
///
/// **Core Responsibility:**
/// Turn a student's answer to a programming question into `points_earned` and
/// `feedback`, using the sandbox to run the code against the instructor's tests.
///
/// **Short Circuits (sandbox never invoked):**
/// - Empty or whitespace-only answer → 0 points, "not answered"
/// - Question without test code → 0 points, manual grading note
/// - Non-programming question → 0 points
///
/// **Scoring Rules:**
/// - Only `success` results earn points; error and timeout results score 0
///   whatever score they carry
/// - points = max_points × clamp(score / max_score, 0, 1), rounded to 2 decimals
/// - Degenerate max_score (0, negative, NaN) → 0 points
/// - Non-finite or negative max_points is treated as 0
///
/// **Feedback Rules:**
/// - Starts with the result message; error messages get a friendly hint prepended
/// - Program output, when present, is appended under "Program output:" and cut at
///   `feedback_output_limit` characters with a truncation marker
///
/// Students only ever see `GradedAnswer`; the full `ExecutionResult` is kept in
/// the `GradingReport` for instructors.

use crate::executor::Sandbox;
use crate::friendly;
use crate::libraries::infer_required_libraries;
use rgrader_common::config::GraderConfig;
use rgrader_common::types::{
    ExecutionResult, ExecutionStatus, GradedAnswer, GradingReport, Question, QuestionType,
};
use tracing::{debug, info};

pub const NOT_ANSWERED: &str = "not answered";
pub const MISSING_TEST_CODE: &str =
    "no test code configured for this question; it needs to be graded manually";
pub const OUTPUT_HEADER: &str = "\n\nProgram output:\n";
pub const OUTPUT_TRUNCATION_MARKER: &str = "\n...(output truncated)";

/// Points for a result against a question's maximum
pub fn points_for(result: &ExecutionResult, max_points: f64) -> f64 {
    if result.status != ExecutionStatus::Success {
        return 0.0;
    }
    let max_points = if max_points.is_finite() && max_points > 0.0 {
        max_points
    } else {
        0.0
    };
    let points = round2(max_points * result.ratio());
    points.clamp(0.0, max_points)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Student-facing feedback for a result
pub fn compose_feedback(result: &ExecutionResult, output_limit: usize) -> String {
    let mut feedback = match result.status {
        ExecutionStatus::Error => friendly::translate(&result.message),
        _ => result.message.clone(),
    };

    if !result.output.trim().is_empty() {
        feedback.push_str(OUTPUT_HEADER);
        feedback.push_str(&truncate_chars(&result.output, output_limit));
    }
    feedback
}

/// Cut `text` to at most `limit` characters, marking the cut
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => format!("{}{}", &text[..byte_index], OUTPUT_TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

pub struct Grader {
    sandbox: Sandbox,
    feedback_output_limit: usize,
}

impl Grader {
    pub fn new(sandbox: Sandbox, config: &GraderConfig) -> Self {
        Self {
            sandbox,
            feedback_output_limit: config.feedback_output_limit,
        }
    }

    pub fn from_config(config: &GraderConfig) -> Self {
        Self::new(Sandbox::from_config(config), config)
    }

    /// Points and feedback for one answer
    pub async fn grade(&self, answer_text: &str, question: &Question) -> GradedAnswer {
        self.grade_with_report(answer_text, question).await.answer
    }

    pub async fn grade_with_report(&self, answer_text: &str, question: &Question) -> GradingReport {
        if question.question_type != QuestionType::Programming {
            return short_circuit(format!(
                "{} questions are not graded by the programming grader",
                question.question_type
            ));
        }

        if answer_text.trim().is_empty() {
            debug!(question_id = ?question.id, "Empty answer");
            return short_circuit(NOT_ANSWERED.to_string());
        }

        let Some(test_code) = question.test_code() else {
            info!(question_id = ?question.id, "Question has no test code");
            return short_circuit(MISSING_TEST_CODE.to_string());
        };

        let mut libraries = infer_required_libraries(answer_text, &[]);
        libraries.extend(infer_required_libraries(test_code, &[]));
        libraries.extend(question.required_libraries.iter().cloned());

        let result = self.sandbox.execute(answer_text, test_code, &libraries).await;

        let answer = GradedAnswer::new(
            points_for(&result, question.max_points),
            compose_feedback(&result, self.feedback_output_limit),
        );

        info!(
            question_id = ?question.id,
            status = %result.status,
            score = result.score,
            max_score = result.max_score,
            points_earned = answer.points_earned,
            "Answer graded"
        );

        GradingReport {
            answer,
            result: Some(result),
        }
    }
}

fn short_circuit(feedback: String) -> GradingReport {
    GradingReport {
        answer: GradedAnswer::new(0.0, feedback),
        result: None,
    }
}
