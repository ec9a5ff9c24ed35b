use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Scale every execution result is expressed on before rescaling to question points
pub const INTERNAL_MAX_SCORE: f64 = 100.0;

/// User-facing message for infrastructure failures; details stay in logs and debug_info
pub const SYSTEM_ERROR_MESSAGE: &str = "grading system error, contact instructor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    /// Parse a status string from the wire; anything unknown counts as an error
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => ExecutionStatus::Success,
            "timeout" => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sandboxed execution.
///
/// Produced exactly once per `execute()` call. Constructors keep `score` within
/// `[0, max_score]`; the codec does the same for decoded documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub score: f64,
    pub max_score: f64,
    pub message: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub debug_info: String,
}

impl ExecutionResult {
    pub fn success(score: f64, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            score: clamp_score(score, INTERNAL_MAX_SCORE),
            max_score: INTERNAL_MAX_SCORE,
            message: message.into(),
            output: String::new(),
            debug_info: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            score: 0.0,
            max_score: INTERNAL_MAX_SCORE,
            message: message.into(),
            output: String::new(),
            debug_info: String::new(),
        }
    }

    /// Infrastructure failure: generic message for students, detail kept for instructors
    pub fn system_error(detail: impl Into<String>) -> Self {
        Self::error(SYSTEM_ERROR_MESSAGE).with_debug_info(detail)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            score: 0.0,
            max_score: INTERNAL_MAX_SCORE,
            message: format!(
                "execution exceeded the time limit of {} seconds",
                limit.as_secs_f64()
            ),
            output: String::new(),
            debug_info: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_debug_info(mut self, debug_info: impl Into<String>) -> Self {
        self.debug_info = debug_info.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Earned fraction in `[0, 1]`; zero for degenerate maxima
    pub fn ratio(&self) -> f64 {
        if !self.max_score.is_finite() || self.max_score <= 0.0 || !self.score.is_finite() {
            return 0.0;
        }
        (self.score / self.max_score).clamp(0.0, 1.0)
    }
}

/// Clamp a score into `[0, max]`, mapping NaN to zero
pub fn clamp_score(score: f64, max: f64) -> f64 {
    let max = if max.is_finite() && max > 0.0 { max } else { 0.0 };
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Choice,
    FillBlank,
    Programming,
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionType::Choice => write!(f, "choice"),
            QuestionType::FillBlank => write!(f, "fill_blank"),
            QuestionType::Programming => write!(f, "programming"),
        }
    }
}

/// The parts of a question the grader reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub id: Option<u64>,
    pub question_type: QuestionType,
    #[serde(default)]
    pub test_code: Option<String>,
    pub max_points: f64,
    /// Libraries the instructor declared on top of the inferred ones
    #[serde(default)]
    pub required_libraries: BTreeSet<String>,
}

impl Question {
    pub fn programming(test_code: impl Into<String>, max_points: f64) -> Self {
        Self {
            id: None,
            question_type: QuestionType::Programming,
            test_code: Some(test_code.into()),
            max_points,
            required_libraries: BTreeSet::new(),
        }
    }

    /// Test code with surrounding whitespace removed, if any is left
    pub fn test_code(&self) -> Option<&str> {
        self.test_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

/// One student's code for one question, scoped to a single grading attempt
#[derive(Debug, Clone)]
pub struct Submission {
    pub student_code: String,
    pub test_code: String,
    pub required_libraries: BTreeSet<String>,
    pub time_limit: Duration,
    /// Advisory only; not enforced
    pub memory_limit_mb: u32,
}

/// The two fields the grader is allowed to write on a caller's answer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub points_earned: f64,
    pub feedback: String,
}

impl GradedAnswer {
    pub fn new(points_earned: f64, feedback: impl Into<String>) -> Self {
        Self {
            points_earned,
            feedback: feedback.into(),
        }
    }
}

/// Instructor view of a grading: the student-visible answer plus the raw result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingReport {
    pub answer: GradedAnswer,
    /// `None` when grading short-circuited without running anything
    pub result: Option<ExecutionResult>,
}

/// Worker input record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub answer_text: String,
    pub question: Question,
}

/// Worker output record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub job_id: Uuid,
    pub question_id: Option<u64>,
    pub points_earned: f64,
    pub feedback: String,
    pub status: Option<ExecutionStatus>,
    pub score: Option<f64>,
    pub max_score: Option<f64>,
    pub output: Option<String>,
    pub debug_info: Option<String>,
    pub graded_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl GradingOutcome {
    pub fn from_report(job: &GradingJob, report: GradingReport, duration: Duration) -> Self {
        let result = report.result;
        Self {
            job_id: job.id,
            question_id: job.question.id,
            points_earned: report.answer.points_earned,
            feedback: report.answer.feedback,
            status: result.as_ref().map(|r| r.status),
            score: result.as_ref().map(|r| r.score),
            max_score: result.as_ref().map(|r| r.max_score),
            output: result.as_ref().map(|r| r.output.clone()),
            debug_info: result.map(|r| r.debug_info),
            graded_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_wire() {
        assert_eq!(ExecutionStatus::from_wire("success"), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from_wire(" SUCCESS "), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from_wire("timeout"), ExecutionStatus::Timeout);
        assert_eq!(ExecutionStatus::from_wire("error"), ExecutionStatus::Error);
        assert_eq!(ExecutionStatus::from_wire("passed"), ExecutionStatus::Error);
        assert_eq!(ExecutionStatus::from_wire(""), ExecutionStatus::Error);
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(50.0, 100.0), 50.0);
        assert_eq!(clamp_score(-3.0, 100.0), 0.0);
        assert_eq!(clamp_score(250.0, 100.0), 100.0);
        assert_eq!(clamp_score(f64::NAN, 100.0), 0.0);
        assert_eq!(clamp_score(f64::INFINITY, 100.0), 100.0);
        assert_eq!(clamp_score(10.0, f64::NAN), 0.0);
        assert_eq!(clamp_score(10.0, -5.0), 0.0);
    }

    #[test]
    fn test_clamp_score_random_inputs() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for _ in 0..1000 {
            let score = rng.gen_range(-1.0e6..1.0e6);
            let max = rng.gen_range(-10.0..1000.0);
            let clamped = clamp_score(score, max);

            assert!(clamped >= 0.0);
            assert!(clamped <= max.max(0.0));
        }
    }

    #[test]
    fn test_ratio_degenerate_max() {
        let mut result = ExecutionResult::success(100.0, "ok");
        assert_eq!(result.ratio(), 1.0);

        result.max_score = 0.0;
        assert_eq!(result.ratio(), 0.0);

        result.max_score = f64::NAN;
        assert_eq!(result.ratio(), 0.0);
    }

    #[test]
    fn test_system_error_hides_detail() {
        let result = ExecutionResult::system_error("spawn Rscript: No such file or directory");
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.message, SYSTEM_ERROR_MESSAGE);
        assert!(result.debug_info.contains("No such file"));
    }

    #[test]
    fn test_question_test_code_blank() {
        let mut question = Question::programming("   \n", 10.0);
        assert!(question.test_code().is_none());

        question.test_code = None;
        assert!(question.test_code().is_none());

        question.test_code = Some("  test_result <- list()  ".to_string());
        assert_eq!(question.test_code(), Some("test_result <- list()"));
    }

    #[test]
    fn test_job_deserialize_defaults() {
        let job: GradingJob = serde_json::from_str(
            r#"{"question": {"question_type": "programming", "max_points": 20}}"#,
        )
        .unwrap();

        assert!(job.answer_text.is_empty());
        assert!(job.question.test_code.is_none());
        assert!(job.question.required_libraries.is_empty());
        assert_eq!(job.question.question_type, QuestionType::Programming);
    }
}
