//! Plan-gated actions and their usage counters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::UsageLimit;
use crate::UserId;

/// An action whose volume is capped by the user's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    /// Creating a course.
    CreateCourse,
    /// Uploading a video.
    UploadVideo,
    /// Generating a quiz.
    GenerateQuiz,
    /// Asking the AI assistant a question.
    AskAiQuestion,
}

impl UsageAction {
    /// All actions.
    pub const ALL: [Self; 4] = [
        Self::CreateCourse,
        Self::UploadVideo,
        Self::GenerateQuiz,
        Self::AskAiQuestion,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateCourse => "create_course",
            Self::UploadVideo => "upload_video",
            Self::GenerateQuiz => "generate_quiz",
            Self::AskAiQuestion => "ask_ai_question",
        }
    }

    /// Name of the counter column tracking this action.
    #[must_use]
    pub const fn counter_name(&self) -> &'static str {
        match self {
            Self::CreateCourse => "courses_created",
            Self::UploadVideo => "videos_uploaded",
            Self::GenerateQuiz => "quizzes_generated",
            Self::AskAiQuestion => "ai_questions_asked",
        }
    }

    /// Plural noun used in denial messages.
    #[must_use]
    pub const fn noun(&self) -> &'static str {
        match self {
            Self::CreateCourse => "courses",
            Self::UploadVideo => "video uploads",
            Self::GenerateQuiz => "quiz generations",
            Self::AskAiQuestion => "AI questions",
        }
    }
}

impl fmt::Display for UsageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The window a counter covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    /// Create a window.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Per-user, per-window action counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    /// The owning user.
    pub user_id: UserId,
    /// Start of the window.
    pub period_start: DateTime<Utc>,
    /// End of the window.
    pub period_end: DateTime<Utc>,
    /// Courses created.
    pub courses_created: i64,
    /// Videos uploaded.
    pub videos_uploaded: i64,
    /// Quizzes generated.
    pub quizzes_generated: i64,
    /// AI questions asked.
    pub ai_questions_asked: i64,
}

impl UsageCounter {
    /// A zeroed counter for a window.
    #[must_use]
    pub const fn new(user_id: UserId, window: UsageWindow) -> Self {
        Self {
            user_id,
            period_start: window.start,
            period_end: window.end,
            courses_created: 0,
            videos_uploaded: 0,
            quizzes_generated: 0,
            ai_questions_asked: 0,
        }
    }

    /// The window this counter covers.
    #[must_use]
    pub const fn window(&self) -> UsageWindow {
        UsageWindow::new(self.period_start, self.period_end)
    }

    /// Current count for an action.
    #[must_use]
    pub const fn get(&self, action: UsageAction) -> i64 {
        match action {
            UsageAction::CreateCourse => self.courses_created,
            UsageAction::UploadVideo => self.videos_uploaded,
            UsageAction::GenerateQuiz => self.quizzes_generated,
            UsageAction::AskAiQuestion => self.ai_questions_asked,
        }
    }

    /// Bump the count for an action by one.
    pub fn increment(&mut self, action: UsageAction) {
        let slot = match action {
            UsageAction::CreateCourse => &mut self.courses_created,
            UsageAction::UploadVideo => &mut self.videos_uploaded,
            UsageAction::GenerateQuiz => &mut self.quizzes_generated,
            UsageAction::AskAiQuestion => &mut self.ai_questions_asked,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Result of a usage check. Denials are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum UsageDecision {
    /// The action may proceed.
    Allowed {
        /// Count so far in the binding window.
        used: i64,
        /// The binding limit.
        limit: UsageLimit,
    },
    /// The action must not proceed.
    Denied {
        /// Human-readable explanation.
        reason: String,
        /// Count so far in the binding window.
        used: i64,
        /// The binding limit.
        limit: UsageLimit,
    },
}

impl UsageDecision {
    /// Whether the action may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The denial reason, if denied.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { reason, .. } => Some(reason),
        }
    }
}

/// Which window a limit applies to, for denial wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The billing period.
    Period,
    /// The current UTC day.
    Day,
}

impl LimitScope {
    const fn phrase(self) -> &'static str {
        match self {
            Self::Period => "this month",
            Self::Day => "today",
        }
    }
}

/// Compare a count against a limit.
#[must_use]
pub fn decide(
    action: UsageAction,
    used: i64,
    limit: UsageLimit,
    scope: LimitScope,
    plan_name: &str,
) -> UsageDecision {
    match limit {
        UsageLimit::Unlimited => UsageDecision::Allowed { used, limit },
        UsageLimit::Unavailable => UsageDecision::Denied {
            reason: format!("{} are not available on the {plan_name} plan", action.noun()),
            used,
            limit,
        },
        UsageLimit::Capped(max) if used >= max => UsageDecision::Denied {
            reason: format!(
                "you have used {used} of {max} {} {}",
                action.noun(),
                scope.phrase()
            ),
            used,
            limit,
        },
        UsageLimit::Capped(_) => UsageDecision::Allowed { used, limit },
    }
}
