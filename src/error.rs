use thiserror::Error;

/// Which cron field a parse diagnostic points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Seconds,
    Minutes,
    Hours,
    DayOfMonth,
    Month,
    DayOfWeek,
    Year,
}

impl CronField {
    pub fn name(&self) -> &'static str {
        match self {
            CronField::Seconds => "seconds",
            CronField::Minutes => "minutes",
            CronField::Hours => "hours",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day-of-week",
            CronField::Year => "year",
        }
    }
}

impl std::fmt::Display for CronField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CronParseError {
    #[error("expected 6 or 7 fields, got {0}")]
    FieldCount(usize),
    #[error("{field} field '{token}': {reason}")]
    Field {
        field: CronField,
        token: String,
        reason: String,
    },
    #[error("day-of-month and day-of-week cannot both be concrete; one must be '?'")]
    ConflictingDayFields,
    #[error("'?' is only valid in day-of-month or day-of-week")]
    MisplacedQuestionMark,
}

impl CronParseError {
    pub(crate) fn field(field: CronField, token: impl Into<String>, reason: impl Into<String>) -> Self {
        CronParseError::Field {
            field,
            token: token.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Error)]
pub enum SubmitError {
    #[error("timer has been shut down; submissions are rejected")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum AddError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronParseError),
    #[error("cron expression yields no future fire time")]
    ExpressionExhausted,
    #[error("scheduler has been shut down")]
    Shutdown,
}

impl From<SubmitError> for AddError {
    fn from(_: SubmitError) -> Self {
        AddError::Shutdown
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read job file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse job file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}
