//! Workflow, criterion and target types.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Validation failures for workflows, criteria and targets.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The operator cannot be applied to the field.
    #[error("operator {op:?} cannot be applied to field {field:?}")]
    IncompatibleOperator { field: MatchField, op: MatchOperator },

    /// The comparison value does not parse for the field's type.
    #[error("value {value:?} is invalid for field {field:?}: {reason}")]
    InvalidValue {
        field: MatchField,
        value: String,
        reason: String,
    },

    /// A label collided with an existing one.
    #[error("label {0:?} is already in use")]
    DuplicateLabel(String),

    /// A workflow referenced an unknown target.
    #[error("unknown target id {0}")]
    UnknownTarget(Uuid),
}

/// Encoder invocation options carried by a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfmpegOptions {
    /// Video codec (`-c:v`); `None` streams-copies.
    #[serde(default)]
    pub video_codec: Option<String>,
    /// Audio codec (`-c:a`); `None` streams-copies.
    #[serde(default)]
    pub audio_codec: Option<String>,
    /// Output container extension (e.g. "mp4", "mkv").
    pub container: String,
    /// Target video bitrate in kbit/s.
    #[serde(default)]
    pub video_bitrate_kbps: Option<u32>,
    /// Raw `-vf`/`-af` style filter arguments, passed through verbatim.
    #[serde(default)]
    pub filter_args: Vec<String>,
}

impl FfmpegOptions {
    /// A plain remux into the given container.
    pub fn remux(container: impl Into<String>) -> Self {
        Self {
            video_codec: None,
            audio_codec: None,
            container: container.into(),
            video_bitrate_kbps: None,
            filter_args: Vec::new(),
        }
    }
}

/// A named encoder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    /// Unique human-readable label.
    pub label: String,
    pub options: FfmpegOptions,
}

impl Target {
    pub fn new(label: impl Into<String>, options: FfmpegOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            options,
        }
    }
}

/// Item attribute a criterion inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Title,
    Season,
    Episode,
    Episodic,
    Genre,
    Runtime,
    Year,
}

impl MatchField {
    /// Whether the field carries a numeric value.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            MatchField::Season | MatchField::Episode | MatchField::Runtime | MatchField::Year
        )
    }
}

/// Comparison applied by a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    Equals,
    NotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Matches,
    Contains,
}

/// A single `(field, operator, value)` predicate.
///
/// Construct through [`Criterion::new`], which rejects malformed
/// combinations so they are never evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: MatchField,
    pub op: MatchOperator,
    pub value: String,
}

impl Criterion {
    /// Build a validated criterion.
    pub fn new(
        field: MatchField,
        op: MatchOperator,
        value: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let criterion = Self {
            field,
            op,
            value: value.into(),
        };
        criterion.validate()?;
        Ok(criterion)
    }

    /// Check field/operator/value compatibility. Called at save time;
    /// evaluation assumes a validated criterion.
    pub fn validate(&self) -> Result<(), ValidationError> {
        use MatchField::*;
        use MatchOperator::*;

        let compatible = match self.op {
            Equals | NotEquals => true,
            LessThan | LessOrEqual | GreaterThan | GreaterOrEqual => self.field.is_numeric(),
            Matches | Contains => matches!(self.field, Title | Genre),
        };
        if !compatible {
            return Err(ValidationError::IncompatibleOperator {
                field: self.field,
                op: self.op,
            });
        }

        if self.field.is_numeric() {
            self.value
                .parse::<i64>()
                .map_err(|e| ValidationError::InvalidValue {
                    field: self.field,
                    value: self.value.clone(),
                    reason: e.to_string(),
                })?;
        }
        if self.field == Episodic {
            self.value
                .parse::<bool>()
                .map_err(|e| ValidationError::InvalidValue {
                    field: self.field,
                    value: self.value.clone(),
                    reason: e.to_string(),
                })?;
        }
        if self.op == Matches {
            regex_lite::Regex::new(&self.value).map_err(|e| ValidationError::InvalidValue {
                field: self.field,
                value: self.value.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Criteria plus the targets to encode with when they all hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    /// Unique human-readable label.
    pub label: String,
    pub enabled: bool,
    /// All criteria must evaluate true for the workflow to match.
    pub criteria: Vec<Criterion>,
    pub target_ids: Vec<Uuid>,
}

impl Workflow {
    pub fn new(label: impl Into<String>, criteria: Vec<Criterion>, target_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            enabled: true,
            criteria,
            target_ids,
        }
    }

    /// Re-validate every criterion (used when loading persisted workflows).
    pub fn validate(&self) -> Result<(), ValidationError> {
        for criterion in &self.criteria {
            criterion.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_value_required_for_numeric_fields() {
        assert!(Criterion::new(MatchField::Season, MatchOperator::Equals, "2").is_ok());
        assert!(matches!(
            Criterion::new(MatchField::Season, MatchOperator::Equals, "two"),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_ordering_rejected_on_non_numeric_fields() {
        assert!(matches!(
            Criterion::new(MatchField::Title, MatchOperator::LessThan, "abc"),
            Err(ValidationError::IncompatibleOperator { .. })
        ));
        assert!(matches!(
            Criterion::new(MatchField::Episodic, MatchOperator::GreaterThan, "true"),
            Err(ValidationError::IncompatibleOperator { .. })
        ));
    }

    #[test]
    fn test_matches_requires_valid_regex() {
        assert!(Criterion::new(MatchField::Title, MatchOperator::Matches, "^Breaking.*").is_ok());
        assert!(matches!(
            Criterion::new(MatchField::Title, MatchOperator::Matches, "("),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_episodic_requires_bool() {
        assert!(Criterion::new(MatchField::Episodic, MatchOperator::Equals, "true").is_ok());
        assert!(matches!(
            Criterion::new(MatchField::Episodic, MatchOperator::Equals, "yes"),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_contains_allowed_on_genre() {
        assert!(Criterion::new(MatchField::Genre, MatchOperator::Contains, "Sci").is_ok());
    }
}
