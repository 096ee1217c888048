use regex::Regex;
use serde::{Deserialize, Serialize};

/// A canonical question from the question catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

/// A rule an answer must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Answer contains something other than whitespace.
    NonEmpty,
    /// Trimmed answer has at least `min` characters.
    MinLength { min: usize },
    /// Trimmed answer has at most `max` characters.
    MaxLength { max: usize },
    /// Trimmed answer matches a regular expression.
    Pattern { regex: String },
    /// Trimmed answer equals one of the options (case-insensitive).
    OneOf { options: Vec<String> },
    /// Trimmed answer parses as a number.
    Numeric,
    /// Answer is a recognisable yes or no.
    YesNo,
}

impl ValidationRule {
    /// Check the rule's own configuration (e.g. the regex compiles).
    pub fn check_definition(&self) -> Result<(), String> {
        match self {
            Self::Pattern { regex } => Regex::new(regex)
                .map(|_| ())
                .map_err(|e| format!("invalid pattern '{}': {}", regex, e)),
            Self::OneOf { options } if options.is_empty() => {
                Err("one_of rule has no options".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Validate an answer, returning a human-readable reason on failure.
    pub fn validate(&self, answer: &str) -> Result<(), String> {
        let trimmed = answer.trim();
        match self {
            Self::NonEmpty => {
                if trimmed.is_empty() {
                    return Err("answer must not be empty".to_string());
                }
            }
            Self::MinLength { min } => {
                if trimmed.chars().count() < *min {
                    return Err(format!("answer must be at least {} characters", min));
                }
            }
            Self::MaxLength { max } => {
                if trimmed.chars().count() > *max {
                    return Err(format!("answer must be at most {} characters", max));
                }
            }
            Self::Pattern { regex } => {
                let re = Regex::new(regex)
                    .map_err(|e| format!("invalid pattern '{}': {}", regex, e))?;
                if !re.is_match(trimmed) {
                    return Err(format!("answer must match pattern '{}'", regex));
                }
            }
            Self::OneOf { options } => {
                if !options.iter().any(|o| o.eq_ignore_ascii_case(trimmed)) {
                    return Err(format!("answer must be one of: {}", options.join(", ")));
                }
            }
            Self::Numeric => {
                if trimmed.parse::<f64>().is_err() {
                    return Err("answer must be a number".to_string());
                }
            }
            Self::YesNo => {
                if crate::interaction::interpret_approval(trimmed).is_none() {
                    return Err("answer must be yes or no".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Validate an answer against every rule, reporting the first violation.
pub fn validate_answer(answer: &str, rules: &[ValidationRule]) -> Result<(), String> {
    rules.iter().try_for_each(|rule| rule.validate(answer))
}
