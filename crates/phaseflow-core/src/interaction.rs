use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PhaseflowError, Result};

/// Kind of question a paused run is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    /// Free-form question authored by the workflow.
    AskUser,
    /// Canonical question looked up in the question catalog.
    AskCatalogQuestion,
    /// Yes/no approval.
    Approval,
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AskUser => write!(f, "ask_user"),
            Self::AskCatalogQuestion => write!(f, "ask_catalog_question"),
            Self::Approval => write!(f, "approval"),
        }
    }
}

/// A pending ask to the human operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRequest {
    pub id: String,
    pub interaction_type: InteractionType,
    pub question: String,
    /// Catalog question id; always set for `AskCatalogQuestion`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl InteractionRequest {
    /// Build a request, enforcing a non-blank question and a question id for
    /// catalog questions.
    pub fn new(
        interaction_type: InteractionType,
        question: impl Into<String>,
        question_id: Option<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        let question = question.into();
        if question.trim().is_empty() {
            return Err(PhaseflowError::InvalidInteraction(
                "question must not be blank".into(),
            ));
        }
        let question_id = question_id.filter(|id| !id.trim().is_empty());
        if interaction_type == InteractionType::AskCatalogQuestion && question_id.is_none() {
            return Err(PhaseflowError::InvalidInteraction(
                "catalog questions require a question id".into(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            interaction_type,
            question,
            question_id,
            context,
            created_at: Utc::now(),
        })
    }

    pub fn ask_user(
        question: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        Self::new(InteractionType::AskUser, question, None, context)
    }

    pub fn catalog_question(
        question_id: impl Into<String>,
        question: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        Self::new(
            InteractionType::AskCatalogQuestion,
            question,
            Some(question_id.into()),
            context,
        )
    }

    pub fn approval(
        question: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        Self::new(InteractionType::Approval, question, None, context)
    }
}

/// The human's answer to an `InteractionRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub request_id: String,
    pub answer: String,
    pub responded_at: DateTime<Utc>,
    /// Milliseconds between request creation and response; never negative.
    pub response_time_ms: u64,
}

impl InteractionResponse {
    /// Answer a request. The answer must not be blank.
    pub fn to_request(request: &InteractionRequest, answer: impl Into<String>) -> Result<Self> {
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(PhaseflowError::InvalidInteraction(
                "answer must not be blank".into(),
            ));
        }

        // Clock skew must not produce a response that precedes its request.
        let responded_at = Utc::now().max(request.created_at);
        let response_time_ms = (responded_at - request.created_at)
            .num_milliseconds()
            .max(0) as u64;

        Ok(Self {
            request_id: request.id.clone(),
            answer,
            responded_at,
            response_time_ms,
        })
    }
}

/// A resolved request/response pair kept in the execution's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub request: InteractionRequest,
    pub response: InteractionResponse,
}

/// Interpret a free-text approval answer. Returns `None` when the answer is
/// neither a recognisable yes nor no.
pub fn interpret_approval(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" | "approve" | "approved" | "ok" | "true" | "lgtm" => Some(true),
        "n" | "no" | "reject" | "rejected" | "deny" | "denied" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_question_rejected() {
        let err = InteractionRequest::ask_user("   ", HashMap::new()).unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));
    }

    #[test]
    fn test_catalog_requires_question_id() {
        let err = InteractionRequest::new(
            InteractionType::AskCatalogQuestion,
            "What is the scope?",
            None,
            HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));

        let req =
            InteractionRequest::catalog_question("scope", "What is the scope?", HashMap::new())
                .unwrap();
        assert_eq!(req.question_id.as_deref(), Some("scope"));
        assert_eq!(req.interaction_type, InteractionType::AskCatalogQuestion);
    }

    #[test]
    fn test_blank_answer_rejected() {
        let req = InteractionRequest::ask_user("Name?", HashMap::new()).unwrap();
        assert!(InteractionResponse::to_request(&req, "").is_err());
        assert!(InteractionResponse::to_request(&req, " \n").is_err());
    }

    #[test]
    fn test_response_time_never_negative() {
        let mut req = InteractionRequest::ask_user("Name?", HashMap::new()).unwrap();
        // Request stamped in the future, as if produced by a skewed clock.
        req.created_at = Utc::now() + chrono::Duration::seconds(30);
        let resp = InteractionResponse::to_request(&req, "Ada").unwrap();
        assert!(resp.responded_at >= req.created_at);
        assert_eq!(resp.response_time_ms, 0);
        assert_eq!(resp.request_id, req.id);
    }

    #[test]
    fn test_interpret_approval() {
        assert_eq!(interpret_approval("Yes"), Some(true));
        assert_eq!(interpret_approval(" approved "), Some(true));
        assert_eq!(interpret_approval("no"), Some(false));
        assert_eq!(interpret_approval("maybe later"), None);
    }

    #[test]
    fn test_interaction_type_serialization() {
        let json = serde_json::to_string(&InteractionType::AskCatalogQuestion).unwrap();
        assert_eq!(json, "\"ask_catalog_question\"");
    }
}
