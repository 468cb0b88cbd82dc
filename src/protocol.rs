//! Action protocol — wire messages for cross-extension condition requests.
//!
//! ARCHITECTURE
//! ============
//! Callers broadcast a request on the request channel; every client running
//! the service sees it, and the one that executes it broadcasts a response on
//! the response channel. Callers correlate responses by `(callId, requesterId)`.
//!
//! DESIGN
//! ======
//! - Inbound payloads are untrusted JSON. `RawRequest` accepts anything
//!   shaped roughly right; `RawRequest::validate` turns it into a typed
//!   `ActionRequest` or a rejection code before any store access.
//! - Errors never cross the wire as anything but `ok: false` + `error`.
//! - Field names are camelCase on the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::scene::ItemId;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default channel carrying requests.
pub const REQUEST_CHANNEL: &str = "conditionmarkers.api.request";

/// Default channel carrying responses.
pub const RESPONSE_CHANNEL: &str = "conditionmarkers.api.response";

pub const INVALID_ACTION: &str = "INVALID_ACTION";
pub const MISSING_TOKEN_OR_CONDITION: &str = "MISSING_TOKEN_OR_CONDITION";
pub const TOKEN_NOT_FOUND: &str = "TOKEN_NOT_FOUND";
pub const API_TIMEOUT: &str = "API_TIMEOUT";

const CALL_ID_SUFFIX_LEN: usize = 6;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured errors.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Failures a request can end in, as seen from either side of the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("unrecognized action")]
    InvalidAction,
    #[error("request is missing tokenId or condition")]
    MissingTokenOrCondition,
    #[error("token not found: {0}")]
    TokenNotFound(String),
    /// Client-local. The remote operation may still have completed.
    #[error("no response for call {call_id} within {timeout_ms}ms")]
    Timeout { call_id: String, timeout_ms: u64 },
    /// Opaque diagnostic from a failure during execution.
    #[error("{0}")]
    Unexpected(String),
}

impl ErrorCode for ActionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAction => INVALID_ACTION,
            Self::MissingTokenOrCondition => MISSING_TOKEN_OR_CONDITION,
            Self::TokenNotFound(_) => TOKEN_NOT_FOUND,
            Self::Timeout { .. } => API_TIMEOUT,
            Self::Unexpected(_) => "E_UNEXPECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unexpected(_))
    }
}

impl ActionError {
    /// The string carried in a response's `error` field.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::Unexpected(message) => message.clone(),
            other => other.error_code().to_string(),
        }
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// Operation named by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Remove,
}

impl Action {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Request exactly as it arrived. Every field is optional until validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Validated request, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    Add { token_id: ItemId, condition: String, value: Option<String> },
    Remove { token_id: ItemId, condition: String },
}

impl ActionRequest {
    #[must_use]
    pub fn token_id(&self) -> ItemId {
        match self {
            Self::Add { token_id, .. } | Self::Remove { token_id, .. } => *token_id,
        }
    }

    #[must_use]
    pub fn condition(&self) -> &str {
        match self {
            Self::Add { condition, .. } | Self::Remove { condition, .. } => condition,
        }
    }
}

/// Correlation pair every response must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub call_id: String,
    pub requester_id: String,
}

impl RawRequest {
    /// Build an outbound request.
    #[must_use]
    pub fn new(ctx: &CallContext, action: Action, token_id: &str, condition: &str, value: Option<String>) -> Self {
        let action = match action {
            Action::Add => "add",
            Action::Remove => "remove",
        };
        Self {
            call_id: Some(ctx.call_id.clone()),
            requester_id: Some(ctx.requester_id.clone()),
            action: Some(action.into()),
            token_id: Some(token_id.into()),
            condition: Some(condition.into()),
            value,
        }
    }

    /// The correlation pair, if both halves are present and non-empty.
    /// Without it no response can be addressed.
    #[must_use]
    pub fn context(&self) -> Option<CallContext> {
        let call_id = self.call_id.as_deref().filter(|s| !s.is_empty())?;
        let requester_id = self.requester_id.as_deref().filter(|s| !s.is_empty())?;
        Some(CallContext { call_id: call_id.into(), requester_id: requester_id.into() })
    }

    /// Check shape and required fields, in protocol order: action first,
    /// then token/condition presence, then token id format.
    ///
    /// # Errors
    ///
    /// `InvalidAction`, `MissingTokenOrCondition`, or `TokenNotFound` when the
    /// token id cannot name any item.
    pub fn validate(&self) -> Result<ActionRequest, ActionError> {
        let action = self
            .action
            .as_deref()
            .and_then(Action::parse)
            .ok_or(ActionError::InvalidAction)?;

        let token = self.token_id.as_deref().filter(|s| !s.is_empty());
        let condition = self.condition.as_deref().filter(|s| !s.is_empty());
        let (Some(token), Some(condition)) = (token, condition) else {
            return Err(ActionError::MissingTokenOrCondition);
        };

        let token_id = ItemId::parse_str(token).map_err(|_| ActionError::TokenNotFound(token.into()))?;
        let condition = condition.to_string();

        Ok(match action {
            Action::Add => ActionRequest::Add {
                token_id,
                condition,
                value: self.value.clone().filter(|v| !v.is_empty()),
            },
            Action::Remove => ActionRequest::Remove { token_id, condition },
        })
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// Exactly one of these is broadcast per answerable request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub call_id: String,
    pub requester_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already_present: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<usize>,
}

impl ActionResponse {
    /// Base response echoing the request's correlation and target fields.
    #[must_use]
    pub fn to(req: &RawRequest, ctx: &CallContext) -> Self {
        Self {
            call_id: ctx.call_id.clone(),
            requester_id: ctx.requester_id.clone(),
            token_id: req.token_id.clone(),
            condition: req.condition.clone(),
            ok: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn already_present(mut self) -> Self {
        self.already_present = Some(true);
        self
    }

    #[must_use]
    pub fn added(mut self) -> Self {
        self.added = Some(true);
        self
    }

    #[must_use]
    pub fn deleted(mut self, count: usize) -> Self {
        self.deleted = Some(count);
        self
    }

    #[must_use]
    pub fn failed(mut self, err: &ActionError) -> Self {
        self.ok = false;
        self.error = Some(err.wire_message());
        self
    }

    /// True when this response answers the call identified by `ctx`.
    #[must_use]
    pub fn answers(&self, ctx: &CallContext) -> bool {
        self.call_id == ctx.call_id && self.requester_id == ctx.requester_id
    }
}

// =============================================================================
// CALL IDS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
fn now_ms() -> u128 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    dur.as_millis()
}

/// Fresh call id: `{millis}-{suffix}`. Unique enough for correlation on a
/// shared channel; not a security token.
#[must_use]
pub fn new_call_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CALL_ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{suffix}", now_ms())
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
