use serde::{Deserialize, Serialize};

/// Caller identity and intent for one request.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RequestContext {
    pub principal_id: String,
    pub role: String,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Caller asked for a bulk export regardless of query shape.
    #[serde(default)]
    pub export: bool,
}

impl RequestContext {
    pub fn new(principal_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            role: role.into(),
            request_id: None,
            export: false,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn exporting(mut self) -> Self {
        self.export = true;
        self
    }
}
