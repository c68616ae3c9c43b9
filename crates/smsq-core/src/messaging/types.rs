use serde::{Deserialize, Serialize};

/// Carrier answer to a single send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Carrier message id; `None` when the carrier refused the message.
    pub external_id: Option<String>,
    /// Carrier status code (`"0"` is success for Vonage).
    pub status_code: String,
    pub error_text: Option<String>,
}

impl SendReceipt {
    pub fn accepted(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            status_code: "0".to_string(),
            error_text: None,
        }
    }

    pub fn rejected(status_code: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            external_id: None,
            status_code: status_code.into(),
            error_text: Some(error_text.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.external_id.is_some()
    }
}
