use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::message_trait::MessageBody;

pub const PROBLEM_REPORT_TYPE: &str = "https://didcomm.org/report-problem/2.0/problem-report";

/// Report of a failure on the thread given by the message `thid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Problem code, e.g. `e.p.xfer.cant-process`.
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ProblemReport {
    pub fn new(code: &str, comment: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            comment: Some(comment.into()),
        }
    }
}

impl MessageBody for ProblemReport {
    fn message_type() -> &'static str {
        PROBLEM_REPORT_TYPE
    }

    fn validate(&self) -> Result<()> {
        if !(self.code.starts_with("e.") || self.code.starts_with("w.")) {
            return Err(Error::Validation(format!(
                "problem code `{}` must start with e. or w.",
                self.code
            )));
        }
        Ok(())
    }
}
