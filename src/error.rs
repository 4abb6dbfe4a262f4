//! 整個 crate 共用的錯誤型別。
//!
//! 各模組保留自己的錯誤列舉，並透過 `#[from]` 轉換成 [`Error`]。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::AccountError, certificate::CertificateError, config::ConfigError, csr::CsrError,
    directory::DirectoryError, http::HttpError, http::HttpResponse, nonce::NonceError,
    payload::PayloadError, responder::ResponderError, signature::SignatureError,
};

/// `badNonce` 問題類型。
pub const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// CA 回傳的問題文件（RFC 7807）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{problem_type}: {detail}")]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    pub fn new(problem_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            detail: detail.into(),
            ..Self::default()
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.problem_type == BAD_NONCE
    }

    /// 從非 2xx 回應解析問題文件。
    ///
    /// 本文不是問題文件時，產生一個帶有 HTTP 狀態碼與原始本文的替代問題。
    pub fn from_response(response: &HttpResponse) -> Self {
        match response.json::<Problem>() {
            Ok(mut problem) if !problem.problem_type.is_empty() => {
                problem.status.get_or_insert(response.status);
                problem
            }
            _ => Problem {
                problem_type: "about:blank".to_string(),
                detail: response.text(),
                status: Some(response.status),
                subproblems: Vec::new(),
            },
        }
    }
}

/// 協議驅動器可能回傳的所有錯誤。
#[derive(Debug, Error)]
pub enum Error {
    #[error("Signing error: {0}")]
    Signing(#[from] SignatureError),
    #[error("CA error: {0}")]
    Ca(Problem),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Challenge failed for {identifier} ({authorization}): {detail}")]
    ChallengeFailed {
        identifier: String,
        authorization: String,
        detail: String,
        problem: Option<Problem>,
    },
    #[error("Challenge type {wanted} not offered for {identifier}, offered: {offered:?}")]
    UnsupportedChallenge {
        identifier: String,
        wanted: String,
        offered: Vec<String>,
    },
    #[error("Polling {url} timed out after {attempts} attempts")]
    PollTimeout { url: String, attempts: u32 },
    #[error("Polling {url} ended in status {status}: {detail}")]
    PollFailed {
        url: String,
        status: String,
        detail: String,
        problem: Option<Problem>,
    },
    #[error("Status of {url} went from {from} back to {to}")]
    StatusRegression { url: String, from: String, to: String },
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Responder error: {0}")]
    Responder(#[from] ResponderError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// CA 回傳的問題文件（若有）。
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Error::Ca(problem) => Some(problem),
            Error::Account(AccountError::Rejected(problem)) => Some(problem),
            Error::ChallengeFailed { problem, .. } | Error::PollFailed { problem, .. } => {
                problem.as_ref()
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_problem_document_parsed() {
        let response = HttpResponse::new(400).with_json(&json!({
            "type": BAD_NONCE,
            "detail": "JWS has an invalid anti-replay nonce"
        }));
        let problem = Problem::from_response(&response);

        assert!(problem.is_bad_nonce());
        assert_eq!(problem.detail, "JWS has an invalid anti-replay nonce");
        assert_eq!(problem.status, Some(400));
    }

    #[test]
    fn test_non_problem_body_becomes_synthetic_problem() {
        let response = HttpResponse::new(502).with_body("Bad Gateway");
        let problem = Problem::from_response(&response);

        assert_eq!(problem.problem_type, "about:blank");
        assert_eq!(problem.detail, "Bad Gateway");
        assert_eq!(problem.status, Some(502));
        assert!(!problem.is_bad_nonce());
    }

    #[test]
    fn test_subproblems_kept() {
        let response = HttpResponse::new(400).with_json(&json!({
            "type": "urn:ietf:params:acme:error:rejectedIdentifier",
            "detail": "Some identifiers were rejected",
            "subproblems": [{
                "type": "urn:ietf:params:acme:error:rejectedIdentifier",
                "detail": "bad.example is forbidden"
            }]
        }));
        let problem = Problem::from_response(&response);
        assert_eq!(problem.subproblems.len(), 1);
        assert_eq!(
            Error::Ca(problem.clone()).problem(),
            Some(&problem)
        );
    }
}
