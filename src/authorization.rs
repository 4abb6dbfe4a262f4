use serde::{Deserialize, Serialize};

use crate::{
    challenge::{Challenge, ChallengeType},
    error::Problem,
    payload::Identifier,
    poll::{Pollable, Progress},
};

/// 授權狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    /// 驗證失敗或已失效的終止狀態。
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Pending | Self::Valid)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Valid => 1,
            _ => 2,
        }
    }
}

/// 一個識別項的授權，包含 CA 提供的挑戰。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// 找出指定類型的挑戰。
    pub fn find_challenge(&self, challenge_type: &ChallengeType) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == *challenge_type)
    }

    pub fn offered_types(&self) -> Vec<String> {
        self.challenges
            .iter()
            .map(|c| c.challenge_type.to_string())
            .collect()
    }

    /// 授權中第一個帶有錯誤的挑戰所提供的問題文件。
    pub fn failure_problem(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }

    /// 失敗原因：挑戰錯誤的 `detail`，沒有時以狀態描述。
    pub fn failure_detail(&self) -> String {
        match self.failure_problem() {
            Some(problem) if !problem.detail.is_empty() => problem.detail.clone(),
            _ => format!("authorization for {} is {}", self.identifier.value, self.status.as_str()),
        }
    }

    /// 輪詢時使用的進度判斷：離開 `pending` 即為終止。
    pub fn progress(&self) -> Progress {
        match self.status {
            AuthorizationStatus::Pending => Progress::Pending,
            AuthorizationStatus::Valid => Progress::Done,
            status => Progress::Failed {
                status: status.as_str().to_string(),
                detail: self.failure_detail(),
                problem: self.failure_problem().cloned(),
            },
        }
    }
}

impl Pollable for Authorization {
    fn status_label(&self) -> &str {
        self.status.as_str()
    }

    fn status_rank(&self) -> u8 {
        self.status.rank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authorization(status: &str, challenge_status: &str) -> Authorization {
        serde_json::from_value(json!({
            "identifier": {"type": "dns", "value": "example.com"},
            "status": status,
            "expires": "2026-11-01T00:00:00Z",
            "challenges": [
                {
                    "type": "http-01",
                    "url": "https://ca.test/acme/chall/1",
                    "token": "tok-http",
                    "status": challenge_status,
                    "error": if challenge_status == "invalid" {
                        json!({
                            "type": "urn:ietf:params:acme:error:connection",
                            "detail": "Invalid response from http://example.com/.well-known/acme-challenge/tok-http"
                        })
                    } else {
                        json!(null)
                    }
                },
                {
                    "type": "dns-01",
                    "url": "https://ca.test/acme/chall/2",
                    "token": "tok-dns",
                    "status": "pending"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_find_challenge() {
        let authz = authorization("pending", "pending");
        assert_eq!(
            authz.find_challenge(&ChallengeType::Http01).unwrap().token,
            "tok-http"
        );
        assert!(authz.find_challenge(&ChallengeType::TlsAlpn01).is_none());
        assert_eq!(authz.offered_types(), vec!["http-01", "dns-01"]);
    }

    #[test]
    fn test_progress() {
        assert_eq!(authorization("pending", "pending").progress(), Progress::Pending);
        assert_eq!(authorization("valid", "valid").progress(), Progress::Done);

        match authorization("invalid", "invalid").progress() {
            Progress::Failed { status, detail, problem } => {
                assert_eq!(status, "invalid");
                assert_eq!(
                    detail,
                    "Invalid response from http://example.com/.well-known/acme-challenge/tok-http"
                );
                assert!(problem.is_some());
            }
            other => panic!("unexpected progress: {:?}", other),
        }
    }

    #[test]
    fn test_failure_detail_without_problem() {
        let authz = authorization("expired", "pending");
        assert_eq!(authz.failure_detail(), "authorization for example.com is expired");
        assert!(authz.status.is_failure());
    }

    #[test]
    fn test_rank_is_monotonic() {
        assert!(AuthorizationStatus::Pending.rank() < AuthorizationStatus::Valid.rank());
        assert!(AuthorizationStatus::Valid.rank() < AuthorizationStatus::Revoked.rank());
    }
}
