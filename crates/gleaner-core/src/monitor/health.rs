//! Session health classification.
//!
//! Pure: looks at the executor's last [`Observation`] and says whether the
//! session can keep navigating. Precedence is rate limit, then challenge,
//! then session expiry.

use serde::{Deserialize, Serialize};

use crate::domain::BlockReason;
use crate::ports::{ExecutorError, Observation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionHealth {
    Healthy,
    Challenge,
    SessionExpired,
    RateLimited,
}

impl SessionHealth {
    pub fn is_healthy(self) -> bool {
        self == SessionHealth::Healthy
    }

    pub fn block_reason(self) -> Option<BlockReason> {
        match self {
            SessionHealth::Healthy => None,
            SessionHealth::Challenge => Some(BlockReason::Challenge),
            SessionHealth::SessionExpired => Some(BlockReason::SessionExpired),
            SessionHealth::RateLimited => Some(BlockReason::RateLimited),
        }
    }

    /// Detection class carried by an executor error; other errors say nothing
    /// about the session and map to `Healthy`.
    pub fn from_error(error: &ExecutorError) -> Self {
        match error.block_reason() {
            Some(BlockReason::Challenge) => SessionHealth::Challenge,
            Some(BlockReason::SessionExpired) => SessionHealth::SessionExpired,
            Some(BlockReason::RateLimited) => SessionHealth::RateLimited,
            None => SessionHealth::Healthy,
        }
    }
}

/// Text markers looked for (case-insensitively) in the page title and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMarkers {
    pub rate_limited: Vec<String>,
    pub challenge: Vec<String>,
    pub session_expired: Vec<String>,
    /// URL path fragments of the login flow.
    pub login_paths: Vec<String>,
}

impl Default for HealthMarkers {
    fn default() -> Self {
        fn owned(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            rate_limited: owned(&["too many requests", "rate limit"]),
            challenge: owned(&[
                "captcha",
                "access denied",
                "just a moment",
                "verify you are human",
                "unusual traffic",
            ]),
            session_expired: owned(&["session expired", "please log in", "sign in to continue"]),
            login_paths: owned(&["/login", "/account-security/login", "/signin"]),
        }
    }
}

pub fn classify(observation: &Observation, markers: &HealthMarkers) -> SessionHealth {
    let text = format!(
        "{}\n{}",
        observation.title.as_deref().unwrap_or_default(),
        observation.body_excerpt.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    let url = observation
        .url
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let status = observation.status_code;

    if status == Some(429) || contains_any(&text, &markers.rate_limited) {
        return SessionHealth::RateLimited;
    }
    if status == Some(403) || contains_any(&text, &markers.challenge) {
        return SessionHealth::Challenge;
    }
    if status == Some(401)
        || contains_any(&url, &markers.login_paths)
        || contains_any(&text, &markers.session_expired)
    {
        return SessionHealth::SessionExpired;
    }
    SessionHealth::Healthy
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .filter(|n| !n.is_empty())
        .any(|n| haystack.contains(&n.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn obs(url: &str, status: Option<u16>, title: &str, body: &str) -> Observation {
        Observation {
            url: Some(url.to_string()),
            status_code: status,
            title: Some(title.to_string()),
            body_excerpt: Some(body.to_string()),
        }
    }

    #[rstest]
    #[case(obs("https://m.example/search", Some(200), "Jobs", "10 results"), SessionHealth::Healthy)]
    #[case(obs("https://m.example/search", Some(429), "", ""), SessionHealth::RateLimited)]
    #[case(obs("https://m.example/search", Some(200), "Too Many Requests", ""), SessionHealth::RateLimited)]
    #[case(obs("https://m.example/search", Some(403), "", ""), SessionHealth::Challenge)]
    #[case(obs("https://m.example/search", Some(200), "Just a moment...", ""), SessionHealth::Challenge)]
    #[case(obs("https://m.example/search", Some(200), "", "Please complete the CAPTCHA"), SessionHealth::Challenge)]
    #[case(obs("https://m.example/search", Some(401), "", ""), SessionHealth::SessionExpired)]
    #[case(obs("https://m.example/ab/account-security/login", Some(200), "Log in", ""), SessionHealth::SessionExpired)]
    fn classifies_observations(#[case] observation: Observation, #[case] expected: SessionHealth) {
        assert_eq!(classify(&observation, &HealthMarkers::default()), expected);
    }

    #[test]
    fn rate_limit_takes_precedence_over_challenge_and_login() {
        let o = obs("https://m.example/login", Some(429), "captcha", "");
        assert_eq!(classify(&o, &HealthMarkers::default()), SessionHealth::RateLimited);

        let o = obs("https://m.example/login", Some(403), "", "");
        assert_eq!(classify(&o, &HealthMarkers::default()), SessionHealth::Challenge);
    }

    #[test]
    fn custom_markers_replace_defaults() {
        let markers = HealthMarkers {
            challenge: vec!["Pardon Our Interruption".into()],
            ..HealthMarkers::default()
        };
        let o = obs("https://m.example/x", Some(200), "pardon our interruption", "");
        assert_eq!(classify(&o, &markers), SessionHealth::Challenge);
    }

    #[test]
    fn executor_errors_map_to_health() {
        assert_eq!(
            SessionHealth::from_error(&ExecutorError::RateLimited),
            SessionHealth::RateLimited
        );
        assert_eq!(
            SessionHealth::from_error(&ExecutorError::Timeout),
            SessionHealth::Healthy
        );
    }
}
