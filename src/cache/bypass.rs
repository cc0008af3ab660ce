//! Requests that must never be served from or stored into the cache.

use serde::Serialize;

use super::keys::PageRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// Caching is switched off.
    Disabled,
    /// The request carries an authenticated session.
    Authenticated,
    /// The path is excluded from caching.
    ExcludedPath,
    /// Link-preview crawlers get output that differs per user agent.
    LinkPreview,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Authenticated => "authenticated",
            Self::ExcludedPath => "excluded_path",
            Self::LinkPreview => "link_preview",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassPolicy {
    pub excluded_path_prefixes: Vec<String>,
    pub user_agent_prefixes: Vec<String>,
}

impl BypassPolicy {
    /// Reason the request skips the cache, if any.
    ///
    /// The health checker still goes through the cache on excluded paths so
    /// health checks exercise the same code as real traffic.
    pub fn classify(&self, request: &PageRequest, is_health_check: bool) -> Option<BypassReason> {
        if request.authenticated {
            return Some(BypassReason::Authenticated);
        }

        if !is_health_check
            && self
                .excluded_path_prefixes
                .iter()
                .any(|prefix| request.path.starts_with(prefix.as_str()))
        {
            return Some(BypassReason::ExcludedPath);
        }

        let user_agent = request.user_agent.as_deref().unwrap_or_default();
        if self
            .user_agent_prefixes
            .iter()
            .any(|prefix| user_agent.starts_with(prefix.as_str()))
        {
            return Some(BypassReason::LinkPreview);
        }

        None
    }
}

impl Default for BypassPolicy {
    fn default() -> Self {
        Self {
            excluded_path_prefixes: vec!["/editPost".to_string(), "/collaborateOnPost".to_string()],
            user_agent_prefixes: vec!["Slackbot-LinkExpanding".to_string()],
        }
    }
}
