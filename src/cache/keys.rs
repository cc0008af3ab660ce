//! Cache key definitions.
//!
//! A [`BaseKey`] captures everything about a request that affects rendering
//! except experiments. A [`CompositeKey`] pairs it with the relevant
//! allocation of one stored output.

use std::fmt;

use super::allocation::RelevantAllocation;

/// The attributes of an anonymous page request the cache cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Route path, including the query string.
    pub path: String,
    pub timezone: Option<String>,
    pub theme: Option<String>,
    pub user_agent: Option<String>,
    /// Whether the request carries an authenticated session.
    pub authenticated: bool,
}

impl PageRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }
}

/// Route and locale attributes of a request. Carries no experiment data.
///
/// Kept structured rather than concatenated so a path that happens to contain
/// `&timezone=` can never collide with a request that sets the cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseKey {
    path: String,
    timezone: Option<String>,
    theme: Option<String>,
}

impl BaseKey {
    pub fn for_request(request: &PageRequest) -> Self {
        Self {
            path: request.path.clone(),
            timezone: request.timezone.clone(),
            theme: request.theme.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.path.len()
            + self.timezone.as_ref().map_or(0, String::len)
            + self.theme.as_ref().map_or(0, String::len)
    }
}

impl fmt::Display for BaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if let Some(timezone) = &self.timezone {
            write!(f, "&timezone={timezone}")?;
        }
        if let Some(theme) = &self.theme {
            write!(f, "&theme={theme}")?;
        }
        Ok(())
    }
}

/// Store key: base key plus the experiments the stored output depended on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub base: BaseKey,
    pub relevant: RelevantAllocation,
}

impl CompositeKey {
    pub fn new(base: BaseKey, relevant: RelevantAllocation) -> Self {
        Self { base, relevant }
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.base.approx_size() + self.relevant.approx_size()
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.base, self.relevant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_key_display_appends_present_attributes() {
        let bare = BaseKey::for_request(&PageRequest::new("/frontpage?page=2"));
        assert_eq!(bare.to_string(), "/frontpage?page=2");

        let full = BaseKey::for_request(
            &PageRequest::new("/frontpage")
                .with_timezone("Europe/Paris")
                .with_theme("dark"),
        );
        assert_eq!(
            full.to_string(),
            "/frontpage&timezone=Europe/Paris&theme=dark"
        );

        let theme_only = BaseKey::for_request(&PageRequest::new("/frontpage").with_theme("dark"));
        assert_eq!(theme_only.to_string(), "/frontpage&theme=dark");
    }

    #[test]
    fn base_key_ignores_identity_attributes() {
        let anonymous = PageRequest::new("/posts/1").with_user_agent("curl/8");
        let other = PageRequest::new("/posts/1").with_user_agent("Mozilla/5.0");
        assert_eq!(
            BaseKey::for_request(&anonymous),
            BaseKey::for_request(&other)
        );
    }

    #[test]
    fn locale_attributes_separate_base_keys() {
        let utc = BaseKey::for_request(&PageRequest::new("/").with_timezone("UTC"));
        let paris = BaseKey::for_request(&PageRequest::new("/").with_timezone("Europe/Paris"));
        let none = BaseKey::for_request(&PageRequest::new("/"));
        assert_ne!(utc, paris);
        assert_ne!(utc, none);
    }

    #[test]
    fn crafted_path_does_not_collide_with_cookie_attributes() {
        let crafted = BaseKey::for_request(&PageRequest::new("/&timezone=UTC"));
        let cookie = BaseKey::for_request(&PageRequest::new("/").with_timezone("UTC"));
        assert_eq!(crafted.to_string(), cookie.to_string());
        assert_ne!(crafted, cookie);
    }

    #[test]
    fn composite_keys_differ_by_relevant_allocation() {
        let base = BaseKey::for_request(&PageRequest::new("/frontpage"));
        let red: RelevantAllocation = [("buttonColor", "red")].into_iter().collect();
        let blue: RelevantAllocation = [("buttonColor", "blue")].into_iter().collect();

        assert_ne!(
            CompositeKey::new(base.clone(), red),
            CompositeKey::new(base.clone(), blue)
        );
        assert_eq!(
            CompositeKey::new(base.clone(), RelevantAllocation::new()).approx_size(),
            "/frontpage".len()
        );
    }
}
