use crate::config::FilterConfig;

/// Denylist check applied to search results
///
/// Matching is a case-sensitive substring test. Filtering happens only when
/// results are served, so stored posts are never altered and a changed
/// denylist takes effect on the next query.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    denylist: Vec<String>,
}

impl ContentFilter {
    /// Create a filter from configuration
    pub fn new(config: &FilterConfig) -> Self {
        Self::with_terms(config.denylist.iter().cloned())
    }

    /// Create a filter from an explicit list of terms
    pub fn with_terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denylist: terms
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    /// Whether `message` contains any denylisted term
    pub fn is_filtered(&self, message: &str) -> bool {
        self.denylist.iter().any(|term| message.contains(term.as_str()))
    }

    pub fn terms(&self) -> &[String] {
        &self.denylist
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_denylist() {
        let filter = ContentFilter::default();
        assert!(filter.is_filtered("this is fuckword"));
        assert!(!filter.is_filtered("clean message"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let filter = ContentFilter::with_terms(["spam"]);
        assert!(filter.is_filtered("buy spam now"));
        assert!(!filter.is_filtered("buy SPAM now"));
    }

    #[test]
    fn test_substring_anywhere() {
        let filter = ContentFilter::with_terms(["bad", "worse"]);
        assert!(filter.is_filtered("badge"));
        assert!(filter.is_filtered("it got worse"));
        assert!(!filter.is_filtered("fine"));
        assert!(!filter.is_filtered(""));
    }

    #[test]
    fn test_empty_terms_are_ignored() {
        let filter = ContentFilter::with_terms(["", "x"]);
        assert_eq!(filter.terms(), &["x".to_string()]);
        assert!(!filter.is_filtered("clean"));
    }
}
