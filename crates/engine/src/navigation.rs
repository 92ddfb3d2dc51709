use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    /// Let the web view load it.
    Allow,
    /// Cancel and hand the URL to the system browser.
    OpenExternally,
}

/// Decides what the host web view does with a navigation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NavigationPolicy;

impl NavigationPolicy {
    pub fn decide(&self, url: &str, user_initiated: bool) -> NavigationDecision {
        if !user_initiated {
            return NavigationDecision::Allow;
        }
        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                NavigationDecision::OpenExternally
            }
            _ => NavigationDecision::Allow,
        }
    }
}
