use std::fmt;

use url::Url;

use crate::config::{CompressionConfig, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    ExcludedPath,
    ExcludedExtension,
    /// `data:` payloads and `blob:` handles are already in memory.
    Inline,
    OptOut,
    CrossOrigin,
    Unresolvable,
}

impl fmt::Display for PassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            PassReason::ExcludedPath => "excluded path",
            PassReason::ExcludedExtension => "excluded extension",
            PassReason::Inline => "inline url",
            PassReason::OptOut => "opted out",
            PassReason::CrossOrigin => "cross-origin",
            PassReason::Unresolvable => "unresolvable url",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    /// May be compressed; carries the absolute URL to fetch.
    Eligible(Url),
    PassThrough(PassReason),
}

/// Static URL checks that run before the cache is consulted.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    origin: Url,
    exclude_paths: Vec<String>,
    exclude_extensions: Vec<String>,
    opt_out_key: String,
    opt_out_value: String,
}

impl EligibilityFilter {
    pub fn new(config: &CompressionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            origin: config.origin_url()?,
            exclude_paths: config.exclude_paths.clone(),
            exclude_extensions: config.exclude_extensions.iter().map(|ext| ext.to_ascii_lowercase()).collect(),
            opt_out_key: config.opt_out_key.clone(),
            opt_out_value: config.opt_out_value.clone(),
        })
    }

    pub fn check(&self, url: &str) -> Eligibility {
        let trimmed = url.trim();
        if is_inline(trimmed) {
            return Eligibility::PassThrough(PassReason::Inline);
        }
        if trimmed.is_empty() {
            return Eligibility::PassThrough(PassReason::Unresolvable);
        }

        // Relative and root-relative paths resolve onto our own origin
        let resolved = match self.origin.join(trimmed) {
            Ok(resolved) => resolved,
            Err(_) => return Eligibility::PassThrough(PassReason::Unresolvable),
        };

        let path = resolved.path();
        if self.exclude_paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return Eligibility::PassThrough(PassReason::ExcludedPath);
        }
        let lower = path.to_ascii_lowercase();
        if self.exclude_extensions.iter().any(|ext| lower.ends_with(ext.as_str())) {
            return Eligibility::PassThrough(PassReason::ExcludedExtension);
        }
        if self.has_opt_out(&resolved) {
            return Eligibility::PassThrough(PassReason::OptOut);
        }
        // A foreign image would taint the raster surface
        if resolved.origin() != self.origin.origin() {
            return Eligibility::PassThrough(PassReason::CrossOrigin);
        }

        Eligibility::Eligible(resolved)
    }

    fn has_opt_out(&self, url: &Url) -> bool {
        url.query_pairs()
            .any(|(key, value)| key == self.opt_out_key.as_str() && value == self.opt_out_value.as_str())
    }
}

fn is_inline(url: &str) -> bool {
    let head = url.get(..5).unwrap_or(url).to_ascii_lowercase();
    head.starts_with("data:") || head.starts_with("blob:")
}

/// Appends the opt-out marker to `url`, keeping any query string and fragment.
pub fn opt_out(url: &str, marker: &str) -> String {
    let (base, fragment) = match url.find('#') {
        Some(index) => url.split_at(index),
        None => (url, ""),
    };
    let already_marked = base
        .split_once('?')
        .map(|(_, query)| query.split('&').any(|pair| pair == marker))
        .unwrap_or(false);
    if already_marked {
        return url.to_string();
    }

    let separator = match base.find('?') {
        None => "?",
        Some(_) if base.ends_with('?') || base.ends_with('&') => "",
        Some(_) => "&",
    };
    format!("{}{}{}{}", base, separator, marker, fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EligibilityFilter {
        EligibilityFilter::new(&CompressionConfig::default()).unwrap()
    }

    fn pass_reason(url: &str) -> Option<PassReason> {
        match filter().check(url) {
            Eligibility::PassThrough(reason) => Some(reason),
            Eligibility::Eligible(_) => None,
        }
    }

    #[test]
    fn test_local_paths_are_eligible() {
        match filter().check("/images/photo-big.jpg") {
            Eligibility::Eligible(url) => assert_eq!(url.as_str(), "http://localhost:8000/images/photo-big.jpg"),
            other => panic!("expected eligible, got {:?}", other),
        }
        assert_eq!(pass_reason("images/photo.png"), None);
        assert_eq!(pass_reason("./images/photo.png"), None);
        assert_eq!(pass_reason("http://localhost:8000/images/photo.png"), None);
        assert_eq!(pass_reason("/images/photo.jpg?v=2"), None);
    }

    #[test]
    fn test_excluded_extensions_ignore_case_and_query() {
        assert_eq!(pass_reason("/images/logo.svg"), Some(PassReason::ExcludedExtension));
        assert_eq!(pass_reason("/images/LOGO.SVG"), Some(PassReason::ExcludedExtension));
        assert_eq!(pass_reason("/images/spinner.gif?v=3"), Some(PassReason::ExcludedExtension));
    }

    #[test]
    fn test_excluded_paths() {
        assert_eq!(pass_reason("/favicon.png"), Some(PassReason::ExcludedPath));
        assert_eq!(pass_reason("/icons/arrow.png"), Some(PassReason::ExcludedPath));
        assert_eq!(pass_reason("/images/icons/arrow.png"), None);
    }

    #[test]
    fn test_inline_urls() {
        assert_eq!(pass_reason("data:image/png;base64,iVBORw0KGgo="), Some(PassReason::Inline));
        assert_eq!(pass_reason("DATA:image/png;base64,iVBORw0KGgo="), Some(PassReason::Inline));
        assert_eq!(pass_reason("blob:http://localhost:8000/1234"), Some(PassReason::Inline));
    }

    #[test]
    fn test_cross_origin() {
        assert_eq!(pass_reason("https://cdn.example.com/images/photo.jpg"), Some(PassReason::CrossOrigin));
        assert_eq!(pass_reason("//cdn.example.com/photo.jpg"), Some(PassReason::CrossOrigin));
        assert_eq!(pass_reason("https://localhost:8000/photo.jpg"), Some(PassReason::CrossOrigin));
        assert_eq!(pass_reason("http://localhost:9000/photo.jpg"), Some(PassReason::CrossOrigin));
    }

    #[test]
    fn test_opt_out_marker_is_honoured() {
        assert_eq!(pass_reason("/images/a.jpg?nocompress=true"), Some(PassReason::OptOut));
        assert_eq!(pass_reason("/images/a.jpg?w=2&nocompress=true"), Some(PassReason::OptOut));
        assert_eq!(pass_reason("/images/a.jpg?nocompress=false"), None);
    }

    #[test]
    fn test_empty_url() {
        assert_eq!(pass_reason(""), Some(PassReason::Unresolvable));
        assert_eq!(pass_reason("   "), Some(PassReason::Unresolvable));
    }

    #[test]
    fn test_opt_out_builder() {
        let marker = "nocompress=true";
        assert_eq!(opt_out("/images/a.jpg", marker), "/images/a.jpg?nocompress=true");
        assert_eq!(opt_out("/images/a.jpg?v=2", marker), "/images/a.jpg?v=2&nocompress=true");
        assert_eq!(opt_out("/images/a.jpg?", marker), "/images/a.jpg?nocompress=true");
        assert_eq!(opt_out("/images/a.jpg#top", marker), "/images/a.jpg?nocompress=true#top");
        assert_eq!(opt_out("/images/a.jpg?nocompress=true", marker), "/images/a.jpg?nocompress=true");
    }

    #[test]
    fn test_opt_out_urls_pass_through() {
        let marker = CompressionConfig::default().opt_out_marker();
        for url in ["/images/a.jpg", "/images/a.jpg?v=2"] {
            assert_eq!(pass_reason(&opt_out(url, &marker)), Some(PassReason::OptOut));
        }
    }
}
