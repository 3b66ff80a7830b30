//! Pulling URLs out of free text.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Stops at whitespace, quotes and angle brackets
    Regex::new(r#"(?i)\bhttps?://[^\s<>"'`]+"#).unwrap()
});

/// Characters that usually end a sentence rather than a URL.
const TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}'];

/// Every distinct http(s) URL in `text`, in order of first appearance.
#[must_use]
pub fn extract(text: &str) -> Vec<Url> {
    let mut urls: Vec<Url> = Vec::new();

    for m in URL_RE.find_iter(text) {
        let candidate = trim_trailing(m.as_str());
        let Ok(url) = Url::parse(candidate) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            continue;
        }
        if !urls.contains(&url) {
            urls.push(url);
        }
    }

    urls
}

/// Strip sentence punctuation, keeping a closing paren that has a match.
fn trim_trailing(s: &str) -> &str {
    let mut s = s;
    while let Some(last) = s.chars().last() {
        if !TRAILING.contains(&last) {
            break;
        }
        if last == ')' && s.matches('(').count() >= s.matches(')').count() {
            break;
        }
        s = &s[..s.len() - last.len_utf8()];
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(urls: &[Url]) -> Vec<&str> {
        urls.iter().map(Url::as_str).collect()
    }

    #[test]
    fn test_extract_dedups_in_order() {
        let text = "see https://b.example/x and http://a.example, then https://b.example/x again";
        assert_eq!(
            strs(&extract(text)),
            vec!["https://b.example/x", "http://a.example/"]
        );
    }

    #[test]
    fn test_extract_ignores_other_schemes() {
        let text = "ftp://files.example/a mailto:me@example.com HTTPS://UP.EXAMPLE/Path";
        assert_eq!(strs(&extract(text)), vec!["https://up.example/Path"]);
    }

    #[test]
    fn test_extract_trims_punctuation() {
        let text = "(read https://en.wikipedia.org/wiki/Rust_(programming_language)). Or https://x.example/a?b=1!";
        assert_eq!(
            strs(&extract(text)),
            vec![
                "https://en.wikipedia.org/wiki/Rust_(programming_language)",
                "https://x.example/a?b=1"
            ]
        );
    }

    #[test]
    fn test_extract_nothing() {
        assert!(extract("no links here").is_empty());
    }
}
