//! Free-text query parsing.
//!
//! Users narrow a search to one tag by writing it in brackets anywhere in the
//! query: `design patterns [rust]` searches for "design patterns" among
//! questions tagged `rust`. Only the first bracketed token is treated as a
//! filter.

use crate::index::SearchQuery;
use regex::Regex;
use std::sync::LazyLock;

static TAG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]").expect("static regex"));

/// Fields the free text is matched against.
pub const QUERY_BY: [&str; 2] = ["title", "content"];

/// Query text matching every document
pub const MATCH_ALL: &str = "*";

/// A raw query split into search text and tag filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub text: String,
    pub tag: Option<String>,
}

/// Extract the first `[tag]` token from `raw`.
///
/// With a token, the token is cut out and the rest trimmed; an empty `[]`
/// is cut out but yields no tag. Without one, `raw` is returned untouched.
pub fn parse(raw: &str) -> ParsedQuery {
    let Some(captures) = TAG_TOKEN.captures(raw) else {
        return ParsedQuery {
            text: raw.to_string(),
            tag: None,
        };
    };

    let tag = captures
        .get(1)
        .map(|m| m.as_str().trim().to_string())
        .filter(|tag| !tag.is_empty());

    let text = match captures.get(0) {
        Some(token) => format!("{}{}", &raw[..token.start()], &raw[token.end()..]),
        None => raw.to_string(),
    };

    ParsedQuery {
        text: text.trim().to_string(),
        tag,
    }
}

impl ParsedQuery {
    /// Build the index query: full text over title and content, ANDed with the
    /// tag filter.
    pub fn to_search_query(&self, limit: usize) -> SearchQuery {
        let text = if self.text.trim().is_empty() {
            MATCH_ALL.to_string()
        } else {
            self.text.clone()
        };

        SearchQuery {
            text,
            query_by: QUERY_BY.iter().map(|f| f.to_string()).collect(),
            tag: self.tag.clone(),
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str, tag: Option<&str>) -> ParsedQuery {
        ParsedQuery {
            text: text.to_string(),
            tag: tag.map(String::from),
        }
    }

    #[test]
    fn test_trailing_tag() {
        assert_eq!(
            parse("design patterns [rust]"),
            parsed("design patterns", Some("rust"))
        );
    }

    #[test]
    fn test_no_tag() {
        assert_eq!(parse("design patterns"), parsed("design patterns", None));
    }

    #[test]
    fn test_no_tag_keeps_raw_query() {
        assert_eq!(parse("  padded  "), parsed("  padded  ", None));
    }

    #[test]
    fn test_leading_and_inner_tag() {
        assert_eq!(parse("[async] tokio runtime"), parsed("tokio runtime", Some("async")));
        assert_eq!(parse("tokio [async] runtime"), parsed("tokio  runtime", Some("async")));
    }

    #[test]
    fn test_only_first_tag_is_used() {
        assert_eq!(
            parse("traits [rust] [generics]"),
            parsed("traits  [generics]", Some("rust"))
        );
    }

    #[test]
    fn test_tag_only() {
        assert_eq!(parse("[rust]"), parsed("", Some("rust")));
    }

    #[test]
    fn test_empty_brackets() {
        assert_eq!(parse("lifetimes []"), parsed("lifetimes", None));
    }

    #[test]
    fn test_search_query_defaults_to_match_all() {
        let query = parse("[rust]").to_search_query(20);
        assert_eq!(query.text, "*");
        assert_eq!(query.tag.as_deref(), Some("rust"));
        assert_eq!(query.query_by, vec!["title", "content"]);
        assert_eq!(query.limit, 20);
    }
}
