use regex::Regex;

use kubetap_types::{EndpointIdentity, EndpointKind, Error};

/// Characters that turn a plain name into a regular expression
const REGEX_META: &[char] = &[
    '.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '^', '$', '\\',
];

/// How a selection pattern matches names
#[derive(Clone, Debug)]
enum NameMatcher {
    Literal(String),
    Regex(Regex),
}

/// Compiled matcher for selecting pods and services
///
/// Matching is pure, so a pattern can be evaluated against any number of
/// snapshots.
#[derive(Clone, Debug)]
pub struct SelectionPattern {
    namespace: Option<String>,
    matcher: NameMatcher,
    labels: Option<String>,
}

impl SelectionPattern {
    /// Compile `pattern` as a regex if it contains regex syntax, else as a literal
    pub fn parse(namespace: Option<&str>, pattern: &str) -> Result<Self, Error> {
        if pattern.contains(REGEX_META) {
            Self::regex(namespace, pattern)
        } else {
            Self::literal(namespace, pattern)
        }
    }

    pub fn literal(namespace: Option<&str>, name: &str) -> Result<Self, Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(empty_pattern());
        }

        Ok(Self {
            namespace: normalize_namespace(namespace),
            matcher: NameMatcher::Literal(name.to_string()),
            labels: None,
        })
    }

    pub fn regex(namespace: Option<&str>, pattern: &str) -> Result<Self, Error> {
        if pattern.trim().is_empty() {
            return Err(empty_pattern());
        }

        let regex = Regex::new(pattern).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            namespace: normalize_namespace(namespace),
            matcher: NameMatcher::Regex(regex),
            labels: None,
        })
    }

    /// Restrict pod listings to a label selector such as `app=worker`
    pub fn with_labels(mut self, selector: &str) -> Self {
        let selector = selector.trim();
        self.labels = (!selector.is_empty()).then(|| selector.to_string());
        self
    }

    /// Namespace filter; `None` means all namespaces
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn labels(&self) -> Option<&str> {
        self.labels.as_deref()
    }

    pub fn is_regex(&self) -> bool {
        matches!(self.matcher, NameMatcher::Regex(_))
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        match &self.matcher {
            NameMatcher::Literal(name) => name,
            NameMatcher::Regex(re) => re.as_str(),
        }
    }

    /// Check a name of the given kind against this pattern
    ///
    /// A literal matches pods by exact name or as the owner prefix of a
    /// generated child name (`web` matches `web-0` and `web-7d9f-x2`), and
    /// services by exact name only.
    pub fn matches(&self, kind: EndpointKind, name: &str) -> bool {
        match &self.matcher {
            NameMatcher::Regex(re) => re.is_match(name),
            NameMatcher::Literal(literal) => match kind {
                EndpointKind::Service => name == literal,
                EndpointKind::Pod => name == literal || name.contains(&format!("{}-", literal)),
            },
        }
    }

    /// Check namespace and name together
    pub fn matches_identity(&self, identity: &EndpointIdentity) -> bool {
        let namespace_ok = self
            .namespace
            .as_deref()
            .is_none_or(|ns| ns == identity.namespace);
        namespace_ok && self.matches(identity.kind, &identity.name)
    }
}

fn normalize_namespace(namespace: Option<&str>) -> Option<String> {
    namespace
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
}

fn empty_pattern() -> Error {
    Error::InvalidPattern {
        pattern: String::new(),
        reason: "pattern must not be empty".to_string(),
    }
}
