use crate::config::ClientRule;
use crate::window::WindowIdentity;
use regex::Regex;

/// A rule pattern: a regular expression, or a case-insensitive substring
/// when the pattern does not compile.
#[derive(Debug, Clone)]
enum Pattern {
    Empty,
    Regex(Regex),
    Substring(String),
}

impl Pattern {
    fn compile(pattern: &str) -> Self {
        if pattern.is_empty() {
            return Pattern::Empty;
        }
        match Regex::new(pattern) {
            Ok(re) => Pattern::Regex(re),
            Err(_) => Pattern::Substring(pattern.to_lowercase()),
        }
    }

    fn is_match(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match self {
            Pattern::Empty => false,
            Pattern::Regex(re) => re.is_match(text),
            Pattern::Substring(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Empty pattern or empty text never match.
#[cfg(test)]
pub fn match_pattern(pattern: &str, text: &str) -> bool {
    Pattern::compile(pattern).is_match(text)
}

#[derive(Debug, Clone)]
struct CompiledRule {
    class: Pattern,
    /// `None` when the rule has no title constraint
    title: Option<Pattern>,
    input_method: String,
}

impl CompiledRule {
    fn matches(&self, window: &WindowIdentity) -> bool {
        if !self.class.is_match(&window.class) {
            return false;
        }
        match &self.title {
            None => true,
            Some(title) => title.is_match(&window.title),
        }
    }
}

/// Rule list compiled once per config generation.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    rules: Vec<CompiledRule>,
    default_method: String,
}

impl RuleMatcher {
    pub fn new(rules: &[ClientRule], default_method: &str) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                class: Pattern::compile(&rule.class),
                title: (!rule.title.is_empty()).then(|| Pattern::compile(&rule.title)),
                input_method: rule.input_method.clone(),
            })
            .collect();
        Self {
            rules,
            default_method: default_method.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule in declaration order wins.
    pub fn resolve(&self, window: &WindowIdentity) -> &str {
        if window.is_unfocused() {
            return &self.default_method;
        }
        self.rules
            .iter()
            .find(|rule| rule.matches(window))
            .map(|rule| rule.input_method.as_str())
            .unwrap_or(&self.default_method)
    }
}
