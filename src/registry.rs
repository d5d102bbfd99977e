//! Rule registration and endpoint-to-throttle lookup
//!
//! Rules bind an HTTP method plus a path template (placeholders in braces,
//! e.g. `/users/{userId}/meetings`) to rate and daily limits. Templates are
//! compiled once at registration into immutable matchers; lookups scan the
//! rule table in registration order. Paths with no matching rule share one
//! unlimited throttle, so unthrottled endpoints behave identically to "no
//! rule exists" without special-casing.

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::throttle::Throttle;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// One piece of a compiled path segment.
#[derive(Debug, Clone)]
enum Piece {
    Literal(String),
    /// Matches a non-empty run of non-slash, non-query characters. The
    /// name is kept for diagnostics only; it does not affect matching.
    Placeholder(#[allow(dead_code)] String),
}

/// A path template compiled into an immutable matcher.
#[derive(Debug, Clone)]
pub(crate) struct PathPattern {
    segments: Vec<Vec<Piece>>,
}

impl PartialEq for PathPattern {
    /// Structural equality ignoring placeholder names, so `/m/{a}` and
    /// `/m/{b}` register as the same pattern.
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| match (x, y) {
                        (Piece::Literal(l), Piece::Literal(r)) => l == r,
                        (Piece::Placeholder(_), Piece::Placeholder(_)) => true,
                        _ => false,
                    })
            })
    }
}

impl Eq for PathPattern {}

impl PathPattern {
    pub(crate) fn compile(template: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };
        let Some(rest) = template.strip_prefix('/') else {
            return Err(malformed("template must start with '/'"));
        };

        let mut segments = Vec::new();
        for raw_segment in rest.split('/') {
            let mut pieces = Vec::new();
            let mut literal = String::new();
            let mut chars = raw_segment.chars();
            while let Some(c) = chars.next() {
                match c {
                    '{' => {
                        if !literal.is_empty() {
                            pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                        }
                        let mut name = String::new();
                        loop {
                            match chars.next() {
                                Some('}') => break,
                                Some('{') => return Err(malformed("nested '{' in placeholder")),
                                Some(c) => name.push(c),
                                None => return Err(malformed("unclosed '{'")),
                            }
                        }
                        if name.is_empty() {
                            return Err(malformed("empty placeholder name"));
                        }
                        pieces.push(Piece::Placeholder(name));
                    }
                    '}' => return Err(malformed("'}' without matching '{'")),
                    c => literal.push(c),
                }
            }
            if !literal.is_empty() {
                pieces.push(Piece::Literal(literal));
            }
            segments.push(pieces);
        }
        Ok(Self { segments })
    }

    /// Whether a concrete path matches. Query strings and fragments are
    /// stripped before matching.
    pub(crate) fn matches(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let Some(rest) = path.strip_prefix('/') else { return false };
        let candidate: Vec<&str> = rest.split('/').collect();
        candidate.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(&candidate)
                .all(|(pieces, segment)| match_pieces(pieces, segment))
    }
}

fn match_pieces(pieces: &[Piece], s: &str) -> bool {
    match pieces.split_first() {
        None => s.is_empty(),
        Some((Piece::Literal(lit), rest)) => {
            s.strip_prefix(lit.as_str()).is_some_and(|tail| match_pieces(rest, tail))
        }
        Some((Piece::Placeholder(_), rest)) => {
            if rest.is_empty() {
                return !s.is_empty();
            }
            // Placeholders match a non-empty run; try every split point.
            (1..=s.len()).any(|i| s.is_char_boundary(i) && match_pieces(rest, &s[i..]))
        }
    }
}

/// A rate rule: at most `max_requests` per `interval`, enforced by spacing
/// dequeues `interval / max_requests` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u32,
    pub interval: Duration,
}

/// Static configuration binding an HTTP method and path template to
/// rate/quota limits. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Rule {
    method: String,
    template: String,
    pattern: PathPattern,
    rate: Option<RateRule>,
    max_per_day: Option<u64>,
}

impl Rule {
    /// Start building a rule for `method` + `template`.
    pub fn builder(method: impl Into<String>, template: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            method: method.into(),
            template: template.into(),
            rate: None,
            max_per_day: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn rate(&self) -> Option<RateRule> {
        self.rate
    }

    pub fn max_per_day(&self) -> Option<u64> {
        self.max_per_day
    }

    /// Gap between successive dequeues implied by the rate rule.
    pub(crate) fn dequeue_interval(&self) -> Option<Duration> {
        self.rate.map(|rate| rate.interval / rate.max_requests)
    }
}

/// Builder for [`Rule`]; validates method, template, and limits at `build`.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    method: String,
    template: String,
    rate: Option<RateRule>,
    max_per_day: Option<u64>,
}

impl RuleBuilder {
    /// Allow at most `max_requests` per `interval` (pacing).
    pub fn max_per_interval(mut self, max_requests: u32, interval: Duration) -> Self {
        self.rate = Some(RateRule { max_requests, interval });
        self
    }

    /// Allow at most `max_requests` per UTC day (quota).
    pub fn max_per_day(mut self, max_requests: u64) -> Self {
        self.max_per_day = Some(max_requests);
        self
    }

    /// Validate and build. Template compilation errors surface here, never
    /// at call time.
    pub fn build(self) -> Result<Rule, ConfigError> {
        if self.method.trim().is_empty() {
            return Err(ConfigError::EmptyMethod);
        }
        if let Some(rate) = self.rate {
            if rate.max_requests == 0 {
                return Err(ConfigError::InvalidLimit("max requests per interval must be > 0"));
            }
            if rate.interval.is_zero() {
                return Err(ConfigError::InvalidLimit("rate interval must be > 0"));
            }
        }
        if self.max_per_day == Some(0) {
            return Err(ConfigError::InvalidLimit("max requests per day must be > 0"));
        }
        let pattern = PathPattern::compile(&self.template)?;
        Ok(Rule {
            method: self.method.to_ascii_uppercase(),
            template: self.template,
            pattern,
            rate: self.rate,
            max_per_day: self.max_per_day,
        })
    }
}

/// Serde-friendly mirror of [`Rule`] so rule tables can live in config
/// files. `max_per_interval` and `interval_ms` must be given together.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuleConfig {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub max_per_interval: Option<u32>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub max_per_day: Option<u64>,
}

impl RuleConfig {
    pub fn into_rule(self) -> Result<Rule, ConfigError> {
        let mut builder = Rule::builder(self.method, self.path);
        match (self.max_per_interval, self.interval_ms) {
            (Some(max), Some(ms)) => {
                builder = builder.max_per_interval(max, Duration::from_millis(ms));
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::InvalidLimit(
                    "max_per_interval and interval_ms must be set together",
                ));
            }
        }
        if let Some(max) = self.max_per_day {
            builder = builder.max_per_day(max);
        }
        builder.build()
    }
}

struct Entry {
    method: String,
    template: String,
    pattern: PathPattern,
    throttle: Arc<Throttle>,
}

/// Maps (HTTP method, path) to the throttle governing that endpoint.
pub struct ThrottleRegistry {
    entries: RwLock<Vec<Entry>>,
    unlimited: Arc<Throttle>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ThrottleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("throttle registry poisoned");
        f.debug_struct("ThrottleRegistry").field("rules", &entries.len()).finish()
    }
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemClock), Arc::new(TokioSleeper))
    }

    /// Construct with injected time sources; the seam tests use.
    pub fn with_parts(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            unlimited: Arc::new(Throttle::unlimited(clock.clone())),
            clock,
            sleeper,
        }
    }

    /// Register a rule, creating its throttle. Fails with
    /// [`ConfigError::DuplicateRule`] if a rule for the same (method,
    /// compiled pattern) pair exists; the existing rule is untouched.
    pub fn register(&self, rule: Rule) -> Result<Arc<Throttle>, ConfigError> {
        let mut entries = self.entries.write().expect("throttle registry poisoned");
        if let Some(existing) =
            entries.iter().find(|e| e.method == rule.method() && e.pattern == rule.pattern)
        {
            return Err(ConfigError::DuplicateRule {
                method: existing.method.clone(),
                template: existing.template.clone(),
            });
        }
        let throttle = Arc::new(Throttle::new(
            rule.dequeue_interval(),
            rule.max_per_day(),
            self.clock.clone(),
            self.sleeper.clone(),
        ));
        debug!(
            target: "quotagate::registry",
            method = %rule.method(),
            template = %rule.template(),
            "rule registered"
        );
        entries.push(Entry {
            method: rule.method().to_string(),
            template: rule.template().to_string(),
            pattern: rule.pattern.clone(),
            throttle: throttle.clone(),
        });
        Ok(throttle)
    }

    /// Register a batch of deserialized rules, stopping at the first error.
    pub fn register_all(
        &self,
        configs: impl IntoIterator<Item = RuleConfig>,
    ) -> Result<(), ConfigError> {
        for config in configs {
            self.register(config.into_rule()?)?;
        }
        Ok(())
    }

    /// Resolve the throttle for a concrete call. Method comparison is
    /// case-insensitive; patterns are tried in registration order; paths
    /// with no matching rule share the unlimited throttle.
    pub fn lookup(&self, method: &str, path: &str) -> Arc<Throttle> {
        let entries = self.entries.read().expect("throttle registry poisoned");
        let method = method.to_ascii_uppercase();
        entries
            .iter()
            .find(|e| e.method == method && e.pattern.matches(path))
            .map(|e| e.throttle.clone())
            .unwrap_or_else(|| self.unlimited.clone())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.entries.read().expect("throttle registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
