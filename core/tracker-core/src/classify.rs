//! Domain classification strategies.
//!
//! A [`ClassifierChain`] tries each [`Classifier`] in order and falls through
//! only on an explicit `Err`. When every strategy fails the domain is
//! recorded as [`UNCATEGORIZED`](crate::types::UNCATEGORIZED); classification
//! never aborts tracking.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{CategoryRule, ClassifierConfig, CommandClassifierConfig};
use crate::types::Classification;

static RE_JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

const COMMAND_POLL_INTERVAL_MS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("no rule matches {domain}")]
    NoMatch { domain: String },

    #[error("{classifier} unavailable: {details}")]
    Unavailable { classifier: String, details: String },

    #[error("{classifier} returned an invalid response: {details}")]
    InvalidResponse { classifier: String, details: String },
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, domain: &str) -> Result<Classification, ClassifyError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Table
// ═══════════════════════════════════════════════════════════════════════════════

/// Static lookup: a domain matches a rule when it equals one of the rule's
/// domains or is a subdomain of one.
pub struct RuleTableClassifier {
    rules: Vec<CategoryRule>,
}

impl RuleTableClassifier {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self { rules }
    }
}

impl Classifier for RuleTableClassifier {
    fn name(&self) -> &str {
        "rule_table"
    }

    fn classify(&self, domain: &str) -> Result<Classification, ClassifyError> {
        let domain = domain.to_ascii_lowercase();
        for rule in &self.rules {
            let matched = rule.domains.iter().any(|candidate| {
                let candidate = candidate.to_ascii_lowercase();
                domain == candidate || domain.ends_with(&format!(".{}", candidate))
            });
            if matched {
                return Ok(Classification {
                    category: rule.category.clone(),
                    subcategories: rule.subcategories.clone(),
                    tags: Vec::new(),
                });
            }
        }
        Err(ClassifyError::NoMatch { domain })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// External Command
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs an external classifier with the domain as its last argument and
/// reads a `{category, subcategories, tags}` JSON object from stdout.
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(config: &CommandClassifierConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn unavailable(&self, details: impl Into<String>) -> ClassifyError {
        ClassifyError::Unavailable {
            classifier: self.name().to_string(),
            details: details.into(),
        }
    }

    fn run(&self, domain: &str) -> Result<String, ClassifyError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(domain)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| self.unavailable(format!("failed to spawn {}: {}", self.program, err)))?;

        // Drained concurrently so a chatty classifier can't fill the pipe and
        // stall until the deadline.
        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut output = String::new();
                stdout.read_to_string(&mut output).map(|_| output)
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(self.unavailable("timed out"));
                }
                Ok(None) => thread::sleep(Duration::from_millis(COMMAND_POLL_INTERVAL_MS)),
                Err(err) => return Err(self.unavailable(format!("wait failed: {}", err))),
            }
        };

        if !status.success() {
            return Err(self.unavailable(format!("exited with {}", status)));
        }

        match reader {
            Some(reader) => reader
                .join()
                .map_err(|_| self.unavailable("output reader panicked"))?
                .map_err(|err| self.unavailable(format!("failed to read output: {}", err))),
            None => Ok(String::new()),
        }
    }
}

impl Classifier for CommandClassifier {
    fn name(&self) -> &str {
        "command"
    }

    fn classify(&self, domain: &str) -> Result<Classification, ClassifyError> {
        let output = self.run(domain)?;
        parse_classification_response(&output).map_err(|details| ClassifyError::InvalidResponse {
            classifier: self.name().to_string(),
            details,
        })
    }
}

/// Extracts the first JSON object from free-form classifier output (which may
/// wrap it in prose or code fences). An empty category is rejected.
pub fn parse_classification_response(text: &str) -> Result<Classification, String> {
    let object = RE_JSON_OBJECT
        .find(text)
        .ok_or_else(|| "no JSON object in response".to_string())?;
    let parsed: Classification = serde_json::from_str(object.as_str())
        .map_err(|err| format!("response JSON did not match: {}", err))?;
    if parsed.category.trim().is_empty() {
        return Err("response category was empty".to_string());
    }
    Ok(Classification {
        category: parsed.category.trim().to_string(),
        subcategories: parsed.subcategories,
        tags: parsed.tags,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Chain
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ClassifierChain {
    strategies: Vec<Box<dyn Classifier>>,
}

impl ClassifierChain {
    pub fn new(strategies: Vec<Box<dyn Classifier>>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        let mut strategies: Vec<Box<dyn Classifier>> =
            vec![Box::new(RuleTableClassifier::new(config.rules.clone()))];
        if let Some(command) = &config.command {
            strategies.push(Box::new(CommandClassifier::new(command)));
        }
        Self::new(strategies)
    }

    pub fn classify(&self, domain: &str) -> Classification {
        for strategy in &self.strategies {
            match strategy.classify(domain) {
                Ok(classification) => {
                    debug!(
                        domain,
                        classifier = strategy.name(),
                        category = %classification.category,
                        "Domain classified"
                    );
                    return classification;
                }
                Err(ClassifyError::NoMatch { .. }) => {
                    debug!(domain, classifier = strategy.name(), "No match; trying next");
                }
                Err(err) => {
                    warn!(domain, classifier = strategy.name(), error = %err, "Classifier failed");
                }
            }
        }
        debug!(domain, "All classifiers failed; recording as uncategorized");
        Classification::uncategorized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNCATEGORIZED;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        result: fn() -> Result<Classification, ClassifyError>,
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn classify(&self, _domain: &str) -> Result<Classification, ClassifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn sports() -> Result<Classification, ClassifyError> {
        Ok(Classification {
            category: "Sports".to_string(),
            subcategories: vec!["Football".to_string()],
            tags: vec![],
        })
    }

    fn offline() -> Result<Classification, ClassifyError> {
        Err(ClassifyError::Unavailable {
            classifier: "scripted".to_string(),
            details: "offline".to_string(),
        })
    }

    #[test]
    fn rule_table_matches_subdomains_case_insensitively() {
        let classifier = RuleTableClassifier::new(ClassifierConfig::default().rules);
        assert_eq!(
            classifier.classify("WWW.BBC.com").expect("match").category,
            "News"
        );
        assert_eq!(
            classifier.classify("instagram.com").expect("match").category,
            "Social Media"
        );
        assert!(matches!(
            classifier.classify("notbbc.com"),
            Err(ClassifyError::NoMatch { .. })
        ));
    }

    #[test]
    fn chain_falls_through_on_failure_only() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let chain = ClassifierChain::new(vec![
            Box::new(Scripted {
                result: offline,
                calls: first_calls.clone(),
            }),
            Box::new(Scripted {
                result: sports,
                calls: second_calls.clone(),
            }),
            Box::new(Scripted {
                result: offline,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        ]);
        let result = chain.classify("scores.example");
        assert_eq!(result.category, "Sports");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_chain_is_uncategorized() {
        let chain = ClassifierChain::new(vec![Box::new(Scripted {
            result: offline,
            calls: Arc::new(AtomicUsize::new(0)),
        })]);
        let result = chain.classify("unknown.example");
        assert_eq!(result.category, UNCATEGORIZED);
        assert!(result.subcategories.is_empty());
    }

    #[test]
    fn parses_response_wrapped_in_prose() {
        let text = "Sure! ```json\n{\"category\": \"News\", \"subcategories\": [\"World\"], \"tags\": [\"daily\"]}\n```";
        let parsed = parse_classification_response(text).expect("parse");
        assert_eq!(parsed.category, "News");
        assert_eq!(parsed.subcategories, vec!["World".to_string()]);
        assert_eq!(parsed.tags, vec!["daily".to_string()]);
    }

    #[test]
    fn rejects_empty_or_missing_category() {
        assert!(parse_classification_response("{\"category\": \"  \"}").is_err());
        assert!(parse_classification_response("{\"tags\": []}").is_err());
        assert!(parse_classification_response("no json here").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_reads_stdout() {
        let classifier = CommandClassifier::new(&CommandClassifierConfig {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "printf '{\"category\":\"Reference\",\"subcategories\":[\"%s\"]}' \"$0\"".to_string(),
            ],
            timeout_ms: 5_000,
        });
        let result = classifier.classify("docs.example").expect("classify");
        assert_eq!(result.category, "Reference");
        assert_eq!(result.subcategories, vec!["docs.example".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_reads_output_larger_than_a_pipe_buffer() {
        let classifier = CommandClassifier::new(&CommandClassifierConfig {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "yes x | head -c 200000; printf '{\"category\":\"Reference\"}'".to_string(),
            ],
            timeout_ms: 5_000,
        });
        let result = classifier.classify("docs.example").expect("classify");
        assert_eq!(result.category, "Reference");
    }

    #[test]
    fn missing_command_is_unavailable() {
        let classifier = CommandClassifier::new(&CommandClassifierConfig {
            program: "/nonexistent/tabtime-classifier".to_string(),
            args: vec![],
            timeout_ms: 1_000,
        });
        assert!(matches!(
            classifier.classify("docs.example"),
            Err(ClassifyError::Unavailable { .. })
        ));
    }
}
