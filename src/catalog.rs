//! Test catalog: the read-only mapping from test name to its questions and
//! policy.
//!
//! Built once at startup, before the listener starts, and never mutated
//! afterwards. Handler tasks share it behind an `Arc` without further
//! synchronization.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::config::{Config, TestConfig};
use crate::parser::{self, Test};

/// Immutable per-test rules.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Users allowed to take the test
    pub valid_users: HashSet<String>,
    /// Maximum attempt duration
    pub duration: Duration,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Whether the numeric score is disclosed at completion
    pub show_results: bool,
    /// Static description returned by `get_banner`
    pub description: String,
}

impl Policy {
    fn from_config(test: &TestConfig) -> Self {
        Policy {
            valid_users: test.valid_users.iter().cloned().collect(),
            duration: Duration::seconds(test.duration as i64),
            max_attempts: test.number_of_attempts,
            show_results: test.show_results,
            description: test.description.clone(),
        }
    }
}

/// One catalog entry: the parsed test plus its policy.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub test: Arc<Test>,
    pub policy: Policy,
}

/// Read-only, process-lifetime mapping from test name to its entry.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            entries: HashMap::new(),
        }
    }

    /// Build the catalog from configuration, loading one definition file
    /// per test entry. A test whose file fails to load is logged and
    /// skipped; the rest of the catalog still loads.
    pub fn load(config: &Config) -> Self {
        let mut catalog = Catalog::new();

        for test_config in &config.tests {
            let path = config.test_path.join(&test_config.name);
            match parser::load_test(&path, &test_config.name) {
                Ok(test) => {
                    info!(
                        test = %test.name,
                        questions = test.questions.len(),
                        "Loaded test"
                    );
                    catalog.insert(test, Policy::from_config(test_config));
                }
                Err(e) => {
                    warn!(test = %test_config.name, error = %e, "Skipping test");
                }
            }
        }

        catalog
    }

    /// Register a test with its policy. Duplicate names replace the
    /// previous entry.
    pub fn insert(&mut self, test: Test, policy: Policy) {
        let name = test.name.clone();
        if self
            .entries
            .insert(
                name.clone(),
                CatalogEntry {
                    test: Arc::new(test),
                    policy,
                },
            )
            .is_some()
        {
            warn!(test = %name, "Duplicate test entry replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Whether any policy in the catalog recognizes this user.
    pub fn knows_user(&self, user: &str) -> bool {
        self.entries
            .values()
            .any(|entry| entry.policy.valid_users.contains(user))
    }

    /// Names of tests the user is allowed to take, sorted.
    pub fn tests_for(&self, user: &str) -> Vec<String> {
        let mut tests: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.policy.valid_users.contains(user))
            .map(|(name, _)| name.clone())
            .collect();
        tests.sort();
        tests
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
