// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port eligibility filtering.
//!
//! Configuration lists port rules as plain strings. A rule starting with
//! `regex:` is compiled as a regular expression; anything else is a literal
//! path prefix. A port is eligible when it matches *any* rule of either
//! kind, so rule order never matters.
//!
//! The filter is compiled once from configuration and passed by reference;
//! there is no lazy per-call compilation.

use regex::Regex;

use crate::error::ConfigError;

/// Marker that distinguishes regex rules from literal prefixes.
const REGEX_RULE_PREFIX: &str = "regex:";

/// Compiled port selection rules.
///
/// # Examples
///
/// ```
/// use uartmq::filter::PortFilter;
///
/// let rules = vec![
///     "/dev/ttyACM".to_string(),
///     "regex:^/dev/ttyUSB[0-9]+$".to_string(),
/// ];
/// let filter = PortFilter::compile(&rules).unwrap();
///
/// assert!(filter.matches("/dev/ttyACM0"));
/// assert!(filter.matches("/dev/ttyUSB3"));
/// assert!(!filter.matches("/dev/ttyS0"));
/// ```
#[derive(Debug)]
pub struct PortFilter {
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl PortFilter {
    /// Compiles a list of port rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPortRule`] if a `regex:` rule fails to
    /// compile.
    pub fn compile(rules: &[String]) -> Result<Self, ConfigError> {
        let mut prefixes = Vec::new();
        let mut patterns = Vec::new();

        for rule in rules {
            if let Some(pattern) = rule.strip_prefix(REGEX_RULE_PREFIX) {
                let regex =
                    Regex::new(pattern).map_err(|source| ConfigError::InvalidPortRule {
                        rule: rule.clone(),
                        source,
                    })?;
                patterns.push(regex);
            } else {
                prefixes.push(rule.clone());
            }
        }

        Ok(Self { prefixes, patterns })
    }

    /// Returns true if the port path matches any configured rule.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
            || self.patterns.iter().any(|pattern| pattern.is_match(path))
    }

    /// Returns true if no rules are configured.
    ///
    /// An empty filter matches nothing; the gateway manages no ports.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.patterns.is_empty()
    }
}
