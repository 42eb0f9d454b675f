//! Weighted redirect selection.
//!
//! A [`RedirectTable`] is compiled from the ordered `redirects` list of the [`Config`]. Each
//! rule has a set of [`Glob`] patterns and a list of weighted targets. The first rule with a
//! matching pattern picks one of its targets through a [`WeightedSequence`], so that traffic is
//! spread deterministically according to the weights. A target with an empty base URL stands
//! for this server itself.
//!
//! When this server cannot serve a file (for example because it is too large to be cached),
//! the same rule is asked again with the local target excluded. The remaining targets form a
//! different weight tuple, which gets its own sequence. Sequences are remembered per rule and
//! weight tuple, so repeated requests continue the rotation instead of restarting it.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::config::{Config, RedirectConfig};

mod glob;
mod sequence;

pub use glob::{Glob, PatternError};
pub use sequence::WeightedSequence;

/// A weighted destination of a [`RedirectRule`].
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Always positive.
    pub weight: f64,
    /// Empty for this server.
    pub base_url: String,
}

impl Target {
    pub fn is_local(&self) -> bool {
        self.base_url.is_empty()
    }
}

/// The identity of a weight tuple, used to look up its [`WeightedSequence`].
type WeightsKey = Vec<u64>;

/// A compiled entry of the [`RedirectTable`].
#[derive(Debug)]
pub struct RedirectRule {
    patterns: Vec<Glob>,
    targets: Vec<Target>,
    sequences: Mutex<HashMap<WeightsKey, WeightedSequence>>,
}

impl RedirectRule {
    /// Compiles the rule, dropping disabled targets and normalizing negative weights.
    pub fn compile(config: &RedirectConfig) -> Result<Self, PatternError> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| Glob::new(pattern))
            .collect::<Result<_, _>>()?;

        let targets = config
            .targets
            .iter()
            .filter(|target| target.weight != 0.0 && target.weight.is_finite())
            .map(|target| Target {
                weight: target.weight.abs(),
                base_url: target.base_url.clone(),
            })
            .collect();

        Ok(Self {
            patterns,
            targets,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Picks the next target, or `None` if no target is eligible.
    fn select(&self, disable_self_host: bool) -> Option<&Target> {
        let eligible: Vec<&Target> = self
            .targets
            .iter()
            .filter(|target| !disable_self_host || !target.is_local())
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let key: WeightsKey = eligible.iter().map(|t| t.weight.to_bits()).collect();
        let index = {
            let mut sequences = self.sequences.lock().unwrap();
            sequences
                .entry(key)
                .or_insert_with(|| {
                    let weights: Vec<f64> = eligible.iter().map(|t| t.weight).collect();
                    WeightedSequence::new(&weights)
                })
                .next()?
        };

        eligible.get(index).copied()
    }
}

/// The outcome of [`RedirectTable::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Serve the file from this server.
    Local,
    /// Redirect to the given mirror base URL.
    Remote(String),
}

/// The ordered, compiled list of [`RedirectRule`]s.
#[derive(Debug, Default)]
pub struct RedirectTable {
    rules: Vec<RedirectRule>,
}

impl RedirectTable {
    pub fn compile(rules: &[RedirectConfig]) -> Result<Self, PatternError> {
        let rules = rules
            .iter()
            .map(RedirectRule::compile)
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::compile(&config.redirects).context("failed to compile redirect table")
    }

    pub fn rules(&self) -> &[RedirectRule] {
        &self.rules
    }

    /// Picks the destination for `path`.
    ///
    /// Only the first rule matching `path` is considered. With `disable_self_host`, the local
    /// target of that rule is skipped. Returns `None` if no rule matches, or if the matching
    /// rule has no eligible target left.
    pub fn resolve(&self, path: &str, disable_self_host: bool) -> Option<Destination> {
        let rule = self.rules.iter().find(|rule| rule.is_match(path))?;
        let target = rule.select(disable_self_host)?;

        Some(if target.is_local() {
            Destination::Local
        } else {
            Destination::Remote(target.base_url.clone())
        })
    }
}
