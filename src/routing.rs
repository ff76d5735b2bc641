//! Channel routing: maps a mesh channel label (`LongFast`, `MediumSlow`, ...)
//! to a chat destination using ordered regex rules. First match wins.
//!
//! Rules are compiled once per deployment. `Regex::is_match` keeps no scan
//! position between calls, so resolving the same label twice always agrees.

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::config::ChannelRegexRule;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid routing.channelRegex[{index}] pattern '{pattern}': {reason}")]
    Pattern {
        index: usize,
        pattern: String,
        reason: String,
    },
    #[error("Invalid routing.channelRegex[{index}].flags '{flags}'")]
    Flags { index: usize, flags: String },
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    regex: Regex,
    destination: String,
}

impl CompiledRule {
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_match(&self, label: &str) -> bool {
        self.regex.is_match(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    rules: Vec<CompiledRule>,
}

/// JavaScript-style flag letters. `g` and `y` only affect stateful scanning
/// and are accepted as no-ops.
fn apply_flags(builder: &mut RegexBuilder, flags: &str) -> Result<(), char> {
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'u' => {
                builder.unicode(true);
            }
            'g' | 'y' => {}
            other => return Err(other),
        }
    }
    Ok(())
}

impl ChannelRouter {
    pub fn compile(rules: &[ChannelRegexRule]) -> Result<Self, RouteError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let mut builder = RegexBuilder::new(&rule.pattern);
            if let Some(flags) = rule.flags.as_deref() {
                apply_flags(&mut builder, flags).map_err(|_| RouteError::Flags {
                    index,
                    flags: flags.to_string(),
                })?;
            }
            let regex = builder.build().map_err(|e| RouteError::Pattern {
                index,
                pattern: rule.pattern.clone(),
                reason: e.to_string(),
            })?;
            compiled.push(CompiledRule {
                regex,
                destination: rule.discord_channel_id.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn resolve(&self, label: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(label))
            .map(CompiledRule::destination)
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
