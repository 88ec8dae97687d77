use recorder_types::split_entity_id;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub entities: Vec<String>,
    pub domains: Vec<String>,
    pub entity_globs: Vec<String>,
}

impl FilterRules {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.domains.is_empty() && self.entity_globs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityFilterConfig {
    pub include: FilterRules,
    pub exclude: FilterRules,
}

/// Decides whether an entity is recorded (or, for entity purges, selected).
///
/// Precedence, first match wins:
/// 1. explicitly included entity
/// 2. explicitly excluded entity
/// 3. excluded glob
/// 4. included glob
/// 5. excluded domain
/// 6. included domain
///
/// An entity matching nothing passes only when no include rules exist.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    include: CompiledRules,
    exclude: CompiledRules,
}

#[derive(Debug, Clone, Default)]
struct CompiledRules {
    entities: HashSet<String>,
    domains: HashSet<String>,
    globs: Option<Regex>,
}

impl CompiledRules {
    fn compile(rules: &FilterRules) -> StoreResult<Self> {
        Ok(Self {
            entities: rules.entities.iter().cloned().collect(),
            domains: rules.domains.iter().cloned().collect(),
            globs: compile_globs(&rules.entity_globs)?,
        })
    }

    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.domains.is_empty() && self.globs.is_none()
    }

    fn glob_matches(&self, entity_id: &str) -> bool {
        self.globs
            .as_ref()
            .map(|re| re.is_match(entity_id))
            .unwrap_or(false)
    }
}

impl EntityFilter {
    pub fn new(config: &EntityFilterConfig) -> StoreResult<Self> {
        Ok(Self {
            include: CompiledRules::compile(&config.include)?,
            exclude: CompiledRules::compile(&config.exclude)?,
        })
    }

    /// A filter selecting exactly the given entities, domains and globs.
    pub fn include_only(
        entity_ids: &[String],
        domains: &[String],
        entity_globs: &[String],
    ) -> StoreResult<Self> {
        Self::new(&EntityFilterConfig {
            include: FilterRules {
                entities: entity_ids.to_vec(),
                domains: domains.to_vec(),
                entity_globs: entity_globs.to_vec(),
            },
            exclude: FilterRules::default(),
        })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        if self.include.entities.contains(entity_id) {
            return true;
        }
        if self.exclude.entities.contains(entity_id) {
            return false;
        }
        if self.exclude.glob_matches(entity_id) {
            return false;
        }
        if self.include.glob_matches(entity_id) {
            return true;
        }
        let domain = split_entity_id(entity_id)
            .map(|(domain, _)| domain)
            .unwrap_or_default();
        if self.exclude.domains.contains(domain) {
            return false;
        }
        if self.include.domains.contains(domain) {
            return true;
        }
        self.include.is_empty()
    }
}

fn compile_globs(globs: &[String]) -> StoreResult<Option<Regex>> {
    if globs.is_empty() {
        return Ok(None);
    }
    let alternatives: Vec<String> = globs.iter().map(|g| glob_to_pattern(g)).collect();
    let pattern = format!("^(?:{})$", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|err| StoreError::InvalidConfig(format!("invalid entity glob: {err}")))
}

fn glob_to_pattern(glob: &str) -> String {
    let mut pattern = String::with_capacity(glob.len() * 2);
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entities: &[&str], domains: &[&str], globs: &[&str]) -> FilterRules {
        FilterRules {
            entities: entities.iter().map(|s| s.to_string()).collect(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            entity_globs: globs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = EntityFilter::allow_all();
        assert!(filter.matches("light.kitchen"));
        assert!(filter.matches("nodomain"));
    }

    #[test]
    fn exclude_only() {
        let filter = EntityFilter::new(&EntityFilterConfig {
            include: FilterRules::default(),
            exclude: rules(&["sensor.noisy"], &["media_player"], &["*_rssi"]),
        })
        .unwrap();

        assert!(!filter.matches("sensor.noisy"));
        assert!(!filter.matches("media_player.tv"));
        assert!(!filter.matches("sensor.wifi_rssi"));
        assert!(filter.matches("sensor.temperature"));
    }

    #[test]
    fn include_only() {
        let filter = EntityFilter::include_only(
            &["switch.pump".to_string()],
            &["light".to_string()],
            &["sensor.kitchen_*".to_string()],
        )
        .unwrap();

        assert!(filter.matches("switch.pump"));
        assert!(filter.matches("light.hall"));
        assert!(filter.matches("sensor.kitchen_humidity"));
        assert!(!filter.matches("switch.heater"));
        assert!(!filter.matches("sensor.garage_humidity"));
    }

    #[test]
    fn precedence_between_include_and_exclude() {
        let filter = EntityFilter::new(&EntityFilterConfig {
            include: rules(&["sensor.keep_rssi"], &["sensor"], &[]),
            exclude: rules(&["sensor.secret"], &[], &["*_rssi"]),
        })
        .unwrap();

        assert!(filter.matches("sensor.keep_rssi"));
        assert!(!filter.matches("sensor.other_rssi"));
        assert!(!filter.matches("sensor.secret"));
        assert!(filter.matches("sensor.power"));
        assert!(!filter.matches("light.hall"));
    }

    #[test]
    fn glob_metacharacters_are_literal() {
        let filter = EntityFilter::include_only(&[], &[], &["sensor.a+b?".to_string()]).unwrap();
        assert!(filter.matches("sensor.a+bc"));
        assert!(!filter.matches("sensor.aabc"));
    }
}
