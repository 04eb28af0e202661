//! Rule engine: evaluates trigger conditions against incoming events.
//!
//! For each incoming event:
//! 1. Select enabled rules whose trigger kind matches the event kind
//! 2. Check the rule's active window (local day of week + time of day)
//! 3. Evaluate the compiled condition against the event payload
//! 4. Emit one candidate notification per matching rule
//!
//! Rule sets are compiled once at load time and swapped atomically on reload;
//! evaluation works on a snapshot and never re-parses expressions.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, Utc, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use herald_common::types::{
    BoundVariables, CandidateNotification, Event, EventKind, Priority, TargetScope,
};

use crate::condition::{Condition, ConditionError};
use crate::template::TemplateStore;

/// Errors raised while loading a rule set. A failed load never replaces the
/// rules currently in service.
#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed rule definitions: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("rule '{rule_id}' has an invalid condition: {source}")]
    InvalidCondition {
        rule_id: String,
        source: ConditionError,
    },

    #[error("rule '{rule_id}' references unknown template '{template_id}'")]
    UnknownTemplate {
        rule_id: String,
        template_id: String,
    },
}

/// Condition as written in configuration: an expression string or a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Expression(String),
    Tree(Condition),
}

/// Trigger of a rule: event kind plus optional condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub kind: EventKind,
    #[serde(default)]
    pub condition: Option<ConditionSpec>,
}

/// Days/time-of-day restriction on when a rule may fire.
///
/// Empty `days` means every day; a missing bound means open-ended. The time
/// range is half-open `[start, end)` and wraps midnight when `start > end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub start: Option<NaiveTime>,
    #[serde(default)]
    pub end: Option<NaiveTime>,
}

impl ActiveWindow {
    pub fn applies(&self, local: NaiveDateTime) -> bool {
        use chrono::Datelike;

        if !self.days.is_empty() && !self.days.contains(&local.weekday()) {
            return false;
        }

        let time = local.time();
        match (self.start, self.end) {
            (None, None) => true,
            (Some(start), None) => time >= start,
            (None, Some(end)) => time < end,
            (Some(start), Some(end)) if start <= end => time >= start && time < end,
            (Some(start), Some(end)) => time >= start || time < end,
        }
    }
}

/// A rule as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: TriggerSpec,
    pub template_id: String,
    pub priority: Priority,
    /// Category stamped on every candidate this rule produces.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub active_window: Option<ActiveWindow>,
    /// Static narrowing of recipients (e.g. a rule for one sector).
    #[serde(default)]
    pub target_scope: Option<TargetScope>,
}

fn default_enabled() -> bool {
    true
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub enabled: bool,
    pub kind: EventKind,
    pub condition: Option<Condition>,
    pub template_id: String,
    pub priority: Priority,
    pub category: Option<String>,
    pub active_window: Option<ActiveWindow>,
    pub target_scope: Option<TargetScope>,
}

impl Rule {
    fn compile(spec: RuleSpec) -> Result<Self, RuleLoadError> {
        let condition = match spec.trigger.condition {
            None => None,
            Some(ConditionSpec::Tree(tree)) => Some(tree),
            Some(ConditionSpec::Expression(expr)) => {
                Some(
                    Condition::parse(&expr).map_err(|source| RuleLoadError::InvalidCondition {
                        rule_id: spec.id.clone(),
                        source,
                    })?,
                )
            }
        };

        Ok(Self {
            id: spec.id,
            enabled: spec.enabled,
            kind: spec.trigger.kind,
            condition,
            template_id: spec.template_id,
            priority: spec.priority,
            category: spec.category,
            active_window: spec.active_window,
            target_scope: spec.target_scope,
        })
    }
}

/// Compile and validate a set of rule specs against the template store.
pub fn compile_rules(
    specs: Vec<RuleSpec>,
    templates: &TemplateStore,
) -> Result<Vec<Rule>, RuleLoadError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(specs.len());

    for spec in specs {
        if !seen.insert(spec.id.clone()) {
            return Err(RuleLoadError::DuplicateId(spec.id));
        }
        if !templates.contains(&spec.template_id) {
            return Err(RuleLoadError::UnknownTemplate {
                rule_id: spec.id,
                template_id: spec.template_id,
            });
        }
        rules.push(Rule::compile(spec)?);
    }

    Ok(rules)
}

/// Parse rule specs from a JSON array.
pub fn parse_rule_specs(json: &str) -> Result<Vec<RuleSpec>, RuleLoadError> {
    Ok(serde_json::from_str(json)?)
}

/// Read rule specs from a JSON file.
pub fn load_rule_specs(path: &str) -> Result<Vec<RuleSpec>, RuleLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
        path: path.to_string(),
        source,
    })?;
    parse_rule_specs(&raw)
}

/// Reloadable rule engine.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
    offset: FixedOffset,
}

impl RuleEngine {
    /// Build an engine from already-compiled rules. `offset` is the local
    /// timezone used for active windows.
    pub fn new(rules: Vec<Rule>, offset: FixedOffset) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            offset,
        }
    }

    /// Compile `specs` and swap them in. On error the current rules stay active.
    pub fn reload(
        &self,
        specs: Vec<RuleSpec>,
        templates: &TemplateStore,
    ) -> Result<usize, RuleLoadError> {
        let compiled = compile_rules(specs, templates)?;
        let count = compiled.len();
        *self.rules.write() = Arc::new(compiled);
        tracing::info!(rules = count, "Rule set reloaded");
        Ok(count)
    }

    /// Number of loaded rules (enabled or not).
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    /// Evaluate an event against every applicable rule.
    ///
    /// Rules whose condition references a missing field or compares the wrong
    /// type are skipped for this event; other rules are still evaluated.
    /// The order of the returned candidates is unspecified.
    pub fn evaluate(&self, event: &Event) -> Vec<CandidateNotification> {
        let rules = self.snapshot();
        let local = event.occurred_at.with_timezone(&self.offset).naive_local();
        let mut candidates = Vec::new();

        for rule in rules.iter() {
            if !rule.enabled || rule.kind != event.kind {
                continue;
            }

            if rule
                .active_window
                .as_ref()
                .is_some_and(|window| !window.applies(local))
            {
                tracing::trace!(rule_id = %rule.id, "Rule outside active window");
                continue;
            }

            let matched = match &rule.condition {
                None => true,
                Some(condition) => match condition.evaluate(&event.payload) {
                    Ok(matched) => matched,
                    Err(e) => {
                        tracing::warn!(
                            rule_id = %rule.id,
                            event_id = %event.id,
                            error = %e,
                            "Skipping rule, condition could not be evaluated"
                        );
                        continue;
                    }
                },
            };

            if !matched {
                continue;
            }

            let candidate = Self::build_candidate(rule, event);
            tracing::debug!(
                rule_id = %rule.id,
                event_id = %event.id,
                candidate_id = %candidate.id,
                priority = %candidate.priority,
                "Rule matched"
            );
            candidates.push(candidate);
        }

        candidates
    }

    fn build_candidate(rule: &Rule, event: &Event) -> CandidateNotification {
        let mut values = event.payload.as_object().cloned().unwrap_or_default();
        values.insert(
            "event_kind".to_string(),
            serde_json::Value::String(event.kind.to_string()),
        );
        values.insert(
            "occurred_at".to_string(),
            serde_json::Value::String(event.occurred_at.to_rfc3339()),
        );

        let instrument_codes = string_list(&event.payload, &["instrument_codes", "instrument_code"]);

        let mut categories = Vec::new();
        if let Some(category) = &rule.category {
            categories.push(category.clone());
        }
        for category in string_list(&event.payload, &["categories", "category"]) {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }

        let mut scope = rule.target_scope.clone().unwrap_or_default();
        if let Some(users) = event.payload.get("target_user_ids").and_then(|v| v.as_array()) {
            for user_id in users
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Uuid::parse_str(s).ok())
            {
                if !scope.user_ids.contains(&user_id) {
                    scope.user_ids.push(user_id);
                }
            }
        }

        if event.payload.get("online_only").and_then(|v| v.as_bool()) == Some(true) {
            scope.online_only = true;
        }

        CandidateNotification {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            template_id: rule.template_id.clone(),
            priority: rule.priority,
            categories,
            bound_variables: BoundVariables {
                values,
                instrument_codes,
            },
            target_scope: (!scope.is_empty()).then_some(scope),
            schedule_at: instant(&event.payload, "schedule_at"),
            expires_at: instant(&event.payload, "expires_at"),
            created_at: Utc::now(),
        }
    }
}

/// RFC 3339 timestamp under `key`, if present and well formed.
fn instant(payload: &serde_json::Value, key: &str) -> Option<DateTime<Utc>> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Collect strings from the first present key; accepts a string or an array of strings.
fn string_list(payload: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys {
        match payload.get(key) {
            Some(serde_json::Value::String(s)) => out.push(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                out.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_string))
            }
            _ => {}
        }
    }
    out
}

/// Built-in rules used when no rule file is configured.
pub fn default_rule_specs() -> Vec<RuleSpec> {
    let spec = |id: &str,
                kind: EventKind,
                condition: &str,
                template_id: &str,
                priority: Priority,
                category: &str| RuleSpec {
        id: id.to_string(),
        enabled: true,
        trigger: TriggerSpec {
            kind,
            condition: Some(ConditionSpec::Expression(condition.to_string())),
        },
        template_id: template_id.to_string(),
        priority,
        category: Some(category.to_string()),
        active_window: None,
        target_scope: None,
    };

    let mut daily_summary = spec(
        "daily_summary",
        EventKind::Time,
        "time_of_day == 15:30",
        "market_analysis",
        Priority::Low,
        "analysis",
    );
    daily_summary.active_window = Some(ActiveWindow {
        days: vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ],
        start: None,
        end: None,
    });

    vec![
        spec(
            "high_impact_news",
            EventKind::News,
            "relevance >= 0.8 AND categories intersects [breaking, major]",
            "news_breakout",
            Priority::High,
            "news",
        ),
        spec(
            "price_movement_alert",
            EventKind::Price,
            "abs_change_pct >= 5",
            "price_alert",
            Priority::Medium,
            "price",
        ),
        spec(
            "technical_signal",
            EventKind::TechnicalSignal,
            "confidence >= 0.7",
            "technical_signal",
            Priority::Medium,
            "analysis",
        ),
        daily_summary,
    ]
}
