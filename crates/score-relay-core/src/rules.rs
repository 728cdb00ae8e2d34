use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ensure_non_empty, CoreError, EntityMetrics, FactValue};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConditionError {
    #[error("malformed condition '{raw}': {reason}")]
    Malformed { raw: String, reason: String },
    #[error("condition references an empty fact name")]
    EmptyFact,
    #[error("condition literal for '{fact}' is not finite")]
    NonFiniteLiteral { fact: String },
    #[error("fact '{fact}' holds a non-finite value")]
    NonFiniteFact { fact: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Comparator {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    /// Two-character operators come first so `>=` is never read as `>`.
    const PARSE_ORDER: [Self; 6] = [Self::Ge, Self::Le, Self::Ne, Self::Eq, Self::Gt, Self::Lt];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::PARSE_ORDER
            .into_iter()
            .find(|comparator| comparator.as_str() == value)
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

/// A typed `fact <comparator> literal` test, compiled once at rule definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Compare {
        fact: String,
        comparator: Comparator,
        literal: FactValue,
    },
    /// Text that could not be compiled. Never matches.
    Malformed { raw: String, reason: String },
}

impl Condition {
    #[must_use]
    pub fn compare(
        fact: impl Into<String>,
        comparator: Comparator,
        literal: impl Into<FactValue>,
    ) -> Self {
        Self::Compare {
            fact: fact.into(),
            comparator,
            literal: literal.into(),
        }
    }

    /// Compiles `"<fact> <op> <literal>"`. Unparsable text becomes
    /// [`Condition::Malformed`] instead of an error.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let malformed = |reason: &str| Self::Malformed {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let Some((comparator, (lhs, rhs))) = Comparator::PARSE_ORDER
            .into_iter()
            .find_map(|comparator| raw.split_once(comparator.as_str()).map(|split| (comparator, split)))
        else {
            return malformed("no comparator found");
        };

        let fact = lhs.trim();
        if fact.is_empty() {
            return malformed("missing fact name");
        }
        if !fact
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return malformed("fact name must be alphanumeric or '_'");
        }

        let literal = match rhs.trim() {
            "True" | "true" => FactValue::Flag(true),
            "False" | "false" => FactValue::Flag(false),
            other => match other.trim_start_matches('+').parse::<f64>() {
                Ok(value) if value.is_finite() => FactValue::Number(value),
                _ => return malformed("literal must be a finite number or boolean"),
            },
        };

        Self::Compare {
            fact: fact.to_string(),
            comparator,
            literal,
        }
    }

    /// Tests the condition against `metrics`; a missing fact reads as `0`.
    ///
    /// # Errors
    /// Returns [`ConditionError`] for malformed definitions or non-finite
    /// operands. Callers treat any error as a non-match.
    pub fn evaluate(&self, metrics: &EntityMetrics) -> Result<bool, ConditionError> {
        match self {
            Self::Malformed { raw, reason } => Err(ConditionError::Malformed {
                raw: raw.clone(),
                reason: reason.clone(),
            }),
            Self::Compare {
                fact,
                comparator,
                literal,
            } => {
                if fact.trim().is_empty() {
                    return Err(ConditionError::EmptyFact);
                }
                let rhs = literal.as_number();
                if !rhs.is_finite() {
                    return Err(ConditionError::NonFiniteLiteral { fact: fact.clone() });
                }
                let lhs = metrics.numeric(fact);
                if !lhs.is_finite() {
                    return Err(ConditionError::NonFiniteFact { fact: fact.clone() });
                }
                Ok(comparator.holds(lhs, rhs))
            }
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compare {
                fact,
                comparator,
                literal,
            } => write!(f, "{fact} {} {literal}", comparator.as_str()),
            Self::Malformed { raw, .. } => write!(f, "{raw} (malformed)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    Bonus { points: u32 },
    Penalty { points: u32 },
    Warning { text: String },
    Recommendation { text: String },
    TrustSignal { text: String },
    Tag { key: String, value: String },
}

impl Effect {
    fn bonus(points: u32) -> Self {
        Self::Bonus { points }
    }

    fn penalty(points: u32) -> Self {
        Self::Penalty { points }
    }

    fn warning(text: &str) -> Self {
        Self::Warning {
            text: text.to_string(),
        }
    }

    fn recommendation(text: &str) -> Self {
        Self::Recommendation {
            text: text.to_string(),
        }
    }

    fn trust_signal(text: &str) -> Self {
        Self::TrustSignal {
            text: text.to_string(),
        }
    }

    fn tag(key: &str, value: &str) -> Self {
        Self::Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub name: String,
    pub description: String,
    pub conditions: Vec<Condition>,
    pub effects: Vec<Effect>,
    pub priority: i32,
}

impl Rule {
    /// Conditions are AND-combined; any condition error is a non-match.
    ///
    /// # Errors
    /// Returns the first [`ConditionError`] hit while testing conditions.
    pub fn matches(&self, metrics: &EntityMetrics) -> Result<bool, ConditionError> {
        for condition in &self.conditions {
            if !condition.evaluate(metrics)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[must_use]
    pub fn from_definition(definition: RuleDefinition) -> Self {
        Self {
            name: definition.name,
            description: definition.description,
            conditions: definition.when.iter().map(|raw| Condition::parse(raw)).collect(),
            effects: definition.then,
            priority: definition.priority,
        }
    }
}

/// File form of a rule: conditions as text, compiled by [`Rule::from_definition`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub then: Vec<Effect>,
    #[serde(default)]
    pub priority: i32,
}

/// Decodes a JSON array of [`RuleDefinition`]s and compiles them.
///
/// # Errors
/// Returns [`CoreError::Configuration`] when the payload does not decode, a
/// rule name is empty, or two rules share a name.
pub fn load_rules_json(value: &Value) -> Result<Vec<Rule>, CoreError> {
    let definitions: Vec<RuleDefinition> = serde_json::from_value(value.clone())
        .map_err(|err| CoreError::Configuration(format!("invalid rule set JSON payload: {err}")))?;

    let mut names = BTreeSet::new();
    let mut rules = Vec::with_capacity(definitions.len());
    for definition in definitions {
        ensure_non_empty("rule name", &definition.name)
            .map_err(|err| CoreError::Configuration(err.to_string()))?;
        if !names.insert(definition.name.clone()) {
            return Err(CoreError::Configuration(format!(
                "duplicate rule name: {}",
                definition.name
            )));
        }
        rules.push(Rule::from_definition(definition));
    }

    Ok(rules)
}

/// The built-in reputation rule set, in declaration order.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn default_rules() -> Vec<Rule> {
    use Comparator::{Eq, Ge, Gt, Lt};

    vec![
        Rule {
            name: "elite_defi_user".to_string(),
            description: "Identifies power users across many protocols".to_string(),
            conditions: vec![
                Condition::compare("protocol_count", Ge, 10),
                Condition::compare("protocol_tvl", Gt, 100_000),
                Condition::compare("protocol_consistency", Gt, 0.8),
            ],
            effects: vec![
                Effect::tag("user_type", "EliteDefiUser"),
                Effect::bonus(100),
                Effect::trust_signal("VeryHigh"),
                Effect::recommendation(
                    "Premier protocol participant with extensive experience",
                ),
            ],
            priority: 10,
        },
        Rule {
            name: "excellent_reputation".to_string(),
            description: "High overall reputation across all dimensions".to_string(),
            conditions: vec![
                Condition::compare("score", Gt, 800),
                Condition::compare("entity_age_days", Gt, 365),
                Condition::compare("security_incidents", Eq, 0),
                Condition::compare("failed_tx_ratio", Lt, 0.05),
            ],
            effects: vec![
                Effect::tag("reputation_level", "Excellent"),
                Effect::bonus(50),
                Effect::recommendation("Highly trusted entity with long-term reliability"),
            ],
            priority: 9,
        },
        Rule {
            name: "security_risk".to_string(),
            description: "Detects potential security concerns".to_string(),
            conditions: vec![
                Condition::compare("failed_tx_ratio", Gt, 0.3),
                Condition::compare("scam_interactions", Gt, 0),
            ],
            effects: vec![
                Effect::tag("risk_level", "High"),
                Effect::penalty(200),
                Effect::warning("Suspicious activity detected"),
                Effect::recommendation("Exercise extreme caution"),
            ],
            priority: 10,
        },
        Rule {
            name: "social_proof_verified".to_string(),
            description: "Strong social verification signals".to_string(),
            conditions: vec![
                Condition::compare("has_verified_identity", Eq, true),
                Condition::compare("identity_attested", Eq, true),
                Condition::compare("social_score", Gt, 80),
            ],
            effects: vec![
                Effect::tag("social_tier", "Verified"),
                Effect::bonus(40),
                Effect::recommendation("Socially verified identity adds trust"),
            ],
            priority: 7,
        },
        Rule {
            name: "emerging_user".to_string(),
            description: "New but promising entity".to_string(),
            conditions: vec![
                Condition::compare("entity_age_days", Lt, 90),
                Condition::compare("transaction_count", Ge, 20),
                Condition::compare("transaction_count", Lt, 100),
                Condition::compare("score", Ge, 400),
                Condition::compare("security_incidents", Eq, 0),
            ],
            effects: vec![
                Effect::tag("user_type", "EmergingUser"),
                Effect::tag("reputation_level", "Moderate"),
                Effect::recommendation("Promising new entity showing good early behavior"),
            ],
            priority: 5,
        },
        Rule {
            name: "veteran_entity".to_string(),
            description: "Rewards long-term existence".to_string(),
            conditions: vec![Condition::compare("entity_age_days", Gt, 730)],
            effects: vec![
                Effect::tag("age_tier", "Veteran"),
                Effect::bonus(30),
                Effect::recommendation("Long-term presence indicates stability"),
            ],
            priority: 6,
        },
        Rule {
            name: "high_volume_trader".to_string(),
            description: "Active trading behavior".to_string(),
            conditions: vec![
                Condition::compare("transaction_count", Gt, 500),
                Condition::compare("avg_tx_value", Gt, 1000),
            ],
            effects: vec![
                Effect::tag("activity_tier", "HighVolume"),
                Effect::bonus(25),
                Effect::recommendation(
                    "Active participant with substantial transaction history",
                ),
            ],
            priority: 6,
        },
        Rule {
            name: "collectible_enthusiast".to_string(),
            description: "Active in the collectibles ecosystem".to_string(),
            conditions: vec![
                Condition::compare("collectible_count", Gt, 50),
                Condition::compare("collectible_diversity", Gt, 10),
            ],
            effects: vec![
                Effect::tag("collector_tier", "Enthusiast"),
                Effect::bonus(20),
                Effect::recommendation("Active collector with a diverse portfolio"),
            ],
            priority: 5,
        },
        Rule {
            name: "low_activity".to_string(),
            description: "Insufficient activity for the entity's age".to_string(),
            conditions: vec![
                Condition::compare("transaction_count", Lt, 10),
                Condition::compare("entity_age_days", Gt, 180),
            ],
            effects: vec![
                Effect::tag("activity_level", "Low"),
                Effect::penalty(50),
                Effect::warning("Insufficient activity for reliable assessment"),
                Effect::recommendation("Increase activity to build reputation"),
            ],
            priority: 7,
        },
        Rule {
            name: "diverse_interactions".to_string(),
            description: "Interacts with many quality contracts".to_string(),
            conditions: vec![
                Condition::compare("unique_contract_count", Gt, 25),
                Condition::compare("contract_quality_avg", Gt, 0.7),
            ],
            effects: vec![
                Effect::tag("interaction_tier", "Diverse"),
                Effect::bonus(35),
                Effect::recommendation("Engages with a wide variety of quality protocols"),
            ],
            priority: 6,
        },
    ]
}
