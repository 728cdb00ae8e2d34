use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::rules::{Effect, Rule};
use crate::{CoreError, EntityMetrics, ReputationTier, MAX_SCORE, MIN_SCORE};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppliedRule {
    pub name: String,
    pub description: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreAdjustment {
    pub rule: String,
    pub points: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NarrativeTag {
    pub rule: String,
    pub key: String,
    pub value: String,
}

/// Explainable outcome of one [`evaluate`] call.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReasoningResult {
    pub base_score: i64,
    pub applied_rules: Vec<String>,
    pub rule_details: Vec<AppliedRule>,
    pub score_adjustment: i64,
    pub final_score: u32,
    pub reputation_level: ReputationTier,
    pub bonuses: Vec<ScoreAdjustment>,
    pub penalties: Vec<ScoreAdjustment>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub trust_signals: Vec<String>,
    pub tags: Vec<NarrativeTag>,
    pub rules_evaluated: usize,
}

/// Applies `rules` to `metrics`.
///
/// Rules run in descending priority; ties keep declaration order. Every
/// matching rule contributes all of its effects. A rule whose conditions cannot
/// be evaluated is skipped with a warning.
#[must_use]
pub fn evaluate(metrics: &EntityMetrics, rules: &[Rule]) -> ReasoningResult {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by(|lhs, rhs| rhs.priority.cmp(&lhs.priority));

    let base_score = metrics.base_score();
    let mut result = ReasoningResult {
        base_score,
        applied_rules: Vec::new(),
        rule_details: Vec::new(),
        score_adjustment: 0,
        final_score: 0,
        reputation_level: ReputationTier::Developing,
        bonuses: Vec::new(),
        penalties: Vec::new(),
        warnings: Vec::new(),
        recommendations: Vec::new(),
        trust_signals: Vec::new(),
        tags: Vec::new(),
        rules_evaluated: rules.len(),
    };

    for rule in ordered {
        match rule.matches(metrics) {
            Ok(true) => apply_rule(rule, &mut result),
            Ok(false) => {}
            Err(err) => {
                warn!(rule = %rule.name, error = %err, "malformed rule condition; rule skipped");
            }
        }
    }

    result.final_score = clamp_score(base_score.saturating_add(result.score_adjustment));
    result.reputation_level = ReputationTier::from_score(result.final_score);
    result
}

fn apply_rule(rule: &Rule, result: &mut ReasoningResult) {
    result.applied_rules.push(rule.name.clone());
    result.rule_details.push(AppliedRule {
        name: rule.name.clone(),
        description: rule.description.clone(),
        priority: rule.priority,
    });

    for effect in &rule.effects {
        match effect {
            Effect::Bonus { points } => {
                let points = i64::from(*points);
                result.score_adjustment = result.score_adjustment.saturating_add(points);
                result.bonuses.push(ScoreAdjustment {
                    rule: rule.name.clone(),
                    points,
                    reason: rule.description.clone(),
                });
            }
            Effect::Penalty { points } => {
                let points = -i64::from(*points);
                result.score_adjustment = result.score_adjustment.saturating_add(points);
                result.penalties.push(ScoreAdjustment {
                    rule: rule.name.clone(),
                    points,
                    reason: rule.description.clone(),
                });
            }
            Effect::Warning { text } => result.warnings.push(text.clone()),
            Effect::Recommendation { text } => result.recommendations.push(text.clone()),
            Effect::TrustSignal { text } => result.trust_signals.push(text.clone()),
            Effect::Tag { key, value } => result.tags.push(NarrativeTag {
                rule: rule.name.clone(),
                key: key.clone(),
                value: value.clone(),
            }),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_score(raw: i64) -> u32 {
    raw.clamp(MIN_SCORE, MAX_SCORE) as u32
}

/// Renders a fixed, deterministic narrative for `result`.
#[must_use]
pub fn explain(result: &ReasoningResult) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Base score: {}/{MAX_SCORE}", result.base_score);
    let _ = writeln!(text, "Adjustments: {:+} points", result.score_adjustment);
    let _ = writeln!(text, "Final score: {}/{MAX_SCORE}", result.final_score);
    let _ = writeln!(text, "Reputation level: {}", result.reputation_level);

    let _ = write!(text, "\nApplied rules ({}):\n", result.applied_rules.len());
    for detail in &result.rule_details {
        let _ = writeln!(
            text,
            "- {} (priority {}): {}",
            detail.name, detail.priority, detail.description
        );
    }

    if !result.bonuses.is_empty() {
        text.push_str("\nScore bonuses:\n");
        for bonus in &result.bonuses {
            let _ = writeln!(text, "- {:+} points: {}", bonus.points, bonus.reason);
        }
    }

    if !result.penalties.is_empty() {
        text.push_str("\nScore penalties:\n");
        for penalty in &result.penalties {
            let _ = writeln!(text, "- {:+} points: {}", penalty.points, penalty.reason);
        }
    }

    for (heading, entries) in [
        ("Warnings", &result.warnings),
        ("Recommendations", &result.recommendations),
        ("Trust signals", &result.trust_signals),
    ] {
        if entries.is_empty() {
            continue;
        }
        let _ = write!(text, "\n{heading}:\n");
        for entry in entries {
            let _ = writeln!(text, "- {entry}");
        }
    }

    let _ = write!(
        text,
        "\nSummary: evaluated {} rules and applied {}; final reputation level is {} with a score of {}/{MAX_SCORE}.",
        result.rules_evaluated,
        result.applied_rules.len(),
        result.reputation_level,
        result.final_score
    );

    text
}

/// Hex SHA-256 over the canonical JSON encoding of `result`.
///
/// # Errors
/// Returns [`CoreError::Validation`] if the result cannot be serialized.
pub fn digest(result: &ReasoningResult) -> Result<String, CoreError> {
    let bytes = serde_json::to_vec(result)
        .map_err(|err| CoreError::Validation(format!("failed to encode reasoning result: {err}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{default_rules, Comparator, Condition};
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn rule(name: &str, priority: i32, conditions: Vec<Condition>, effects: Vec<Effect>) -> Rule {
        Rule {
            name: name.to_string(),
            description: format!("{name} description"),
            conditions,
            effects,
            priority,
        }
    }

    fn always(name: &str, priority: i32, effects: Vec<Effect>) -> Rule {
        rule(name, priority, Vec::new(), effects)
    }

    fn excellent_scenario() -> EntityMetrics {
        EntityMetrics::new()
            .with("score", 850)
            .with("entity_age_days", 400)
            .with("security_incidents", 0)
            .with("failed_tx_ratio", 0.02)
    }

    #[test]
    fn excellent_rule_recomputes_tier_after_adjustment() {
        let rules = default_rules()
            .into_iter()
            .filter(|rule| rule.name == "excellent_reputation")
            .collect::<Vec<_>>();

        let result = evaluate(&excellent_scenario(), &rules);

        assert_eq!(result.applied_rules, vec!["excellent_reputation".to_string()]);
        assert_eq!(result.score_adjustment, 50);
        assert_eq!(result.final_score, 900);
        assert_eq!(result.reputation_level, ReputationTier::Exceptional);
    }

    #[test]
    fn missing_transaction_count_still_reads_as_low_activity() {
        let result = evaluate(&excellent_scenario(), &default_rules());

        assert_eq!(result.applied_rules, vec!["excellent_reputation", "low_activity"]);
        assert_eq!(result.score_adjustment, 0);
        assert_eq!(result.final_score, 850);
        assert_eq!(result.reputation_level, ReputationTier::Excellent);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn fewer_transactions_never_score_higher() {
        let at = |count: i64| {
            let metrics = EntityMetrics::new()
                .with("score", 600)
                .with("entity_age_days", 400)
                .with("transaction_count", count);
            evaluate(&metrics, &default_rules())
        };

        let zero = at(0);
        let five = at(5);
        let fifty = at(50);

        assert_eq!(zero.applied_rules, vec!["low_activity"]);
        assert_eq!(five.applied_rules, vec!["low_activity"]);
        assert!(zero.final_score <= five.final_score);
        assert!(five.final_score <= fifty.final_score);
        assert_eq!(fifty.final_score, 600);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let metrics = EntityMetrics::new()
            .with("score", 640)
            .with("transaction_count", 720)
            .with("avg_tx_value", 2500)
            .with("entity_age_days", 900)
            .with("unique_contract_count", 40)
            .with("contract_quality_avg", 0.9);

        let first = evaluate(&metrics, &default_rules());
        let second = evaluate(&metrics, &default_rules());

        assert_eq!(first, second);
        assert_eq!(must_ok(digest(&first)), must_ok(digest(&second)));
        assert_eq!(explain(&first), explain(&second));
    }

    #[test]
    fn higher_priority_rules_apply_first() {
        let rules = vec![
            always("low", 5, vec![Effect::Bonus { points: 1 }]),
            always("high", 10, vec![Effect::Bonus { points: 2 }]),
        ];
        let result = evaluate(&EntityMetrics::new(), &rules);
        assert_eq!(result.applied_rules, vec!["high".to_string(), "low".to_string()]);
    }

    #[test]
    fn equal_priorities_keep_declaration_order() {
        let rules = vec![
            always("first", 7, vec![Effect::Warning { text: "a".to_string() }]),
            always("second", 7, vec![Effect::Warning { text: "b".to_string() }]),
            always("third", 7, vec![Effect::Warning { text: "c".to_string() }]),
        ];
        let result = evaluate(&EntityMetrics::new(), &rules);
        assert_eq!(result.applied_rules, vec!["first", "second", "third"]);
        assert_eq!(result.warnings, vec!["a", "b", "c"]);
    }

    #[test]
    fn three_matching_default_rules_accumulate() {
        let metrics = EntityMetrics::new()
            .with("score", 500)
            .with("entity_age_days", 800)
            .with("transaction_count", 600)
            .with("avg_tx_value", 1500)
            .with("unique_contract_count", 30)
            .with("contract_quality_avg", 0.75);

        let result = evaluate(&metrics, &default_rules());

        assert_eq!(
            result.applied_rules,
            vec!["veteran_entity", "high_volume_trader", "diverse_interactions"]
        );
        assert_eq!(result.score_adjustment, 30 + 25 + 35);
        assert_eq!(result.bonuses.len(), 3);
        assert_eq!(result.final_score, 590);
        assert_eq!(result.reputation_level, ReputationTier::Moderate);
    }

    #[test]
    fn penalties_and_narratives_accumulate_without_overwrite() {
        let metrics = EntityMetrics::new()
            .with("score", 300)
            .with("failed_tx_ratio", 0.5)
            .with("scam_interactions", 2)
            .with("transaction_count", 4)
            .with("entity_age_days", 200);

        let result = evaluate(&metrics, &default_rules());

        assert_eq!(result.applied_rules, vec!["security_risk", "low_activity"]);
        assert_eq!(result.score_adjustment, -250);
        assert_eq!(result.final_score, 50);
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.recommendations.len(), 2);
        assert_eq!(result.penalties[0].points, -200);
    }

    #[test]
    fn final_score_clamps_to_bounds() {
        let huge_bonus = vec![always("boost", 1, vec![Effect::Bonus { points: 5_000 }])];
        let high = evaluate(&EntityMetrics::new().with("score", 990), &huge_bonus);
        assert_eq!(high.final_score, 1000);
        assert_eq!(high.reputation_level, ReputationTier::Exceptional);

        let huge_penalty = vec![always("sink", 1, vec![Effect::Penalty { points: 5_000 }])];
        let low = evaluate(&EntityMetrics::new().with("score", 10), &huge_penalty);
        assert_eq!(low.final_score, 0);
        assert_eq!(low.reputation_level, ReputationTier::Developing);
    }

    #[test]
    fn malformed_condition_only_disables_its_rule() {
        let rules = vec![
            rule(
                "broken",
                10,
                vec![Condition::parse("score >>= 1")],
                vec![Effect::Bonus { points: 100 }],
            ),
            rule(
                "healthy",
                5,
                vec![Condition::compare("score", Comparator::Ge, 1)],
                vec![Effect::Bonus { points: 10 }],
            ),
        ];
        let result = evaluate(&EntityMetrics::new().with("score", 100), &rules);
        assert_eq!(result.applied_rules, vec!["healthy"]);
        assert_eq!(result.final_score, 110);
    }

    #[test]
    fn explanation_lists_sections_in_fixed_order() {
        let metrics = EntityMetrics::new()
            .with("score", 300)
            .with("failed_tx_ratio", 0.5)
            .with("scam_interactions", 1);
        let text = explain(&evaluate(&metrics, &default_rules()));

        assert!(text.starts_with("Base score: 300/1000\nAdjustments: -200 points\n"));
        assert!(text.contains("- security_risk (priority 10): Detects potential security concerns"));
        assert!(text.contains("Score penalties:\n- -200 points"));
        assert!(text.contains("Warnings:\n- Suspicious activity detected"));
        assert!(text.ends_with("final reputation level is Developing with a score of 100/1000."));
        assert!(!text.contains("Score bonuses"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_final_score_stays_in_range(
            base in -5_000i64..5_000,
            bonuses in prop::collection::vec(0u32..800, 0..6),
            penalties in prop::collection::vec(0u32..800, 0..6),
        ) {
            let mut rules = Vec::new();
            for (index, points) in bonuses.iter().enumerate() {
                rules.push(always(&format!("bonus_{index}"), 3, vec![Effect::Bonus { points: *points }]));
            }
            for (index, points) in penalties.iter().enumerate() {
                rules.push(always(&format!("penalty_{index}"), 2, vec![Effect::Penalty { points: *points }]));
            }

            let result = evaluate(&EntityMetrics::new().with("score", base), &rules);
            let expected_adjustment: i64 = bonuses.iter().map(|p| i64::from(*p)).sum::<i64>()
                - penalties.iter().map(|p| i64::from(*p)).sum::<i64>();

            prop_assert!(result.final_score <= 1000);
            prop_assert_eq!(result.score_adjustment, expected_adjustment);
            prop_assert_eq!(result.applied_rules.len(), bonuses.len() + penalties.len());
            prop_assert_eq!(result.reputation_level, ReputationTier::from_score(result.final_score));
        }
    }
}
