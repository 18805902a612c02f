//! Orphan cascade: soft deletion propagated from parents to children.
//!
//! Each rule runs once per run, in configuration order, as a single update
//! in its own transaction. Rules are not iterated to a fixed point: a
//! grandchild orphaned only through two chained rules is caught on the next
//! run unless the parent rule happens to come first in the list.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::pmis::sync::destination::Destination;
use crate::pmis::sync::model::OrphanRule;
use crate::pmis::sync::schema::SchemaRegistry;

/// Result of one cascade rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeOutcome {
    pub rule: OrphanRule,
    pub cascaded: u64,
    /// Why the rule was skipped or failed, if it was.
    pub error: Option<String>,
}

impl CascadeOutcome {
    fn skipped(rule: &OrphanRule, reason: String) -> Self {
        Self {
            rule: rule.clone(),
            cascaded: 0,
            error: Some(reason),
        }
    }
}

/// Evaluates every rule once against the destination.
#[instrument(level = "info", skip_all, fields(rules = rules.len()))]
pub async fn run_cascade<D>(
    destination: &mut D,
    registry: &SchemaRegistry,
    rules: &[OrphanRule],
    run_started: NaiveDateTime,
) -> Vec<CascadeOutcome>
where
    D: Destination + ?Sized,
{
    let mut outcomes = Vec::with_capacity(rules.len());
    for rule in rules {
        let (child, parent) = match (registry.get(&rule.child), registry.get(&rule.parent)) {
            (Ok(child), Ok(parent)) => (child, parent),
            (Err(err), _) | (_, Err(err)) => {
                warn!(%rule, error = %err, "cascade rule skipped");
                outcomes.push(CascadeOutcome::skipped(rule, err.to_string()));
                continue;
            }
        };
        if !child.supports_soft_delete() || !parent.supports_soft_delete() {
            warn!(%rule, "cascade rule skipped, bookkeeping columns missing");
            outcomes.push(CascadeOutcome::skipped(
                rule,
                "missing is_deleted/last_updated".to_string(),
            ));
            continue;
        }
        if !child.has_column(&rule.foreign_key) {
            warn!(%rule, "cascade rule skipped, foreign key column missing");
            outcomes.push(CascadeOutcome::skipped(
                rule,
                format!("{} has no column {}", rule.child, rule.foreign_key),
            ));
            continue;
        }

        match destination
            .cascade_soft_delete(child, &rule.foreign_key, parent, run_started)
            .await
        {
            Ok(cascaded) => {
                info!(
                    child = %rule.child,
                    parent = %rule.parent,
                    foreign_key = %rule.foreign_key,
                    cascaded,
                    "cascade applied"
                );
                outcomes.push(CascadeOutcome {
                    rule: rule.clone(),
                    cascaded,
                    error: None,
                });
            }
            Err(err) => {
                error!(%rule, error = %err, "cascade rule rolled back");
                outcomes.push(CascadeOutcome::skipped(rule, err.to_string()));
            }
        }
    }
    outcomes
}
