//! Criterion evaluation and workflow matching.
//!
//! Evaluation is pure and total: no I/O, and a criterion over a field the
//! item does not carry (e.g. `season` on a movie) is simply false.

use crate::queue::Item;

use super::types::{Criterion, MatchField, MatchOperator, Target, Workflow};

/// Evaluate one criterion against an item.
pub fn evaluate(criterion: &Criterion, item: &Item) -> bool {
    use MatchField::*;

    let title = item.title.info();
    let metadata = item.metadata.known();

    match criterion.field {
        Title => match title {
            Some(info) => string_op(criterion.op, info.title(), &criterion.value),
            None => false,
        },
        Season => numeric_op(criterion.op, title.and_then(|t| t.season()), &criterion.value),
        Episode => numeric_op(criterion.op, title.and_then(|t| t.episode()), &criterion.value),
        Episodic => match (title, criterion.value.parse::<bool>()) {
            (Some(info), Ok(expected)) => match criterion.op {
                MatchOperator::Equals => info.is_episodic() == expected,
                MatchOperator::NotEquals => info.is_episodic() != expected,
                _ => false,
            },
            _ => false,
        },
        Genre => match metadata {
            Some(meta) => genre_op(criterion.op, &meta.genres, &criterion.value),
            None => false,
        },
        Runtime => numeric_op(
            criterion.op,
            metadata.and_then(|m| m.runtime_mins),
            &criterion.value,
        ),
        Year => {
            let year = metadata
                .and_then(|m| m.release_year)
                .or_else(|| title.and_then(|t| t.year()));
            numeric_op(criterion.op, year, &criterion.value)
        }
    }
}

fn string_op(op: MatchOperator, actual: &str, expected: &str) -> bool {
    match op {
        MatchOperator::Equals => actual == expected,
        MatchOperator::NotEquals => actual != expected,
        MatchOperator::Contains => actual.contains(expected),
        MatchOperator::Matches => regex_lite::Regex::new(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        _ => false,
    }
}

fn numeric_op(op: MatchOperator, actual: Option<u32>, expected: &str) -> bool {
    let (Some(actual), Ok(expected)) = (actual, expected.parse::<i64>()) else {
        return false;
    };
    let actual = actual as i64;
    match op {
        MatchOperator::Equals => actual == expected,
        MatchOperator::NotEquals => actual != expected,
        MatchOperator::LessThan => actual < expected,
        MatchOperator::LessOrEqual => actual <= expected,
        MatchOperator::GreaterThan => actual > expected,
        MatchOperator::GreaterOrEqual => actual >= expected,
        _ => false,
    }
}

fn genre_op(op: MatchOperator, genres: &[String], expected: &str) -> bool {
    match op {
        MatchOperator::Equals => genres.iter().any(|g| g == expected),
        MatchOperator::NotEquals => !genres.iter().any(|g| g == expected),
        MatchOperator::Contains => genres.iter().any(|g| g.contains(expected)),
        MatchOperator::Matches => regex_lite::Regex::new(expected)
            .map(|re| genres.iter().any(|g| re.is_match(g)))
            .unwrap_or(false),
        _ => false,
    }
}

/// Whether every criterion of a workflow holds for the item.
pub fn workflow_matches(workflow: &Workflow, item: &Item) -> bool {
    workflow.enabled && workflow.criteria.iter().all(|c| evaluate(c, item))
}

/// The set-union of targets across all enabled workflows that match.
pub fn matching_targets<'a>(
    workflows: &[Workflow],
    targets: &'a [Target],
    item: &Item,
) -> Vec<&'a Target> {
    let mut matched: Vec<&Target> = Vec::new();
    for workflow in workflows {
        if !workflow_matches(workflow, item) {
            continue;
        }
        for target_id in &workflow.target_ids {
            if matched.iter().any(|t| t.id == *target_id) {
                continue;
            }
            if let Some(target) = targets.iter().find(|t| t.id == *target_id) {
                matched.push(target);
            }
        }
    }
    matched
}
