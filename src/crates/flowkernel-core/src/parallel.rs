//! Fan-out / fan-in bookkeeping
//!
//! A parallel node tags each of its outputs with a fresh group id and a
//! [`ParallelMode`] before broadcasting it to every branch. Every per-edge successor of
//! that output carries the same group id, so the join can reassemble the group:
//!
//! ```text
//!                 ┌──► branch L ──┐
//!   parallel ─────┤               ├──► join
//!   (group g1)    └──► branch R ──┘   ALL: waits for L and R of g1
//!                                     EITHER: first of g1 wins, the other is archived
//! ```
//!
//! The ALL member count is taken from the number of edges declared into the join.

use flowkernel_store::{Context, ParallelMode, Repository};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

/// Whether an item may still be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eligibility {
    Eligible,
    /// An EITHER race this item belongs to was already won by a sibling
    Decided,
}

/// Check an item against its parallel group
///
/// `decided` caches group ids known to have a joined member.
pub(crate) async fn eligibility(
    repo: &dyn Repository,
    ctx: &Context,
    decided: &mut HashMap<String, bool>,
) -> Result<Eligibility> {
    let (Some(group), Some(ParallelMode::Either)) = (&ctx.parallel_id, ctx.parallel_mode) else {
        return Ok(Eligibility::Eligible);
    };
    if ctx.joined {
        return Ok(Eligibility::Eligible);
    }

    let joined = match decided.get(group) {
        Some(joined) => *joined,
        None => {
            let joined = repo
                .find_by_parallel(group)
                .await?
                .iter()
                .any(|member| member.joined);
            decided.insert(group.clone(), joined);
            joined
        }
    };

    Ok(if joined {
        Eligibility::Decided
    } else {
        Eligibility::Eligible
    })
}

/// Claim an EITHER race for `ctx` before anything executes it
///
/// Later siblings, in this pass through `decided` or in later passes through the
/// repository, come out [`Eligibility::Decided`].
pub(crate) async fn reserve(
    repo: &dyn Repository,
    ctx: &mut Context,
    decided: &mut HashMap<String, bool>,
) -> Result<()> {
    let (Some(group), Some(ParallelMode::Either)) = (&ctx.parallel_id, ctx.parallel_mode) else {
        return Ok(());
    };
    if ctx.joined {
        return Ok(());
    }
    repo.mark_joined(group, std::slice::from_ref(&ctx.id)).await?;
    decided.insert(group.clone(), true);
    ctx.joined = true;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Parallel(String),
    Batch(Option<String>),
}

/// Pick the first group a join can consume from its dispatched items
///
/// Items without a group id form ordinary batches. `branches` is the number of edges
/// declared into the join.
pub(crate) fn select_join_group(
    default_mode: ParallelMode,
    branches: usize,
    items: Vec<Context>,
) -> Vec<Context> {
    let mut order: Vec<GroupKey> = Vec::new();
    let mut groups: HashMap<GroupKey, Vec<Context>> = HashMap::new();
    for ctx in items {
        let key = match &ctx.parallel_id {
            Some(group) => GroupKey::Parallel(group.clone()),
            None => GroupKey::Batch(ctx.batch_id.clone()),
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(ctx);
    }

    for key in order {
        let Some(mut members) = groups.remove(&key) else {
            continue;
        };
        if let GroupKey::Batch(_) = key {
            return members;
        }
        let mode = members
            .first()
            .and_then(|c| c.parallel_mode)
            .unwrap_or(default_mode);
        match mode {
            ParallelMode::Either => {
                members.truncate(1);
                return members;
            }
            ParallelMode::All => {
                if members.len() >= branches.max(1) {
                    return members;
                }
            }
        }
    }
    Vec::new()
}

/// Tag each output of a parallel node with its own fresh group
pub(crate) fn stamp_fan_out(outputs: &mut [Context], mode: ParallelMode) {
    for ctx in outputs.iter_mut() {
        ctx.parallel_id = Some(Uuid::new_v4().to_string());
        ctx.parallel_mode = Some(mode);
        ctx.joined = false;
    }
}
