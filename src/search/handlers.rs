//! Per-type result handlers.

use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use crate::acl::AccumulatedAcl;
use crate::target::{MatchTarget, TargetType};

use super::{HandlerResult, PostProcessContext};

/// Accumulates and post-processes one target type's slot.
pub trait ResultHandler: Send + Sync {
    /// A fresh, empty slot.
    fn init_result(&self) -> HandlerResult;

    /// Empties a slot for reuse.
    fn reset_result(&self, result: &mut HandlerResult);

    /// Adds one traversal node's hits.
    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult);

    /// Finishes the slot at `my_index`. Slots below `my_index` are already
    /// post-processed.
    fn post_process(
        &self,
        ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    );
}

/// Handler table in post-processing order, indexed by [`TargetType::index`].
pub static HANDLERS: [&dyn ResultHandler; TargetType::COUNT] = [
    &AclHandler,
    &SubscriptionHandler,
    &ConsumerHandler,
    &NeighbourHandler,
    &SignatureHandler,
];

// One registration can match through several conjunctions.
fn dedup_by_id<T>(items: &mut Vec<T>, id: impl Fn(&T) -> Uuid) {
    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|item| seen.insert(id(item)));
}

/// Folds matched ACL entries into an [`AccumulatedAcl`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AclHandler;

impl ResultHandler for AclHandler {
    fn init_result(&self) -> HandlerResult {
        HandlerResult::Acl {
            matched: Vec::new(),
            accumulated: AccumulatedAcl::new(),
        }
    }

    fn reset_result(&self, result: &mut HandlerResult) {
        if let HandlerResult::Acl {
            matched,
            accumulated,
        } = result
        {
            matched.clear();
            accumulated.reset();
        }
    }

    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult) {
        if let HandlerResult::Acl { matched, .. } = result {
            matched.extend(matches.iter().filter_map(|t| match t {
                MatchTarget::Acl(acl) => Some(acl.clone()),
                _ => None,
            }));
        }
    }

    fn post_process(
        &self,
        _ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    ) {
        if let HandlerResult::Acl {
            matched,
            accumulated,
        } = &mut results[my_index]
        {
            dedup_by_id(matched, |a| a.id.as_uuid());
            accumulated.reset();
            accumulated.fold_matched(matched);
        }
    }
}

/// Collects local subscriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionHandler;

impl ResultHandler for SubscriptionHandler {
    fn init_result(&self) -> HandlerResult {
        HandlerResult::Subscriptions(Vec::new())
    }

    fn reset_result(&self, result: &mut HandlerResult) {
        if let HandlerResult::Subscriptions(v) = result {
            v.clear();
        }
    }

    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult) {
        if let HandlerResult::Subscriptions(v) = result {
            v.extend(matches.iter().filter_map(|t| match t {
                MatchTarget::Subscription(cd) => Some(cd.clone()),
                _ => None,
            }));
        }
    }

    fn post_process(
        &self,
        _ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    ) {
        if let HandlerResult::Subscriptions(v) = &mut results[my_index] {
            dedup_by_id(v, |cd| cd.id.as_uuid());
        }
    }
}

/// Collects consumer points.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerHandler;

impl ResultHandler for ConsumerHandler {
    fn init_result(&self) -> HandlerResult {
        HandlerResult::Consumers(Vec::new())
    }

    fn reset_result(&self, result: &mut HandlerResult) {
        if let HandlerResult::Consumers(v) = result {
            v.clear();
        }
    }

    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult) {
        if let HandlerResult::Consumers(v) = result {
            v.extend(matches.iter().filter_map(|t| match t {
                MatchTarget::Consumer(cp) => Some(cp.clone()),
                _ => None,
            }));
        }
    }

    fn post_process(
        &self,
        _ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    ) {
        if let HandlerResult::Consumers(v) = &mut results[my_index] {
            dedup_by_id(v, |cp| cp.id.as_uuid());
        }
    }
}

/// Collects neighbour proxies and drops foreign secured ones whose user may
/// not subscribe.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighbourHandler;

impl ResultHandler for NeighbourHandler {
    fn init_result(&self) -> HandlerResult {
        HandlerResult::Neighbours(Vec::new())
    }

    fn reset_result(&self, result: &mut HandlerResult) {
        if let HandlerResult::Neighbours(v) = result {
            v.clear();
        }
    }

    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult) {
        if let HandlerResult::Neighbours(v) = result {
            v.extend(matches.iter().filter_map(|t| match t {
                MatchTarget::Neighbour(ps) => Some(ps.clone()),
                _ => None,
            }));
        }
    }

    fn post_process(
        &self,
        ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    ) {
        let (earlier, rest) = results.split_at_mut(my_index);
        let HandlerResult::Neighbours(proxies) = &mut rest[0] else {
            return;
        };
        dedup_by_id(proxies, |ps| ps.id.as_uuid());

        let Some(topic_space) = ctx.topic_space else {
            return;
        };
        let empty = AccumulatedAcl::new();
        let acl = match earlier.get(TargetType::Acl.index()) {
            Some(HandlerResult::Acl { accumulated, .. }) => accumulated,
            _ => &empty,
        };

        proxies.retain(|ps| {
            if !ps.foreign_secured {
                return true;
            }
            let allowed = ctx.access.check_subscribe_permission(
                topic_space,
                ctx.topic,
                ps.me_sub_user_id.as_deref(),
                acl,
            );
            if !allowed {
                debug!(
                    neighbour = %ps.neighbour,
                    user = ps.me_sub_user_id.as_deref().unwrap_or("<none>"),
                    topic = ctx.topic,
                    "foreign proxy subscription filtered by ACL"
                );
            }
            allowed
        });
    }
}

/// Collects application signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureHandler;

impl ResultHandler for SignatureHandler {
    fn init_result(&self) -> HandlerResult {
        HandlerResult::Signatures(Vec::new())
    }

    fn reset_result(&self, result: &mut HandlerResult) {
        if let HandlerResult::Signatures(v) = result {
            v.clear();
        }
    }

    fn accumulate(&self, matches: &[&MatchTarget], result: &mut HandlerResult) {
        if let HandlerResult::Signatures(v) = result {
            v.extend(matches.iter().filter_map(|t| match t {
                MatchTarget::ApplicationSignature(sig) => Some(sig.clone()),
                _ => None,
            }));
        }
    }

    fn post_process(
        &self,
        _ctx: &PostProcessContext<'_>,
        results: &mut [HandlerResult],
        my_index: usize,
    ) {
        if let HandlerResult::Signatures(v) = &mut results[my_index] {
            dedup_by_id(v, |sig| sig.id.as_uuid());
        }
    }
}
