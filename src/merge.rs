//! Resolves one winning record per identity across an ordered layer set.
//!
//! The winner is the record from the layer with the lowest position in the
//! [`LayerSet`]. Attribute stacks list contributing layers lowest priority
//! first with the winner last, relation stacks list the winner first. Both
//! orders are kept as they are because callers depend on them.

use std::collections::HashMap;
use tracing::debug;

use crate::construct::{
    AttributeIdentity, CIAttribute, IdentityHasher, LayerSet, MergedCIAttribute, MergedRelation,
    Relation, RelationIdentity,
};
use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskHandlingForRetrieval {
    /// masked identities are hidden
    #[default]
    ApplyMasks,
    /// masks are returned like any other winner
    GetMasks,
}

/// Groups records by identity, keeping the priority of the layer each came from.
/// Records from layers outside of the set do not take part.
fn group_by_identity<K, R, F>(
    records: impl IntoIterator<Item = R>,
    layers: &LayerSet,
    layer_of: F,
    identity_of: impl Fn(&R) -> K,
) -> Result<HashMap<K, Vec<(usize, R)>, IdentityHasher>>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
    F: Fn(&R) -> &str,
{
    let mut groups: HashMap<K, Vec<(usize, R)>, IdentityHasher> = HashMap::default();
    for record in records {
        let Some(order) = layers.get_order(layer_of(&record)) else {
            debug!(layer = layer_of(&record), "skipping record from a layer outside of the layer set");
            continue;
        };
        let identity = identity_of(&record);
        let group = groups.entry(identity).or_default();
        if group.iter().any(|(o, _)| *o == order) {
            return Err(StrataError::Invariant(format!(
                "more than one record for {} in layer {}",
                identity_of(&record),
                layer_of(&record)
            )));
        }
        group.push((order, record));
    }
    Ok(groups)
}

pub fn merge_attributes(
    records: impl IntoIterator<Item = CIAttribute>,
    layers: &LayerSet,
) -> Result<Vec<MergedCIAttribute>> {
    if layers.is_empty() {
        return Ok(Vec::new());
    }
    let groups: HashMap<AttributeIdentity, Vec<(usize, CIAttribute)>, IdentityHasher> =
        group_by_identity(records, layers, |a| a.layer.as_str(), CIAttribute::information_hash)?;

    let mut merged = Vec::with_capacity(groups.len());
    for (_, mut group) in groups {
        // weakest first, so the winner ends up last
        group.sort_by(|a, b| b.0.cmp(&a.0));
        let layer_stack = group.iter().map(|(_, a)| a.layer.clone()).collect();
        let Some((_, winner)) = group.pop() else {
            continue;
        };
        if winner.is_removed() {
            continue;
        }
        merged.push(MergedCIAttribute {
            attribute: winner,
            layer_stack,
        });
    }
    merged.sort_by(|a, b| {
        a.attribute
            .information_hash()
            .cmp(&b.attribute.information_hash())
    });
    Ok(merged)
}

pub fn merge_relations(
    records: impl IntoIterator<Item = Relation>,
    layers: &LayerSet,
    mask_handling: MaskHandlingForRetrieval,
) -> Result<Vec<MergedRelation>> {
    if layers.is_empty() {
        return Ok(Vec::new());
    }
    let groups: HashMap<RelationIdentity, Vec<(usize, Relation)>, IdentityHasher> =
        group_by_identity(records, layers, |r| r.layer.as_str(), Relation::information_hash)?;

    let mut merged = Vec::with_capacity(groups.len());
    for (_, mut group) in groups {
        group.sort_by_key(|(order, _)| *order);
        let layer_stack = group.iter().map(|(_, r)| r.layer.clone()).collect();
        let Some((_, winner)) = group.into_iter().next() else {
            continue;
        };
        if winner.removed {
            continue;
        }
        if winner.mask && mask_handling == MaskHandlingForRetrieval::ApplyMasks {
            continue;
        }
        merged.push(MergedRelation {
            relation: winner,
            layer_stack,
        });
    }
    merged.sort_by(|a, b| {
        a.relation
            .information_hash()
            .cmp(&b.relation.information_hash())
    });
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::AttributeState;
    use crate::datatype::AttributeValue;
    use chrono::Utc;
    use uuid::Uuid;

    fn attribute(ci: Uuid, layer: &str, value: &str, state: AttributeState) -> CIAttribute {
        CIAttribute {
            id: Uuid::new_v4(),
            name: "a".into(),
            ci,
            value: AttributeValue::text(value),
            state,
            changeset: Uuid::new_v4(),
            layer: layer.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn duplicate_layer_records_are_an_invariant_fault() {
        let ci = Uuid::new_v4();
        let layers = LayerSet::new(["l1"]).unwrap();
        let records = vec![
            attribute(ci, "l1", "x", AttributeState::New),
            attribute(ci, "l1", "y", AttributeState::New),
        ];
        assert!(matches!(
            merge_attributes(records, &layers),
            Err(StrataError::Invariant(_))
        ));
    }

    #[test]
    fn removed_winner_hides_lower_layers() {
        let ci = Uuid::new_v4();
        let layers = LayerSet::new(["top", "bottom"]).unwrap();
        let records = vec![
            attribute(ci, "top", "x", AttributeState::Removed),
            attribute(ci, "bottom", "y", AttributeState::New),
        ];
        assert!(merge_attributes(records, &layers).unwrap().is_empty());
    }
}
