//! Bulk replacement of the records of one write layer.
//!
//! A bulk call states the desired content of a scope. The writer diffs it
//! against what the layer currently holds and writes only the difference,
//! under a single changeset that is allocated only when something changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::changeset::ChangesetProxy;
use crate::construct::{
    AttributeIdentity, AttributeSelection, AttributeState, CIAttribute, CiId, CiSelection,
    IdentityHasher, LayerId, LayerSet, PredicateId, PredicateSelection, Relation,
    RelationIdentity, RelationSelection, TimeThreshold,
};
use crate::datatype::AttributeValue;
use crate::error::{Result, StrataError};
use crate::merge::{merge_attributes, merge_relations, MaskHandlingForRetrieval};
use crate::model::{persist_attributes, persist_relations, validate_relation};
use crate::persist::TemporalStore;

// ------------- Policies -------------
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MaskHandlingForRemoval {
    /// removals are plain removals
    #[default]
    ApplyNoMask,
    /// a removal that would let a lower layer shine through writes a mask instead
    ApplyMaskIfNecessary { read_layers: LayerSet },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OtherLayersValueHandling {
    #[default]
    ForceWrite,
    /// inserts already satisfied by the other read layers are dropped
    TakeIntoAccount { read_layers: LayerSet },
}

// ------------- Attribute scopes -------------
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFragment {
    pub ci: CiId,
    pub name: String,
    pub value: AttributeValue,
}
impl AttributeFragment {
    pub fn new(ci: CiId, name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            ci,
            name: name.into(),
            value,
        }
    }
    pub fn identity(&self) -> AttributeIdentity {
        AttributeIdentity::new(self.ci, self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeScope {
    /// every attribute of the layer whose name starts with the prefix
    Layer { name_prefix: String },
    /// the attributes of one CI whose name starts with the prefix
    Ci { name_prefix: String, ci: CiId },
    /// the fragments themselves plus explicitly listed removals. A removal
    /// the layer does not hold is a no-op, a malformed one is rejected.
    Specific { removals: Vec<AttributeIdentity> },
}
impl AttributeScope {
    fn contains(&self, identity: &AttributeIdentity) -> bool {
        match self {
            AttributeScope::Layer { name_prefix } => identity.name.starts_with(name_prefix.as_str()),
            AttributeScope::Ci { name_prefix, ci } => {
                identity.ci == *ci && identity.name.starts_with(name_prefix.as_str())
            }
            AttributeScope::Specific { .. } => true,
        }
    }
}

// ------------- Relation scopes -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFragment {
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
    pub mask: bool,
}
impl RelationFragment {
    pub fn new(from: CiId, to: CiId, predicate: impl Into<PredicateId>) -> Self {
        Self {
            from,
            to,
            predicate: predicate.into(),
            mask: false,
        }
    }
    pub fn masked(mut self) -> Self {
        self.mask = true;
        self
    }
    pub fn identity(&self) -> RelationIdentity {
        RelationIdentity::new(self.from, self.to, self.predicate.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationScope {
    Layer,
    /// relations with the CI at either end
    Ci { ci: CiId },
    Predicate { predicate: PredicateId },
    /// relations of one predicate leaving (or entering) one CI, limited to
    /// the selected CIs at the other end
    CiAndPredicate {
        ci: CiId,
        predicate: PredicateId,
        outgoing: bool,
        others: CiSelection,
    },
    /// the fragments themselves plus explicitly listed removals. A removal
    /// the layer does not hold is a no-op, a malformed one is rejected.
    Specific { removals: Vec<RelationIdentity> },
}
impl RelationScope {
    fn contains(&self, identity: &RelationIdentity) -> bool {
        match self {
            RelationScope::Layer | RelationScope::Specific { .. } => true,
            RelationScope::Ci { ci } => identity.from == *ci || identity.to == *ci,
            RelationScope::Predicate { predicate } => identity.predicate == *predicate,
            RelationScope::CiAndPredicate {
                ci,
                predicate,
                outgoing,
                others,
            } => {
                let (this, other) = if *outgoing {
                    (identity.from, identity.to)
                } else {
                    (identity.to, identity.from)
                };
                identity.predicate == *predicate && this == *ci && others.contains(&other)
            }
        }
    }
    fn selection(&self, fragments: &[RelationFragment]) -> RelationSelection {
        match self {
            RelationScope::Layer => RelationSelection::All,
            RelationScope::Ci { ci } => RelationSelection::Either(CiSelection::specific([*ci])),
            RelationScope::Predicate { predicate } => {
                RelationSelection::WithPredicate(PredicateSelection::specific([predicate.clone()]))
            }
            RelationScope::CiAndPredicate { ci, outgoing, .. } => {
                let cis = CiSelection::specific([*ci]);
                if *outgoing {
                    RelationSelection::From(cis)
                } else {
                    RelationSelection::To(cis)
                }
            }
            RelationScope::Specific { removals } => RelationSelection::Specific(
                fragments
                    .iter()
                    .map(RelationFragment::identity)
                    .chain(removals.iter().cloned())
                    .collect(),
            ),
        }
    }
}

// ------------- Writer -------------
pub struct BulkWriter {
    store: Arc<dyn TemporalStore>,
}

impl BulkWriter {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self { store }
    }

    /// Makes the scope of `layer` hold exactly `fragments`, returning the
    /// identities that changed.
    pub async fn bulk_replace_attributes(
        &self,
        fragments: Vec<AttributeFragment>,
        scope: &AttributeScope,
        layer: &str,
        other_layers: &OtherLayersValueHandling,
        changeset: &ChangesetProxy,
    ) -> Result<Vec<AttributeIdentity>> {
        let time = changeset.time();
        if let AttributeScope::Specific { removals } = scope {
            if removals.iter().any(|r| r.name.is_empty()) {
                return Err(StrataError::InvalidInput(
                    "attribute name must not be empty".into(),
                ));
            }
        }

        // what the write layer holds within the scope, tombstones included
        let mut existing: HashMap<AttributeIdentity, CIAttribute, IdentityHasher> = self
            .existing_attributes(&fragments, scope, layer, &time)
            .await?
            .into_iter()
            .filter(|a| scope.contains(&a.information_hash()))
            .map(|a| (a.information_hash(), a))
            .collect();
        let mut outdated: HashSet<AttributeIdentity, IdentityHasher> = existing
            .iter()
            .filter(|(_, a)| !a.is_removed())
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut seen: HashSet<AttributeIdentity, IdentityHasher> = HashSet::default();
        let mut inserts: Vec<(AttributeFragment, AttributeState)> = Vec::new();
        // fragments the write layer already holds with the same value
        let mut unchanged: Vec<AttributeFragment> = Vec::new();
        for fragment in fragments {
            if fragment.name.is_empty() {
                return Err(StrataError::InvalidInput(
                    "attribute name must not be empty".into(),
                ));
            }
            let identity = fragment.identity();
            if !scope.contains(&identity) {
                return Err(StrataError::InvalidInput(format!(
                    "attribute {identity} lies outside of the bulk scope"
                )));
            }
            if !seen.insert(identity.clone()) {
                return Err(StrataError::InvalidInput(format!(
                    "attribute {identity} appears more than once"
                )));
            }
            outdated.remove(&identity);
            let current = existing.get(&identity);
            if let Some(current) = current {
                if !current.is_removed() && current.value == fragment.value {
                    unchanged.push(fragment);
                    continue;
                }
            }
            inserts.push((fragment, AttributeState::on_insert(current)));
        }

        if let OtherLayersValueHandling::TakeIntoAccount { read_layers } = other_layers {
            let others = read_layers.without(layer);
            if !others.is_empty() && !(inserts.is_empty() && unchanged.is_empty()) {
                let candidates = || inserts.iter().map(|(f, _)| f).chain(unchanged.iter());
                let cis = CiSelection::specific(candidates().map(|f| f.ci));
                let names = AttributeSelection::named(candidates().map(|f| f.name.clone()));
                let per_layer = futures_util::future::try_join_all(
                    others
                        .iter()
                        .map(|l| self.store.get_attributes(&cis, &names, l, &time, false)),
                )
                .await?;
                let merged: HashMap<AttributeIdentity, AttributeValue, IdentityHasher> =
                    merge_attributes(per_layer.into_iter().flatten(), &others)?
                        .into_iter()
                        .map(|m| (m.attribute.information_hash(), m.attribute.value))
                        .collect();
                inserts.retain(|(fragment, _)| {
                    let identity = fragment.identity();
                    if merged.get(&identity) != Some(&fragment.value) {
                        return true;
                    }
                    if existing.get(&identity).is_some_and(|a| !a.is_removed()) {
                        outdated.insert(identity);
                    }
                    false
                });
                // redundant copies in the write layer are dropped as well
                for fragment in &unchanged {
                    let identity = fragment.identity();
                    if merged.get(&identity) == Some(&fragment.value) {
                        outdated.insert(identity);
                    }
                }
            }
        }

        if inserts.is_empty() && outdated.is_empty() {
            debug!(layer, "bulk attribute replace resolved to no changes");
            return Ok(Vec::new());
        }

        let changeset_id = changeset.get_changeset(layer).await?.id;
        let timestamp = changeset.timestamp();
        let mut records = Vec::with_capacity(inserts.len() + outdated.len());
        let mut changed = Vec::with_capacity(records.capacity());
        let insert_count = inserts.len();
        for (fragment, state) in inserts {
            changed.push(fragment.identity());
            records.push(CIAttribute {
                id: Uuid::new_v4(),
                name: fragment.name,
                ci: fragment.ci,
                value: fragment.value,
                state,
                changeset: changeset_id,
                layer: layer.to_owned(),
                timestamp,
            });
        }
        let removal_count = outdated.len();
        for identity in outdated {
            let Some(current) = existing.remove(&identity) else {
                continue;
            };
            changed.push(identity);
            records.push(CIAttribute {
                id: Uuid::new_v4(),
                state: AttributeState::Removed,
                changeset: changeset_id,
                timestamp,
                ..current
            });
        }
        persist_attributes(self.store.as_ref(), &records, timestamp).await?;
        debug!(
            layer,
            inserts = insert_count,
            removals = removal_count,
            "bulk attribute replace written"
        );
        Ok(changed)
    }

    async fn existing_attributes(
        &self,
        fragments: &[AttributeFragment],
        scope: &AttributeScope,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Vec<CIAttribute>> {
        match scope {
            AttributeScope::Layer { name_prefix } => {
                let pattern = format!("^{}", regex::escape(name_prefix));
                self.store
                    .find_attributes_by_name(&pattern, &CiSelection::All, layer, time, true)
                    .await
            }
            AttributeScope::Ci { name_prefix, ci } => {
                let pattern = format!("^{}", regex::escape(name_prefix));
                self.store
                    .find_attributes_by_name(
                        &pattern,
                        &CiSelection::specific([*ci]),
                        layer,
                        time,
                        true,
                    )
                    .await
            }
            AttributeScope::Specific { removals } => {
                let identities: HashSet<AttributeIdentity, IdentityHasher> = fragments
                    .iter()
                    .map(AttributeFragment::identity)
                    .chain(removals.iter().cloned())
                    .collect();
                let cis = CiSelection::specific(identities.iter().map(|i| i.ci));
                let names = AttributeSelection::named(identities.iter().map(|i| i.name.clone()));
                let found = self
                    .store
                    .get_attributes(&cis, &names, layer, time, true)
                    .await?;
                Ok(found
                    .into_iter()
                    .filter(|a| identities.contains(&a.information_hash()))
                    .collect())
            }
        }
    }

    /// Makes the scope of `layer` hold exactly `fragments`, returning the
    /// identities that changed.
    pub async fn bulk_replace_relations(
        &self,
        fragments: Vec<RelationFragment>,
        scope: &RelationScope,
        layer: &str,
        mask_handling: &MaskHandlingForRemoval,
        other_layers: &OtherLayersValueHandling,
        changeset: &ChangesetProxy,
    ) -> Result<Vec<RelationIdentity>> {
        let time = changeset.time();

        if let RelationScope::Specific { removals } = scope {
            for removal in removals {
                validate_relation(&removal.from, &removal.to, &removal.predicate)?;
            }
        }
        let selection = scope.selection(&fragments);
        let existing: HashMap<RelationIdentity, Relation, IdentityHasher> = self
            .store
            .get_relations(&selection, layer, &time, true)
            .await?
            .into_iter()
            .filter(|r| scope.contains(&r.information_hash()))
            .map(|r| (r.information_hash(), r))
            .collect();
        let mut outdated: HashSet<RelationIdentity, IdentityHasher> = existing
            .iter()
            .filter(|(_, r)| !r.removed)
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut seen: HashSet<RelationIdentity, IdentityHasher> = HashSet::default();
        let mut inserts: Vec<RelationFragment> = Vec::new();
        let mut unchanged: Vec<RelationFragment> = Vec::new();
        for fragment in fragments {
            validate_relation(&fragment.from, &fragment.to, &fragment.predicate)?;
            let identity = fragment.identity();
            if !scope.contains(&identity) {
                return Err(StrataError::InvalidInput(format!(
                    "relation {identity} lies outside of the bulk scope"
                )));
            }
            if !seen.insert(identity.clone()) {
                return Err(StrataError::InvalidInput(format!(
                    "relation {identity} appears more than once"
                )));
            }
            outdated.remove(&identity);
            if let Some(current) = existing.get(&identity) {
                if !current.removed && current.mask == fragment.mask {
                    unchanged.push(fragment);
                    continue;
                }
            }
            inserts.push(fragment);
        }

        // removals that must not be turned into masks
        let mut plain_removals: HashSet<RelationIdentity, IdentityHasher> = HashSet::default();
        if let OtherLayersValueHandling::TakeIntoAccount { read_layers } = other_layers {
            let others = read_layers.without(layer);
            if !others.is_empty() && !(inserts.is_empty() && unchanged.is_empty()) {
                let identities = inserts
                    .iter()
                    .chain(unchanged.iter())
                    .map(RelationFragment::identity)
                    .collect();
                let merged: HashMap<RelationIdentity, bool, IdentityHasher> = self
                    .merged_relations(
                        &RelationSelection::Specific(identities),
                        &others,
                        &time,
                        MaskHandlingForRetrieval::GetMasks,
                    )
                    .await?
                    .into_iter()
                    .map(|m| (m.relation.information_hash(), m.relation.mask))
                    .collect();
                inserts.retain(|fragment| {
                    let identity = fragment.identity();
                    if merged.get(&identity) != Some(&fragment.mask) {
                        return true;
                    }
                    if existing.get(&identity).is_some_and(|r| !r.removed) {
                        plain_removals.insert(identity);
                    }
                    false
                });
                for fragment in &unchanged {
                    if merged.get(&fragment.identity()) == Some(&fragment.mask) {
                        plain_removals.insert(fragment.identity());
                    }
                }
            }
        }

        // removals that would let a lower layer shine through become masks
        let mut masks: HashSet<RelationIdentity, IdentityHasher> = HashSet::default();
        if let MaskHandlingForRemoval::ApplyMaskIfNecessary { read_layers } = mask_handling {
            let below = read_layers.layers_below(layer);
            if !below.is_empty() && !outdated.is_empty() {
                let identities = outdated.iter().cloned().collect();
                let supplied = self
                    .merged_relations(
                        &RelationSelection::Specific(identities),
                        &below,
                        &time,
                        MaskHandlingForRetrieval::ApplyMasks,
                    )
                    .await?;
                for merged in supplied {
                    let identity = merged.relation.information_hash();
                    outdated.remove(&identity);
                    // an existing mask already does the job
                    if existing.get(&identity).is_some_and(|r| !r.mask) {
                        masks.insert(identity);
                    }
                }
            }
        }
        outdated.extend(plain_removals);

        if inserts.is_empty() && outdated.is_empty() && masks.is_empty() {
            debug!(layer, "bulk relation replace resolved to no changes");
            return Ok(Vec::new());
        }

        let changeset_id = changeset.get_changeset(layer).await?.id;
        let timestamp = changeset.timestamp();
        let record = |identity: RelationIdentity, mask: bool, removed: bool| Relation {
            id: Uuid::new_v4(),
            from: identity.from,
            to: identity.to,
            predicate: identity.predicate,
            changeset: changeset_id,
            mask,
            removed,
            layer: layer.to_owned(),
            timestamp,
        };
        let (insert_count, removal_count, mask_count) = (inserts.len(), outdated.len(), masks.len());
        let mut records = Vec::with_capacity(insert_count + removal_count + mask_count);
        let mut changed = Vec::with_capacity(records.capacity());
        for fragment in inserts {
            changed.push(fragment.identity());
            records.push(record(fragment.identity(), fragment.mask, false));
        }
        for identity in masks {
            changed.push(identity.clone());
            records.push(record(identity, true, false));
        }
        for identity in outdated {
            let mask = existing.get(&identity).is_some_and(|r| r.mask);
            changed.push(identity.clone());
            records.push(record(identity, mask, true));
        }
        persist_relations(self.store.as_ref(), &records, timestamp).await?;
        debug!(
            layer,
            inserts = insert_count,
            removals = removal_count,
            masks = mask_count,
            "bulk relation replace written"
        );
        Ok(changed)
    }

    async fn merged_relations(
        &self,
        selection: &RelationSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
        mask_handling: MaskHandlingForRetrieval,
    ) -> Result<Vec<crate::construct::MergedRelation>> {
        let per_layer = futures_util::future::try_join_all(
            layers
                .iter()
                .map(|l: &LayerId| self.store.get_relations(selection, l, time, false)),
        )
        .await?;
        merge_relations(per_layer.into_iter().flatten(), layers, mask_handling)
    }
}
