//! Merged reads and single record writes for attributes, relations and CIs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use tracing::{debug, info};
use uuid::Uuid;

use crate::changeset::ChangesetProxy;
use crate::construct::{
    validate_predicate_id, AttributeSelection, AttributeState, CIAttribute, CiId, CiSelection,
    LayerSet, MergedCIAttribute, MergedRelation, Relation, RelationIdentity, RelationSelection,
    TimeThreshold, NAME_ATTRIBUTE,
};
use crate::datatype::AttributeValue;
use crate::error::{Result, StrataError};
use crate::merge::{merge_attributes, merge_relations, MaskHandlingForRetrieval};
use crate::persist::TemporalStore;

// ------------- Writing -------------
pub(crate) async fn persist_attributes(
    store: &dyn TemporalStore,
    records: &[CIAttribute],
    timestamp: DateTime<Utc>,
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let partition = store
        .latest_partition_index(&TimeThreshold::at(timestamp))
        .await?;
    store.append_historic_attributes(records, partition).await?;
    store.upsert_latest_attributes(records).await
}

pub(crate) async fn persist_relations(
    store: &dyn TemporalStore,
    records: &[Relation],
    timestamp: DateTime<Utc>,
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let partition = store
        .latest_partition_index(&TimeThreshold::at(timestamp))
        .await?;
    store.append_historic_relations(records, partition).await?;
    store.upsert_latest_relations(records).await
}

pub(crate) fn validate_relation(from: &CiId, to: &CiId, predicate: &str) -> Result<()> {
    if from == to {
        return Err(StrataError::InvalidInput(format!(
            "relation '{predicate}' must not point from CI {from} to itself"
        )));
    }
    validate_predicate_id(predicate)
}

// ------------- Attributes -------------
pub struct AttributeModel {
    store: Arc<dyn TemporalStore>,
}

impl AttributeModel {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self { store }
    }

    /// The record currently stored in one layer, tombstones included.
    pub async fn get_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>> {
        self.store.get_attribute(name, ci, layer, time).await
    }

    pub async fn get_full_binary_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>> {
        self.store
            .get_full_binary_attribute(name, ci, layer, time)
            .await
    }

    pub async fn get_merged_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
    ) -> Result<Vec<MergedCIAttribute>> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }
        let per_layer = try_join_all(
            layers
                .iter()
                .map(|layer| self.store.get_attributes(cis, attributes, layer, time, false)),
        )
        .await?;
        merge_attributes(per_layer.into_iter().flatten(), layers)
    }

    pub async fn get_merged_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layers: &LayerSet,
        time: &TimeThreshold,
    ) -> Result<Option<MergedCIAttribute>> {
        let mut merged = self
            .get_merged_attributes(
                &CiSelection::specific([*ci]),
                &AttributeSelection::named([name]),
                layers,
                time,
            )
            .await?;
        if merged.len() > 1 {
            return Err(StrataError::Invariant(format!(
                "{} merged attributes resolved for {name} of CI {ci}",
                merged.len()
            )));
        }
        Ok(merged.pop())
    }

    pub async fn find_merged_attributes_by_name(
        &self,
        pattern: &str,
        cis: &CiSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
    ) -> Result<Vec<MergedCIAttribute>> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }
        let per_layer = try_join_all(layers.iter().map(|layer| {
            self.store
                .find_attributes_by_name(pattern, cis, layer, time, false)
        }))
        .await?;
        merge_attributes(per_layer.into_iter().flatten(), layers)
    }

    /// Writes a value unless the layer already holds it. The flag tells
    /// whether a record was written.
    pub async fn insert_attribute(
        &self,
        name: &str,
        value: AttributeValue,
        ci: &CiId,
        layer: &str,
        changeset: &ChangesetProxy,
    ) -> Result<(CIAttribute, bool)> {
        if name.is_empty() {
            return Err(StrataError::InvalidInput(
                "attribute name must not be empty".into(),
            ));
        }
        let current = self
            .store
            .get_attribute(name, ci, layer, &changeset.time())
            .await?;
        if let Some(current) = &current {
            if !current.is_removed() && current.value == value {
                debug!(attribute = name, ci = %ci, layer, "value unchanged, skipping insert");
                return Ok((current.clone(), false));
            }
        }
        let state = AttributeState::on_insert(current.as_ref());
        let changeset_id = changeset.get_changeset(layer).await?.id;
        let record = CIAttribute {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            ci: *ci,
            value,
            state,
            changeset: changeset_id,
            layer: layer.to_owned(),
            timestamp: changeset.timestamp(),
        };
        persist_attributes(
            self.store.as_ref(),
            std::slice::from_ref(&record),
            changeset.timestamp(),
        )
        .await?;
        Ok((record, true))
    }

    /// Writes a tombstone that keeps the last known value.
    pub async fn remove_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        changeset: &ChangesetProxy,
    ) -> Result<(CIAttribute, bool)> {
        let current = self
            .store
            .get_attribute(name, ci, layer, &changeset.time())
            .await?
            .ok_or_else(|| {
                StrataError::InvalidInput(format!(
                    "cannot remove attribute {name} of CI {ci} in layer {layer}, it does not exist"
                ))
            })?;
        if current.is_removed() {
            return Ok((current, false));
        }
        let changeset_id = changeset.get_changeset(layer).await?.id;
        let record = CIAttribute {
            id: Uuid::new_v4(),
            state: AttributeState::Removed,
            changeset: changeset_id,
            timestamp: changeset.timestamp(),
            ..current
        };
        persist_attributes(
            self.store.as_ref(),
            std::slice::from_ref(&record),
            changeset.timestamp(),
        )
        .await?;
        Ok((record, true))
    }
}

// ------------- Relations -------------
pub struct RelationModel {
    store: Arc<dyn TemporalStore>,
}

impl RelationModel {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self { store }
    }

    pub async fn get_relation(
        &self,
        identity: &RelationIdentity,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<Relation>> {
        self.store.get_relation(identity, layer, time).await
    }

    pub async fn get_merged_relations(
        &self,
        selection: &RelationSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
        mask_handling: MaskHandlingForRetrieval,
    ) -> Result<Vec<MergedRelation>> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }
        let per_layer = try_join_all(
            layers
                .iter()
                .map(|layer| self.store.get_relations(selection, layer, time, false)),
        )
        .await?;
        merge_relations(per_layer.into_iter().flatten(), layers, mask_handling)
    }

    pub async fn get_merged_relation(
        &self,
        identity: &RelationIdentity,
        layers: &LayerSet,
        time: &TimeThreshold,
        mask_handling: MaskHandlingForRetrieval,
    ) -> Result<Option<MergedRelation>> {
        let selection = RelationSelection::Specific([identity.clone()].into_iter().collect());
        let mut merged = self
            .get_merged_relations(&selection, layers, time, mask_handling)
            .await?;
        if merged.len() > 1 {
            return Err(StrataError::Invariant(format!(
                "{} merged relations resolved for {identity}",
                merged.len()
            )));
        }
        Ok(merged.pop())
    }

    pub async fn insert_relation(
        &self,
        identity: &RelationIdentity,
        layer: &str,
        mask: bool,
        changeset: &ChangesetProxy,
    ) -> Result<(Relation, bool)> {
        validate_relation(&identity.from, &identity.to, &identity.predicate)?;
        let current = self
            .store
            .get_relation(identity, layer, &changeset.time())
            .await?;
        if let Some(current) = current {
            if !current.removed && current.mask == mask {
                return Ok((current, false));
            }
        }
        let changeset_id = changeset.get_changeset(layer).await?.id;
        let record = Relation {
            id: Uuid::new_v4(),
            from: identity.from,
            to: identity.to,
            predicate: identity.predicate.clone(),
            changeset: changeset_id,
            mask,
            removed: false,
            layer: layer.to_owned(),
            timestamp: changeset.timestamp(),
        };
        persist_relations(
            self.store.as_ref(),
            std::slice::from_ref(&record),
            changeset.timestamp(),
        )
        .await?;
        Ok((record, true))
    }

    /// Removes a relation from one layer. `None` when the layer holds nothing
    /// to remove.
    pub async fn remove_relation(
        &self,
        identity: &RelationIdentity,
        layer: &str,
        changeset: &ChangesetProxy,
    ) -> Result<Option<Relation>> {
        validate_relation(&identity.from, &identity.to, &identity.predicate)?;
        let current = match self
            .store
            .get_relation(identity, layer, &changeset.time())
            .await?
        {
            Some(current) if !current.removed => current,
            _ => return Ok(None),
        };
        let changeset_id = changeset.get_changeset(layer).await?.id;
        let record = Relation {
            id: Uuid::new_v4(),
            changeset: changeset_id,
            removed: true,
            timestamp: changeset.timestamp(),
            ..current
        };
        persist_relations(
            self.store.as_ref(),
            std::slice::from_ref(&record),
            changeset.timestamp(),
        )
        .await?;
        Ok(Some(record))
    }
}

// ------------- CIs -------------
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCI {
    pub id: CiId,
    pub name: Option<String>,
    pub attributes: BTreeMap<String, MergedCIAttribute>,
}
impl MergedCI {
    fn new(id: CiId, attributes: BTreeMap<String, MergedCIAttribute>) -> Self {
        let name = match attributes.get(NAME_ATTRIBUTE).map(|a| &a.attribute.value) {
            Some(AttributeValue::Text(name)) => Some(name.clone()),
            _ => None,
        };
        Self {
            id,
            name,
            attributes,
        }
    }
}

pub struct CiModel {
    store: Arc<dyn TemporalStore>,
    attributes: AttributeModel,
}

impl CiModel {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self {
            attributes: AttributeModel::new(store.clone()),
            store,
        }
    }

    pub async fn create_ci(&self, id: Option<CiId>) -> Result<CiId> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        self.store.create_ci(&id).await?;
        info!(ci = %id, "created CI");
        Ok(id)
    }

    pub async fn ci_ids(&self) -> Result<Vec<CiId>> {
        self.store.ci_ids().await
    }

    /// Merged CIs of a selection. CIs without any merged attribute only show
    /// up when `include_empty` is set.
    pub async fn get_merged_cis(
        &self,
        cis: &CiSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
        include_empty: bool,
    ) -> Result<Vec<MergedCI>> {
        let merged = self
            .attributes
            .get_merged_attributes(cis, &AttributeSelection::All, layers, time)
            .await?;
        let mut by_ci: BTreeMap<CiId, BTreeMap<String, MergedCIAttribute>> = BTreeMap::new();
        for attribute in merged {
            by_ci
                .entry(attribute.attribute.ci)
                .or_default()
                .insert(attribute.attribute.name.clone(), attribute);
        }
        if include_empty {
            for id in self.store.ci_ids().await? {
                if cis.contains(&id) {
                    by_ci.entry(id).or_default();
                }
            }
        }
        Ok(by_ci
            .into_iter()
            .map(|(id, attributes)| MergedCI::new(id, attributes))
            .collect())
    }
}
