//! Binds flattened traits to merged CIs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::construct::{
    CiId, CiSelection, IdentityHasher, LayerSet, MergedCIAttribute, MergedRelation,
    RelationSelection, TimeThreshold,
};
use crate::datatype::AttributeValueType;
use crate::error::Result;
use crate::merge::MaskHandlingForRetrieval;
use crate::model::{CiModel, MergedCI, RelationModel};
use crate::persist::TemporalStore;
use crate::traits::{
    CIAttributeTemplate, FlattenedTrait, RelationTemplate, TraitCatalog, TraitId, EMPTY_TRAIT_ID,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("attribute '{0}' is missing")]
    MissingAttribute(String),
    #[error("attribute '{name}' is of type {found}, expected {expected}")]
    WrongType {
        name: String,
        expected: AttributeValueType,
        found: AttributeValueType,
    },
    #[error("attribute '{name}' has the wrong multiplicity, expected array: {expected_array}")]
    WrongMultiplicity { name: String, expected_array: bool },
    #[error("attribute '{name}' violates constraint: {constraint}")]
    ConstraintViolated { name: String, constraint: String },
    #[error("relation '{predicate}' occurs {count} times, expected between {min:?} and {max:?}")]
    RelationCardinality {
        predicate: String,
        count: usize,
        min: Option<usize>,
        max: Option<usize>,
    },
}

// ------------- Checks -------------
pub fn check_attribute(
    attribute: Option<&MergedCIAttribute>,
    template: &CIAttributeTemplate,
) -> Vec<TemplateError> {
    let Some(attribute) = attribute else {
        return vec![TemplateError::MissingAttribute(template.name.clone())];
    };
    let value = &attribute.attribute.value;
    if let Some(expected) = template.value_type {
        if value.value_type() != expected {
            return vec![TemplateError::WrongType {
                name: template.name.clone(),
                expected,
                found: value.value_type(),
            }];
        }
    }
    if let Some(expected_array) = template.is_array {
        if value.is_array() != expected_array {
            return vec![TemplateError::WrongMultiplicity {
                name: template.name.clone(),
                expected_array,
            }];
        }
    }
    template
        .constraints
        .iter()
        .filter(|c| c.has_errors(value))
        .map(|c| TemplateError::ConstraintViolated {
            name: template.name.clone(),
            constraint: c.to_string(),
        })
        .collect()
}

/// The relations of `ci` a template selects, if their number fits its cardinality.
pub fn check_relations(
    ci: &CiId,
    relations: &[MergedRelation],
    template: &RelationTemplate,
) -> std::result::Result<Vec<MergedRelation>, TemplateError> {
    let matching: Vec<MergedRelation> = relations
        .iter()
        .filter(|m| {
            let r = &m.relation;
            let end = if template.direction_forward { r.from } else { r.to };
            r.predicate == template.predicate && end == *ci
        })
        .cloned()
        .collect();
    let count = matching.len();
    let too_few = template.min_cardinality.is_some_and(|min| count < min);
    let too_many = template.max_cardinality.is_some_and(|max| count > max);
    if too_few || too_many {
        return Err(TemplateError::RelationCardinality {
            predicate: template.predicate.clone(),
            count,
            min: template.min_cardinality,
            max: template.max_cardinality,
        });
    }
    Ok(matching)
}

fn is_empty_ci(ci: &MergedCI, relations: &[MergedRelation]) -> bool {
    ci.attributes.is_empty() && relations.is_empty()
}

/// Every reason a CI fails the required part of a trait.
pub fn check_trait(
    flattened: &FlattenedTrait,
    ci: &MergedCI,
    relations: &[MergedRelation],
) -> Vec<TemplateError> {
    let mut errors = Vec::new();
    for required in &flattened.required_attributes {
        let template = &required.template;
        errors.extend(check_attribute(ci.attributes.get(&template.name), template));
    }
    for required in &flattened.required_relations {
        if let Err(e) = check_relations(&ci.id, relations, &required.template) {
            errors.push(e);
        }
    }
    errors
}

/// `relations` holds the merged relations touching the CI.
pub fn can_resolve(flattened: &FlattenedTrait, ci: &MergedCI, relations: &[MergedRelation]) -> bool {
    if flattened.is_empty_trait() {
        return is_empty_ci(ci, relations);
    }
    flattened.required_attributes.iter().all(|required| {
        let template = &required.template;
        check_attribute(ci.attributes.get(&template.name), template).is_empty()
    }) && flattened
        .required_relations
        .iter()
        .all(|required| check_relations(&ci.id, relations, &required.template).is_ok())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveTrait {
    pub ci: CiId,
    pub trait_id: TraitId,
    pub attributes: BTreeMap<String, MergedCIAttribute>,
    pub relations: BTreeMap<String, Vec<MergedRelation>>,
}
impl EffectiveTrait {
    /// The CIs at the other end of the relations bound to an identifier.
    pub fn related_cis(&self, identifier: &str) -> Vec<CiId> {
        self.relations
            .get(identifier)
            .map(|relations| {
                relations
                    .iter()
                    .map(|m| {
                        if m.relation.from == self.ci {
                            m.relation.to
                        } else {
                            m.relation.from
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn resolve(
    flattened: &FlattenedTrait,
    ci: &MergedCI,
    relations: &[MergedRelation],
) -> Option<EffectiveTrait> {
    if !can_resolve(flattened, ci, relations) {
        return None;
    }
    let mut attributes = BTreeMap::new();
    for (trait_attribute, required) in flattened
        .required_attributes
        .iter()
        .map(|a| (a, true))
        .chain(flattened.optional_attributes.iter().map(|a| (a, false)))
    {
        let template = &trait_attribute.template;
        let Some(attribute) = ci.attributes.get(&template.name) else {
            continue;
        };
        if required || check_attribute(Some(attribute), template).is_empty() {
            attributes.insert(trait_attribute.identifier.clone(), attribute.clone());
        }
    }
    let mut bound_relations = BTreeMap::new();
    for trait_relation in flattened
        .required_relations
        .iter()
        .chain(flattened.optional_relations.iter())
    {
        if let Ok(matching) = check_relations(&ci.id, relations, &trait_relation.template) {
            bound_relations.insert(trait_relation.identifier.clone(), matching);
        }
    }
    Some(EffectiveTrait {
        ci: ci.id,
        trait_id: flattened.id.clone(),
        attributes,
        relations: bound_relations,
    })
}

// ------------- Requirements -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyHandling {
    Ignore,
    /// only CIs without attributes and relations qualify
    Require,
    Exclude,
}

/// A reduced set of trait checks, longest trait ids first.
#[derive(Debug, Clone)]
pub struct TraitRequirements {
    pub required: Vec<FlattenedTrait>,
    pub forbidden: Vec<FlattenedTrait>,
    pub empty: EmptyHandling,
}
impl TraitRequirements {
    pub fn matches(&self, ci: &MergedCI, relations: &[MergedRelation]) -> bool {
        let empty = is_empty_ci(ci, relations);
        match self.empty {
            EmptyHandling::Require if !empty => return false,
            EmptyHandling::Exclude if empty => return false,
            _ => {}
        }
        self.required
            .iter()
            .all(|t| can_resolve(t, ci, relations))
            && !self
                .forbidden
                .iter()
                .any(|t| can_resolve(t, ci, relations))
    }
}

/// Drops checks implied by others. `None` when no CI can satisfy the
/// combination.
pub fn reduce_trait_requirements(
    required: &[&FlattenedTrait],
    forbidden: &[&FlattenedTrait],
) -> Option<TraitRequirements> {
    let requires_empty = required.iter().any(|t| t.is_empty_trait());
    let forbids_empty = forbidden.iter().any(|t| t.is_empty_trait());
    let required: Vec<&FlattenedTrait> = dedup(required.iter().filter(|t| !t.is_empty_trait()));
    let forbidden: Vec<&FlattenedTrait> = dedup(forbidden.iter().filter(|t| !t.is_empty_trait()));

    let empty = match (requires_empty, forbids_empty) {
        (true, true) => return None,
        // an empty CI has no other traits
        (true, false) if !required.is_empty() => return None,
        (true, false) => EmptyHandling::Require,
        (false, true) => EmptyHandling::Exclude,
        (false, false) => EmptyHandling::Ignore,
    };

    let forbidden_ids: BTreeSet<&str> = forbidden.iter().map(|t| t.id.as_str()).collect();
    for t in &required {
        if forbidden_ids.contains(t.id.as_str())
            || t.ancestor_traits
                .iter()
                .any(|a| forbidden_ids.contains(a.as_str()))
        {
            debug!(trait_id = %t.id, "required trait conflicts with a forbidden trait");
            return None;
        }
    }

    let mut reduced_required: Vec<FlattenedTrait> = required
        .iter()
        .filter(|t| {
            !required
                .iter()
                .any(|other| other.ancestor_traits.contains(&t.id))
        })
        .map(|t| (*t).clone())
        .collect();
    let mut reduced_forbidden: Vec<FlattenedTrait> = forbidden
        .iter()
        .filter(|t| {
            !t.ancestor_traits
                .iter()
                .any(|a| forbidden_ids.contains(a.as_str()))
        })
        .map(|t| (*t).clone())
        .collect();
    reduced_required.sort_by(|a, b| b.id.len().cmp(&a.id.len()));
    reduced_forbidden.sort_by(|a, b| b.id.len().cmp(&a.id.len()));

    Some(TraitRequirements {
        required: reduced_required,
        forbidden: reduced_forbidden,
        empty,
    })
}

fn dedup<'a>(traits: impl Iterator<Item = &'a &'a FlattenedTrait>) -> Vec<&'a FlattenedTrait> {
    let mut seen = BTreeSet::new();
    traits
        .filter(|t| seen.insert(t.id.clone()))
        .copied()
        .collect()
}

// ------------- Model -------------
pub struct EffectiveTraitModel {
    cis: CiModel,
    relations: RelationModel,
}

impl EffectiveTraitModel {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self {
            cis: CiModel::new(store.clone()),
            relations: RelationModel::new(store),
        }
    }

    async fn merged_cis_with_relations(
        &self,
        cis: &CiSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
        include_empty: bool,
    ) -> Result<Vec<(MergedCI, Vec<MergedRelation>)>> {
        let merged_cis = self.cis.get_merged_cis(cis, layers, time, include_empty).await?;
        if merged_cis.is_empty() {
            return Ok(Vec::new());
        }
        let selection =
            RelationSelection::Either(CiSelection::specific(merged_cis.iter().map(|c| c.id)));
        let mut by_ci: HashMap<CiId, Vec<MergedRelation>, IdentityHasher> = HashMap::default();
        for merged in self
            .relations
            .get_merged_relations(&selection, layers, time, MaskHandlingForRetrieval::ApplyMasks)
            .await?
        {
            by_ci
                .entry(merged.relation.to)
                .or_default()
                .push(merged.clone());
            by_ci.entry(merged.relation.from).or_default().push(merged);
        }
        Ok(merged_cis
            .into_iter()
            .map(|ci| {
                let relations = by_ci.remove(&ci.id).unwrap_or_default();
                (ci, relations)
            })
            .collect())
    }

    pub async fn get_effective_traits_for_trait(
        &self,
        flattened: &FlattenedTrait,
        cis: &CiSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
    ) -> Result<Vec<EffectiveTrait>> {
        // CIs without attributes can only satisfy traits that require none
        let include_empty = flattened.required_attributes.is_empty();
        let candidates = self
            .merged_cis_with_relations(cis, layers, time, include_empty)
            .await?;
        Ok(candidates
            .iter()
            .filter_map(|(ci, relations)| resolve(flattened, ci, relations))
            .collect())
    }

    pub async fn get_merged_cis_with_trait_requirements(
        &self,
        cis: &CiSelection,
        layers: &LayerSet,
        time: &TimeThreshold,
        required: &[&FlattenedTrait],
        forbidden: &[&FlattenedTrait],
    ) -> Result<Vec<MergedCI>> {
        let Some(requirements) = reduce_trait_requirements(required, forbidden) else {
            return Ok(Vec::new());
        };
        // a CI without attributes may still carry relations, `matches` decides
        let include_empty = requirements
            .required
            .iter()
            .all(|t| t.required_attributes.is_empty());
        let candidates = self
            .merged_cis_with_relations(cis, layers, time, include_empty)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|(ci, relations)| requirements.matches(ci, relations))
            .map(|(ci, _)| ci)
            .collect())
    }

    /// Every trait of the catalog that applies to one CI.
    pub async fn get_effective_traits_for_ci(
        &self,
        catalog: &TraitCatalog,
        ci: &CiId,
        layers: &LayerSet,
        time: &TimeThreshold,
    ) -> Result<Vec<EffectiveTrait>> {
        let candidates = self
            .merged_cis_with_relations(&CiSelection::specific([*ci]), layers, time, true)
            .await?;
        let Some((merged, relations)) = candidates.into_iter().next() else {
            return Ok(Vec::new());
        };
        Ok(catalog
            .iter()
            .filter(|t| t.id != EMPTY_TRAIT_ID || is_empty_ci(&merged, &relations))
            .filter_map(|t| resolve(t, &merged, &relations))
            .collect())
    }
}
