//! Trait definitions and their flattening.
//!
//! A [`RecursiveTrait`] names the traits it depends on. Flattening folds the
//! requirements of every dependency into the dependant, producing
//! [`FlattenedTrait`]s that can be checked against a CI on their own. Traits
//! that cannot be flattened, because they sit on a dependency cycle or depend
//! on something unknown, are left out of the result and reported next to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::construct::{OtherHasher, PredicateId, NAME_ATTRIBUTE};
use crate::datatype::{AttributeValue, AttributeValueType};
use crate::error::{Result, StrataError};

pub type TraitId = String;

/// The trait every CI without attributes and relations has.
pub const EMPTY_TRAIT_ID: &str = "empty";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TraitOrigin {
    Core,
    Plugin,
    #[default]
    Data,
}
impl TraitOrigin {
    // lower takes precedence when the same id is defined twice
    fn precedence(&self) -> u8 {
        match self {
            TraitOrigin::Core => 0,
            TraitOrigin::Plugin => 1,
            TraitOrigin::Data => 2,
        }
    }
}

// ------------- Constraints -------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CIAttributeValueConstraint {
    /// bounds on the UTF-16 length of every text element
    TextLength {
        minimum: Option<usize>,
        maximum: Option<usize>,
    },
    ArrayLength {
        minimum: Option<usize>,
        maximum: Option<usize>,
    },
    /// every text element must contain a match
    TextRegex {
        #[serde(with = "regex_pattern")]
        regex: Regex,
    },
}
impl CIAttributeValueConstraint {
    pub fn text_length(minimum: Option<usize>, maximum: Option<usize>) -> Result<Self> {
        check_bounds(minimum, maximum)?;
        Ok(Self::TextLength { minimum, maximum })
    }
    pub fn array_length(minimum: Option<usize>, maximum: Option<usize>) -> Result<Self> {
        check_bounds(minimum, maximum)?;
        Ok(Self::ArrayLength { minimum, maximum })
    }
    pub fn text_regex(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| StrataError::InvalidInput(e.to_string()))?;
        Ok(Self::TextRegex { regex })
    }

    pub fn has_errors(&self, value: &AttributeValue) -> bool {
        match self {
            Self::TextLength { minimum, maximum } => match value.text_values() {
                Some(texts) => texts.iter().any(|t| {
                    !within(t.encode_utf16().count(), *minimum, *maximum)
                }),
                None => true,
            },
            Self::ArrayLength { minimum, maximum } => match value.array_len() {
                Some(length) => !within(length, *minimum, *maximum),
                None => true,
            },
            Self::TextRegex { regex } => match value.text_values() {
                Some(texts) => texts.iter().any(|t| !regex.is_match(t)),
                None => true,
            },
        }
    }
}
impl PartialEq for CIAttributeValueConstraint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::TextLength { minimum, maximum },
                Self::TextLength { minimum: m, maximum: x },
            )
            | (
                Self::ArrayLength { minimum, maximum },
                Self::ArrayLength { minimum: m, maximum: x },
            ) => minimum == m && maximum == x,
            (Self::TextRegex { regex }, Self::TextRegex { regex: other }) => {
                regex.as_str() == other.as_str()
            }
            _ => false,
        }
    }
}
impl Eq for CIAttributeValueConstraint {}

impl fmt::Display for CIAttributeValueConstraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bound = |b: &Option<usize>| b.map(|b| b.to_string()).unwrap_or_else(|| "*".into());
        match self {
            Self::TextLength { minimum, maximum } => {
                write!(f, "text length in [{}, {}]", bound(minimum), bound(maximum))
            }
            Self::ArrayLength { minimum, maximum } => {
                write!(f, "array length in [{}, {}]", bound(minimum), bound(maximum))
            }
            Self::TextRegex { regex } => write!(f, "text matching /{}/", regex.as_str()),
        }
    }
}

fn check_bounds(minimum: Option<usize>, maximum: Option<usize>) -> Result<()> {
    match (minimum, maximum) {
        (Some(min), Some(max)) if min > max => Err(StrataError::InvalidInput(format!(
            "minimum {min} must not be larger than maximum {max}"
        ))),
        _ => Ok(()),
    }
}

fn within(length: usize, minimum: Option<usize>, maximum: Option<usize>) -> bool {
    minimum.is_none_or(|min| length >= min) && maximum.is_none_or(|max| length <= max)
}

mod regex_pattern {
    use regex::Regex;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(regex: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(regex.as_str())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Regex::new(&pattern).map_err(de::Error::custom)
    }
}

// ------------- Templates -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CIAttributeTemplate {
    pub name: String,
    #[serde(default)]
    pub value_type: Option<AttributeValueType>,
    #[serde(default)]
    pub is_array: Option<bool>,
    #[serde(default)]
    pub constraints: Vec<CIAttributeValueConstraint>,
    #[serde(default)]
    pub is_id: Option<bool>,
}
impl CIAttributeTemplate {
    pub fn new(name: impl Into<String>, value_type: AttributeValueType, is_array: bool) -> Self {
        Self {
            name: name.into(),
            value_type: Some(value_type),
            is_array: Some(is_array),
            constraints: Vec::new(),
            is_id: None,
        }
    }
    pub fn with_constraint(mut self, constraint: CIAttributeValueConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTemplate {
    pub predicate: PredicateId,
    /// true when the CI is the origin of the relation
    pub direction_forward: bool,
    #[serde(default)]
    pub min_cardinality: Option<usize>,
    #[serde(default)]
    pub max_cardinality: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitAttribute {
    pub identifier: String,
    pub template: CIAttributeTemplate,
}
impl TraitAttribute {
    pub fn new(identifier: impl Into<String>, template: CIAttributeTemplate) -> Self {
        Self {
            identifier: identifier.into(),
            template,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitRelation {
    pub identifier: String,
    pub template: RelationTemplate,
}
impl TraitRelation {
    pub fn new(
        identifier: impl Into<String>,
        predicate: impl Into<PredicateId>,
        direction_forward: bool,
        min_cardinality: Option<usize>,
        max_cardinality: Option<usize>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            template: RelationTemplate {
                predicate: predicate.into(),
                direction_forward,
                min_cardinality,
                max_cardinality,
            },
        }
    }
}

// ------------- Traits -------------
/// A trait as it is defined, naming the traits it builds on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursiveTrait {
    pub id: TraitId,
    #[serde(default)]
    pub origin: TraitOrigin,
    #[serde(default)]
    pub required_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    pub optional_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    pub required_relations: Vec<TraitRelation>,
    #[serde(default)]
    pub optional_relations: Vec<TraitRelation>,
    #[serde(default)]
    pub required_traits: Vec<TraitId>,
}
impl RecursiveTrait {
    pub fn new(id: impl Into<TraitId>, origin: TraitOrigin) -> Self {
        Self {
            id: id.into(),
            origin,
            required_attributes: Vec::new(),
            optional_attributes: Vec::new(),
            required_relations: Vec::new(),
            optional_relations: Vec::new(),
            required_traits: Vec::new(),
        }
    }
}

/// A trait with everything it inherits folded in.
#[derive(Debug, Clone)]
pub struct FlattenedTrait {
    pub id: TraitId,
    pub origin: TraitOrigin,
    pub required_attributes: Vec<TraitAttribute>,
    pub optional_attributes: Vec<TraitAttribute>,
    pub required_relations: Vec<TraitRelation>,
    pub optional_relations: Vec<TraitRelation>,
    pub ancestor_traits: BTreeSet<TraitId>,
}
impl FlattenedTrait {
    pub fn empty() -> Self {
        Self {
            id: EMPTY_TRAIT_ID.to_owned(),
            origin: TraitOrigin::Core,
            required_attributes: Vec::new(),
            optional_attributes: Vec::new(),
            required_relations: Vec::new(),
            optional_relations: Vec::new(),
            ancestor_traits: BTreeSet::new(),
        }
    }
    pub fn is_empty_trait(&self) -> bool {
        self.id == EMPTY_TRAIT_ID
    }
    fn own(raw: &RecursiveTrait) -> Self {
        Self {
            id: raw.id.clone(),
            origin: raw.origin,
            required_attributes: raw.required_attributes.clone(),
            optional_attributes: raw.optional_attributes.clone(),
            required_relations: raw.required_relations.clone(),
            optional_relations: raw.optional_relations.clone(),
            ancestor_traits: BTreeSet::new(),
        }
    }
    // own contributions come first, then everything inherited
    fn absorb(&mut self, dependency: &FlattenedTrait) {
        extend_distinct(&mut self.required_attributes, &dependency.required_attributes);
        extend_distinct(&mut self.optional_attributes, &dependency.optional_attributes);
        extend_distinct(&mut self.required_relations, &dependency.required_relations);
        extend_distinct(&mut self.optional_relations, &dependency.optional_relations);
        self.ancestor_traits.insert(dependency.id.clone());
        self.ancestor_traits
            .extend(dependency.ancestor_traits.iter().cloned());
    }
}

/// Appends what is not already present. Templates sharing an identifier but
/// differing otherwise are all kept.
fn extend_distinct<T: Clone + PartialEq>(target: &mut Vec<T>, source: &[T]) {
    for item in source {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

// ------------- Flattening -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlattenIssue {
    /// the trait sits on this dependency cycle
    Cycle(Vec<TraitId>),
    /// a required trait is unknown or could not be flattened itself
    MissingDependency(TraitId),
}
impl fmt::Display for FlattenIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlattenIssue::Cycle(path) => write!(f, "dependency cycle {}", path.join(" -> ")),
            FlattenIssue::MissingDependency(id) => write!(f, "required trait '{id}' is unavailable"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlattenOutcome {
    pub traits: BTreeMap<TraitId, FlattenedTrait>,
    pub dropped: Vec<(TraitId, FlattenIssue)>,
}

struct Flattener<'a> {
    input: &'a BTreeMap<TraitId, RecursiveTrait>,
    finished: HashMap<TraitId, Option<FlattenedTrait>, OtherHasher>,
    dropped: BTreeMap<TraitId, FlattenIssue>,
    path: Vec<TraitId>,
}
impl<'a> Flattener<'a> {
    fn visit(&mut self, id: &str) -> Option<FlattenedTrait> {
        if let Some(finished) = self.finished.get(id) {
            return finished.clone();
        }
        if let Some(position) = self.path.iter().position(|p| p == id) {
            let mut cycle = self.path[position..].to_vec();
            cycle.push(id.to_owned());
            for member in &self.path[position..] {
                self.dropped
                    .entry(member.clone())
                    .or_insert_with(|| FlattenIssue::Cycle(cycle.clone()));
            }
            return None;
        }
        let input = self.input;
        let raw = input.get(id)?;

        self.path.push(id.to_owned());
        let mut flattened = FlattenedTrait::own(raw);
        for dependency in &raw.required_traits {
            match self.visit(dependency) {
                Some(resolved) => flattened.absorb(&resolved),
                None => {
                    self.dropped
                        .entry(id.to_owned())
                        .or_insert_with(|| FlattenIssue::MissingDependency(dependency.clone()));
                }
            }
        }
        self.path.pop();

        let result = if self.dropped.contains_key(id) {
            None
        } else {
            Some(flattened)
        };
        self.finished.insert(id.to_owned(), result.clone());
        result
    }
}

/// Flattens a trait catalog. Traits on a dependency cycle and traits that
/// depend on anything unavailable are dropped and reported, never an error.
pub fn flatten_traits(input: &BTreeMap<TraitId, RecursiveTrait>) -> FlattenOutcome {
    let mut flattener = Flattener {
        input,
        finished: HashMap::default(),
        dropped: BTreeMap::new(),
        path: Vec::new(),
    };
    let mut traits = BTreeMap::new();
    for id in input.keys() {
        if let Some(flattened) = flattener.visit(id) {
            traits.insert(id.clone(), flattened);
        }
    }
    for (id, issue) in &flattener.dropped {
        warn!(trait_id = %id, issue = %issue, "dropping trait that cannot be flattened");
    }
    FlattenOutcome {
        traits,
        dropped: flattener.dropped.into_iter().collect(),
    }
}

/// Flattens a single trait that has no dependencies.
pub fn flatten_single(raw: &RecursiveTrait) -> Result<FlattenedTrait> {
    if !raw.required_traits.is_empty() {
        return Err(StrataError::InvalidInput(format!(
            "trait '{}' depends on other traits",
            raw.id
        )));
    }
    Ok(FlattenedTrait::own(raw))
}

// ------------- Catalog -------------
/// Combines trait definitions from several sources. When an id is defined
/// more than once, core beats plugin beats data; among equals the first wins.
pub fn merge_trait_sources(
    traits: impl IntoIterator<Item = RecursiveTrait>,
) -> BTreeMap<TraitId, RecursiveTrait> {
    let mut merged: BTreeMap<TraitId, RecursiveTrait> = BTreeMap::new();
    for candidate in traits {
        match merged.get(&candidate.id) {
            Some(existing) if existing.origin.precedence() <= candidate.origin.precedence() => {
                debug!(trait_id = %candidate.id, "ignoring shadowed trait definition");
            }
            _ => {
                merged.insert(candidate.id.clone(), candidate);
            }
        }
    }
    merged
}

/// Reads data defined traits from a JSON array.
pub fn traits_from_json(json: &str) -> Result<Vec<RecursiveTrait>> {
    let traits: Vec<RecursiveTrait> = serde_json::from_str(json)?;
    for t in &traits {
        if t.id == EMPTY_TRAIT_ID {
            return Err(StrataError::InvalidInput(format!(
                "trait id '{EMPTY_TRAIT_ID}' is reserved"
            )));
        }
    }
    Ok(traits)
}

/// The flattened traits available for resolution, always including `empty`.
#[derive(Debug, Clone, Default)]
pub struct TraitCatalog {
    traits: BTreeMap<TraitId, FlattenedTrait>,
}
impl TraitCatalog {
    /// Merges the sources, flattens them and returns what had to be dropped.
    pub fn build(
        sources: impl IntoIterator<Item = RecursiveTrait>,
    ) -> (Self, Vec<(TraitId, FlattenIssue)>) {
        let merged = merge_trait_sources(sources);
        let FlattenOutcome { mut traits, dropped } = flatten_traits(&merged);
        traits.insert(EMPTY_TRAIT_ID.to_owned(), FlattenedTrait::empty());
        (Self { traits }, dropped)
    }
    pub fn get(&self, id: &str) -> Option<&FlattenedTrait> {
        self.traits.get(id)
    }
    pub fn contains(&self, id: &str) -> bool {
        self.traits.contains_key(id)
    }
    pub fn ids(&self) -> impl Iterator<Item = &TraitId> {
        self.traits.keys()
    }
    pub fn iter(&self) -> impl Iterator<Item = &FlattenedTrait> {
        self.traits.values()
    }
    pub fn len(&self) -> usize {
        self.traits.len()
    }
    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }
}

// ------------- Core traits -------------
fn non_empty_text(name: &str) -> CIAttributeTemplate {
    CIAttributeTemplate::new(name, AttributeValueType::Text, false).with_constraint(
        CIAttributeValueConstraint::TextLength {
            minimum: Some(1),
            maximum: None,
        },
    )
}

fn id_text(name: &str, pattern: &str) -> Result<CIAttributeTemplate> {
    Ok(non_empty_text(name).with_constraint(CIAttributeValueConstraint::text_regex(pattern)?))
}

/// Traits that are always defined.
pub fn core_traits() -> Result<Vec<RecursiveTrait>> {
    let mut named = RecursiveTrait::new("named", TraitOrigin::Core);
    named
        .required_attributes
        .push(TraitAttribute::new("name", non_empty_text(NAME_ATTRIBUTE)));

    let mut meta_trait = RecursiveTrait::new("__meta.config.trait", TraitOrigin::Core);
    meta_trait.required_attributes = vec![
        TraitAttribute::new("id", id_text("trait.id", r"^[a-z0-9_.]+$")?),
        TraitAttribute::new(
            "required_attributes",
            CIAttributeTemplate::new("trait.required_attributes", AttributeValueType::JSON, true)
                .with_constraint(CIAttributeValueConstraint::ArrayLength {
                    minimum: Some(1),
                    maximum: None,
                }),
        ),
    ];
    meta_trait.optional_attributes = vec![
        TraitAttribute::new(
            "optional_attributes",
            CIAttributeTemplate::new("trait.optional_attributes", AttributeValueType::JSON, true),
        ),
        TraitAttribute::new(
            "required_relations",
            CIAttributeTemplate::new("trait.required_relations", AttributeValueType::JSON, true),
        ),
        TraitAttribute::new(
            "required_traits",
            CIAttributeTemplate::new("trait.required_traits", AttributeValueType::Text, true),
        ),
        TraitAttribute::new("name", non_empty_text(NAME_ATTRIBUTE)),
    ];

    let mut meta_predicate = RecursiveTrait::new("__meta.config.predicate", TraitOrigin::Core);
    meta_predicate.required_attributes = vec![
        TraitAttribute::new("id", id_text("predicate.id", r"^[a-z0-9_.]+$")?),
        TraitAttribute::new("wording_from", non_empty_text("predicate.wording_from")),
        TraitAttribute::new("wording_to", non_empty_text("predicate.wording_to")),
    ];
    meta_predicate.optional_attributes =
        vec![TraitAttribute::new("name", non_empty_text(NAME_ATTRIBUTE))];

    Ok(vec![named, meta_trait, meta_predicate])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_length_counts_utf16_units() {
        let constraint = CIAttributeValueConstraint::text_length(None, Some(2)).unwrap();
        // one astral code point is two UTF-16 units
        assert!(!constraint.has_errors(&AttributeValue::text("😀")));
        assert!(constraint.has_errors(&AttributeValue::text("a😀")));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(CIAttributeValueConstraint::text_length(Some(3), Some(1)).is_err());
        assert!(CIAttributeValueConstraint::array_length(Some(2), Some(2)).is_ok());
    }

    #[test]
    fn regex_is_a_search() {
        let constraint = CIAttributeValueConstraint::text_regex("b+").unwrap();
        assert!(!constraint.has_errors(&AttributeValue::text("abbc")));
        assert!(constraint.has_errors(&AttributeValue::text("ac")));
        assert!(constraint.has_errors(&AttributeValue::Integer(1)));
    }
}
