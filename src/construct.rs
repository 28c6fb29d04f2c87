// configuration items, records and changesets use 128-bit identities
use uuid::Uuid;

// used for timestamps on records and changesets
use chrono::{DateTime, Utc};

// used to keep the one-to-one mapping between a layer and its priority
use bimap::BiMap;

// identity keyed maps and sets use a fast hasher
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;
use std::collections::{BTreeSet, HashSet};

// used to print out readable forms of a construct
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

// our own stuff that we need
use crate::datatype::AttributeValue;
use crate::error::{Result, StrataError};

// ------------- Identities -------------
pub type CiId = Uuid;
pub type LayerId = String;
pub type PredicateId = String;
pub type ChangesetId = Uuid;
pub type RecordId = Uuid;

pub type IdentityHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

/// Attribute that carries the display name of a CI.
pub const NAME_ATTRIBUTE: &str = "__name";

lazy_static! {
    static ref PREDICATE_ID_REGEX: Regex =
        Regex::new(r"^[a-z0-9_.]+$").expect("valid predicate id regex");
}

pub fn validate_predicate_id(predicate: &str) -> Result<()> {
    if predicate.is_empty() {
        return Err(StrataError::InvalidInput(
            "predicate id must not be empty".into(),
        ));
    }
    if !PREDICATE_ID_REGEX.is_match(predicate) {
        return Err(StrataError::InvalidInput(format!(
            "invalid predicate id '{predicate}'"
        )));
    }
    Ok(())
}

// ------------- Layer -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerState {
    Active,
    Deprecated,
    Inactive,
}
impl LayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerState::Active => "active",
            LayerState::Deprecated => "deprecated",
            LayerState::Inactive => "inactive",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LayerState::Active),
            "deprecated" => Some(LayerState::Deprecated),
            "inactive" => Some(LayerState::Inactive),
            _ => None,
        }
    }
}

/// Metadata of a layer. The records a layer contributes live in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub description: String,
    pub state: LayerState,
    /// ids of generators and compute units that feed this layer
    pub generators: Vec<String>,
    pub color: u32,
}
impl Layer {
    pub fn new(id: impl Into<LayerId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            state: LayerState::Active,
            generators: Vec::new(),
            color: 0xFFFFFF,
        }
    }
}

// ------------- LayerSet -------------
// Position defines priority, the layer at index 0 wins.
#[derive(Debug, Clone)]
pub struct LayerSet {
    layers: Vec<LayerId>,
    order: BiMap<LayerId, usize>,
}
impl LayerSet {
    pub fn new<I, L>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        let layers: Vec<LayerId> = layers.into_iter().map(Into::into).collect();
        let mut order = BiMap::new();
        for (index, layer) in layers.iter().enumerate() {
            if order.insert_no_overwrite(layer.clone(), index).is_err() {
                return Err(StrataError::InvalidInput(format!(
                    "layer '{layer}' appears more than once in layer set"
                )));
            }
        }
        Ok(Self { layers, order })
    }
    pub fn empty() -> Self {
        Self {
            layers: Vec::new(),
            order: BiMap::new(),
        }
    }
    /// Priority of a layer within this set, lower is stronger.
    pub fn get_order(&self, layer: &str) -> Option<usize> {
        self.order.get_by_left(layer).copied()
    }
    pub fn layer_at(&self, order: usize) -> Option<&LayerId> {
        self.order.get_by_right(&order)
    }
    pub fn contains(&self, layer: &str) -> bool {
        self.order.contains_left(layer)
    }
    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }
    pub fn iter(&self) -> std::slice::Iter<'_, LayerId> {
        self.layers.iter()
    }
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    /// The layers with lower priority than `layer`, in priority order.
    /// A layer outside of the set has nothing below it.
    pub fn layers_below(&self, layer: &str) -> LayerSet {
        match self.get_order(layer) {
            Some(order) => Self::from_trusted(self.layers[order + 1..].to_vec()),
            None => Self::empty(),
        }
    }
    /// Every layer of the set except `layer`.
    pub fn without(&self, layer: &str) -> LayerSet {
        Self::from_trusted(
            self.layers
                .iter()
                .filter(|l| l.as_str() != layer)
                .cloned()
                .collect(),
        )
    }
    // only for subsets of an already validated set
    fn from_trusted(layers: Vec<LayerId>) -> Self {
        let order = layers
            .iter()
            .enumerate()
            .map(|(index, layer)| (layer.clone(), index))
            .collect();
        Self { layers, order }
    }
}
impl PartialEq for LayerSet {
    fn eq(&self, other: &Self) -> bool {
        self.layers == other.layers
    }
}
impl Eq for LayerSet {}
impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.layers.join(","))
    }
}

// ------------- TimeThreshold -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeThreshold {
    /// now, evaluated anew by every read
    Latest,
    AtTime(DateTime<Utc>),
}
impl TimeThreshold {
    pub fn at(time: DateTime<Utc>) -> Self {
        TimeThreshold::AtTime(time)
    }
    pub fn is_latest(&self) -> bool {
        matches!(self, TimeThreshold::Latest)
    }
    pub fn resolve(&self) -> DateTime<Utc> {
        match self {
            TimeThreshold::Latest => Utc::now(),
            TimeThreshold::AtTime(time) => *time,
        }
    }
}
impl Default for TimeThreshold {
    fn default() -> Self {
        TimeThreshold::Latest
    }
}

// ------------- Origin & Changeset -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataOrigin {
    Manual,
    InboundIngest,
    InboundOnline,
    ComputeLayer,
    Generator,
}
impl DataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::Manual => "manual",
            DataOrigin::InboundIngest => "inbound_ingest",
            DataOrigin::InboundOnline => "inbound_online",
            DataOrigin::ComputeLayer => "compute_layer",
            DataOrigin::Generator => "generator",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(DataOrigin::Manual),
            "inbound_ingest" => Some(DataOrigin::InboundIngest),
            "inbound_online" => Some(DataOrigin::InboundOnline),
            "compute_layer" => Some(DataOrigin::ComputeLayer),
            "generator" => Some(DataOrigin::Generator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub id: ChangesetId,
    pub user: String,
    pub layer: LayerId,
    pub origin: DataOrigin,
    pub timestamp: DateTime<Utc>,
}

/// Opaque partition bucket stamped onto every historic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionIndex(pub DateTime<Utc>);

// ------------- Attribute -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeState {
    New,
    Changed,
    Removed,
    Renewed,
}
impl AttributeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeState::New => "new",
            AttributeState::Changed => "changed",
            AttributeState::Removed => "removed",
            AttributeState::Renewed => "renewed",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(AttributeState::New),
            "changed" => Some(AttributeState::Changed),
            "removed" => Some(AttributeState::Removed),
            "renewed" => Some(AttributeState::Renewed),
            _ => None,
        }
    }
    /// State of a write given the record it replaces.
    pub fn on_insert(previous: Option<&CIAttribute>) -> Self {
        match previous {
            None => AttributeState::New,
            Some(p) if p.state == AttributeState::Removed => AttributeState::Renewed,
            Some(_) => AttributeState::Changed,
        }
    }
}

/// The information hash of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeIdentity {
    pub ci: CiId,
    pub name: String,
}
impl AttributeIdentity {
    pub fn new(ci: CiId, name: impl Into<String>) -> Self {
        Self {
            ci,
            name: name.into(),
        }
    }
}
impl fmt::Display for AttributeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.ci)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CIAttribute {
    pub id: RecordId,
    pub name: String,
    pub ci: CiId,
    pub value: AttributeValue,
    pub state: AttributeState,
    pub changeset: ChangesetId,
    pub layer: LayerId,
    pub timestamp: DateTime<Utc>,
}
impl CIAttribute {
    pub fn information_hash(&self) -> AttributeIdentity {
        AttributeIdentity::new(self.ci, self.name.clone())
    }
    pub fn is_removed(&self) -> bool {
        self.state == AttributeState::Removed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedCIAttribute {
    pub attribute: CIAttribute,
    /// contributing layers, lowest priority first, the winner last
    pub layer_stack: Vec<LayerId>,
}

// ------------- Relation -------------
/// The information hash of a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationIdentity {
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
}
impl RelationIdentity {
    pub fn new(from: CiId, to: CiId, predicate: impl Into<PredicateId>) -> Self {
        Self {
            from,
            to,
            predicate: predicate.into(),
        }
    }
}
impl fmt::Display for RelationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}_{}", self.from, self.to, self.predicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: RecordId,
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
    pub changeset: ChangesetId,
    /// suppresses the same relation from lower layers without asserting it
    pub mask: bool,
    pub removed: bool,
    pub layer: LayerId,
    pub timestamp: DateTime<Utc>,
}
impl Relation {
    pub fn information_hash(&self) -> RelationIdentity {
        RelationIdentity::new(self.from, self.to, self.predicate.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRelation {
    pub relation: Relation,
    /// contributing layers, the winner first
    pub layer_stack: Vec<LayerId>,
}
impl MergedRelation {
    pub fn winning_layer(&self) -> Option<&LayerId> {
        self.layer_stack.first()
    }
}

// ------------- Selections -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiSelection {
    All,
    Specific(HashSet<CiId>),
    AllExcept(HashSet<CiId>),
    None,
}
impl CiSelection {
    pub fn specific<I: IntoIterator<Item = CiId>>(cis: I) -> Self {
        let cis: HashSet<CiId> = cis.into_iter().collect();
        if cis.is_empty() {
            CiSelection::None
        } else {
            CiSelection::Specific(cis)
        }
    }
    pub fn all_except<I: IntoIterator<Item = CiId>>(cis: I) -> Self {
        let cis: HashSet<CiId> = cis.into_iter().collect();
        if cis.is_empty() {
            CiSelection::All
        } else {
            CiSelection::AllExcept(cis)
        }
    }
    pub fn contains(&self, ci: &CiId) -> bool {
        match self {
            CiSelection::All => true,
            CiSelection::Specific(cis) => cis.contains(ci),
            CiSelection::AllExcept(cis) => !cis.contains(ci),
            CiSelection::None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSelection {
    All,
    Named(HashSet<String>),
    None,
}
impl AttributeSelection {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            AttributeSelection::None
        } else {
            AttributeSelection::Named(names)
        }
    }
    pub fn contains(&self, name: &str) -> bool {
        match self {
            AttributeSelection::All => true,
            AttributeSelection::Named(names) => names.contains(name),
            AttributeSelection::None => false,
        }
    }
    pub fn union(self, other: AttributeSelection) -> AttributeSelection {
        match (self, other) {
            (AttributeSelection::All, _) | (_, AttributeSelection::All) => AttributeSelection::All,
            (AttributeSelection::None, o) | (o, AttributeSelection::None) => o,
            (AttributeSelection::Named(mut a), AttributeSelection::Named(b)) => {
                a.extend(b);
                AttributeSelection::Named(a)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateSelection {
    All,
    Specific(HashSet<PredicateId>),
    None,
}
impl PredicateSelection {
    pub fn specific<I, S>(predicates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PredicateId>,
    {
        let predicates: HashSet<PredicateId> = predicates.into_iter().map(Into::into).collect();
        if predicates.is_empty() {
            PredicateSelection::None
        } else {
            PredicateSelection::Specific(predicates)
        }
    }
    pub fn contains(&self, predicate: &str) -> bool {
        match self {
            PredicateSelection::All => true,
            PredicateSelection::Specific(predicates) => predicates.contains(predicate),
            PredicateSelection::None => false,
        }
    }
    pub fn union(self, other: PredicateSelection) -> PredicateSelection {
        match (self, other) {
            (PredicateSelection::All, _) | (_, PredicateSelection::All) => PredicateSelection::All,
            (PredicateSelection::None, o) | (o, PredicateSelection::None) => o,
            (PredicateSelection::Specific(mut a), PredicateSelection::Specific(b)) => {
                a.extend(b);
                PredicateSelection::Specific(a)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSelection {
    All,
    From(CiSelection),
    To(CiSelection),
    /// relations where either end is selected
    Either(CiSelection),
    WithPredicate(PredicateSelection),
    Specific(BTreeSet<RelationIdentity>),
}
impl RelationSelection {
    pub fn contains(&self, relation: &Relation) -> bool {
        match self {
            RelationSelection::All => true,
            RelationSelection::From(cis) => cis.contains(&relation.from),
            RelationSelection::To(cis) => cis.contains(&relation.to),
            RelationSelection::Either(cis) => {
                cis.contains(&relation.from) || cis.contains(&relation.to)
            }
            RelationSelection::WithPredicate(predicates) => predicates.contains(&relation.predicate),
            RelationSelection::Specific(identities) => {
                identities.contains(&relation.information_hash())
            }
        }
    }
}
