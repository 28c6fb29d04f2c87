//! Strata – a layered, temporal configuration item store.
//!
//! Facts about configuration items (CIs) are kept as named attributes and
//! typed relations. Every fact belongs to a *layer*, and layers are stacked
//! in a [`construct::LayerSet`] where the first layer has the highest
//! priority. Reading a CI means merging its records across the layer set as
//! of a [`construct::TimeThreshold`].
//!
//! ## Modules
//! * [`construct`] – Identities, layers, records, merged records and selections.
//! * [`datatype`] – Attribute values and their versioned `(text, binary, control)` codec.
//! * [`persist`] – The [`persist::TemporalStore`] contract and its SQLite [`persist::Persistor`].
//! * [`merge`] – Winner per identity across a layer set.
//! * [`model`] – Merged reads and single record writes for attributes, relations and CIs.
//! * [`bulk`] – Diffing bulk replacement of a layer scope, with masking.
//! * [`changeset`] – Lazily allocated changesets for one logical write.
//! * [`traits`] – Trait definitions, core traits and dependency flattening.
//! * [`effective`] – Checking merged CIs against flattened traits.
//! * [`settings`] – Configuration of the `strata` binary.
//!
//! ## Writes
//! A write goes through a [`changeset::ChangesetProxy`] bound to one time
//! threshold, so every read the write performs sees the same state. Writes
//! that turn out to change nothing never allocate a changeset. Callers scope
//! a logical write between [`persist::TemporalStore::begin`] and
//! [`persist::TemporalStore::commit`].
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use strata::changeset::ChangesetProxy;
//! use strata::construct::{CiSelection, AttributeSelection, DataOrigin, LayerSet, TimeThreshold};
//! use strata::datatype::AttributeValue;
//! use strata::model::{AttributeModel, CiModel};
//! use strata::persist::{PersistenceMode, Persistor, TemporalStore};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store: Arc<dyn TemporalStore> = Arc::new(Persistor::new(PersistenceMode::InMemory).unwrap());
//! let ci = CiModel::new(store.clone()).create_ci(None).await.unwrap();
//! let attributes = AttributeModel::new(store.clone());
//! let changeset = ChangesetProxy::new("alice", TimeThreshold::Latest, DataOrigin::Manual, store.clone());
//! attributes
//!     .insert_attribute("__name", AttributeValue::text("host1"), &ci, "base", &changeset)
//!     .await
//!     .unwrap();
//! let merged = attributes
//!     .get_merged_attributes(
//!         &CiSelection::All,
//!         &AttributeSelection::All,
//!         &LayerSet::new(["base"]).unwrap(),
//!         &TimeThreshold::Latest,
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(merged.len(), 1);
//! # });
//! ```

pub mod bulk;
pub mod changeset;
pub mod construct;
pub mod datatype;
pub mod effective;
pub mod error;
pub mod merge;
pub mod model;
pub mod persist;
pub mod settings;
pub mod traits;
