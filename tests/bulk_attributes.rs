use std::collections::BTreeSet;
use std::sync::Arc;

use strata::bulk::{AttributeFragment, AttributeScope, BulkWriter, OtherLayersValueHandling};
use strata::changeset::ChangesetProxy;
use strata::construct::{
    AttributeIdentity, AttributeState, CiId, DataOrigin, LayerSet, TimeThreshold,
};
use strata::datatype::AttributeValue;
use strata::error::StrataError;
use strata::model::{AttributeModel, CiModel};
use strata::persist::{PersistenceMode, Persistor, TemporalStore};

fn store() -> Arc<dyn TemporalStore> {
    Arc::new(Persistor::new(PersistenceMode::InMemory).expect("store"))
}

fn proxy(store: &Arc<dyn TemporalStore>) -> ChangesetProxy {
    ChangesetProxy::new("importer", TimeThreshold::Latest, DataOrigin::InboundIngest, store.clone())
}

fn whole_layer() -> AttributeScope {
    AttributeScope::Layer {
        name_prefix: String::new(),
    }
}

fn fragments(ci: CiId, pairs: &[(&str, &str)]) -> Vec<AttributeFragment> {
    pairs
        .iter()
        .map(|(name, value)| AttributeFragment::new(ci, *name, AttributeValue::text(*value)))
        .collect()
}

async fn state_of(store: &Arc<dyn TemporalStore>, ci: &CiId, name: &str, layer: &str) -> AttributeState {
    AttributeModel::new(store.clone())
        .get_attribute(name, ci, layer, &TimeThreshold::Latest)
        .await
        .expect("get")
        .expect("present")
        .state
}

#[tokio::test]
async fn only_the_difference_is_written() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());

    let initial = fragments(ci, &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")]);
    let changed = writer
        .bulk_replace_attributes(initial, &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");
    assert_eq!(changed.len(), 5);

    let desired = fragments(ci, &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "40"), ("f", "6")]);
    let changed: BTreeSet<AttributeIdentity> = writer
        .bulk_replace_attributes(desired, &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk")
        .into_iter()
        .collect();
    let expected: BTreeSet<AttributeIdentity> = ["d", "f", "e"]
        .into_iter()
        .map(|name| AttributeIdentity::new(ci, name))
        .collect();
    assert_eq!(changed, expected);

    assert_eq!(state_of(&store, &ci, "a", "l").await, AttributeState::New);
    assert_eq!(state_of(&store, &ci, "d", "l").await, AttributeState::Changed);
    assert_eq!(state_of(&store, &ci, "e", "l").await, AttributeState::Removed);
    assert_eq!(state_of(&store, &ci, "f", "l").await, AttributeState::New);
}

#[tokio::test]
async fn unchanged_content_allocates_no_changeset() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());
    let content = [("a", "1"), ("b", "2")];

    writer
        .bulk_replace_attributes(fragments(ci, &content), &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");

    let again = proxy(&store);
    let changed = writer
        .bulk_replace_attributes(fragments(ci, &content), &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &again)
        .await
        .expect("bulk");
    assert!(changed.is_empty());
    assert!(again.allocated().await.is_empty());
}

#[tokio::test]
async fn all_changes_share_one_changeset() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());
    let changeset = proxy(&store);

    writer
        .bulk_replace_attributes(fragments(ci, &[("a", "1"), ("b", "2"), ("c", "3")]), &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &changeset)
        .await
        .expect("bulk");
    let allocated = changeset.allocated().await;
    assert_eq!(allocated.len(), 1);

    let attributes = AttributeModel::new(store.clone());
    for name in ["a", "b", "c"] {
        let record = attributes
            .get_attribute(name, &ci, "l", &TimeThreshold::Latest)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.changeset, allocated[0].id);
        assert_eq!(record.timestamp, changeset.timestamp());
    }
}

#[tokio::test]
async fn malformed_fragments_are_rejected() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let other = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());

    let duplicate = fragments(ci, &[("a", "1"), ("a", "2")]);
    let result = writer
        .bulk_replace_attributes(duplicate, &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));

    let scope = AttributeScope::Ci {
        name_prefix: "net.".into(),
        ci,
    };
    let wrong_prefix = fragments(ci, &[("name", "x")]);
    let result = writer
        .bulk_replace_attributes(wrong_prefix, &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));

    let wrong_ci = fragments(other, &[("net.ip", "x")]);
    let result = writer
        .bulk_replace_attributes(wrong_ci, &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));

    let unnamed = fragments(ci, &[("", "x")]);
    let result = writer
        .bulk_replace_attributes(unnamed, &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));
}

#[tokio::test]
async fn scopes_limit_removals() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());

    writer
        .bulk_replace_attributes(fragments(ci, &[("net.ip", "1"), ("net.mask", "2"), ("os", "linux")]), &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");

    // the prefix scope only touches net.*, so os survives
    let scope = AttributeScope::Ci {
        name_prefix: "net.".into(),
        ci,
    };
    let changed = writer
        .bulk_replace_attributes(fragments(ci, &[("net.ip", "1")]), &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");
    assert_eq!(changed, vec![AttributeIdentity::new(ci, "net.mask")]);
    assert_eq!(state_of(&store, &ci, "os", "l").await, AttributeState::New);

    // a specific scope only removes what it lists
    let scope = AttributeScope::Specific {
        removals: vec![AttributeIdentity::new(ci, "os")],
    };
    let changed = writer
        .bulk_replace_attributes(Vec::new(), &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");
    assert_eq!(changed, vec![AttributeIdentity::new(ci, "os")]);
    assert_eq!(state_of(&store, &ci, "os", "l").await, AttributeState::Removed);
    assert_eq!(state_of(&store, &ci, "net.ip", "l").await, AttributeState::New);

    // listing it again, or something never written, is a no-op
    let scope = AttributeScope::Specific {
        removals: vec![AttributeIdentity::new(ci, "os"), AttributeIdentity::new(ci, "unknown")],
    };
    let changed = writer
        .bulk_replace_attributes(Vec::new(), &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");
    assert!(changed.is_empty());

    let scope = AttributeScope::Specific {
        removals: vec![AttributeIdentity::new(ci, "")],
    };
    let result = writer
        .bulk_replace_attributes(Vec::new(), &scope, "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));
}

#[tokio::test]
async fn removed_attributes_are_renewed() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());

    for content in [&[("a", "1")][..], &[][..], &[("a", "1")][..]] {
        writer
            .bulk_replace_attributes(fragments(ci, content), &whole_layer(), "l", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
            .await
            .expect("bulk");
    }
    assert_eq!(state_of(&store, &ci, "a", "l").await, AttributeState::Renewed);
}

#[tokio::test]
async fn values_supplied_by_other_layers_are_not_duplicated() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let writer = BulkWriter::new(store.clone());
    let read_layers = LayerSet::new(["top", "base"]).expect("layers");
    let take_into_account = OtherLayersValueHandling::TakeIntoAccount {
        read_layers: read_layers.clone(),
    };

    writer
        .bulk_replace_attributes(fragments(ci, &[("a", "1")]), &whole_layer(), "base", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");

    let changeset = proxy(&store);
    let changed = writer
        .bulk_replace_attributes(fragments(ci, &[("a", "1")]), &whole_layer(), "top", &take_into_account, &changeset)
        .await
        .expect("bulk");
    assert!(changed.is_empty());
    assert!(changeset.allocated().await.is_empty());

    // a forced copy in the write layer is turned into a removal
    writer
        .bulk_replace_attributes(fragments(ci, &[("a", "1")]), &whole_layer(), "top", &OtherLayersValueHandling::ForceWrite, &proxy(&store))
        .await
        .expect("bulk");
    let changed = writer
        .bulk_replace_attributes(fragments(ci, &[("a", "1")]), &whole_layer(), "top", &take_into_account, &proxy(&store))
        .await
        .expect("bulk");
    assert_eq!(changed, vec![AttributeIdentity::new(ci, "a")]);
    assert_eq!(state_of(&store, &ci, "a", "top").await, AttributeState::Removed);

    let merged = AttributeModel::new(store.clone())
        .get_merged_attribute("a", &ci, &read_layers, &TimeThreshold::Latest)
        .await
        .expect("merged")
        .expect("present");
    assert_eq!(merged.attribute.layer, "base");

    // a different value is still written
    let changed = writer
        .bulk_replace_attributes(fragments(ci, &[("a", "2")]), &whole_layer(), "top", &take_into_account, &proxy(&store))
        .await
        .expect("bulk");
    assert_eq!(changed, vec![AttributeIdentity::new(ci, "a")]);
    assert_eq!(state_of(&store, &ci, "a", "top").await, AttributeState::Renewed);
}
