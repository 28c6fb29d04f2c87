use std::sync::Arc;

use strata::changeset::ChangesetProxy;
use strata::construct::{
    AttributeSelection, AttributeState, CIAttribute, CiId, CiSelection, DataOrigin, LayerSet,
    TimeThreshold,
};
use strata::datatype::{AttributeValue, BinaryProxy};
use strata::error::StrataError;
use strata::model::{AttributeModel, CiModel};
use strata::persist::{PersistenceMode, Persistor, TemporalStore};

fn store() -> Arc<dyn TemporalStore> {
    Arc::new(Persistor::new(PersistenceMode::InMemory).expect("store"))
}

fn proxy(store: &Arc<dyn TemporalStore>) -> ChangesetProxy {
    ChangesetProxy::new("tester", TimeThreshold::Latest, DataOrigin::Manual, store.clone())
}

#[tokio::test]
async fn insert_query_remove_end_to_end() {
    let store = store();
    let c1 = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let layers = LayerSet::new(["L1"]).expect("layers");

    let (inserted, changed) = attributes
        .insert_attribute("name", AttributeValue::text("host1"), &c1, "L1", &proxy(&store))
        .await
        .expect("insert");
    assert!(changed);
    assert_eq!(inserted.state, AttributeState::New);

    let merged = attributes
        .get_merged_attributes(&CiSelection::All, &AttributeSelection::All, &layers, &TimeThreshold::Latest)
        .await
        .expect("merged");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].attribute.state, AttributeState::New);
    assert_eq!(merged[0].attribute.value, AttributeValue::text("host1"));
    assert_eq!(merged[0].layer_stack, vec!["L1".to_string()]);

    let (removed, changed) = attributes
        .remove_attribute("name", &c1, "L1", &proxy(&store))
        .await
        .expect("remove");
    assert!(changed);
    assert_eq!(removed.state, AttributeState::Removed);

    let merged = attributes
        .get_merged_attributes(&CiSelection::All, &AttributeSelection::All, &layers, &TimeThreshold::Latest)
        .await
        .expect("merged");
    assert!(merged.is_empty());

    let tombstone = attributes
        .get_attribute("name", &c1, "L1", &TimeThreshold::Latest)
        .await
        .expect("get")
        .expect("tombstone");
    assert_eq!(tombstone.state, AttributeState::Removed);
    assert_eq!(tombstone.value, AttributeValue::text("host1"));
}

#[tokio::test]
async fn same_value_twice_is_a_noop() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());

    let (first, changed) = attributes
        .insert_attribute("a", AttributeValue::Integer(1), &ci, "l", &proxy(&store))
        .await
        .expect("insert");
    assert!(changed);
    let second_proxy = proxy(&store);
    let (second, changed) = attributes
        .insert_attribute("a", AttributeValue::Integer(1), &ci, "l", &second_proxy)
        .await
        .expect("insert");
    assert!(!changed);
    assert_eq!(second.id, first.id);
    assert_eq!(second.state, AttributeState::New);
    // nothing was written, so no changeset was allocated either
    assert!(second_proxy.allocated().await.is_empty());
}

async fn insert(
    attributes: &AttributeModel,
    store: &Arc<dyn TemporalStore>,
    ci: &CiId,
    value: &str,
) -> (CIAttribute, bool) {
    attributes
        .insert_attribute("a", AttributeValue::text(value), ci, "l", &proxy(store))
        .await
        .expect("insert")
}

#[tokio::test]
async fn state_machine_cycle() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());

    assert_eq!(insert(&attributes, &store, &ci, "x").await.0.state, AttributeState::New);
    let (removed, _) = attributes
        .remove_attribute("a", &ci, "l", &proxy(&store))
        .await
        .expect("remove");
    assert_eq!(removed.state, AttributeState::Removed);
    assert_eq!(insert(&attributes, &store, &ci, "x").await.0.state, AttributeState::Renewed);
    assert_eq!(insert(&attributes, &store, &ci, "y").await.0.state, AttributeState::Changed);
    let (unchanged, changed) = insert(&attributes, &store, &ci, "y").await;
    assert!(!changed);
    assert_eq!(unchanged.state, AttributeState::Changed);

    // removing twice is a no-op the second time
    let (_, changed) = attributes
        .remove_attribute("a", &ci, "l", &proxy(&store))
        .await
        .expect("remove");
    assert!(changed);
    let (_, changed) = attributes
        .remove_attribute("a", &ci, "l", &proxy(&store))
        .await
        .expect("remove");
    assert!(!changed);
}

#[tokio::test]
async fn removing_unknown_attribute_fails() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let result = attributes
        .remove_attribute("missing", &ci, "l", &proxy(&store))
        .await;
    assert!(matches!(result, Err(StrataError::InvalidInput(_))));
}

#[tokio::test]
async fn higher_layer_wins_and_lower_shines_through() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let layers = LayerSet::new(["top", "bottom"]).expect("layers");

    attributes
        .insert_attribute("a", AttributeValue::text("low"), &ci, "bottom", &proxy(&store))
        .await
        .expect("insert");
    attributes
        .insert_attribute("a", AttributeValue::text("high"), &ci, "top", &proxy(&store))
        .await
        .expect("insert");

    let merged = attributes
        .get_merged_attribute("a", &ci, &layers, &TimeThreshold::Latest)
        .await
        .expect("merged")
        .expect("present");
    assert_eq!(merged.attribute.value, AttributeValue::text("high"));
    // lowest priority first, winner last
    assert_eq!(merged.layer_stack, vec!["bottom".to_string(), "top".to_string()]);

    attributes
        .remove_attribute("a", &ci, "top", &proxy(&store))
        .await
        .expect("remove");
    let merged = attributes
        .get_merged_attribute("a", &ci, &layers, &TimeThreshold::Latest)
        .await
        .expect("merged")
        .expect("present");
    assert_eq!(merged.attribute.value, AttributeValue::text("low"));

    let empty = attributes
        .get_merged_attribute("a", &ci, &LayerSet::empty(), &TimeThreshold::Latest)
        .await
        .expect("merged");
    assert!(empty.is_none());
}

#[tokio::test]
async fn reads_at_a_point_in_time() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let layers = LayerSet::new(["l"]).expect("layers");

    let (first, _) = attributes
        .insert_attribute("a", AttributeValue::text("v1"), &ci, "l", &proxy(&store))
        .await
        .expect("insert");
    let between = first.timestamp;
    std::thread::sleep(std::time::Duration::from_millis(5));
    attributes
        .insert_attribute("a", AttributeValue::text("v2"), &ci, "l", &proxy(&store))
        .await
        .expect("insert");

    let past = attributes
        .get_merged_attribute("a", &ci, &layers, &TimeThreshold::at(between))
        .await
        .expect("merged")
        .expect("present");
    assert_eq!(past.attribute.value, AttributeValue::text("v1"));
    let now = attributes
        .get_merged_attribute("a", &ci, &layers, &TimeThreshold::Latest)
        .await
        .expect("merged")
        .expect("present");
    assert_eq!(now.attribute.value, AttributeValue::text("v2"));
}

#[tokio::test]
async fn binary_values_are_read_as_proxies_unless_asked() {
    let store = store();
    let ci = CiModel::new(store.clone()).create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let image = BinaryProxy::from_data("image/png", vec![1, 2, 3, 4]).expect("proxy");

    attributes
        .insert_attribute("logo", AttributeValue::Image(image), &ci, "l", &proxy(&store))
        .await
        .expect("insert");

    let plain = attributes
        .get_attribute("logo", &ci, "l", &TimeThreshold::Latest)
        .await
        .expect("get")
        .expect("present");
    match plain.value {
        AttributeValue::Image(p) => assert!(!p.has_full_data()),
        other => panic!("unexpected value {other:?}"),
    }
    let full = attributes
        .get_full_binary_attribute("logo", &ci, "l", &TimeThreshold::Latest)
        .await
        .expect("get")
        .expect("present");
    match full.value {
        AttributeValue::Image(p) => assert_eq!(p.data(), Some(&[1u8, 2, 3, 4][..])),
        other => panic!("unexpected value {other:?}"),
    }
}

#[tokio::test]
async fn find_by_name_pattern_and_merged_cis() {
    let store = store();
    let cis = CiModel::new(store.clone());
    let ci = cis.create_ci(None).await.expect("ci");
    let bare = cis.create_ci(None).await.expect("ci");
    let attributes = AttributeModel::new(store.clone());
    let layers = LayerSet::new(["l"]).expect("layers");

    for (name, value) in [("__name", "web01"), ("net.ip", "10.0.0.1"), ("net.mask", "24")] {
        attributes
            .insert_attribute(name, AttributeValue::text(value), &ci, "l", &proxy(&store))
            .await
            .expect("insert");
    }

    let found = attributes
        .find_merged_attributes_by_name("^net\\.", &CiSelection::All, &layers, &TimeThreshold::Latest)
        .await
        .expect("find");
    assert_eq!(found.len(), 2);

    let merged = cis
        .get_merged_cis(&CiSelection::All, &layers, &TimeThreshold::Latest, false)
        .await
        .expect("cis");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].name.as_deref(), Some("web01"));
    assert_eq!(merged[0].attributes.len(), 3);

    let with_empty = cis
        .get_merged_cis(&CiSelection::All, &layers, &TimeThreshold::Latest, true)
        .await
        .expect("cis");
    assert_eq!(with_empty.len(), 2);
    assert!(with_empty.iter().any(|c| c.id == bare && c.attributes.is_empty()));
}
