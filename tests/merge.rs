use chrono::Utc;
use strata::construct::{AttributeState, CIAttribute, LayerSet, Relation};
use strata::datatype::AttributeValue;
use strata::merge::{merge_attributes, merge_relations, MaskHandlingForRetrieval};
use uuid::Uuid;

fn attribute(ci: Uuid, name: &str, layer: &str, value: &str) -> CIAttribute {
    CIAttribute {
        id: Uuid::new_v4(),
        name: name.into(),
        ci,
        value: AttributeValue::text(value),
        state: AttributeState::New,
        changeset: Uuid::new_v4(),
        layer: layer.into(),
        timestamp: Utc::now(),
    }
}

fn relation(from: Uuid, to: Uuid, layer: &str, mask: bool) -> Relation {
    Relation {
        id: Uuid::new_v4(),
        from,
        to,
        predicate: "runs_on".into(),
        changeset: Uuid::new_v4(),
        mask,
        removed: false,
        layer: layer.into(),
        timestamp: Utc::now(),
    }
}

#[test]
fn winner_is_the_highest_priority_layer() {
    let ci = Uuid::new_v4();
    let layers = LayerSet::new(["a", "b", "c"]).expect("layers");
    let records = vec![
        attribute(ci, "x", "c", "from c"),
        attribute(ci, "x", "b", "from b"),
    ];
    let merged = merge_attributes(records, &layers).expect("merge");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].attribute.value, AttributeValue::text("from b"));
    assert_eq!(merged[0].layer_stack, vec!["c".to_string(), "b".to_string()]);
}

#[test]
fn identities_merge_independently() {
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let layers = LayerSet::new(["a", "b"]).expect("layers");
    let records = vec![
        attribute(c1, "x", "a", "1"),
        attribute(c1, "y", "b", "2"),
        attribute(c2, "x", "b", "3"),
    ];
    assert_eq!(merge_attributes(records, &layers).expect("merge").len(), 3);
}

#[test]
fn records_outside_of_the_layer_set_are_ignored() {
    let ci = Uuid::new_v4();
    let layers = LayerSet::new(["b"]).expect("layers");
    let records = vec![attribute(ci, "x", "a", "1"), attribute(ci, "x", "b", "2")];
    let merged = merge_attributes(records, &layers).expect("merge");
    assert_eq!(merged[0].attribute.value, AttributeValue::text("2"));
    assert_eq!(merged[0].layer_stack, vec!["b".to_string()]);
}

#[test]
fn empty_layer_set_yields_nothing() {
    let ci = Uuid::new_v4();
    let merged = merge_attributes(vec![attribute(ci, "x", "a", "1")], &LayerSet::empty())
        .expect("merge");
    assert!(merged.is_empty());
}

#[test]
fn relation_stack_lists_the_winner_first() {
    let (from, to) = (Uuid::new_v4(), Uuid::new_v4());
    let layers = LayerSet::new(["a", "b", "c"]).expect("layers");
    let records = vec![
        relation(from, to, "c", false),
        relation(from, to, "a", false),
        relation(from, to, "b", false),
    ];
    let merged = merge_relations(records, &layers, MaskHandlingForRetrieval::ApplyMasks)
        .expect("merge");
    assert_eq!(merged.len(), 1);
    assert_eq!(
        merged[0].layer_stack,
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(merged[0].winning_layer().map(String::as_str), Some("a"));
}

#[test]
fn masks_hide_or_show_depending_on_handling() {
    let (from, to) = (Uuid::new_v4(), Uuid::new_v4());
    let layers = LayerSet::new(["a", "b"]).expect("layers");
    let records = || vec![relation(from, to, "a", true), relation(from, to, "b", false)];

    let applied = merge_relations(records(), &layers, MaskHandlingForRetrieval::ApplyMasks)
        .expect("merge");
    assert!(applied.is_empty());

    let kept = merge_relations(records(), &layers, MaskHandlingForRetrieval::GetMasks)
        .expect("merge");
    assert_eq!(kept.len(), 1);
    assert!(kept[0].relation.mask);

    // a mask below the winner does nothing
    let below = vec![relation(from, to, "a", false), relation(from, to, "b", true)];
    let merged = merge_relations(below, &layers, MaskHandlingForRetrieval::ApplyMasks)
        .expect("merge");
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].relation.mask);
}
