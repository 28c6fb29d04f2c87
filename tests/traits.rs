use std::collections::BTreeMap;

use strata::datatype::AttributeValueType;
use strata::traits::{
    core_traits, flatten_single, flatten_traits, merge_trait_sources, traits_from_json,
    CIAttributeTemplate, CIAttributeValueConstraint, FlattenIssue, RecursiveTrait, TraitAttribute,
    TraitCatalog, TraitOrigin, TraitRelation, EMPTY_TRAIT_ID,
};

fn text_trait(id: &str, attribute: &str, requires: &[&str]) -> RecursiveTrait {
    let mut t = RecursiveTrait::new(id, TraitOrigin::Data);
    t.required_attributes.push(TraitAttribute::new(
        attribute,
        CIAttributeTemplate::new(attribute, AttributeValueType::Text, false),
    ));
    t.required_traits = requires.iter().map(|r| r.to_string()).collect();
    t
}

fn catalog_of(traits: Vec<RecursiveTrait>) -> BTreeMap<String, RecursiveTrait> {
    traits.into_iter().map(|t| (t.id.clone(), t)).collect()
}

#[test]
fn dependencies_are_folded_in() {
    let input = catalog_of(vec![
        text_trait("host", "hostname", &[]),
        text_trait("linux_host", "kernel", &["host"]),
        text_trait("web_server", "port", &["linux_host"]),
    ]);
    let outcome = flatten_traits(&input);
    assert!(outcome.dropped.is_empty());

    let web = &outcome.traits["web_server"];
    let names: Vec<&str> = web
        .required_attributes
        .iter()
        .map(|a| a.identifier.as_str())
        .collect();
    assert_eq!(names, vec!["port", "kernel", "hostname"]);
    assert_eq!(
        web.ancestor_traits.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["host", "linux_host"]
    );
    assert!(outcome.traits["host"].ancestor_traits.is_empty());
}

#[test]
fn inherited_templates_survive_a_shared_identifier() {
    let mut child = text_trait("child", "x", &["parent"]);
    child.required_attributes[0].template.name = "y".into();
    let input = catalog_of(vec![text_trait("parent", "x", &[]), child]);
    let outcome = flatten_traits(&input);
    let flattened = &outcome.traits["child"];
    let names: Vec<&str> = flattened
        .required_attributes
        .iter()
        .map(|a| a.template.name.as_str())
        .collect();
    assert_eq!(names, vec!["y", "x"]);
}

#[test]
fn identical_templates_are_kept_once() {
    let input = catalog_of(vec![
        text_trait("base", "id", &[]),
        text_trait("left", "id", &["base"]),
        text_trait("right", "other", &["base"]),
        text_trait("diamond", "id", &["left", "right"]),
    ]);
    let outcome = flatten_traits(&input);
    let names: Vec<&str> = outcome.traits["diamond"]
        .required_attributes
        .iter()
        .map(|a| a.template.name.as_str())
        .collect();
    assert_eq!(names, vec!["id", "other"]);
}

#[test]
fn cycles_drop_every_member() {
    let input = catalog_of(vec![
        text_trait("t1", "a", &["t2"]),
        text_trait("t2", "b", &["t1"]),
        text_trait("t3", "c", &[]),
    ]);
    let outcome = flatten_traits(&input);
    assert_eq!(outcome.traits.keys().collect::<Vec<_>>(), vec!["t3"]);
    assert_eq!(outcome.dropped.len(), 2);
    for (id, issue) in &outcome.dropped {
        assert!(id == "t1" || id == "t2");
        assert!(matches!(issue, FlattenIssue::Cycle(_)));
    }
}

#[test]
fn dependants_of_dropped_traits_are_dropped_too() {
    let input = catalog_of(vec![
        text_trait("orphan", "a", &["unknown"]),
        text_trait("grandchild", "b", &["orphan"]),
        text_trait("fine", "c", &[]),
    ]);
    let outcome = flatten_traits(&input);
    assert_eq!(outcome.traits.len(), 1);
    let dropped: BTreeMap<_, _> = outcome.dropped.into_iter().collect();
    assert_eq!(
        dropped["orphan"],
        FlattenIssue::MissingDependency("unknown".into())
    );
    assert_eq!(
        dropped["grandchild"],
        FlattenIssue::MissingDependency("orphan".into())
    );
}

#[test]
fn single_traits_without_dependencies() {
    let flattened = flatten_single(&text_trait("solo", "a", &[])).expect("flatten");
    assert_eq!(flattened.required_attributes.len(), 1);
    assert!(flatten_single(&text_trait("needy", "a", &["solo"])).is_err());
}

#[test]
fn core_definitions_take_precedence() {
    let mut plugin = text_trait("named", "plugin_attribute", &[]);
    plugin.origin = TraitOrigin::Plugin;
    let data = text_trait("named", "data_attribute", &[]);
    let mut sources = vec![data, plugin];
    sources.extend(core_traits().expect("core traits"));

    let merged = merge_trait_sources(sources);
    assert_eq!(merged["named"].origin, TraitOrigin::Core);
    assert_eq!(merged["named"].required_attributes[0].identifier, "name");

    let first = text_trait("dup", "first", &[]);
    let second = text_trait("dup", "second", &[]);
    let merged = merge_trait_sources(vec![first, second]);
    assert_eq!(merged["dup"].required_attributes[0].identifier, "first");
}

#[test]
fn catalog_always_has_the_empty_trait() {
    let (catalog, dropped) = TraitCatalog::build(core_traits().expect("core traits"));
    assert!(dropped.is_empty());
    assert!(catalog.contains(EMPTY_TRAIT_ID));
    assert!(catalog.contains("named"));
    assert!(catalog.contains("__meta.config.trait"));
    assert!(catalog.contains("__meta.config.predicate"));
    assert_eq!(catalog.len(), 4);
    let empty = catalog.get(EMPTY_TRAIT_ID).expect("empty");
    assert!(empty.is_empty_trait());
    assert!(empty.required_attributes.is_empty());
}

#[test]
fn traits_load_from_json() {
    let json = r#"[
        {
            "id": "monitored_host",
            "required_attributes": [
                {
                    "identifier": "hostname",
                    "template": {
                        "name": "host.name",
                        "value_type": "Text",
                        "is_array": false,
                        "constraints": [
                            {"type": "textLength", "minimum": 1, "maximum": 63},
                            {"type": "textRegex", "regex": "^[a-z0-9-]+$"}
                        ]
                    }
                }
            ],
            "required_relations": [
                {
                    "identifier": "monitor",
                    "template": {"predicate": "is_monitored_by", "direction_forward": true, "min_cardinality": 1}
                }
            ],
            "required_traits": ["named"]
        }
    ]"#;
    let traits = traits_from_json(json).expect("json");
    assert_eq!(traits.len(), 1);
    assert_eq!(traits[0].origin, TraitOrigin::Data);
    assert_eq!(traits[0].required_attributes[0].template.constraints.len(), 2);
    assert_eq!(
        traits[0].required_relations[0].template.max_cardinality,
        None
    );

    let mut sources = core_traits().expect("core traits");
    sources.extend(traits);
    let (catalog, dropped) = TraitCatalog::build(sources);
    assert!(dropped.is_empty());
    let flattened = catalog.get("monitored_host").expect("trait");
    assert_eq!(flattened.required_attributes.len(), 2);
    assert!(flattened.ancestor_traits.contains("named"));

    assert!(traits_from_json(r#"[{"id": "empty"}]"#).is_err());
    assert!(traits_from_json(r#"[{"id": "broken", "required_attributes": [{"identifier": "x", "template": {"name": "x", "constraints": [{"type": "textRegex", "regex": "("}]}}]}]"#).is_err());
}

#[test]
fn constraints_serialize_with_their_type_tag() {
    let constraint = CIAttributeValueConstraint::array_length(Some(1), None).expect("constraint");
    let json = serde_json::to_value(&constraint).expect("json");
    assert_eq!(json["type"], "arrayLength");
    assert_eq!(json["minimum"], 1);

    let relation = TraitRelation::new("runs_on", "runs_on", true, Some(1), Some(1));
    assert_eq!(relation.template.min_cardinality, Some(1));
}
