//! Search integration tests: parameter types, chaining, `_has`, composites,
//! includes and paging.

mod common;

use serde_json::json;

use fhirvault_persistence::core::{ResourceStorage, SearchProvider};

use common::*;

// ============================================================================
// Parameter types
// ============================================================================

#[tokio::test]
async fn test_date_prefixes() {
    let backend = backend();
    let mut early = patient("early", "A");
    early["birthDate"] = json!("1980-06-15");
    let mut late = patient("late", "B");
    late["birthDate"] = json!("2001-01-02");
    seed(&backend, vec![early, late]).await;

    let result = search(&backend, "Patient", &[("birthdate", "ge1990-01-01")]).await;
    assert_eq!(ids(&result.resources.items), vec!["late"]);

    let result = search(&backend, "Patient", &[("birthdate", "lt1990")]).await;
    assert_eq!(ids(&result.resources.items), vec!["early"]);

    let result = search(&backend, "Patient", &[("birthdate", "1980-06")]).await;
    assert_eq!(ids(&result.resources.items), vec!["early"]);
}

#[tokio::test]
async fn test_quantity_prefixes() {
    let backend = backend();
    seed(
        &backend,
        vec![glucose("low", "p1", 90.0), glucose("high", "p1", 110.0)],
    )
    .await;

    let result = search(&backend, "Observation", &[("value-quantity", "gt100")]).await;
    assert_eq!(ids(&result.resources.items), vec!["high"]);

    let result = search(
        &backend,
        "Observation",
        &[("value-quantity", "le90|http://unitsofmeasure.org|mg/dL")],
    )
    .await;
    assert_eq!(ids(&result.resources.items), vec!["low"]);
}

#[tokio::test]
async fn test_multiple_values_are_ored_and_params_anded() {
    let backend = backend();
    let mut female = patient("f", "Smith");
    female["gender"] = json!("female");
    let mut male = patient("m", "Smith");
    male["gender"] = json!("male");
    seed(&backend, vec![female, male, patient("x", "Jones")]).await;

    let result = search(&backend, "Patient", &[("family", "Smith,Jones")]).await;
    assert_eq!(ids(&result.resources.items), vec!["f", "m", "x"]);

    let result = search(&backend, "Patient", &[("family", "Smith"), ("gender", "male")]).await;
    assert_eq!(ids(&result.resources.items), vec!["m"]);
}

#[tokio::test]
async fn test_unknown_parameters_are_ignored() {
    let backend = backend();
    seed(&backend, vec![patient("p1", "Smith")]).await;

    let result = search(&backend, "Patient", &[("shoe-size", "42")]).await;
    assert_eq!(ids(&result.resources.items), vec!["p1"]);
}

// ============================================================================
// Chaining and reverse chaining
// ============================================================================

#[tokio::test]
async fn test_chained_search_by_practitioner_name() {
    let backend = backend();
    seed(
        &backend,
        vec![
            practitioner("smith", "Smith"),
            practitioner("jones", "Jones"),
            patient_with_gp("with-smith", "Adams", "smith"),
            patient_with_gp("with-jones", "Baker", "jones"),
            patient("no-gp", "Clark"),
        ],
    )
    .await;

    let result = search(&backend, "Patient", &[("general-practitioner.name", "Smith")]).await;

    assert_eq!(ids(&result.resources.items), vec!["with-smith"]);
    assert_eq!(result.total(), 1);
}

#[tokio::test]
async fn test_chain_with_type_modifier() {
    let backend = backend();
    seed(
        &backend,
        vec![
            practitioner("smith", "Smith"),
            patient_with_gp("p1", "Adams", "smith"),
        ],
    )
    .await;

    let typed = search(
        &backend,
        "Patient",
        &[("general-practitioner:Practitioner.name", "Smith")],
    )
    .await;
    assert_eq!(ids(&typed.resources.items), vec!["p1"]);

    let wrong_type = search(
        &backend,
        "Patient",
        &[("general-practitioner:Organization.name", "Smith")],
    )
    .await;
    assert!(wrong_type.resources.items.is_empty());
}

#[tokio::test]
async fn test_reverse_chain_has() {
    let backend = backend();
    seed(
        &backend,
        vec![
            patient("p1", "Smith"),
            patient("p2", "Jones"),
            observation("o1", "p1", "1234-5"),
            observation("o2", "p2", "9999-9"),
        ],
    )
    .await;

    let result = search(
        &backend,
        "Patient",
        &[("_has:Observation:subject:code", "1234-5")],
    )
    .await;
    assert_eq!(ids(&result.resources.items), vec!["p1"]);
}

// ============================================================================
// Composites
// ============================================================================

#[tokio::test]
async fn test_composite_code_value_quantity() {
    let backend = backend();
    seed(
        &backend,
        vec![
            glucose("ninety", "p1", 90.0),
            glucose("one-ten", "p1", 110.0),
        ],
    )
    .await;

    let result = search(
        &backend,
        "Observation",
        &[("code-value-quantity", "2339-0$gt100")],
    )
    .await;
    assert_eq!(ids(&result.resources.items), vec!["one-ten"]);

    let with_system = search(
        &backend,
        "Observation",
        &[("code-value-quantity", "http://loinc.org|2339-0$le90")],
    )
    .await;
    assert_eq!(ids(&with_system.resources.items), vec!["ninety"]);
}

#[tokio::test]
async fn test_composite_components_must_share_an_instance() {
    let backend = backend();
    let obs = json!({
        "resourceType": "Observation",
        "id": "bp",
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
        "component": [
            {
                "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                "valueQuantity": {"value": 120, "unit": "mmHg"}
            },
            {
                "code": {"coding": [{"system": "http://loinc.org", "code": "8462-4"}]},
                "valueQuantity": {"value": 80, "unit": "mmHg"}
            }
        ]
    });
    backend.create("Observation", obs).await.unwrap();

    let systolic_high = search(
        &backend,
        "Observation",
        &[("component-code-value-quantity", "8480-6$gt100")],
    )
    .await;
    assert_eq!(ids(&systolic_high.resources.items), vec!["bp"]);

    // 8462-4 is 80; 120 belongs to the other component
    let crossed = search(
        &backend,
        "Observation",
        &[("component-code-value-quantity", "8462-4$gt100")],
    )
    .await;
    assert!(crossed.resources.items.is_empty());
}

// ============================================================================
// _count and paging
// ============================================================================

#[tokio::test]
async fn test_count_rules() {
    let backend = backend();
    for i in 0..12 {
        backend
            .create("Patient", patient(&format!("p{:02}", i), "Smith"))
            .await
            .unwrap();
    }

    let default = search(&backend, "Patient", &[]).await;
    assert_eq!(default.resources.items.len(), 10);
    assert_eq!(default.total(), 12);

    let err = backend
        .parse_query("Patient", &pairs(&[("_count", "-1")]))
        .unwrap_err();
    assert_eq!(err.http_status(), 400);

    let capped = backend
        .parse_query("Patient", &pairs(&[("_count", "1001")]))
        .unwrap();
    assert_eq!(capped.count, Some(1000));
}

#[tokio::test]
async fn test_sequential_pages_never_share_ids() {
    let backend = backend();
    for i in 0..7 {
        backend
            .create("Patient", patient(&format!("p{}", i), "Smith"))
            .await
            .unwrap();
    }

    let first = search(&backend, "Patient", &[("_count", "3"), ("_page", "1")]).await;
    let second = search(&backend, "Patient", &[("_count", "3"), ("_page", "2")]).await;

    let first_ids = ids(&first.resources.items);
    let second_ids = ids(&second.resources.items);
    assert_eq!(first_ids.len(), 3);
    assert_eq!(second_ids.len(), 3);
    assert!(first_ids.iter().all(|id| !second_ids.contains(id)));
}

#[tokio::test]
async fn test_empty_result_bundle() {
    let engine = engine();
    let bundle = engine
        .search("Patient", &pairs(&[("family", "Nobody")]), None)
        .await
        .unwrap()
        .body
        .unwrap();

    assert_eq!(bundle["total"], 0);
    assert!(bundle.get("entry").is_none());
    let relations: Vec<&str> = bundle["link"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|l| l["relation"].as_str())
        .collect();
    assert!(!relations.contains(&"next"));
    assert!(!relations.contains(&"previous"));
}

#[tokio::test]
async fn test_paging_links() {
    let engine = engine().with_base_url("http://fhir.example");
    for i in 0..5 {
        engine
            .create("Patient", patient(&format!("p{}", i), "Smith"), None)
            .await
            .unwrap();
    }

    let bundle = engine
        .search(
            "Patient",
            &pairs(&[("family", "Smith"), ("_count", "2"), ("_page", "2")]),
            None,
        )
        .await
        .unwrap()
        .body
        .unwrap();

    let link = |relation: &str| {
        bundle["link"]
            .as_array()
            .unwrap()
            .iter()
            .find(|l| l["relation"] == relation)
            .and_then(|l| l["url"].as_str())
            .map(String::from)
    };
    let next = link("next").expect("page 2 of 3 has a next link");
    assert!(next.starts_with("http://fhir.example/Patient?"));
    assert!(next.contains("_page=3"));
    assert!(link("previous").unwrap().contains("_page=1"));
    assert_eq!(bundle["entry"].as_array().unwrap().len(), 2);
}

// ============================================================================
// Includes and sorting
// ============================================================================

#[tokio::test]
async fn test_include_entries_are_marked() {
    let engine = engine();
    let backend = engine.backend();
    seed(
        backend,
        vec![patient("p1", "Smith"), observation("o1", "p1", "1234-5")],
    )
    .await;

    let bundle = engine
        .search(
            "Observation",
            &pairs(&[("_include", "Observation:patient")]),
            None,
        )
        .await
        .unwrap()
        .body
        .unwrap();

    assert_eq!(bundle["total"], 1);
    let entries = bundle["entry"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["search"]["mode"], "match");
    assert_eq!(entries[1]["search"]["mode"], "include");
    assert_eq!(entries[1]["resource"]["resourceType"], "Patient");
}

#[tokio::test]
async fn test_wildcard_include() {
    let backend = backend();
    seed(
        &backend,
        vec![
            practitioner("dr1", "Who"),
            patient("p1", "Smith"),
            json!({
                "resourceType": "Observation",
                "id": "o1",
                "status": "final",
                "code": {"text": "pulse"},
                "subject": {"reference": "Patient/p1"},
                "performer": [{"reference": "Practitioner/dr1"}]
            }),
        ],
    )
    .await;

    let result = search(&backend, "Observation", &[("_include", "*")]).await;
    assert_eq!(ids(&result.included), vec!["dr1", "p1"]);
}

#[tokio::test]
async fn test_sort_by_string_parameter() {
    let backend = backend();
    seed(
        &backend,
        vec![patient("b", "Brown"), patient("a", "Adams"), patient("c", "Clark")],
    )
    .await;

    let result = search(&backend, "Patient", &[("_sort", "family")]).await;
    let order: Vec<&str> = result.resources.items.iter().map(|r| r.id()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    let query = backend
        .parse_query("Patient", &pairs(&[("given", "test")]))
        .unwrap();
    assert_eq!(backend.search_count(&query).await.unwrap(), 3);
}
