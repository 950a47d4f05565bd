use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use queryshield_mechanisms::{
    anonymize, laplace, AnonymityParams, Hierarchy, NoiseEngine, NoiseParams, QuasiIdentifier, Row,
};
use serde_json::json;

#[test]
fn laplace_variance_matches_scale() {
    let params = NoiseParams::new(0.5, 2.0);
    let scale = params.laplace_scale();
    let mut engine = NoiseEngine::from_seed([11u8; 32]);
    let draws: Vec<f64> = (0..20_000)
        .map(|_| laplace(0.0, &params, engine.rng()).unwrap())
        .collect();
    let mean = draws.iter().sum::<f64>() / draws.len() as f64;
    let variance = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;
    let expected = 2.0 * scale * scale;
    assert!(mean.abs() < 0.2, "mean = {mean}");
    assert!(
        (variance - expected).abs() / expected < 0.1,
        "variance {variance} vs expected {expected}"
    );
}

const DISEASES: [&str; 4] = ["flu", "cold", "asthma", "gout"];

fn table(rows: &[(u32, u32, usize)]) -> Vec<Row> {
    rows.iter()
        .map(|(age, zip, disease)| {
            let mut row = Row::new();
            row.insert("age".into(), json!(age));
            row.insert("zipcode".into(), json!(format!("{zip:05}")));
            row.insert("disease".into(), json!(DISEASES[*disease]));
            row
        })
        .collect()
}

fn params(k: usize, l: Option<usize>) -> AnonymityParams {
    AnonymityParams {
        k,
        quasi_identifiers: vec![
            QuasiIdentifier {
                column: "age".into(),
                hierarchy: Hierarchy::Numeric {
                    widths: vec![5.0, 20.0, 100.0],
                },
            },
            QuasiIdentifier {
                column: "zipcode".into(),
                hierarchy: Hierarchy::Prefix { keep: vec![4, 2] },
            },
        ],
        l,
        sensitive_column: Some("disease".into()),
    }
}

fn tuples(rows: &[Row]) -> BTreeMap<(String, String), Vec<String>> {
    let mut out: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for row in rows {
        out.entry((row["age"].to_string(), row["zipcode"].to_string()))
            .or_default()
            .push(row["disease"].to_string());
    }
    out
}

proptest! {
    #[test]
    fn every_released_class_has_k_rows(
        rows in prop::collection::vec((0u32..90, 10_000u32..10_400, 0usize..4), 0..40),
        k in 1usize..6,
    ) {
        let input = table(&rows);
        let result = anonymize(&input, &params(k, None)).unwrap();
        prop_assert_eq!(result.rows.len() + result.suppressed, input.len());
        let released = tuples(&result.rows);
        for members in released.values() {
            prop_assert!(members.len() >= k);
        }
        prop_assert!(released.len() <= tuples(&input).len());
    }

    #[test]
    fn every_released_class_is_l_diverse(
        rows in prop::collection::vec((0u32..90, 10_000u32..10_400, 0usize..4), 0..40),
        k in 1usize..4,
        l in 1usize..4,
    ) {
        let input = table(&rows);
        let result = anonymize(&input, &params(k, Some(l))).unwrap();
        for members in tuples(&result.rows).values() {
            prop_assert!(members.len() >= k);
            let distinct: BTreeSet<&String> = members.iter().collect();
            prop_assert!(distinct.len() >= l);
        }
    }
}

#[test]
fn scenario_five_rows_with_k_five_and_l_two() {
    let input = table(&[
        (25, 12345, 0),
        (25, 12345, 1),
        (31, 12399, 0),
        (47, 54321, 2),
        (62, 54329, 3),
    ]);
    let result = anonymize(&input, &params(5, Some(2))).unwrap();
    let classes = tuples(&result.rows);
    if result.rows.is_empty() {
        assert_eq!(result.suppressed, 5);
    } else {
        for members in classes.values() {
            assert!(members.len() >= 5);
            assert!(members.iter().collect::<BTreeSet<_>>().len() >= 2);
        }
    }
}
