//! Transform engine tests against in-memory tiers

mod helpers;

use bankflow_etl::entity::Entity;
use bankflow_etl::extract::Extractor;
use bankflow_etl::record::FieldValue;
use bankflow_etl::transform::TransformEngine;
use helpers::*;

async fn staged(files: Vec<bankflow_etl::source::SourceFile>) -> TestPipeline {
    let pipeline = TestPipeline::new().await;
    Extractor::new(
        pipeline.stores.ledger.clone(),
        pipeline.stores.staging.clone(),
        100,
    )
    .extract_files(&files)
    .await
    .unwrap();
    pipeline
}

fn engine(pipeline: &TestPipeline) -> TransformEngine {
    TransformEngine::new(
        pipeline.stores.staging.clone(),
        pipeline.stores.transform.clone(),
        as_of(),
    )
}

#[tokio::test]
async fn test_transform_twice_gives_identical_rows() {
    let pipeline = staged(sample_files()).await;
    let engine = engine(&pipeline);

    engine.transform_all().await.unwrap();
    let mut first = Vec::new();
    for entity in Entity::ALL {
        first.push(pipeline.stores.transform.fetch_all(entity).await.unwrap());
    }

    engine.transform_all().await.unwrap();
    for (idx, entity) in Entity::ALL.into_iter().enumerate() {
        let second = pipeline.stores.transform.fetch_all(entity).await.unwrap();
        assert_eq!(first[idx], second, "{} changed between runs", entity);
    }
}

#[tokio::test]
async fn test_enriched_fields() {
    let pipeline = staged(sample_files()).await;
    let report = engine(&pipeline).transform_all().await.unwrap();

    assert_eq!(report.as_of, Some(as_of()));
    assert_eq!(report.total_transformed(), 9);
    assert_eq!(report.total_quarantined(), 0);

    let transform = &pipeline.stores.transform;
    let branch = transform.fetch(Entity::Branch, "B2").await.unwrap().unwrap();
    assert_eq!(branch.get("city"), Some(&FieldValue::Text("Mumbai".into())));
    assert_eq!(branch.get("region"), Some(&FieldValue::Text("West".into())));

    let customer = transform.fetch(Entity::Customer, "C1").await.unwrap().unwrap();
    assert_eq!(customer.get("first_name"), Some(&FieldValue::Text("Priya".into())));
    assert_eq!(
        customer.get("email"),
        Some(&FieldValue::Text("priya@example.com".into()))
    );
    assert_eq!(customer.get("age"), Some(&FieldValue::Integer(34)));
    assert_eq!(customer.get("gender"), Some(&FieldValue::Text("Female".into())));
    assert_eq!(
        customer.get("customer_segment"),
        Some(&FieldValue::Text("VIP".into()))
    );

    let loan = transform.fetch(Entity::Loan, "L1").await.unwrap().unwrap();
    assert_eq!(loan.get("loan_amount"), Some(&FieldValue::Real(250000.0)));
    assert_eq!(loan.get("loan_duration_months"), Some(&FieldValue::Integer(120)));
    assert_eq!(loan.get("risk_category"), Some(&FieldValue::Text("Medium".into())));

    let txn = transform.fetch(Entity::Transaction, "T3").await.unwrap().unwrap();
    assert_eq!(
        txn.get("transaction_category"),
        Some(&FieldValue::Text("Large".into()))
    );
    assert_eq!(txn.get("fraud_flag"), Some(&FieldValue::Boolean(false)));
}

#[tokio::test]
async fn test_bad_rows_are_quarantined_and_batch_continues() {
    let mut files = sample_files();
    files.push(file(
        "loans_extra.csv",
        &loans_csv(&[("L3", "C9", "50000"), ("L4", "C1", "-10"), ("L5", "C2", "60000")]),
    ));
    let pipeline = staged(files).await;

    let report = engine(&pipeline).transform_all().await.unwrap();
    let loans = report
        .entities
        .iter()
        .find(|e| e.entity == Entity::Loan)
        .unwrap();
    assert_eq!(loans.processed, 5);
    assert_eq!(loans.transformed, 3);
    assert_eq!(loans.quarantined, 2);
    assert_eq!(loans.quality.accuracy, 60.0);
    assert_eq!(loans.quality.completeness, 100.0);
    assert_eq!(loans.quality.duplicate_rate, 0.0);
    assert_eq!(loans.quality.outlier_rate, 0.0);

    let keys = sorted(pipeline.stores.transform.natural_keys(Entity::Loan).await.unwrap());
    assert_eq!(keys, vec!["L1", "L2", "L5"]);

    let quarantined = pipeline.stores.transform.quarantined(Entity::Loan).await.unwrap();
    assert_eq!(quarantined.len(), 2);
    assert_eq!(quarantined[0].natural_key, "L3");
    assert!(quarantined[0].reason.contains("C9"));
    assert_eq!(quarantined[0].raw["customer_id"], "C9");
    assert_eq!(quarantined[1].natural_key, "L4");
    assert!(quarantined[1].reason.contains("loan_amount"));
}

#[tokio::test]
async fn test_transform_follows_staging_changes() {
    let pipeline = staged(sample_files()).await;
    let engine = engine(&pipeline);
    engine.transform_all().await.unwrap();

    Extractor::new(
        pipeline.stores.ledger.clone(),
        pipeline.stores.staging.clone(),
        100,
    )
    .extract_files(&[file(
        "customers_update.csv",
        &customers_csv(&[("C2", "rahul", "RAHUL@NEW.EXAMPLE.COM")]),
    )])
    .await
    .unwrap();
    engine.transform_all().await.unwrap();

    let customer = pipeline
        .stores
        .transform
        .fetch(Entity::Customer, "C2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        customer.get("email"),
        Some(&FieldValue::Text("rahul@new.example.com".into()))
    );
    assert_eq!(pipeline.stores.transform.count(Entity::Customer).await.unwrap(), 2);
}
