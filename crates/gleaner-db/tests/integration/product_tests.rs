use gleaner_core::models::{AttributeConfidence, Classification, Product, UpsertOutcome};
use gleaner_core::testutil::raw_product;
use gleaner_core::traits::ProductStore;
use gleaner_db::ProductRepository;

use crate::integration::common::setup_test_db;

fn product(store: &str, name: &str, url: &str) -> Product {
    Product::from_raw(store, "dresses", raw_product(name, url)).unwrap()
}

#[tokio::test]
async fn first_upsert_inserts() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let mut p = product("acme", "Linen Dress", "https://acme.test/p/1");
    p.classification = Classification {
        category: "dress".into(),
        color: "white".into(),
        pattern: "solid".into(),
        gender: "women".into(),
        sleeve_length: Some("sleeveless".into()),
        length: Some("maxi".into()),
        confidence: AttributeConfidence {
            category: 0.9,
            color: 0.8,
            pattern: 0.7,
            gender: 0.6,
            sleeve_length: Some(0.5),
            length: Some(0.4),
            ..Default::default()
        },
        ..Classification::unclassified()
    };

    assert_eq!(repo.upsert(&p).await.unwrap(), UpsertOutcome::Inserted);

    let stored = repo
        .get("acme", "https://acme.test/p/1")
        .await
        .unwrap()
        .expect("Should find the product");
    assert_eq!(stored.name, "Linen Dress");
    assert_eq!(stored.category, "dress");
    assert_eq!(stored.gender, "women");
    assert_eq!(stored.sleeve_length.as_deref(), Some("sleeveless"));
    assert_eq!(stored.neckline, None);
    assert_eq!(stored.length.as_deref(), Some("maxi"));
    assert_eq!(stored.category_confidence, 0.9);
    assert_eq!(stored.length_confidence, Some(0.4));
    assert_eq!(stored.neckline_confidence, None);
    assert_eq!(stored.content_hash, p.content_hash());
}

#[tokio::test]
async fn second_upsert_updates_same_row() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let mut p = product("acme", "Linen Dress", "https://acme.test/p/1");
    repo.upsert(&p).await.unwrap();
    let before = repo.get("acme", &p.product_url).await.unwrap().unwrap();

    p.price = Some("39.90".into());
    assert_eq!(repo.upsert(&p).await.unwrap(), UpsertOutcome::Updated);

    let after = repo.get("acme", &p.product_url).await.unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.price.as_deref(), Some("39.90"));
    assert!(after.updated_at >= before.updated_at);
    assert_eq!(repo.count(Some("acme")).await.unwrap(), 1);
}

#[tokio::test]
async fn unchanged_upsert_is_an_update_without_rewrite() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let p = product("acme", "Tee", "https://acme.test/p/2");
    repo.upsert(&p).await.unwrap();
    let before = repo.get("acme", &p.product_url).await.unwrap().unwrap();

    assert_eq!(repo.upsert(&p).await.unwrap(), UpsertOutcome::Updated);
    let after = repo.get("acme", &p.product_url).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn same_url_in_two_stores_is_two_rows() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let url = "https://shared.test/p/1";
    assert_eq!(
        ProductStore::upsert(&repo, &product("a", "Tee", url)).await.unwrap(),
        UpsertOutcome::Inserted
    );
    assert_eq!(
        ProductStore::upsert(&repo, &product("b", "Tee", url)).await.unwrap(),
        UpsertOutcome::Inserted
    );

    assert_eq!(repo.count(None).await.unwrap(), 2);
    assert_eq!(repo.count(Some("a")).await.unwrap(), 1);
    repo.health_check().await.unwrap();
}
