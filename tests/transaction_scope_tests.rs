/// Transaction tests
///
/// Database::with_transaction commit / abort semantics and manual sessions.
/// Run with: cargo test --test transaction_scope_tests

use docmapper::{ClientConfig, Database, Entity, IndexSpec, Model, ModelHandle, ObjectId, OdmError};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: Option<ObjectId>,
    sku: String,
    qty: i64,
}

impl Model for Order {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: Option<ObjectId>,
    name: String,
}

impl Model for Item {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![IndexSpec::new("name").unique(true)]
    }
}

fn item(name: &str) -> Entity<Item> {
    Entity::new(Item {
        id: None,
        name: name.to_string(),
    })
}

async fn setup_items(name: &str) -> (Database, ModelHandle<Item>) {
    let db = Database::connect(ClientConfig::memory(), Some(name)).unwrap();
    let items = db.register::<Item>().unwrap();
    db.materialize().await.unwrap();
    (db, items)
}

#[derive(Debug)]
enum AppError {
    OutOfStock,
    Store(OdmError),
}

impl From<OdmError> for AppError {
    fn from(err: OdmError) -> Self {
        AppError::Store(err)
    }
}

fn order(sku: &str, qty: i64) -> Entity<Order> {
    Entity::new(Order {
        id: None,
        sku: sku.to_string(),
        qty,
    })
}

fn setup() -> (Database, ModelHandle<Order>) {
    let db = Database::connect(ClientConfig::memory(), Some("tx")).unwrap();
    let orders = db.register::<Order>().unwrap();
    (db, orders)
}

#[tokio::test]
async fn test_commit_publishes_writes() {
    let (db, orders) = setup();

    let saved = db
        .with_transaction(|tx| {
            let orders = tx.bind(&orders);
            async move {
                let mut first = order("apple", 1);
                orders.save(&mut first).await?;
                orders.save(&mut order("pear", 2)).await?;
                assert_eq!(orders.count(json!({})).await?, 2);
                Ok::<_, OdmError>(first)
            }
        })
        .await
        .unwrap();

    assert_eq!(orders.count(json!({})).await.unwrap(), 2);
    let stored = orders.get_by_id(saved.id().unwrap()).await.unwrap();
    assert_eq!(stored.sku, "apple");
}

#[tokio::test]
async fn test_writes_are_invisible_until_commit() {
    let (db, orders) = setup();
    let outside = orders.clone();

    db.with_transaction(|tx| {
        let inside = tx.bind(&orders);
        async move {
            inside.save(&mut order("apple", 1)).await?;
            assert_eq!(inside.count(json!({})).await?, 1);
            assert_eq!(outside.count(json!({})).await?, 0);
            Ok::<_, OdmError>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(orders.count(json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn test_error_rolls_back_and_passes_through() {
    let (db, orders) = setup();

    let result: Result<(), AppError> = db
        .with_transaction(|tx| {
            let orders = tx.bind(&orders);
            async move {
                orders.save(&mut order("apple", 1)).await?;
                Err(AppError::OutOfStock)
            }
        })
        .await;

    assert!(matches!(result, Err(AppError::OutOfStock)));
    assert_eq!(orders.count(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_error_inside_transaction() {
    let (db, orders) = setup();
    let mut existing = order("apple", 1);
    orders.save(&mut existing).await.unwrap();

    let result: Result<(), AppError> = db
        .with_transaction(|tx| {
            let orders = tx.bind(&orders);
            async move {
                orders
                    .update_many(json!({}), json!({ "$set": { "qty": 10 } }))
                    .await?;
                orders.create(&mut existing).await?;
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(AppError::Store(OdmError::AlreadyExists))));
    let stored = orders.get(json!({ "sku": "apple" })).await.unwrap();
    assert_eq!(stored.qty, 1);
}

#[tokio::test]
async fn test_bound_handle_reports_session() {
    let (db, orders) = setup();
    assert!(orders.session_id().is_none());

    db.with_transaction(|tx| {
        let bound = tx.bind(&orders);
        assert_eq!(bound.session_id(), Some(tx.session_id()));
        async move { Ok::<_, OdmError>(()) }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_manual_session_abort() {
    let (db, orders) = setup();

    let session = db.start_session().await.unwrap();
    session.start_transaction().await.unwrap();
    assert!(session.in_transaction());

    let bound = session.scope().bind(&orders);
    bound.save(&mut order("apple", 1)).await.unwrap();
    session.abort().await.unwrap();
    assert!(!session.in_transaction());

    assert_eq!(orders.count(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_manual_session_commit() {
    let (db, orders) = setup();

    let session = db.start_session().await.unwrap();
    session.start_transaction().await.unwrap();
    session.scope().bind(&orders).save(&mut order("apple", 1)).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(orders.count(json!({})).await.unwrap(), 1);
    assert!(session.commit().await.is_err());
}

#[tokio::test]
async fn test_dropped_session_discards_transaction() {
    let (db, orders) = setup();

    let bound = {
        let session = db.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        let bound = session.scope().bind(&orders);
        bound.save(&mut order("apple", 1)).await.unwrap();
        bound
    };

    assert_eq!(orders.count(json!({})).await.unwrap(), 0);
    let err = bound.count(json!({})).await.unwrap_err();
    assert!(matches!(err, OdmError::Transaction(_)));
}

#[tokio::test]
async fn test_nested_transactions_are_independent() {
    let (db, orders) = setup();

    let outer: Result<(), AppError> = db
        .with_transaction(|tx| {
            let outer_orders = tx.bind(&orders);
            let db = db.clone();
            let orders = orders.clone();
            async move {
                outer_orders.save(&mut order("outer", 1)).await?;
                db.with_transaction(|inner| {
                    let inner_orders = inner.bind(&orders);
                    async move {
                        inner_orders.save(&mut order("inner", 1)).await?;
                        Ok::<_, AppError>(())
                    }
                })
                .await?;
                Err(AppError::OutOfStock)
            }
        })
        .await;

    assert!(outer.is_err());
    let names: Vec<String> = orders
        .get_many(json!({}))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.into_inner().sku)
        .collect();
    assert_eq!(names, vec!["inner"]);
}

#[tokio::test]
async fn test_commit_keeps_writes_made_outside_the_transaction() {
    let (db, items) = setup_items("tx_merge").await;
    let outside = items.clone();

    db.with_transaction(|tx| {
        let items = tx.bind(&items);
        async move {
            items.save(&mut item("in-tx")).await?;
            outside.save(&mut item("outside")).await?;
            Ok::<_, OdmError>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(items.count(json!({})).await.unwrap(), 2);
    assert_eq!(items.get(json!({ "name": "outside" })).await.unwrap().name, "outside");
}

#[tokio::test]
async fn test_conflicting_commit_fails_with_duplicate_key() {
    let (db, items) = setup_items("tx_unique").await;

    let first = db.start_session().await.unwrap();
    let second = db.start_session().await.unwrap();
    first.start_transaction().await.unwrap();
    second.start_transaction().await.unwrap();

    first.scope().bind(&items).save(&mut item("dup")).await.unwrap();
    let late = second.scope().bind(&items);
    late.save(&mut item("dup")).await.unwrap();
    late.save(&mut item("unrelated")).await.unwrap();

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    assert!(err.is_duplicate_key());
    assert!(!second.in_transaction());

    assert_eq!(items.count(json!({})).await.unwrap(), 1);
    assert_eq!(items.count(json!({ "name": "unrelated" })).await.unwrap(), 0);
}
