/// Connection registry tests
///
/// Registration, late binding, the bucket singleton and custom jobs.
/// Run with: cargo test --test registry_tests

use async_trait::async_trait;
use docmapper::store::StoreBucket;
use docmapper::{
    ClientConfig, Database, Entity, FieldDef, FieldKind, IndexSpec, Job, MemoryClient, Model,
    ModelBinding, ObjectId, OdmError, Result, Schema,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlogPost {
    id: Option<ObjectId>,
    title: String,
}

impl Model for BlogPost {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BadCollection {
    id: Option<ObjectId>,
}

impl Model for BadCollection {
    const COLLECTION_NAME: Option<&'static str> = Some("has-dash");

    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RenamedIdentity {
    id: Option<ObjectId>,
}

impl Model for RenamedIdentity {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn schema() -> Schema {
        Schema::empty().field(FieldDef::identity("key"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TwoIdentities {
    id: Option<ObjectId>,
}

impl Model for TwoIdentities {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn schema() -> Schema {
        Schema::new().field(FieldDef::identity("other"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BadDefault {
    id: Option<ObjectId>,
    count: i64,
}

impl Model for BadDefault {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn schema() -> Schema {
        Schema::new().field(FieldDef::new("count", FieldKind::Int).default_value("many"))
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![IndexSpec::new("count")]
    }
}

static POSTS: ModelBinding<BlogPost> = ModelBinding::new();

struct CountingJob {
    runs: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl Job for CountingJob {
    fn describe(&self) -> String {
        "counting job".to_string()
    }

    async fn run(&self) -> Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(OdmError::InvalidOperation("job failed".into()));
        }
        Ok("counted".to_string())
    }
}

fn connect(name: &str) -> Database {
    Database::connect(ClientConfig::memory(), Some(name)).unwrap()
}

#[tokio::test]
async fn test_default_collection_name() {
    let db = connect("names");
    let posts = db.register::<BlogPost>().unwrap();
    assert_eq!(posts.collection_name(), "blogpost");

    posts
        .save(&mut Entity::new(BlogPost {
            id: None,
            title: "hello".into(),
        }))
        .await
        .unwrap();
    assert_eq!(db.collection_names().await.unwrap(), vec!["blogpost"]);
}

#[tokio::test]
async fn test_late_binding() {
    let err = POSTS.get().unwrap_err();
    assert!(matches!(err, OdmError::NotConnected(ref name) if name == "BlogPost"));

    let db = connect("late");
    POSTS.bind(&db).unwrap();
    assert!(POSTS.is_bound());

    let mut post = Entity::new(BlogPost {
        id: None,
        title: "bound".into(),
    });
    POSTS.get().unwrap().save(&mut post).await.unwrap();
    assert_eq!(POSTS.get().unwrap().count(json!({})).await.unwrap(), 1);

    assert!(matches!(
        POSTS.bind(&connect("late_again")),
        Err(OdmError::InvalidOperation(_))
    ));
}

#[test]
fn test_register_rejects_invalid_models() {
    let db = connect("invalid");

    assert!(matches!(
        db.register::<BadCollection>(),
        Err(OdmError::InvalidModel(_))
    ));
    assert!(matches!(
        db.register::<RenamedIdentity>(),
        Err(OdmError::InvalidModel(_))
    ));
    assert!(matches!(
        db.register::<TwoIdentities>(),
        Err(OdmError::InvalidModel(_))
    ));
    assert!(matches!(
        db.register::<BadDefault>(),
        Err(OdmError::InvalidModel(_))
    ));
    assert_eq!(db.pending_jobs(), 0);
}

#[tokio::test]
async fn test_custom_jobs_run_on_materialize() {
    let db = connect("jobs");
    let runs = Arc::new(AtomicUsize::new(0));

    db.register_job(Box::new(CountingJob {
        runs: runs.clone(),
        fail: false,
    }));
    assert_eq!(db.pending_jobs(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    assert_eq!(db.materialize().await.unwrap(), vec!["counted"]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_job_does_not_stop_others() {
    let db = connect("failing_jobs");
    let runs = Arc::new(AtomicUsize::new(0));
    for fail in [true, false, false] {
        db.register_job(Box::new(CountingJob {
            runs: runs.clone(),
            fail,
        }));
    }

    let err = db.materialize().await.unwrap_err();
    assert!(matches!(err, OdmError::InvalidOperation(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(db.pending_jobs(), 0);
}

#[tokio::test]
async fn test_bucket_singleton() {
    let db = connect("files");
    let bucket = db.bucket();
    assert!(Arc::ptr_eq(&bucket, &db.bucket()));

    let id = bucket
        .upload("report.txt", b"quarterly".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(db.bucket().download(id).await.unwrap(), b"quarterly");

    let listed = db.bucket().find_by_filename("report.txt").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn test_connect_from_url() {
    let config = ClientConfig::from_url("memory://localhost:27017/shop?appName=tests").unwrap();
    let db = Database::connect(config, None).unwrap();
    assert_eq!(db.name(), "shop");
}

#[tokio::test]
async fn test_registries_sharing_a_client() {
    let client = Arc::new(MemoryClient::default());
    let first = Database::with_client(client.clone(), Some("shared")).unwrap();
    let second = Database::with_client(client.clone(), Some("shared")).unwrap();

    let writer = first.register::<BlogPost>().unwrap();
    let reader = second.register::<BlogPost>().unwrap();

    writer
        .save(&mut Entity::new(BlogPost {
            id: None,
            title: "shared".into(),
        }))
        .await
        .unwrap();
    assert_eq!(reader.get(json!({ "title": "shared" })).await.unwrap().title, "shared");
    assert_eq!(client.database_names(), vec!["shared"]);
}
