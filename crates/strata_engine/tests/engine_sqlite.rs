use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use strata_core::{Error, Result, Value};
use strata_engine::{
    Client, InterceptionDecision, MutationAction, MutationHookEvent, Plugin, QueryCtx,
    QueryNext,
};
use strata_driver_sqlite::SqliteConnection;
use strata_test_support::blog_schema;

async fn connect() -> Client {
    let _ = env_logger::builder().is_test(true).try_init();
    let conn = Arc::new(SqliteConnection::open_in_memory().expect("open sqlite"));
    let client = Client::new(
        blog_schema(strata_core::SqlProvider::Sqlite),
        conn,
    )
    .expect("client");
    client.push_schema().await.expect("push schema");
    client
}

fn record(value: &Value) -> &strata_core::Row {
    value.as_record().expect("record value")
}

fn list(value: &Value) -> &[Value] {
    value.as_list().expect("list value")
}

fn text(value: &Value, field: &str) -> String {
    record(value)
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field '{}'", field))
        .to_string()
}

fn int(value: &Value, field: &str) -> i64 {
    record(value)
        .get(field)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing int field '{}'", field))
}

// ---------------------------------------------------------------------------
// Create / read round-trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_then_find_unique_round_trip() {
    let client = connect().await;
    let users = client.model("User");

    let created = users
        .create(json!({ "data": { "email": "u1@test.com", "name": "One" } }))
        .await
        .unwrap();
    assert_eq!(text(&created, "email"), "u1@test.com");
    assert!(matches!(
        record(&created).get("createdAt"),
        Some(Value::DateTime(_))
    ));
    assert!(matches!(
        record(&created).get("updatedAt"),
        Some(Value::DateTime(_))
    ));

    let found = users
        .find_unique(json!({ "where": { "email": "u1@test.com" } }))
        .await
        .unwrap();
    assert_eq!(text(&found, "id"), text(&created, "id"));
    assert_eq!(text(&found, "name"), "One");
}

#[tokio::test]
async fn duplicate_unique_email_fails_and_contains_counts() {
    let client = connect().await;
    let users = client.model("User");

    users
        .create(json!({ "data": { "email": "u1@test.com" } }))
        .await
        .unwrap();
    let err = users
        .create(json!({ "data": { "email": "u1@test.com" } }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { .. }), "got {:?}", err);

    let count = users
        .count(json!({ "where": { "email": { "contains": "u1" } } }))
        .await
        .unwrap();
    assert_eq!(count, Value::Int(1));
}

#[tokio::test]
async fn find_unique_or_throw_reports_not_found() {
    let client = connect().await;
    let err = client
        .model("User")
        .find_unique_or_throw(json!({ "where": { "email": "ghost@test.com" } }))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn rejects_malformed_args_before_sql() {
    let client = connect().await;
    let err = client
        .model("User")
        .find_many(json!({ "skip": -1 }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InputValidation { .. }));
}

// ---------------------------------------------------------------------------
// Nested writes and relation filters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nested_create_with_include_and_relation_filters() {
    let client = connect().await;
    let users = client.model("User");

    let created = users
        .create(json!({
            "data": {
                "email": "a",
                "posts": { "create": { "title": "P1" } }
            },
            "include": { "posts": true }
        }))
        .await
        .unwrap();
    let posts = list(record(&created).get("posts").expect("posts"));
    assert_eq!(posts.len(), 1);
    assert_eq!(text(&posts[0], "title"), "P1");

    let by_some = users
        .find_first(json!({ "where": { "posts": { "some": { "title": "P1" } } } }))
        .await
        .unwrap();
    assert_eq!(text(&by_some, "email"), "a");

    // No user qualifies while the post is unpublished.
    let by_every = users
        .find_first(json!({ "where": { "posts": { "every": { "published": true } } } }))
        .await
        .unwrap();
    assert_eq!(by_every, Value::Null);

    client
        .model("Post")
        .update_many(json!({
            "where": { "title": "P1" },
            "data": { "published": true }
        }))
        .await
        .unwrap();

    let by_every = users
        .find_first(json!({ "where": { "posts": { "every": { "published": true } } } }))
        .await
        .unwrap();
    assert_eq!(text(&by_every, "email"), "a");
}

#[tokio::test]
async fn to_one_relation_connect_and_null_filter() {
    let client = connect().await;
    let users = client.model("User");

    users
        .create(json!({
            "data": {
                "email": "with-profile",
                "profile": { "create": { "bio": "hello" } }
            }
        }))
        .await
        .unwrap();
    users
        .create(json!({ "data": { "email": "no-profile" } }))
        .await
        .unwrap();

    let lonely = users
        .find_many(json!({ "where": { "profile": null } }))
        .await
        .unwrap();
    let lonely = list(&lonely);
    assert_eq!(lonely.len(), 1);
    assert_eq!(text(&lonely[0], "email"), "no-profile");

    let with_profile = users
        .find_first(json!({
            "where": { "profile": { "is": { "bio": "hello" } } },
            "include": { "profile": true }
        }))
        .await
        .unwrap();
    assert_eq!(text(&with_profile, "email"), "with-profile");
    let profile = record(&with_profile).get("profile").expect("profile");
    assert_eq!(text(profile, "bio"), "hello");
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

async fn seed_three_users(client: &Client) {
    for email in ["u1", "u2", "u3"] {
        client
            .model("User")
            .create(json!({ "data": { "id": email, "email": email } }))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn cursor_pagination_partitions_without_gaps() {
    let client = connect().await;
    seed_three_users(&client).await;
    let users = client.model("User");

    let first_page = users
        .find_many(json!({ "orderBy": { "email": "asc" }, "take": 2 }))
        .await
        .unwrap();
    let first_page = list(&first_page);
    assert_eq!(first_page.len(), 2);
    assert_eq!(text(&first_page[0], "email"), "u1");
    assert_eq!(text(&first_page[1], "email"), "u2");

    let second_page = users
        .find_many(json!({
            "cursor": { "id": "u2" },
            "skip": 1,
            "take": 2,
            "orderBy": { "email": "asc" }
        }))
        .await
        .unwrap();
    let second_page = list(&second_page);
    assert_eq!(second_page.len(), 1);
    assert_eq!(text(&second_page[0], "email"), "u3");
}

#[tokio::test]
async fn negative_take_returns_last_rows_in_original_order() {
    let client = connect().await;
    seed_three_users(&client).await;

    let last_two = client
        .model("User")
        .find_many(json!({ "orderBy": { "email": "asc" }, "take": -2 }))
        .await
        .unwrap();
    let last_two = list(&last_two);
    assert_eq!(last_two.len(), 2);
    assert_eq!(text(&last_two[0], "email"), "u2");
    assert_eq!(text(&last_two[1], "email"), "u3");
}

#[tokio::test]
async fn boundary_behaviors() {
    let client = connect().await;
    seed_three_users(&client).await;
    let users = client.model("User");

    let all = users.find_many(json!({ "where": {} })).await.unwrap();
    assert_eq!(list(&all).len(), 3);

    let none = users.find_many(json!({ "take": 0 })).await.unwrap();
    assert!(list(&none).is_empty());

    let past_end = users.find_many(json!({ "skip": 10 })).await.unwrap();
    assert!(list(&past_end).is_empty());

    let and_empty = users
        .find_many(json!({ "where": { "AND": [] } }))
        .await
        .unwrap();
    assert_eq!(list(&and_empty).len(), 3);

    let or_empty = users
        .find_many(json!({ "where": { "OR": [] } }))
        .await
        .unwrap();
    assert!(list(&or_empty).is_empty());
}

// ---------------------------------------------------------------------------
// Many-to-many
// ---------------------------------------------------------------------------

#[tokio::test]
async fn many_to_many_connect_is_idempotent_and_set_resets() {
    let client = connect().await;

    client
        .model("User")
        .create(json!({ "data": { "id": "author", "email": "author" } }))
        .await
        .unwrap();
    client
        .model("Post")
        .create(json!({ "data": { "id": "p", "title": "P", "authorId": "author" } }))
        .await
        .unwrap();
    for tag in ["t1", "t2"] {
        client
            .model("Tag")
            .create(json!({ "data": { "id": tag, "name": tag } }))
            .await
            .unwrap();
    }
    let posts = client.model("Post");

    posts
        .update(json!({
            "where": { "id": "p" },
            "data": { "tags": { "connect": [{ "id": "t1" }, { "id": "t2" }] } }
        }))
        .await
        .unwrap();

    // Connecting twice leaves exactly one link per pair.
    posts
        .update(json!({
            "where": { "id": "p" },
            "data": { "tags": { "connect": [{ "id": "t1" }] } }
        }))
        .await
        .unwrap();

    let with_tags = posts
        .find_unique(json!({
            "where": { "id": "p" },
            "include": { "tags": { "orderBy": { "name": "asc" } } }
        }))
        .await
        .unwrap();
    let tags = list(record(&with_tags).get("tags").expect("tags"));
    assert_eq!(tags.len(), 2);
    assert_eq!(text(&tags[0], "name"), "t1");

    posts
        .update(json!({
            "where": { "id": "p" },
            "data": { "tags": { "set": [{ "id": "t1" }] } }
        }))
        .await
        .unwrap();

    let after_set = posts
        .find_unique(json!({ "where": { "id": "p" }, "include": { "tags": true } }))
        .await
        .unwrap();
    let tags = list(record(&after_set).get("tags").expect("tags"));
    assert_eq!(tags.len(), 1);
    assert_eq!(text(&tags[0], "name"), "t1");

    // Membership is visible from the other side too.
    let tagged = client
        .model("Tag")
        .find_first(json!({ "where": { "posts": { "some": { "id": "p" } } } }))
        .await
        .unwrap();
    assert_eq!(text(&tagged, "name"), "t1");
}

// ---------------------------------------------------------------------------
// Update operators, upsert, delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn numeric_update_operators() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u", "email": "u", "age": 10 } }))
        .await
        .unwrap();

    let bumped = client
        .model("User")
        .update(json!({
            "where": { "id": "u" },
            "data": { "age": { "increment": 5 } }
        }))
        .await
        .unwrap();
    assert_eq!(int(&bumped, "age"), 15);

    let halved = client
        .model("User")
        .update(json!({
            "where": { "id": "u" },
            "data": { "age": { "divide": 3 } }
        }))
        .await
        .unwrap();
    assert_eq!(int(&halved, "age"), 5);
}

#[tokio::test]
async fn noop_update_returns_the_row_unchanged() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({ "data": { "id": "author", "email": "author" } }))
        .await
        .unwrap();
    client
        .model("Post")
        .create(json!({ "data": { "id": "p", "title": "P", "authorId": "author" } }))
        .await
        .unwrap();

    let updated = client
        .model("Post")
        .update(json!({ "where": { "id": "p" }, "data": {} }))
        .await
        .unwrap();
    let found = client
        .model("Post")
        .find_unique(json!({ "where": { "id": "p" } }))
        .await
        .unwrap();
    assert_eq!(updated, found);
}

#[tokio::test]
async fn upsert_updates_then_creates() {
    let client = connect().await;
    let users = client.model("User");

    let created = users
        .upsert(json!({
            "where": { "email": "x" },
            "create": { "email": "x", "age": 1 },
            "update": { "age": { "increment": 1 } }
        }))
        .await
        .unwrap();
    assert_eq!(int(&created, "age"), 1);

    let updated = users
        .upsert(json!({
            "where": { "email": "x" },
            "create": { "email": "x", "age": 1 },
            "update": { "age": { "increment": 1 } }
        }))
        .await
        .unwrap();
    assert_eq!(int(&updated, "age"), 2);
}

#[tokio::test]
async fn delete_twice_reports_not_found() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u", "email": "u" } }))
        .await
        .unwrap();

    let deleted = client
        .model("User")
        .delete(json!({ "where": { "id": "u" } }))
        .await
        .unwrap();
    assert_eq!(text(&deleted, "email"), "u");

    let err = client
        .model("User")
        .delete(json!({ "where": { "id": "u" } }))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn update_many_with_limit_bounds_the_mutation() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({ "data": { "id": "author", "email": "author" } }))
        .await
        .unwrap();
    for i in 0..3 {
        client
            .model("Post")
            .create(json!({
                "data": { "id": format!("p{}", i), "title": "P", "authorId": "author" }
            }))
            .await
            .unwrap();
    }

    let result = client
        .model("Post")
        .update_many(json!({
            "where": { "published": false },
            "data": { "published": true },
            "limit": 1
        }))
        .await
        .unwrap();
    assert_eq!(int(&result, "count"), 1);

    let still_unpublished = client
        .model("Post")
        .count(json!({ "where": { "published": false } }))
        .await
        .unwrap();
    assert_eq!(still_unpublished, Value::Int(2));
}

// ---------------------------------------------------------------------------
// Batch creates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_many_counts_and_skips_duplicates() {
    let client = connect().await;
    let users = client.model("User");

    let before = users.count(json!({})).await.unwrap();
    assert_eq!(before, Value::Int(0));

    let result = users
        .create_many(json!({ "data": [{ "email": "a" }, { "email": "b" }] }))
        .await
        .unwrap();
    assert_eq!(int(&result, "count"), 2);
    assert_eq!(users.count(json!({})).await.unwrap(), Value::Int(2));

    let skipped = users
        .create_many(json!({
            "data": [{ "email": "a" }, { "email": "c" }],
            "skipDuplicates": true
        }))
        .await
        .unwrap();
    assert_eq!(int(&skipped, "count"), 1);

    let returned = users
        .create_many_and_return(json!({ "data": [{ "email": "d" }] }))
        .await
        .unwrap();
    let returned = list(&returned);
    assert_eq!(returned.len(), 1);
    assert_eq!(text(&returned[0], "email"), "d");
}

// ---------------------------------------------------------------------------
// Selection shapes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn select_returns_exactly_the_requested_fields() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u", "email": "u", "name": "N" } }))
        .await
        .unwrap();

    let narrow = client
        .model("User")
        .find_unique(json!({
            "where": { "id": "u" },
            "select": { "email": true, "name": true }
        }))
        .await
        .unwrap();
    let keys: Vec<&String> = record(&narrow).keys().collect();
    assert_eq!(keys, vec!["email", "name"]);

    // Selecting a relation pulls the parent ids along.
    let with_posts = client
        .model("User")
        .find_unique(json!({
            "where": { "id": "u" },
            "select": { "email": true, "posts": { "select": { "title": true } } }
        }))
        .await
        .unwrap();
    let keys: Vec<&String> = record(&with_posts).keys().collect();
    assert!(keys.contains(&&"id".to_string()));
    assert!(keys.contains(&&"posts".to_string()));

    let omitted = client
        .model("User")
        .find_unique(json!({
            "where": { "id": "u" },
            "omit": { "name": true }
        }))
        .await
        .unwrap();
    assert!(record(&omitted).get("name").is_none());
    assert!(record(&omitted).get("email").is_some());
}

#[tokio::test]
async fn count_selection_via_include() {
    let client = connect().await;
    client
        .model("User")
        .create(json!({
            "data": {
                "id": "u",
                "email": "u",
                "posts": { "create": [{ "title": "a" }, { "title": "b" }] }
            }
        }))
        .await
        .unwrap();

    let with_count = client
        .model("User")
        .find_unique(json!({
            "where": { "id": "u" },
            "include": { "_count": true }
        }))
        .await
        .unwrap();
    let count = record(&with_count).get("_count").expect("_count");
    assert_eq!(int(count, "posts"), 2);
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aggregate_and_group_by() {
    let client = connect().await;
    for (email, age) in [("a", 10), ("b", 20), ("c", 30)] {
        client
            .model("User")
            .create(json!({ "data": { "email": email, "age": age } }))
            .await
            .unwrap();
    }

    let aggregated = client
        .model("User")
        .aggregate(json!({
            "_count": { "_all": true },
            "_avg": { "age": true },
            "_max": { "age": true }
        }))
        .await
        .unwrap();
    let counts = record(&aggregated).get("_count").expect("_count");
    assert_eq!(int(counts, "_all"), 3);
    let avg = record(&aggregated).get("_avg").expect("_avg");
    assert_eq!(record(avg).get("age"), Some(&Value::Float(20.0)));

    client
        .model("User")
        .create(json!({ "data": { "id": "author", "email": "author" } }))
        .await
        .unwrap();
    client
        .model("Post")
        .create_many(json!({ "data": [
            { "title": "x", "authorId": "author", "published": true },
            { "title": "y", "authorId": "author", "published": true },
            { "title": "z", "authorId": "author", "published": false }
        ] }))
        .await
        .unwrap();

    let grouped = client
        .model("Post")
        .group_by(json!({
            "by": "published",
            "_count": { "_all": true },
            "orderBy": { "published": "asc" }
        }))
        .await
        .unwrap();
    let grouped = list(&grouped);
    assert_eq!(grouped.len(), 2);
    assert_eq!(record(&grouped[0]).get("published"), Some(&Value::Bool(false)));
    let count = record(&grouped[1]).get("_count").expect("_count");
    assert_eq!(int(count, "_all"), 2);
}

#[tokio::test]
async fn distinct_deduplicates_in_memory() {
    let client = connect().await;
    for (id, name) in [("u1", "dup"), ("u2", "dup"), ("u3", "other")] {
        client
            .model("User")
            .create(json!({ "data": { "id": id, "email": id, "name": name } }))
            .await
            .unwrap();
    }

    let distinct = client
        .model("User")
        .find_many(json!({
            "distinct": ["name"],
            "orderBy": { "id": "asc" }
        }))
        .await
        .unwrap();
    assert_eq!(list(&distinct).len(), 2);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transaction_rolls_back_on_error() {
    let client = connect().await;

    let result: Result<()> = client
        .transaction(|tx| async move {
            tx.model("User")
                .create(json!({ "data": { "email": "doomed" } }))
                .await?;
            Err(Error::internal("abort"))
        })
        .await;
    assert!(result.is_err());

    let count = client.model("User").count(json!({})).await.unwrap();
    assert_eq!(count, Value::Int(0));
}

#[tokio::test]
async fn nested_transactions_reuse_the_outer_scope() {
    let client = connect().await;

    client
        .transaction(|tx| async move {
            tx.model("User")
                .create(json!({ "data": { "email": "outer" } }))
                .await?;
            tx.transaction(|inner| async move {
                inner
                    .model("User")
                    .create(json!({ "data": { "email": "inner" } }))
                    .await?;
                Ok(())
            })
            .await
        })
        .await
        .unwrap();

    let count = client.model("User").count(json!({})).await.unwrap();
    assert_eq!(count, Value::Int(2));
}

// ---------------------------------------------------------------------------
// Scalar lists
// ---------------------------------------------------------------------------

async fn connect_docs() -> Client {
    use strata_core::{FieldBuilder, ModelBuilder, SchemaBuilder};

    let schema = SchemaBuilder::new(strata_core::SqlProvider::Sqlite)
        .model(
            ModelBuilder::new("Doc")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("name").unique())
                .field(FieldBuilder::string("labels").array()),
        )
        .build()
        .unwrap();
    let conn = Arc::new(SqliteConnection::open_in_memory().expect("open sqlite"));
    let client = Client::new(schema, conn).expect("client");
    client.push_schema().await.expect("push schema");
    client
}

#[tokio::test]
async fn scalar_lists_store_filter_and_push() {
    let client = connect_docs().await;
    let docs = client.model("Doc");

    docs.create(json!({ "data": { "name": "a", "labels": ["draft", "internal"] } }))
        .await
        .unwrap();
    docs.create(json!({ "data": { "name": "b", "labels": [] } }))
        .await
        .unwrap();

    let tagged = docs
        .find_many(json!({ "where": { "labels": { "has": "draft" } } }))
        .await
        .unwrap();
    assert_eq!(list(&tagged).len(), 1);
    assert_eq!(text(&list(&tagged)[0], "name"), "a");

    let empty = docs
        .find_many(json!({ "where": { "labels": { "isEmpty": true } } }))
        .await
        .unwrap();
    assert_eq!(text(&list(&empty)[0], "name"), "b");

    let pushed = docs
        .update(json!({
            "where": { "name": "a" },
            "data": { "labels": { "push": "published" } }
        }))
        .await
        .unwrap();
    assert_eq!(
        record(&pushed).get("labels"),
        Some(&Value::List(vec![
            Value::Text("draft".into()),
            Value::Text("internal".into()),
            Value::Text("published".into()),
        ]))
    );

    let both = docs
        .find_many(json!({
            "where": { "labels": { "hasEvery": ["draft", "published"] } }
        }))
        .await
        .unwrap();
    assert_eq!(list(&both).len(), 1);
}

// ---------------------------------------------------------------------------
// Delegate models and computed fields
// ---------------------------------------------------------------------------

fn media_schema() -> strata_core::Schema {
    use strata_core::{
        ComputedFieldDef, FieldBuilder, FieldType, ModelBuilder, SchemaBuilder, SqlExpr,
    };

    SchemaBuilder::new(strata_core::SqlProvider::Sqlite)
        .model(
            ModelBuilder::new("Content")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("contentType"))
                .field(FieldBuilder::string("title"))
                .delegate("contentType")
                .computed(ComputedFieldDef {
                    name: "titleLength".to_string(),
                    field_type: FieldType::Builtin(strata_core::BuiltinType::Int),
                    sql: std::sync::Arc::new(|cx| {
                        SqlExpr::func(
                            "length",
                            vec![SqlExpr::col(cx.model_alias, "title")],
                        )
                    }),
                }),
        )
        .model(
            ModelBuilder::new("Video")
                .field(FieldBuilder::int("duration"))
                .extends("Content"),
        )
        .model(
            ModelBuilder::new("Image")
                .field(FieldBuilder::int("width"))
                .extends("Content"),
        )
        .build()
        .unwrap()
}

async fn connect_media() -> Client {
    let conn = Arc::new(SqliteConnection::open_in_memory().expect("open sqlite"));
    let client = Client::new(media_schema(), conn).expect("client");
    client.push_schema().await.expect("push schema");
    client
}

#[tokio::test]
async fn delegate_create_inserts_base_row_with_discriminator() {
    let client = connect_media().await;

    let video = client
        .model("Video")
        .create(json!({ "data": { "id": "v1", "title": "Launch", "duration": 90 } }))
        .await
        .unwrap();
    assert_eq!(text(&video, "title"), "Launch");
    assert_eq!(text(&video, "contentType"), "Video");
    assert_eq!(int(&video, "duration"), 90);

    // The shared base row exists with the descendant's model name.
    let base = client
        .model("Content")
        .find_unique(json!({ "where": { "id": "v1" } }))
        .await
        .unwrap();
    assert_eq!(text(&base, "contentType"), "Video");
    // Descendant fields merge transparently into the base read.
    assert_eq!(int(&base, "duration"), 90);
}

#[tokio::test]
async fn delegate_base_list_merges_each_descendant() {
    let client = connect_media().await;
    client
        .model("Video")
        .create(json!({ "data": { "id": "v1", "title": "V", "duration": 90 } }))
        .await
        .unwrap();
    client
        .model("Image")
        .create(json!({ "data": { "id": "i1", "title": "I", "width": 640 } }))
        .await
        .unwrap();

    let all = client
        .model("Content")
        .find_many(json!({ "orderBy": { "id": "asc" } }))
        .await
        .unwrap();
    let all = list(&all);
    assert_eq!(all.len(), 2);
    assert_eq!(int(&all[0], "width"), 640);
    assert!(record(&all[0]).get("duration").is_none());
    assert_eq!(int(&all[1], "duration"), 90);
}

#[tokio::test]
async fn delegate_inherited_field_update_and_delete_cascade() {
    let client = connect_media().await;
    client
        .model("Video")
        .create(json!({ "data": { "id": "v1", "title": "Old", "duration": 90 } }))
        .await
        .unwrap();

    // Inherited fields route to the base table.
    let updated = client
        .model("Video")
        .update(json!({ "where": { "id": "v1" }, "data": { "title": "New" } }))
        .await
        .unwrap();
    assert_eq!(text(&updated, "title"), "New");

    client
        .model("Video")
        .delete(json!({ "where": { "id": "v1" } }))
        .await
        .unwrap();
    let base_count = client.model("Content").count(json!({})).await.unwrap();
    assert_eq!(base_count, Value::Int(0));
}

#[tokio::test]
async fn computed_fields_project_sql_fragments() {
    let client = connect_media().await;
    client
        .model("Video")
        .create(json!({ "data": { "id": "v1", "title": "Launch", "duration": 90 } }))
        .await
        .unwrap();

    let row = client
        .model("Content")
        .find_first(json!({ "select": { "title": true, "titleLength": true } }))
        .await
        .unwrap();
    assert_eq!(int(&row, "titleLength"), 6);
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

struct CapPlugin;

#[async_trait]
impl Plugin for CapPlugin {
    fn id(&self) -> &str {
        "cap"
    }

    async fn on_query(&self, mut ctx: QueryCtx, next: QueryNext<'_>) -> Result<Value> {
        if ctx.operation == strata_engine::Operation::FindMany {
            ctx.args["take"] = json!(1);
        }
        next.run(ctx).await
    }
}

#[tokio::test]
async fn on_query_plugins_can_rewrite_args() {
    let client = connect().await;
    seed_three_users(&client).await;

    let capped = client.use_plugin(Arc::new(CapPlugin)).unwrap();
    let rows = capped.model("User").find_many(json!({})).await.unwrap();
    assert_eq!(list(&rows).len(), 1);

    // The underlying client is untouched.
    let rows = client.model("User").find_many(json!({})).await.unwrap();
    assert_eq!(list(&rows).len(), 3);
}

#[derive(Default)]
struct HookLog {
    before: Mutex<Vec<String>>,
    after: Mutex<Vec<(String, usize)>>,
}

struct AuditPlugin {
    log: Arc<HookLog>,
}

#[async_trait]
impl Plugin for AuditPlugin {
    fn id(&self) -> &str {
        "audit"
    }

    fn mutation_interception_filter(
        &self,
        _action: MutationAction,
        _model: &str,
        _stmt: &strata_core::Statement,
    ) -> InterceptionDecision {
        InterceptionDecision {
            intercept: true,
            load_before_mutation_entities: true,
            load_after_mutation_entities: true,
        }
    }

    async fn before_entity_mutation(&self, event: &MutationHookEvent) -> Result<()> {
        self.log.before.lock().unwrap().push(event.model.clone());
        Ok(())
    }

    async fn after_entity_mutation(&self, event: &MutationHookEvent) -> Result<()> {
        self.log.after.lock().unwrap().push((
            event.model.clone(),
            event.after_entities.as_ref().map(Vec::len).unwrap_or(0),
        ));
        Ok(())
    }
}

#[tokio::test]
async fn after_mutation_hooks_fire_only_on_commit() {
    let client = connect().await;
    let log = Arc::new(HookLog::default());
    let audited = client
        .use_plugin(Arc::new(AuditPlugin { log: log.clone() }))
        .unwrap();

    audited
        .model("User")
        .create(json!({ "data": { "email": "kept" } }))
        .await
        .unwrap();
    assert_eq!(log.after.lock().unwrap().len(), 1);
    assert_eq!(log.after.lock().unwrap()[0], ("User".to_string(), 1));

    let result: Result<()> = audited
        .transaction(|tx| async move {
            tx.model("User")
                .create(json!({ "data": { "email": "doomed" } }))
                .await?;
            Err(Error::internal("abort"))
        })
        .await;
    assert!(result.is_err());

    // The rolled-back create ran its before hook but never the after hook.
    assert_eq!(log.before.lock().unwrap().len(), 2);
    assert_eq!(log.after.lock().unwrap().len(), 1);
}
