use serde_json::json;
use std::sync::Arc;
use strata_core::{
    BinaryOp, Error, Expr, FieldBuilder, ModelBuilder, PolicyReason, Schema, SchemaBuilder,
    SqlProvider, Value,
};
use strata_driver_sqlite::SqliteConnection;
use strata_engine::Client;
use strata_policy::{PolicyClientExt, PolicyFeatures};

/// User rows are only visible to and writable by themselves.
fn owner_schema() -> Schema {
    SchemaBuilder::new(SqlProvider::Sqlite)
        .model(
            ModelBuilder::new("User")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("email").unique())
                .field(FieldBuilder::int("age").optional())
                .allow("all", Expr::binary(BinaryOp::Eq, Expr::Auth, Expr::This)),
        )
        .model(
            // No rules at all: everything defaults to deny.
            ModelBuilder::new("Secret")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("payload")),
        )
        .build()
        .unwrap()
}

/// Updates allowed for the old, but the row must stay consistent with its
/// profile afterwards.
fn cross_row_schema() -> Schema {
    SchemaBuilder::new(SqlProvider::Sqlite)
        .model(
            ModelBuilder::new("Profile")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::int("age"))
                .field(FieldBuilder::relation_one("user", "User", "profile")),
        )
        .model(
            ModelBuilder::new("User")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::int("age"))
                .field(FieldBuilder::string("profileId").unique())
                .field(FieldBuilder::relation_owner(
                    "profile",
                    "Profile",
                    "user",
                    &["profileId"],
                    &["id"],
                ))
                .allow(
                    "update",
                    Expr::binary(BinaryOp::Gt, Expr::field("age"), Expr::int(100)),
                )
                .allow(
                    "all",
                    Expr::binary(
                        BinaryOp::Eq,
                        Expr::field("age"),
                        Expr::Member(Box::new(Expr::field("profile")), vec!["age".into()]),
                    ),
                ),
        )
        .build()
        .unwrap()
}

async fn connect(schema: Schema) -> Client {
    let conn = Arc::new(SqliteConnection::open_in_memory().expect("open sqlite"));
    let client = Client::new(schema, conn).expect("client");
    client.push_schema().await.expect("push schema");
    client
}

fn with_auth(client: &Client, auth: serde_json::Value) -> Client {
    client
        .with_features(PolicyFeatures {
            auth: Some(auth),
            external_rules: Vec::new(),
        })
        .expect("policy client")
}

fn text(value: &Value, field: &str) -> String {
    value
        .as_record()
        .and_then(|r| r.get(field))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field '{}'", field))
        .to_string()
}

// ---------------------------------------------------------------------------
// Row visibility (auth() == this)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rows_are_visible_only_to_their_owner() {
    let base = connect(owner_schema()).await;
    for id in ["1", "2"] {
        base.model("User")
            .create(json!({ "data": { "id": id, "email": id } }))
            .await
            .unwrap();
    }

    let as_one = with_auth(&base, json!({ "id": "1" }));
    let own = as_one
        .model("User")
        .find_unique(json!({ "where": { "id": "1" } }))
        .await
        .unwrap();
    assert_eq!(text(&own, "id"), "1");

    // Someone else's row filters out silently, without an error.
    let as_two = with_auth(&base, json!({ "id": "2" }));
    let foreign = as_two
        .model("User")
        .find_unique(json!({ "where": { "id": "1" } }))
        .await
        .unwrap();
    assert_eq!(foreign, Value::Null);

    let visible = as_one.model("User").find_many(json!({})).await.unwrap();
    assert_eq!(visible.as_list().unwrap().len(), 1);
}

#[tokio::test]
async fn models_without_rules_default_to_deny() {
    let base = connect(owner_schema()).await;
    base.model("Secret")
        .create(json!({ "data": { "payload": "classified" } }))
        .await
        .unwrap();

    let guarded = with_auth(&base, json!({ "id": "1" }));
    let visible = guarded.model("Secret").find_many(json!({})).await.unwrap();
    assert!(visible.as_list().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Mutation admission and read-back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_admission_rejects_foreign_rows() {
    let base = connect(owner_schema()).await;
    let as_one = with_auth(&base, json!({ "id": "1" }));

    // Creating one's own row passes the admission check.
    as_one
        .model("User")
        .create(json!({ "data": { "id": "1", "email": "one" } }))
        .await
        .unwrap();

    let err = as_one
        .model("User")
        .create(json!({ "data": { "id": "2", "email": "two" } }))
        .await
        .unwrap_err();
    match err {
        Error::RejectedByPolicy { reason, .. } => {
            assert_eq!(reason, PolicyReason::Other)
        }
        other => panic!("expected policy rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn update_of_foreign_row_reports_not_found() {
    let base = connect(owner_schema()).await;
    base.model("User")
        .create(json!({ "data": { "id": "1", "email": "one" } }))
        .await
        .unwrap();

    let as_two = with_auth(&base, json!({ "id": "2" }));
    let err = as_two
        .model("User")
        .update(json!({ "where": { "id": "1" }, "data": { "email": "hijacked" } }))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {:?}", err);

    let untouched = base
        .model("User")
        .find_unique(json!({ "where": { "id": "1" } }))
        .await
        .unwrap();
    assert_eq!(text(&untouched, "email"), "one");
}

#[tokio::test]
async fn mutation_whose_result_leaves_scope_fails_read_back() {
    let base = connect(owner_schema()).await;
    base.model("User")
        .create(json!({ "data": { "id": "1", "email": "one" } }))
        .await
        .unwrap();

    // The update itself is authorized, but the row's new identity escapes
    // the caller's read scope.
    let as_one = with_auth(&base, json!({ "id": "1" }));
    let err = as_one
        .model("User")
        .update(json!({ "where": { "id": "1" }, "data": { "id": "9" } }))
        .await
        .unwrap_err();
    match err {
        Error::RejectedByPolicy { reason, .. } => {
            assert_eq!(reason, PolicyReason::CannotReadBack)
        }
        other => panic!("expected read-back rejection, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Post-update verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cross_row_update_rule_is_verified_after_the_write() {
    let base = connect(cross_row_schema()).await;
    base.model("Profile")
        .create(json!({ "data": { "id": "p", "age": 18 } }))
        .await
        .unwrap();
    base.model("User")
        .create(json!({ "data": { "id": "u", "age": 18, "profileId": "p" } }))
        .await
        .unwrap();

    let guarded = with_auth(&base, json!({ "id": "u" }));

    // 18 -> 20 diverges from the linked profile; the post-update check
    // rejects it and the transaction rolls back.
    let err = guarded
        .model("User")
        .update(json!({ "where": { "id": "u" }, "data": { "age": 20 } }))
        .await
        .unwrap_err();
    match err {
        Error::RejectedByPolicy { reason, .. } => {
            assert_eq!(reason, PolicyReason::NoAccess)
        }
        other => panic!("expected post-update rejection, got {:?}", other),
    }

    let untouched = base
        .model("User")
        .find_unique(json!({ "where": { "id": "u" } }))
        .await
        .unwrap();
    assert_eq!(
        untouched.as_record().unwrap().get("age"),
        Some(&Value::Int(18))
    );

    // Staying consistent with the profile passes.
    guarded
        .model("User")
        .update(json!({ "where": { "id": "u" }, "data": { "age": 18 } }))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_of_foreign_row_reports_not_found() {
    let base = connect(owner_schema()).await;
    base.model("User")
        .create(json!({ "data": { "id": "1", "email": "one" } }))
        .await
        .unwrap();

    let as_two = with_auth(&base, json!({ "id": "2" }));
    let err = as_two
        .model("User")
        .delete(json!({ "where": { "id": "1" } }))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {:?}", err);

    assert_eq!(
        base.model("User").count(json!({})).await.unwrap(),
        Value::Int(1)
    );
}
