use strata_core::{Connection, QueryRequest, Value};
use strata_driver_sqlite::SqliteConnection;

fn connect_file() -> SqliteConnection {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let db_path = temp_dir.path().join("test.sqlite");

    let connection = SqliteConnection::open(&db_path).expect("open");

    // Leak the tempdir so it doesn't get cleaned up while the connection is
    // alive. The OS will clean it up when the process exits.
    std::mem::forget(temp_dir);

    connection
}

// ---------------------------------------------------------------------------
// Basic connectivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_connect_ping_query() {
    let connection = connect_file();
    connection.ping().await.expect("ping");

    connection
        .execute(&QueryRequest::new(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        ))
        .await
        .unwrap();
    connection
        .execute(
            &QueryRequest::new("INSERT INTO users (name) VALUES (?)")
                .with_params(vec![Value::Text("alice".into())]),
        )
        .await
        .unwrap();

    let result = connection
        .execute(&QueryRequest::new("SELECT id, name FROM users"))
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.columns[1].name, "name");
    assert_eq!(result.rows[0][1], Value::Text("alice".into()));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn returning_rows_are_collected() {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection
        .execute(&QueryRequest::new(
            "CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER)",
        ))
        .await
        .unwrap();

    let result = connection
        .execute(
            &QueryRequest::new("INSERT INTO t (id, n) VALUES (?, ?) RETURNING id")
                .with_params(vec![Value::Text("a".into()), Value::Int(7)]),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0], Value::Text("a".into()));
}

#[tokio::test]
async fn typed_bindings_round_trip() {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection
        .execute(&QueryRequest::new(
            "CREATE TABLE vals (b INTEGER, f REAL, blob BLOB, dt TEXT)",
        ))
        .await
        .unwrap();

    let dt = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    connection
        .execute(
            &QueryRequest::new("INSERT INTO vals (b, f, blob, dt) VALUES (?, ?, ?, ?)")
                .with_params(vec![
                    Value::Bool(true),
                    Value::Float(1.5),
                    Value::Bytes(vec![1, 2, 3]),
                    Value::DateTime(dt),
                ]),
        )
        .await
        .unwrap();

    let result = connection
        .execute(&QueryRequest::new("SELECT b, f, blob, dt FROM vals"))
        .await
        .unwrap();
    let row = &result.rows[0];
    assert_eq!(row[0], Value::Int(1));
    assert_eq!(row[1], Value::Float(1.5));
    assert_eq!(row[2], Value::Bytes(vec![1, 2, 3]));
    assert_eq!(row[3], Value::Text("2024-05-01T10:30:00.000Z".into()));
}

#[tokio::test]
async fn transactions_roll_back() {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection
        .execute(&QueryRequest::new("CREATE TABLE t (id INTEGER PRIMARY KEY)"))
        .await
        .unwrap();

    connection.begin().await.unwrap();
    connection
        .execute(&QueryRequest::new("INSERT INTO t DEFAULT VALUES"))
        .await
        .unwrap();
    connection.rollback().await.unwrap();

    let result = connection
        .execute(&QueryRequest::new("SELECT count(*) FROM t"))
        .await
        .unwrap();
    assert_eq!(result.scalar(), Some(&Value::Int(0)));
}

#[tokio::test]
async fn foreign_keys_are_enforced() {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection
        .execute(&QueryRequest::new("CREATE TABLE parent (id TEXT PRIMARY KEY)"))
        .await
        .unwrap();
    connection
        .execute(&QueryRequest::new(
            "CREATE TABLE child (id TEXT PRIMARY KEY, pid TEXT NOT NULL REFERENCES parent (id))",
        ))
        .await
        .unwrap();

    let err = connection
        .execute(
            &QueryRequest::new("INSERT INTO child (id, pid) VALUES (?, ?)").with_params(vec![
                Value::Text("c".into()),
                Value::Text("missing".into()),
            ]),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY"), "{}", err);
}
