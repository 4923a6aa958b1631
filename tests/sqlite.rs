//! End-to-end tests against a real SQLite database file.

#![cfg(feature = "sqlite")]

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

use musette::backend::SqliteBackend;
use musette::{Dialect, FixtureError, Loader};

const POSTS_YAML: &str = "\
- id: 1
  title: First post
  metadata:
    tags:
      - sql
      - fixtures
  created_at: RAW=CURRENT_TIMESTAMP
- id: 2
  title: Second post
";

const COMMENTS_YAML: &str = "\
- id: 1
  post_id: 1
  body: Nice one
- id: 2
  post_id: 2
  body: Thanks
";

async fn open_pool(dir: &TempDir, file_name: &str) -> SqlitePool {
	let options = SqliteConnectOptions::new()
		.filename(dir.path().join(file_name))
		.create_if_missing(true)
		.foreign_keys(true);
	// A single connection keeps the loader and the assertions on the same
	// database handle.
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await
		.unwrap()
}

async fn create_schema(pool: &SqlitePool) {
	let statements = [
		"CREATE TABLE posts (
			id INTEGER PRIMARY KEY,
			title TEXT NOT NULL,
			metadata TEXT,
			created_at TEXT
		)",
		"CREATE TABLE comments (
			id INTEGER PRIMARY KEY,
			post_id INTEGER NOT NULL REFERENCES posts(id),
			body TEXT
		)",
	];
	for sql in statements {
		sqlx::query(sql).execute(pool).await.unwrap();
	}
}

async fn build_loader(pool: &SqlitePool) -> Loader {
	Loader::builder()
		.with_database(SqliteBackend::new(pool.clone()))
		.with_dialect(Dialect::Sqlite)
		.with_fixture("posts.yml", POSTS_YAML)
		.with_fixture("comments.yml", COMMENTS_YAML)
		.build()
		.await
		.unwrap()
}

#[tokio::test]
async fn test_load_populates_the_tables() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = build_loader(&pool).await;

	loader.load().await.unwrap();

	let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
		.fetch_one(&pool)
		.await
		.unwrap();
	let comments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(posts, 2);
	assert_eq!(comments, 2);

	let title: String = sqlx::query_scalar("SELECT title FROM posts WHERE id = 1")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(title, "First post");
}

#[tokio::test]
async fn test_reload_reverts_changes_made_by_a_test() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = build_loader(&pool).await;

	loader.load().await.unwrap();
	sqlx::query("UPDATE posts SET title = 'changed' WHERE id = 1")
		.execute(&pool)
		.await
		.unwrap();
	sqlx::query("INSERT INTO posts (id, title) VALUES (99, 'stray')")
		.execute(&pool)
		.await
		.unwrap();
	loader.load().await.unwrap();

	let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(posts, 2);
	let title: String = sqlx::query_scalar("SELECT title FROM posts WHERE id = 1")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(title, "First post");
}

#[tokio::test]
async fn test_fixture_order_does_not_matter_under_foreign_keys() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	// Child rows are listed before the posts they reference; the deferred
	// foreign key pragma keeps both the inserts and the cleanup deletes of
	// the second load from tripping over the constraint.
	let mut loader = Loader::builder()
		.with_database(SqliteBackend::new(pool.clone()))
		.with_dialect(Dialect::Sqlite)
		.with_fixture("comments.yml", COMMENTS_YAML)
		.with_fixture("posts.yml", POSTS_YAML)
		.build()
		.await
		.unwrap();

	loader.load().await.unwrap();
	loader.load().await.unwrap();

	let comments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(comments, 2);
}

#[tokio::test]
async fn test_raw_values_are_evaluated_by_the_database() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = build_loader(&pool).await;

	loader.load().await.unwrap();

	let created_at: Option<String> =
		sqlx::query_scalar("SELECT created_at FROM posts WHERE id = 1")
			.fetch_one(&pool)
			.await
			.unwrap();
	let created_at = created_at.unwrap();
	// CURRENT_TIMESTAMP renders as "YYYY-MM-DD HH:MM:SS".
	assert!(created_at.starts_with("20"), "got {created_at}");
}

#[tokio::test]
async fn test_nested_values_are_stored_as_json() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = build_loader(&pool).await;

	loader.load().await.unwrap();

	let metadata: String = sqlx::query_scalar("SELECT metadata FROM posts WHERE id = 1")
		.fetch_one(&pool)
		.await
		.unwrap();
	let parsed: serde_json::Value = serde_json::from_str(&metadata).unwrap();
	assert_eq!(parsed["tags"][0], "sql");
	assert_eq!(parsed["tags"][1], "fixtures");
}

#[tokio::test]
async fn test_multi_table_fixture_source() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "musette_test.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = Loader::builder()
		.with_database(SqliteBackend::new(pool.clone()))
		.with_dialect(Dialect::Sqlite)
		.with_multi_table_fixture(
			"all.yml",
			"\
posts:
  - id: 1
    title: Multi
comments:
  - id: 1
    post_id: 1
",
		)
		.build()
		.await
		.unwrap();

	loader.load().await.unwrap();

	let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
		.fetch_one(&pool)
		.await
		.unwrap();
	let comments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(posts, 1);
	assert_eq!(comments, 1);
}

#[tokio::test]
async fn test_refuses_to_load_into_a_non_test_database() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "prod.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = build_loader(&pool).await;

	let err = loader.load().await.unwrap_err();
	assert!(matches!(err, FixtureError::NotATestDatabase { name } if name == "prod.sqlite3"));

	let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(posts, 0);
}

#[tokio::test]
async fn test_skipping_the_check_allows_any_database_name() {
	let dir = tempfile::tempdir().unwrap();
	let pool = open_pool(&dir, "prod.sqlite3").await;
	create_schema(&pool).await;
	let mut loader = Loader::builder()
		.with_database(SqliteBackend::new(pool.clone()))
		.with_dialect(Dialect::Sqlite)
		.with_fixture("posts.yml", POSTS_YAML)
		.with_fixture("comments.yml", COMMENTS_YAML)
		.dangerously_skip_test_database_check()
		.build()
		.await
		.unwrap();

	loader.load().await.unwrap();

	let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
		.fetch_one(&pool)
		.await
		.unwrap();
	assert_eq!(posts, 2);
}
