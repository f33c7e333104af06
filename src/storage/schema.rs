//! Database schema definitions and bootstrap.

use sqlx::MySqlConnection;

use crate::error::Result;
use crate::schema::SchemaRegistry;

/// The complete DDL for the memory bank database, one statement per entry.
///
/// Statements are idempotent (`IF NOT EXISTS`) so `apply_schema` can run on
/// every startup; indexes live inside the table definitions because MySQL
/// has no `CREATE INDEX IF NOT EXISTS`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // Namespaces
    r"
    CREATE TABLE IF NOT EXISTS namespaces (
        id VARCHAR(255) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        slug VARCHAR(255) NOT NULL,
        owner_id VARCHAR(255) NOT NULL DEFAULT '',
        description TEXT,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE KEY uq_namespaces_name (name),
        UNIQUE KEY uq_namespaces_slug (slug)
    )",
    // Memory blocks
    r"
    CREATE TABLE IF NOT EXISTS memory_blocks (
        id VARCHAR(255) PRIMARY KEY,
        namespace_id VARCHAR(255) NOT NULL DEFAULT 'public',
        `type` VARCHAR(64) NOT NULL,
        schema_version INT NOT NULL,
        `text` LONGTEXT NOT NULL,
        state VARCHAR(16) NOT NULL DEFAULT 'draft',
        visibility VARCHAR(16) NOT NULL DEFAULT 'internal',
        block_version INT NOT NULL DEFAULT 1,
        parent_id VARCHAR(255),
        has_children TINYINT(1) NOT NULL DEFAULT 0,
        tags JSON,
        metadata JSON,
        source_file VARCHAR(1024),
        source_uri VARCHAR(1024),
        confidence JSON,
        created_by VARCHAR(255) NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        embedding JSON,
        KEY idx_blocks_namespace (namespace_id),
        KEY idx_blocks_type (`type`),
        KEY idx_blocks_state (state),
        KEY idx_blocks_parent (parent_id),
        KEY idx_blocks_created_at (created_at),
        CONSTRAINT fk_blocks_namespace
            FOREIGN KEY (namespace_id) REFERENCES namespaces (id),
        CONSTRAINT chk_blocks_state
            CHECK (state IN ('draft', 'published', 'archived')),
        CONSTRAINT chk_blocks_visibility
            CHECK (visibility IN ('internal', 'public', 'restricted')),
        CONSTRAINT chk_blocks_version CHECK (block_version > 0)
    )",
    // Link graph
    r"
    CREATE TABLE IF NOT EXISTS block_links (
        from_id VARCHAR(255) NOT NULL,
        to_id VARCHAR(255) NOT NULL,
        relation VARCHAR(64) NOT NULL,
        priority INT NOT NULL DEFAULT 0,
        link_metadata JSON,
        created_by VARCHAR(255) NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (from_id, to_id, relation),
        KEY idx_links_to (to_id),
        KEY idx_links_relation (relation),
        CONSTRAINT fk_links_from
            FOREIGN KEY (from_id) REFERENCES memory_blocks (id) ON DELETE CASCADE,
        CONSTRAINT fk_links_to
            FOREIGN KEY (to_id) REFERENCES memory_blocks (id) ON DELETE CASCADE
    )",
    // Schema registry
    r"
    CREATE TABLE IF NOT EXISTS node_schemas (
        node_type VARCHAR(64) NOT NULL,
        schema_version INT NOT NULL,
        json_schema JSON NOT NULL,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (node_type, schema_version)
    )",
    // Decomposed metadata properties
    r"
    CREATE TABLE IF NOT EXISTS block_properties (
        block_id VARCHAR(255) NOT NULL,
        property_name VARCHAR(255) NOT NULL,
        value_text LONGTEXT,
        value_number DOUBLE,
        value_json JSON,
        property_type VARCHAR(16) NOT NULL,
        is_computed TINYINT(1) NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (block_id, property_name),
        CONSTRAINT fk_properties_block
            FOREIGN KEY (block_id) REFERENCES memory_blocks (id) ON DELETE CASCADE,
        CONSTRAINT chk_properties_one_value CHECK (
            ((value_text IS NOT NULL) + (value_number IS NOT NULL) + (value_json IS NOT NULL)) = 1
        )
    )",
    // Audit proofs. No FK: a delete proof outlives its block.
    r"
    CREATE TABLE IF NOT EXISTS block_proofs (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        block_id VARCHAR(255) NOT NULL,
        commit_hash VARCHAR(64) NOT NULL,
        operation VARCHAR(16) NOT NULL,
        timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        KEY idx_proofs_block (block_id),
        KEY idx_proofs_commit (commit_hash),
        CONSTRAINT chk_proofs_operation
            CHECK (operation IN ('create', 'update', 'delete'))
    )",
];

/// Apply the schema to the database and bootstrap the default namespace.
///
/// Idempotent; intended to run on every startup against the default branch.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub async fn apply_schema(conn: &mut MySqlConnection, default_namespace: &str) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    // The namespace FK requires the default namespace row to exist before
    // the first block lands.
    sqlx::query(
        "INSERT IGNORE INTO namespaces (id, name, slug, owner_id, description)
         VALUES (?, ?, ?, 'system', 'Default namespace')",
    )
    .bind(default_namespace)
    .bind(default_namespace)
    .bind(default_namespace)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load every persisted schema into the registry.
///
/// # Errors
///
/// Returns an error on query failure or when a persisted schema conflicts
/// with one already registered in memory.
pub async fn load_schemas_into_registry(
    conn: &mut MySqlConnection,
    registry: &SchemaRegistry,
) -> Result<usize> {
    use sqlx::Row as _;

    let rows = sqlx::query(
        "SELECT node_type, schema_version, json_schema FROM node_schemas
         ORDER BY node_type, schema_version",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut loaded = 0;
    for row in rows {
        let node_type: String = row.try_get("node_type")?;
        let version: u32 = row.try_get::<i32, _>("schema_version")?.unsigned_abs();
        let schema: sqlx::types::Json<serde_json::Value> = row.try_get("json_schema")?;
        if registry.register(&node_type, version, schema.0)? {
            loaded += 1;
        }
    }

    Ok(loaded)
}

/// Persist one registered schema. Re-persisting the same row is a no-op.
///
/// # Errors
///
/// Returns an error on statement failure.
pub async fn persist_schema(
    conn: &mut MySqlConnection,
    node_type: &str,
    version: u32,
    schema: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT IGNORE INTO node_schemas (node_type, schema_version, json_schema)
         VALUES (?, ?, ?)",
    )
    .bind(node_type)
    .bind(i32::try_from(version).unwrap_or(i32::MAX))
    .bind(sqlx::types::Json(schema))
    .execute(&mut *conn)
    .await?;

    Ok(())
}
