//! SQL migration definitions for the kbingest database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: urls, tags, url_tags, knowledge_entries, original_files, scraper_params, FTS5",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- URL lifecycle and content versioning
CREATE TABLE IF NOT EXISTS urls (
    id                  TEXT PRIMARY KEY,
    url                 TEXT NOT NULL,
    normalized_url      TEXT NOT NULL UNIQUE,
    content_hash        TEXT,
    previous_hash       TEXT,
    status              TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'skipped')),
    error_message       TEXT,
    first_seen          TEXT NOT NULL,
    last_checked        TEXT NOT NULL,
    last_content_change TEXT,
    process_count       INTEGER NOT NULL DEFAULT 0,
    content_version     INTEGER NOT NULL DEFAULT 0,
    metadata_json       TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_urls_content_hash ON urls(content_hash);
CREATE INDEX IF NOT EXISTS idx_urls_status ON urls(status);

-- Hierarchical tag taxonomy
CREATE TABLE IF NOT EXISTS tags (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    parent_id   TEXT REFERENCES tags(id) ON DELETE SET NULL,
    description TEXT,
    color       TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tags_parent ON tags(parent_id);

-- URL <-> tag association
CREATE TABLE IF NOT EXISTS url_tags (
    url_id     TEXT NOT NULL REFERENCES urls(id) ON DELETE CASCADE,
    tag_id     TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (url_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_url_tags_tag ON url_tags(tag_id);

-- Indexed content snapshots
CREATE TABLE IF NOT EXISTS knowledge_entries (
    id            TEXT PRIMARY KEY,
    url_id        TEXT NOT NULL REFERENCES urls(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    title         TEXT NOT NULL,
    content_type  TEXT NOT NULL,
    content       TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    tags_json     TEXT NOT NULL DEFAULT '[]',
    size          INTEGER NOT NULL,
    checksum      TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE(url_id, checksum)
);

CREATE INDEX IF NOT EXISTS idx_entries_url ON knowledge_entries(url_id);

-- Stored raw files
CREATE TABLE IF NOT EXISTS original_files (
    id            TEXT PRIMARY KEY,
    url_id        TEXT NOT NULL REFERENCES urls(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    file_path     TEXT NOT NULL UNIQUE,
    filename      TEXT NOT NULL,
    mime_type     TEXT NOT NULL,
    size          INTEGER NOT NULL,
    checksum      TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL
);

-- Persisted scraper overrides, keyed by normalized URL
CREATE TABLE IF NOT EXISTS scraper_params (
    normalized_url TEXT PRIMARY KEY,
    scraper_type   TEXT NOT NULL,
    params_json    TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

-- Full-text search on knowledge entries
CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(
    title,
    content,
    content=knowledge_entries,
    content_rowid=rowid
);

-- Triggers to keep FTS in sync with knowledge_entries
CREATE TRIGGER IF NOT EXISTS knowledge_fts_insert AFTER INSERT ON knowledge_entries BEGIN
    INSERT INTO knowledge_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_fts_delete AFTER DELETE ON knowledge_entries BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_fts_update AFTER UPDATE ON knowledge_entries BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO knowledge_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
