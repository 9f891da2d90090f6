//! SQLite schema and migrations.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for concurrent readers alongside the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS requests (
            id TEXT PRIMARY KEY,
            drug_name TEXT NOT NULL,
            delivery_method TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            callback_url TEXT,
            correlation_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS process_tracking (
            request_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            progress_percent INTEGER NOT NULL DEFAULT 0,
            categories_total INTEGER NOT NULL,
            categories_completed INTEGER NOT NULL DEFAULT 0,
            drug_count INTEGER NOT NULL DEFAULT 1,
            estimated_completion_at TEXT,
            current_stage_start TEXT,
            submitted_at TEXT,
            collecting_started_at TEXT,
            collecting_completed_at TEXT,
            verifying_started_at TEXT,
            verifying_completed_at TEXT,
            merging_started_at TEXT,
            merging_completed_at TEXT,
            summarizing_started_at TEXT,
            summarizing_completed_at TEXT,
            completed_at TEXT,
            error_details TEXT,
            updated_at TEXT NOT NULL,
            archived_at TEXT,
            FOREIGN KEY (request_id) REFERENCES requests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS category_results (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            category_name TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            confidence_score REAL NOT NULL DEFAULT 0,
            data_quality_score REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            api_calls_made INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            cost_estimate REAL NOT NULL DEFAULT 0,
            archived_at TEXT,
            UNIQUE (request_id, category_id),
            FOREIGN KEY (request_id) REFERENCES requests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS provider_responses (
            id TEXT PRIMARY KEY,
            category_result_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            temperature REAL,
            query_parameters TEXT NOT NULL DEFAULT '{}',
            raw_text TEXT NOT NULL,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            checksum TEXT NOT NULL,
            created_at TEXT NOT NULL,
            retention_expires_at TEXT NOT NULL,
            archived_at TEXT,
            FOREIGN KEY (category_result_id) REFERENCES category_results(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merged_data (
            id TEXT PRIMARY KEY,
            category_result_id TEXT NOT NULL UNIQUE,
            merged_text TEXT NOT NULL,
            structured_data TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL DEFAULT 0,
            data_quality_score REAL NOT NULL DEFAULT 0,
            source_references TEXT NOT NULL DEFAULT '[]',
            merge_method TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (category_result_id) REFERENCES category_results(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_conflicts (
            id TEXT PRIMARY KEY,
            category_result_id TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            description TEXT NOT NULL,
            conflicting_source_ids TEXT NOT NULL DEFAULT '[]',
            resolution_strategy TEXT NOT NULL,
            resolved_at TEXT,
            confidence_impact REAL NOT NULL DEFAULT 0,
            is_critical INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT,
            FOREIGN KEY (category_result_id) REFERENCES category_results(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_stage_events (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            stage_name TEXT NOT NULL,
            stage_order INTEGER NOT NULL,
            executed INTEGER NOT NULL,
            skipped INTEGER NOT NULL DEFAULT 0,
            input_digest TEXT,
            output_digest TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (request_id, category_id, stage_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS summary_history (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            category_name TEXT NOT NULL,
            style_name TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            generated_summary TEXT NOT NULL DEFAULT '',
            generation_time_ms INTEGER NOT NULL DEFAULT 0,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_estimate REAL NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS phase2_parameter_results (
            request_id TEXT NOT NULL,
            parameter TEXT NOT NULL,
            extracted_value REAL,
            unit TEXT NOT NULL DEFAULT '',
            score INTEGER,
            weighted_score REAL NOT NULL DEFAULT 0,
            rationale TEXT NOT NULL DEFAULT '',
            extraction_method TEXT NOT NULL DEFAULT 'none',
            created_at TEXT NOT NULL,
            PRIMARY KEY (request_id, parameter),
            FOREIGN KEY (request_id) REFERENCES requests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_final_outputs (
            request_id TEXT PRIMARY KEY,
            drug_name TEXT NOT NULL,
            delivery_method TEXT NOT NULL,
            output TEXT NOT NULL,
            td_score REAL NOT NULL,
            tm_score REAL NOT NULL,
            td_verdict TEXT NOT NULL,
            tm_verdict TEXT NOT NULL,
            go_decision TEXT NOT NULL,
            investment_priority TEXT NOT NULL,
            risk_level TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            generated_at TEXT NOT NULL,
            FOREIGN KEY (request_id) REFERENCES requests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            request_id TEXT,
            old_values TEXT,
            new_values TEXT,
            actor TEXT NOT NULL DEFAULT 'engine',
            correlation_id TEXT,
            timestamp TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            archived_at TEXT
        )",
        [],
    )?;

    // The audit log is append-only from the application's perspective;
    // archival stamps are the single allowed column change.
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_events_no_update
         BEFORE UPDATE ON audit_events
         WHEN OLD.id != NEW.id OR OLD.event_type != NEW.event_type
              OR OLD.entity_type != NEW.entity_type OR OLD.entity_id != NEW.entity_id
              OR OLD.timestamp != NEW.timestamp
              OR COALESCE(OLD.old_values, '') != COALESCE(NEW.old_values, '')
              OR COALESCE(OLD.new_values, '') != COALESCE(NEW.new_values, '')
         BEGIN
            SELECT RAISE(ABORT, 'audit events are immutable');
         END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
         BEFORE DELETE ON audit_events
         BEGIN
            SELECT RAISE(ABORT, 'audit events cannot be deleted');
         END",
        [],
    )?;

    // Reference tables.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pharmaceutical_categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            key TEXT NOT NULL UNIQUE,
            phase INTEGER NOT NULL,
            display_order INTEGER NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            prompt_template TEXT NOT NULL,
            verification_rules TEXT NOT NULL DEFAULT '[]',
            conflict_strategy TEXT NOT NULL DEFAULT 'authority_weighted',
            expected_keys TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS category_dependencies (
            dependent_id INTEGER NOT NULL,
            required_id INTEGER NOT NULL,
            PRIMARY KEY (dependent_id, required_id),
            FOREIGN KEY (dependent_id) REFERENCES pharmaceutical_categories(id),
            FOREIGN KEY (required_id) REFERENCES pharmaceutical_categories(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scoring_parameters (
            name TEXT PRIMARY KEY,
            unit TEXT NOT NULL,
            weight REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scoring_ranges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parameter TEXT NOT NULL,
            delivery_method TEXT NOT NULL,
            min_value REAL,
            max_value REAL,
            score INTEGER NOT NULL,
            is_exclusion INTEGER NOT NULL DEFAULT 0,
            range_text TEXT NOT NULL,
            FOREIGN KEY (parameter) REFERENCES scoring_parameters(name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_stages (
            name TEXT PRIMARY KEY,
            stage_order INTEGER NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS summary_styles (
            style_name TEXT PRIMARY KEY,
            system_prompt TEXT NOT NULL,
            user_template TEXT NOT NULL,
            length_type TEXT NOT NULL,
            target_words INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rate_limit_counters (
            bucket TEXT PRIMARY KEY,
            window_start INTEGER NOT NULL,
            used INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Indexes for common queries.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_category_results_request
         ON category_results(request_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_provider_responses_result
         ON provider_responses(category_result_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_events(request_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stage_events_request
         ON pipeline_stage_events(request_id)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='requests'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
