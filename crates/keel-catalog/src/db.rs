//! SQLite-backed catalogue store.
//!
//! Single-node reference backend: one connection behind a Mutex, explicit
//! columns for scalar fields, JSON text columns for nested lists (steps,
//! transitions, bindings, embeddings). Timestamps are RFC 3339 strings.
//!
//! Rule persistence uses dedicated `enforcement_expression` and
//! `tool_bindings` columns. Rows written by the legacy shape packed both into
//! an `action_config` JSON blob; those are still readable (the dedicated
//! columns win when present) but never written.

use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use keel_core::{AgentId, TenantId};

use crate::error::{CatalogError, Result};
use crate::store::{AgentConfigStore, Page};
use crate::types::*;

pub struct SqliteAgentConfigStore {
    db: Mutex<Connection>,
}

impl SqliteAgentConfigStore {
    /// Wrap an already-open connection and create tables if missing.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new(conn)
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            default_model TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            config_version INTEGER NOT NULL,
            settings TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            condition_text TEXT NOT NULL,
            action_text TEXT NOT NULL,
            scope TEXT NOT NULL,
            scope_id TEXT,
            priority INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            max_fires_per_session INTEGER NOT NULL,
            cooldown_turns INTEGER NOT NULL,
            is_hard_constraint INTEGER NOT NULL,
            enforcement_expression TEXT,
            tool_bindings TEXT,
            action_config TEXT,
            attached_template_ids TEXT NOT NULL,
            condition_embedding TEXT,
            embedding_model TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_rules_agent_scope
            ON rules (tenant_id, agent_id, scope, scope_id);
        CREATE TABLE IF NOT EXISTS scenarios (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            version INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            entry_step_id TEXT NOT NULL,
            steps TEXT NOT NULL,
            entry_condition_text TEXT,
            entry_embedding TEXT,
            content_hash TEXT,
            enabled INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS scenario_archive (
            scenario_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            tenant_id TEXT NOT NULL,
            body TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            PRIMARY KEY (scenario_id, version)
        );
        CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            text TEXT NOT NULL,
            mode TEXT NOT NULL,
            scope TEXT NOT NULL,
            scope_id TEXT,
            priority INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS variables (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS intents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            label TEXT NOT NULL,
            body TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS glossary (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            term TEXT NOT NULL,
            body TEXT NOT NULL,
            priority INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS tool_activations (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            tool_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS rule_relationships (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            related_rule_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS field_definitions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_field_defs_name
            ON field_definitions (tenant_id, agent_id, name);
        CREATE TABLE IF NOT EXISTS scenario_requirements (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            scenario_id TEXT NOT NULL,
            step_id TEXT,
            collection_order INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS migration_plans (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            scenario_id TEXT NOT NULL,
            status TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_str(s)?)
}

fn parse_ts(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

fn opt_ts(s: Option<String>) -> Option<chrono::DateTime<chrono::Utc>> {
    s.map(|v| parse_ts(&v))
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    // Legacy rows pack enforcement_expression and tool_bindings into an
    // action_config JSON blob; the dedicated columns win when present.
    let enforcement: Option<String> = row.get("enforcement_expression")?;
    let bindings_json: Option<String> = row.get("tool_bindings")?;
    let action_config: Option<String> = row.get("action_config")?;

    let legacy: Option<serde_json::Value> =
        action_config.and_then(|s| serde_json::from_str(&s).ok());
    let enforcement_expression = enforcement.or_else(|| {
        legacy
            .as_ref()
            .and_then(|v| v.get("enforcement_expression"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });
    let tool_bindings: Vec<ToolBinding> = bindings_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .or_else(|| {
            legacy
                .as_ref()
                .and_then(|v| v.get("tool_bindings"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        })
        .unwrap_or_default();

    let scope_str: String = row.get("scope")?;
    let scope = match scope_str.as_str() {
        "SCENARIO" => Scope::Scenario,
        "STEP" => Scope::Step,
        _ => Scope::Global,
    };
    let tenant: String = row.get("tenant_id")?;
    let agent: String = row.get("agent_id")?;
    let id: String = row.get("id")?;
    let scope_id: Option<String> = row.get("scope_id")?;
    let template_ids: String = row.get("attached_template_ids")?;
    let embedding: Option<String> = row.get("condition_embedding")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    let deleted: Option<String> = row.get("deleted_at")?;

    Ok(Rule {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tenant_id: TenantId::from_str(&tenant).unwrap_or_default(),
        agent_id: AgentId::from_str(&agent).unwrap_or_default(),
        name: row.get("name")?,
        description: row.get("description")?,
        condition_text: row.get("condition_text")?,
        action_text: row.get("action_text")?,
        scope,
        scope_id: scope_id.and_then(|s| Uuid::parse_str(&s).ok()),
        priority: row.get("priority")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        max_fires_per_session: row.get::<_, i64>("max_fires_per_session")? as u32,
        cooldown_turns: row.get::<_, i64>("cooldown_turns")? as u32,
        is_hard_constraint: row.get::<_, i64>("is_hard_constraint")? != 0,
        enforcement_expression,
        tool_bindings,
        attached_template_ids: serde_json::from_str(&template_ids).unwrap_or_default(),
        condition_embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
        embedding_model: row.get("embedding_model")?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
        deleted_at: opt_ts(deleted),
    })
}

const RULE_COLUMNS: &str = "id, tenant_id, agent_id, name, description, condition_text, \
     action_text, scope, scope_id, priority, enabled, max_fires_per_session, cooldown_turns, \
     is_hard_constraint, enforcement_expression, tool_bindings, action_config, \
     attached_template_ids, condition_embedding, embedding_model, created_at, updated_at, \
     deleted_at";

#[async_trait]
impl AgentConfigStore for SqliteAgentConfigStore {
    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, name, default_model, system_prompt, enabled,
                    config_version, settings, created_at, updated_at, deleted_at
             FROM agents WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL",
            params![agent_id.to_string(), tenant_id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                let tenant: String = row.get(1)?;
                let settings: String = row.get(7)?;
                let created: String = row.get(8)?;
                let updated: String = row.get(9)?;
                let deleted: Option<String> = row.get(10)?;
                Ok(Agent {
                    id: AgentId::from_str(&id).unwrap_or_default(),
                    tenant_id: TenantId::from_str(&tenant).unwrap_or_default(),
                    name: row.get(2)?,
                    default_model: row.get(3)?,
                    system_prompt: row.get(4)?,
                    enabled: row.get::<_, i64>(5)? != 0,
                    config_version: row.get::<_, i64>(6)? as u32,
                    settings: serde_json::from_str(&settings).unwrap_or_default(),
                    created_at: parse_ts(&created),
                    updated_at: parse_ts(&updated),
                    deleted_at: opt_ts(deleted),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn save_agent(&self, mut agent: Agent) -> Result<AgentId> {
        agent.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO agents
             (id, tenant_id, name, default_model, system_prompt, enabled,
              config_version, settings, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                agent.id.to_string(),
                agent.tenant_id.to_string(),
                agent.name,
                agent.default_model,
                agent.system_prompt,
                agent.enabled as i64,
                agent.config_version as i64,
                to_json(&agent.settings)?,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
                agent.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(agent.id)
    }

    async fn delete_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE agents SET deleted_at = ?1 WHERE id = ?2 AND tenant_id = ?3
             AND deleted_at IS NULL",
            params![
                utc_now().to_rfc3339(),
                agent_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        Ok(n > 0)
    }

    async fn get_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<Option<Rule>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!(
                "SELECT {RULE_COLUMNS} FROM rules
                 WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL"
            ),
            params![rule_id.to_string(), tenant_id.to_string()],
            row_to_rule,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn get_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        scope: Option<Scope>,
        scope_id: Option<Uuid>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>> {
        let db = self.db.lock().unwrap();
        let mut sql = format!(
            "SELECT {RULE_COLUMNS} FROM rules
             WHERE tenant_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL"
        );
        if scope.is_some() {
            sql.push_str(" AND scope = ?3");
        }
        if enabled_only {
            sql.push_str(" AND enabled = 1");
        }
        sql.push_str(" ORDER BY priority DESC");

        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<Rule> = if let Some(s) = scope {
            stmt.query_map(
                params![tenant_id.to_string(), agent_id.to_string(), s.to_string()],
                row_to_rule,
            )?
            .filter_map(|r| r.ok())
            .collect()
        } else {
            stmt.query_map(
                params![tenant_id.to_string(), agent_id.to_string()],
                row_to_rule,
            )?
            .filter_map(|r| r.ok())
            .collect()
        };
        // scope_id filtering happens in Rust: NULL-aware SQL would complicate
        // the statement for no gain at catalogue sizes.
        Ok(rows
            .into_iter()
            .filter(|r| scope_id.map_or(true, |sid| r.scope_id == Some(sid)))
            .collect())
    }

    async fn list_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Rule>> {
        let db = self.db.lock().unwrap();
        let sql = if include_deleted {
            format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE tenant_id = ?1 AND agent_id = ?2
                 ORDER BY created_at LIMIT ?3 OFFSET ?4"
            )
        } else {
            format!(
                "SELECT {RULE_COLUMNS} FROM rules
                 WHERE tenant_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL
                 ORDER BY created_at LIMIT ?3 OFFSET ?4"
            )
        };
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                tenant_id.to_string(),
                agent_id.to_string(),
                page.limit as i64,
                page.offset as i64
            ],
            row_to_rule,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id, name = %rule.name))]
    async fn save_rule(&self, mut rule: Rule) -> Result<Uuid> {
        rule.validate()?;
        rule.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO rules
             (id, tenant_id, agent_id, name, description, condition_text, action_text,
              scope, scope_id, priority, enabled, max_fires_per_session, cooldown_turns,
              is_hard_constraint, enforcement_expression, tool_bindings, action_config,
              attached_template_ids, condition_embedding, embedding_model,
              created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, NULL, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                rule.id.to_string(),
                rule.tenant_id.to_string(),
                rule.agent_id.to_string(),
                rule.name,
                rule.description,
                rule.condition_text,
                rule.action_text,
                rule.scope.to_string(),
                rule.scope_id.map(|s| s.to_string()),
                rule.priority,
                rule.enabled as i64,
                rule.max_fires_per_session as i64,
                rule.cooldown_turns as i64,
                rule.is_hard_constraint as i64,
                rule.enforcement_expression,
                to_json(&rule.tool_bindings)?,
                to_json(&rule.attached_template_ids)?,
                rule.condition_embedding
                    .as_ref()
                    .map(|e| serde_json::to_string(e))
                    .transpose()?,
                rule.embedding_model,
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
                rule.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!("rule saved");
        Ok(rule.id)
    }

    async fn delete_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE rules SET deleted_at = ?1 WHERE id = ?2 AND tenant_id = ?3
             AND deleted_at IS NULL",
            params![
                utc_now().to_rfc3339(),
                rule_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        Ok(n > 0)
    }

    async fn get_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
    ) -> Result<Option<Scenario>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, agent_id, name, description, version, priority,
                    entry_step_id, steps, entry_condition_text, entry_embedding, content_hash,
                    enabled, created_at, updated_at, deleted_at
             FROM scenarios WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL",
            params![scenario_id.to_string(), tenant_id.to_string()],
            row_to_scenario,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn get_scenarios(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<Scenario>> {
        let db = self.db.lock().unwrap();
        let mut sql = "SELECT id, tenant_id, agent_id, name, description, version, priority,
                    entry_step_id, steps, entry_condition_text, entry_embedding,
                    content_hash, enabled, created_at, updated_at, deleted_at
             FROM scenarios WHERE tenant_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL"
            .to_string();
        if enabled_only {
            sql.push_str(" AND enabled = 1");
        }
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), agent_id.to_string()],
            row_to_scenario,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, scenario), fields(scenario_id = %scenario.id, version = scenario.version))]
    async fn save_scenario(&self, mut scenario: Scenario) -> Result<Uuid> {
        scenario.validate()?;
        scenario.updated_at = utc_now();
        let db = self.db.lock().unwrap();

        // Archive the live version before a newer one replaces it.
        let prev: Option<(u32, String)> = db
            .query_row(
                "SELECT version, tenant_id FROM scenarios WHERE id = ?1",
                params![scenario.id.to_string()],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
            )
            .optional()?;
        if let Some((prev_version, _)) = prev {
            if prev_version < scenario.version {
                let previous = db.query_row(
                    "SELECT id, tenant_id, agent_id, name, description, version, priority,
                            entry_step_id, steps, entry_condition_text, entry_embedding,
                            content_hash, enabled, created_at, updated_at, deleted_at
                     FROM scenarios WHERE id = ?1",
                    params![scenario.id.to_string()],
                    row_to_scenario,
                )?;
                let body = to_json(&previous)?;
                db.execute(
                    "INSERT OR REPLACE INTO scenario_archive
                     (scenario_id, version, tenant_id, body, archived_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        scenario.id.to_string(),
                        prev_version as i64,
                        scenario.tenant_id.to_string(),
                        body,
                        utc_now().to_rfc3339(),
                    ],
                )?;
            }
        }

        db.execute(
            "INSERT OR REPLACE INTO scenarios
             (id, tenant_id, agent_id, name, description, version, priority, entry_step_id,
              steps, entry_condition_text, entry_embedding, content_hash, enabled,
              created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                scenario.id.to_string(),
                scenario.tenant_id.to_string(),
                scenario.agent_id.to_string(),
                scenario.name,
                scenario.description,
                scenario.version as i64,
                scenario.priority,
                scenario.entry_step_id.to_string(),
                to_json(&scenario.steps)?,
                scenario.entry_condition_text,
                scenario
                    .entry_embedding
                    .as_ref()
                    .map(|e| serde_json::to_string(e))
                    .transpose()?,
                scenario.content_hash,
                scenario.enabled as i64,
                scenario.created_at.to_rfc3339(),
                scenario.updated_at.to_rfc3339(),
                scenario.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(scenario.id)
    }

    async fn get_archived_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        version: u32,
    ) -> Result<Option<Scenario>> {
        if let Some(live) = self.get_scenario(tenant_id, scenario_id).await? {
            if live.version == version {
                return Ok(Some(live));
            }
        }
        let db = self.db.lock().unwrap();
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM scenario_archive
                 WHERE scenario_id = ?1 AND version = ?2 AND tenant_id = ?3",
                params![
                    scenario_id.to_string(),
                    version as i64,
                    tenant_id.to_string()
                ],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| from_json(&b)).transpose()
    }

    async fn delete_scenario(&self, tenant_id: TenantId, scenario_id: Uuid) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scenarios SET deleted_at = ?1 WHERE id = ?2 AND tenant_id = ?3
             AND deleted_at IS NULL",
            params![
                utc_now().to_rfc3339(),
                scenario_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        Ok(n > 0)
    }

    async fn get_template(
        &self,
        tenant_id: TenantId,
        template_id: Uuid,
    ) -> Result<Option<Template>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, agent_id, name, text, mode, scope, scope_id, priority,
                    created_at, updated_at, deleted_at
             FROM templates WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL",
            params![template_id.to_string(), tenant_id.to_string()],
            row_to_template,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn get_templates(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Template>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, agent_id, name, text, mode, scope, scope_id, priority,
                    created_at, updated_at, deleted_at
             FROM templates WHERE tenant_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL
             ORDER BY priority DESC",
        )?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), agent_id.to_string()],
            row_to_template,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn save_template(&self, mut template: Template) -> Result<Uuid> {
        template.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO templates
             (id, tenant_id, agent_id, name, text, mode, scope, scope_id, priority,
              created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                template.id.to_string(),
                template.tenant_id.to_string(),
                template.agent_id.to_string(),
                template.name,
                template.text,
                serde_json::to_string(&template.mode)?.trim_matches('"'),
                template.scope.to_string(),
                template.scope_id.map(|s| s.to_string()),
                template.priority,
                template.created_at.to_rfc3339(),
                template.updated_at.to_rfc3339(),
                template.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(template.id)
    }

    async fn delete_template(&self, tenant_id: TenantId, template_id: Uuid) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE templates SET deleted_at = ?1 WHERE id = ?2 AND tenant_id = ?3
             AND deleted_at IS NULL",
            params![
                utc_now().to_rfc3339(),
                template_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        Ok(n > 0)
    }

    async fn get_variables(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Variable>> {
        json_entity_list(
            &self.db,
            "variables",
            tenant_id,
            Some(agent_id),
        )
    }

    async fn save_variable(&self, mut variable: Variable) -> Result<Uuid> {
        if !is_snake_case(&variable.name) {
            return Err(CatalogError::Validation(format!(
                "variable name '{}' must be snake_case",
                variable.name
            )));
        }
        variable.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO variables
             (id, tenant_id, agent_id, name, body, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                variable.id.to_string(),
                variable.tenant_id.to_string(),
                variable.agent_id.to_string(),
                variable.name,
                to_json(&variable)?,
                variable.created_at.to_rfc3339(),
                variable.updated_at.to_rfc3339(),
                variable.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(variable.id)
    }

    async fn delete_variable(&self, tenant_id: TenantId, variable_id: Uuid) -> Result<bool> {
        soft_delete(&self.db, "variables", tenant_id, variable_id)
    }

    async fn get_intents(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Intent>> {
        json_entity_list(&self.db, "intents", tenant_id, Some(agent_id))
    }

    async fn save_intent(&self, mut intent: Intent) -> Result<Uuid> {
        intent.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO intents
             (id, tenant_id, agent_id, label, body, enabled, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                intent.id.to_string(),
                intent.tenant_id.to_string(),
                intent.agent_id.to_string(),
                intent.label,
                to_json(&intent)?,
                intent.enabled as i64,
                intent.created_at.to_rfc3339(),
                intent.updated_at.to_rfc3339(),
                intent.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(intent.id)
    }

    async fn delete_intent(&self, tenant_id: TenantId, intent_id: Uuid) -> Result<bool> {
        soft_delete(&self.db, "intents", tenant_id, intent_id)
    }

    async fn get_glossary(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<GlossaryItem>> {
        let mut items: Vec<GlossaryItem> =
            json_entity_list(&self.db, "glossary", tenant_id, Some(agent_id))?;
        items.sort_by_key(|g| std::cmp::Reverse(g.priority));
        Ok(items)
    }

    async fn save_glossary_item(&self, mut item: GlossaryItem) -> Result<Uuid> {
        item.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO glossary
             (id, tenant_id, agent_id, term, body, priority, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id.to_string(),
                item.tenant_id.to_string(),
                item.agent_id.to_string(),
                item.term,
                to_json(&item)?,
                item.priority,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
                item.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(item.id)
    }

    async fn delete_glossary_item(&self, tenant_id: TenantId, item_id: Uuid) -> Result<bool> {
        soft_delete(&self.db, "glossary", tenant_id, item_id)
    }

    async fn get_tool_activations(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<ToolActivation>> {
        json_entity_list(&self.db, "tool_activations", tenant_id, Some(agent_id))
    }

    async fn save_tool_activation(&self, mut activation: ToolActivation) -> Result<Uuid> {
        activation.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO tool_activations
             (id, tenant_id, agent_id, tool_id, body, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                activation.id.to_string(),
                activation.tenant_id.to_string(),
                activation.agent_id.to_string(),
                activation.tool_id,
                to_json(&activation)?,
                activation.created_at.to_rfc3339(),
                activation.updated_at.to_rfc3339(),
                activation.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(activation.id)
    }

    async fn delete_tool_activation(
        &self,
        tenant_id: TenantId,
        activation_id: Uuid,
    ) -> Result<bool> {
        soft_delete(&self.db, "tool_activations", tenant_id, activation_id)
    }

    async fn get_rule_relationships(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
    ) -> Result<Vec<RuleRelationship>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM rule_relationships
             WHERE tenant_id = ?1 AND (rule_id = ?2 OR related_rule_id = ?2)
             AND deleted_at IS NULL",
        )?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), rule_id.to_string()],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    async fn save_rule_relationship(&self, mut rel: RuleRelationship) -> Result<Uuid> {
        rel.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO rule_relationships
             (id, tenant_id, rule_id, related_rule_id, body, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rel.id.to_string(),
                rel.tenant_id.to_string(),
                rel.rule_id.to_string(),
                rel.related_rule_id.to_string(),
                to_json(&rel)?,
                rel.created_at.to_rfc3339(),
                rel.updated_at.to_rfc3339(),
                rel.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(rel.id)
    }

    async fn get_field_definitions(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<CustomerDataField>> {
        let defs: Vec<CustomerDataField> =
            json_entity_list(&self.db, "field_definitions", tenant_id, Some(agent_id))?;
        Ok(defs
            .into_iter()
            .filter(|d| !enabled_only || d.enabled)
            .collect())
    }

    async fn get_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<Option<CustomerDataField>> {
        let db = self.db.lock().unwrap();
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM field_definitions
                 WHERE tenant_id = ?1 AND agent_id = ?2 AND name = ?3 AND deleted_at IS NULL",
                params![tenant_id.to_string(), agent_id.to_string(), field_name],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| from_json(&b)).transpose()
    }

    async fn save_field_definition(&self, mut definition: CustomerDataField) -> Result<Uuid> {
        definition.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO field_definitions
             (id, tenant_id, agent_id, name, body, enabled, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                definition.id.to_string(),
                definition.tenant_id.to_string(),
                definition.agent_id.to_string(),
                definition.name,
                to_json(&definition)?,
                definition.enabled as i64,
                definition.created_at.to_rfc3339(),
                definition.updated_at.to_rfc3339(),
                definition.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(definition.id)
    }

    async fn delete_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE field_definitions SET deleted_at = ?1
             WHERE tenant_id = ?2 AND agent_id = ?3 AND name = ?4 AND deleted_at IS NULL",
            params![
                utc_now().to_rfc3339(),
                tenant_id.to_string(),
                agent_id.to_string(),
                field_name
            ],
        )?;
        Ok(n > 0)
    }

    async fn get_scenario_requirements(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<ScenarioFieldRequirement>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM scenario_requirements
             WHERE tenant_id = ?1 AND scenario_id = ?2 AND deleted_at IS NULL
             ORDER BY collection_order",
        )?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), scenario_id.to_string()],
            |row| row.get::<_, String>(0),
        )?;
        let reqs: Vec<ScenarioFieldRequirement> = rows
            .filter_map(|r| r.ok())
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect();
        Ok(reqs
            .into_iter()
            .filter(|r| step_id.map_or(true, |sid| r.step_id == Some(sid)))
            .collect())
    }

    async fn save_scenario_requirement(
        &self,
        mut requirement: ScenarioFieldRequirement,
    ) -> Result<Uuid> {
        requirement.updated_at = utc_now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO scenario_requirements
             (id, tenant_id, scenario_id, step_id, collection_order, body,
              created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                requirement.id.to_string(),
                requirement.tenant_id.to_string(),
                requirement.scenario_id.to_string(),
                requirement.step_id.map(|s| s.to_string()),
                requirement.collection_order as i64,
                to_json(&requirement)?,
                requirement.created_at.to_rfc3339(),
                requirement.updated_at.to_rfc3339(),
                requirement.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(requirement.id)
    }

    async fn get_migration_plan(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
    ) -> Result<Option<MigrationPlan>> {
        let db = self.db.lock().unwrap();
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM migration_plans WHERE id = ?1 AND tenant_id = ?2",
                params![plan_id.to_string(), tenant_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| from_json(&b)).transpose()
    }

    async fn list_migration_plans(
        &self,
        tenant_id: TenantId,
        scenario_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<MigrationPlan>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM migration_plans WHERE tenant_id = ?1
             ORDER BY created_at LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![
                tenant_id.to_string(),
                page.limit as i64,
                page.offset as i64
            ],
            |row| row.get::<_, String>(0),
        )?;
        let plans: Vec<MigrationPlan> = rows
            .filter_map(|r| r.ok())
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect();
        Ok(plans
            .into_iter()
            .filter(|p| scenario_id.map_or(true, |sid| p.scenario_id == sid))
            .collect())
    }

    async fn save_migration_plan(&self, plan: MigrationPlan) -> Result<Uuid> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO migration_plans
             (id, tenant_id, scenario_id, status, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                plan.id.to_string(),
                plan.tenant_id.to_string(),
                plan.scenario_id.to_string(),
                serde_json::to_string(&plan.status)?.trim_matches('"'),
                to_json(&plan)?,
                plan.created_at.to_rfc3339(),
            ],
        )?;
        Ok(plan.id)
    }
}

fn row_to_scenario(row: &Row<'_>) -> rusqlite::Result<Scenario> {
    let id: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    let agent: String = row.get(2)?;
    let entry: String = row.get(7)?;
    let steps: String = row.get(8)?;
    let embedding: Option<String> = row.get(10)?;
    let created: String = row.get(13)?;
    let updated: String = row.get(14)?;
    let deleted: Option<String> = row.get(15)?;
    Ok(Scenario {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tenant_id: TenantId::from_str(&tenant).unwrap_or_default(),
        agent_id: AgentId::from_str(&agent).unwrap_or_default(),
        name: row.get(3)?,
        description: row.get(4)?,
        version: row.get::<_, i64>(5)? as u32,
        priority: row.get(6)?,
        entry_step_id: Uuid::parse_str(&entry).unwrap_or_default(),
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        entry_condition_text: row.get(9)?,
        entry_embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
        content_hash: row.get(11)?,
        enabled: row.get::<_, i64>(12)? != 0,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
        deleted_at: opt_ts(deleted),
    })
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<Template> {
    let id: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    let agent: String = row.get(2)?;
    let mode: String = row.get(5)?;
    let scope: String = row.get(6)?;
    let scope_id: Option<String> = row.get(7)?;
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;
    let deleted: Option<String> = row.get(11)?;
    Ok(Template {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tenant_id: TenantId::from_str(&tenant).unwrap_or_default(),
        agent_id: AgentId::from_str(&agent).unwrap_or_default(),
        name: row.get(3)?,
        text: row.get(4)?,
        mode: match mode.as_str() {
            "SUGGEST" => TemplateMode::Suggest,
            "STRICT" => TemplateMode::Strict,
            _ => TemplateMode::Fallback,
        },
        scope: match scope.as_str() {
            "SCENARIO" => Scope::Scenario,
            "STEP" => Scope::Step,
            _ => Scope::Global,
        },
        scope_id: scope_id.and_then(|s| Uuid::parse_str(&s).ok()),
        priority: row.get(8)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
        deleted_at: opt_ts(deleted),
    })
}

/// List deserialisable entities stored as JSON bodies.
fn json_entity_list<T: serde::de::DeserializeOwned>(
    db: &Mutex<Connection>,
    table: &str,
    tenant_id: TenantId,
    agent_id: Option<AgentId>,
) -> Result<Vec<T>> {
    let db = db.lock().unwrap();
    let sql = match agent_id {
        Some(_) => format!(
            "SELECT body FROM {table}
             WHERE tenant_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL"
        ),
        None => format!("SELECT body FROM {table} WHERE tenant_id = ?1 AND deleted_at IS NULL"),
    };
    let mut stmt = db.prepare(&sql)?;
    let bodies: Vec<String> = match agent_id {
        Some(aid) => stmt
            .query_map(params![tenant_id.to_string(), aid.to_string()], |row| {
                row.get(0)
            })?
            .filter_map(|r| r.ok())
            .collect(),
        None => stmt
            .query_map(params![tenant_id.to_string()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect(),
    };
    Ok(bodies
        .into_iter()
        .filter_map(|b| serde_json::from_str(&b).ok())
        .collect())
}

fn soft_delete(
    db: &Mutex<Connection>,
    table: &str,
    tenant_id: TenantId,
    id: Uuid,
) -> Result<bool> {
    let db = db.lock().unwrap();
    let n = db.execute(
        &format!(
            "UPDATE {table} SET deleted_at = ?1
             WHERE id = ?2 AND tenant_id = ?3 AND deleted_at IS NULL"
        ),
        params![utc_now().to_rfc3339(), id.to_string(), tenant_id.to_string()],
    )?;
    Ok(n > 0)
}
