use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, Transaction, TransactionBehavior, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::append::{AppendError, append_rules, assign_rule_ids};
use super::types::{NewRule, NewRuleSet, Rule, RuleSet, RuleSetValidationError};

const RULE_SET_COLUMNS: &str = "id, name, endpoint, description_json, bodies_json, conditions_json, action_json, created_at, updated_at";
const RULE_COLUMNS: &str = "rule_set_id, id, conditions_json, action_json";

#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid rule set: {0}")]
    Invalid(#[from] RuleSetValidationError),
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error("rule set not found: {0}")]
    NotFound(String),
    #[error("rule set already exists: {0}")]
    Conflict(String),
    #[error("rule set '{from}' cannot be renamed to '{to}'")]
    RenameNotSupported { from: String, to: String },
}

/// Lookup-by-name collaborator used by rule execution.
#[async_trait]
pub trait RuleSetLookup: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<RuleSet, RuleSetError>;
}

#[derive(Clone)]
pub struct RuleSetRepository {
    db: Database,
}

impl RuleSetRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new rule set. Rules included in the payload are numbered from 1.
    pub async fn create(&self, new_rule_set: NewRuleSet) -> Result<RuleSet, RuleSetError> {
        new_rule_set.validate()?;

        let conn = self.db.connection().await?;
        let tx = begin_write(&conn).await?;
        if find_rule_set_id(&tx, &new_rule_set.name).await?.is_some() {
            return Err(RuleSetError::Conflict(new_rule_set.name));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO rule_sets (
                id, name, endpoint, description_json, bodies_json, conditions_json, action_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id.clone(),
                new_rule_set.name.clone(),
                new_rule_set.endpoint.clone(),
                serde_json::to_string(&new_rule_set.description)?,
                serde_json::to_string(&new_rule_set.bodies)?,
                serde_json::to_string(&new_rule_set.conditions)?,
                serde_json::to_string(&new_rule_set.action)?,
                now
            ],
        )
        .await?;

        let rules = assign_rule_ids(0, new_rule_set.rules);
        insert_rules(&tx, &id, &rules).await?;
        tx.commit().await?;

        tracing::info!(rule_set = %new_rule_set.name, rules = rules.len(), "created rule set");
        self.get_by_name(&new_rule_set.name).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<RuleSet, RuleSetError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets WHERE name = ?1"),
                params![name],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| RuleSetError::NotFound(name.to_string()))?;
        let mut rule_set = row_to_rule_set(row)?;
        rule_set.rules = load_rules(&conn, &rule_set.id).await?;
        Ok(rule_set)
    }

    /// All rule sets ordered by name, each with its rules in id order.
    pub async fn list_all(&self) -> Result<Vec<RuleSet>, RuleSetError> {
        let conn = self.db.connection().await?;

        let mut rules_by_set: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules ORDER BY rule_set_id, id"),
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let (rule_set_id, rule) = row_to_rule(row)?;
            rules_by_set.entry(rule_set_id).or_default().push(rule);
        }

        let mut rows = conn
            .query(
                &format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets ORDER BY name"),
                (),
            )
            .await?;
        let mut rule_sets = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut rule_set = row_to_rule_set(row)?;
            rule_set.rules = rules_by_set.remove(&rule_set.id).unwrap_or_default();
            rule_sets.push(rule_set);
        }
        Ok(rule_sets)
    }

    /// Replace everything but the name and id. The rule list is renumbered from 1.
    pub async fn replace(
        &self,
        name: &str,
        replacement: NewRuleSet,
    ) -> Result<RuleSet, RuleSetError> {
        replacement.validate()?;
        if replacement.name != name {
            return Err(RuleSetError::RenameNotSupported {
                from: name.to_string(),
                to: replacement.name,
            });
        }

        let conn = self.db.connection().await?;
        let tx = begin_write(&conn).await?;
        let id = find_rule_set_id(&tx, name)
            .await?
            .ok_or_else(|| RuleSetError::NotFound(name.to_string()))?;

        tx.execute(
            "UPDATE rule_sets
             SET endpoint = ?1,
                 description_json = ?2,
                 bodies_json = ?3,
                 conditions_json = ?4,
                 action_json = ?5,
                 updated_at = ?6
             WHERE id = ?7",
            params![
                replacement.endpoint,
                serde_json::to_string(&replacement.description)?,
                serde_json::to_string(&replacement.bodies)?,
                serde_json::to_string(&replacement.conditions)?,
                serde_json::to_string(&replacement.action)?,
                now_rfc3339(),
                id.clone()
            ],
        )
        .await?;
        tx.execute("DELETE FROM rules WHERE rule_set_id = ?1", params![id.clone()])
            .await?;
        insert_rules(&tx, &id, &assign_rule_ids(0, replacement.rules)).await?;
        tx.commit().await?;

        tracing::info!(rule_set = %name, "replaced rule set");
        self.get_by_name(name).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), RuleSetError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM rule_sets WHERE name = ?1 RETURNING id",
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(_) => {
                tracing::info!(rule_set = %name, "deleted rule set");
                Ok(())
            }
            None => Err(RuleSetError::NotFound(name.to_string())),
        }
    }

    /// Append a batch of rules and return it with the ids it was stored under.
    ///
    /// The count of stored rules and the insert happen inside one write
    /// transaction, so concurrent appends to the same database are serialized.
    pub async fn append_rules(
        &self,
        name: &str,
        new_rules: Vec<NewRule>,
    ) -> Result<Vec<Rule>, RuleSetError> {
        let conn = self.db.connection().await?;
        let tx = begin_write(&conn).await?;
        let id = find_rule_set_id(&tx, name)
            .await?
            .ok_or_else(|| RuleSetError::NotFound(name.to_string()))?;

        let existing = load_rules(&tx, &id).await?;
        let assigned = append_rules(&existing, new_rules)?;
        insert_rules(&tx, &id, &assigned).await?;
        tx.execute(
            "UPDATE rule_sets SET updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            rule_set = %name,
            existing = existing.len(),
            appended = assigned.len(),
            "appended rules"
        );
        Ok(assigned)
    }
}

#[async_trait]
impl RuleSetLookup for RuleSetRepository {
    async fn find_by_name(&self, name: &str) -> Result<RuleSet, RuleSetError> {
        self.get_by_name(name).await
    }
}

async fn begin_write(conn: &Connection) -> Result<Transaction, RuleSetError> {
    Ok(conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .await?)
}

async fn find_rule_set_id(conn: &Connection, name: &str) -> Result<Option<String>, RuleSetError> {
    let mut rows = conn
        .query("SELECT id FROM rule_sets WHERE name = ?1", params![name])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

async fn load_rules(conn: &Connection, rule_set_id: &str) -> Result<Vec<Rule>, RuleSetError> {
    let mut rows = conn
        .query(
            &format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_set_id = ?1 ORDER BY id"),
            params![rule_set_id],
        )
        .await?;

    let mut rules = Vec::new();
    while let Some(row) = rows.next().await? {
        rules.push(row_to_rule(row)?.1);
    }
    Ok(rules)
}

async fn insert_rules(
    conn: &Connection,
    rule_set_id: &str,
    rules: &[Rule],
) -> Result<(), RuleSetError> {
    for rule in rules {
        conn.execute(
            "INSERT INTO rules (rule_set_id, id, conditions_json, action_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                rule_set_id,
                rule.id,
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.action)?
            ],
        )
        .await?;
    }
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_rule_set(row: Row) -> Result<RuleSet, RuleSetError> {
    let description_json: String = row.get(3)?;
    let bodies_json: String = row.get(4)?;
    let conditions_json: String = row.get(5)?;
    let action_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(RuleSet {
        id: row.get(0)?,
        name: row.get(1)?,
        endpoint: row.get(2)?,
        description: serde_json::from_str(&description_json)?,
        bodies: serde_json::from_str(&bodies_json)?,
        conditions: serde_json::from_str(&conditions_json)?,
        action: serde_json::from_str(&action_json)?,
        rules: Vec::new(),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn row_to_rule(row: Row) -> Result<(String, Rule), RuleSetError> {
    let conditions_json: String = row.get(2)?;
    let action_json: String = row.get(3)?;

    Ok((
        row.get(0)?,
        Rule {
            id: row.get(1)?,
            conditions: serde_json::from_str(&conditions_json)?,
            action: serde_json::from_str(&action_json)?,
        },
    ))
}
