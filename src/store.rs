//! Ontology store: in-memory view plus SQLite mirror.
//!
//! The in-memory [`Ontology`] accumulates across passes (positions are
//! unioned). The relational tables are a write-through projection of the
//! latest upsert (positions are replaced when the caller supplies any).
//! [`OntologyStore`] keeps both in step behind one coarse async lock, so
//! after an upsert returns both views hold the new value.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::db;
use crate::migrate;
use crate::models::{Entity, Relation, RelationKey};

/// In-memory ontology, in first-insertion order.
#[derive(Debug, Clone, Default)]
pub struct Ontology {
    entities: IndexMap<String, Entity>,
    relations: IndexMap<RelationKey, Relation>,
}

impl Ontology {
    /// Insert `entity`, or merge it into the existing one with the same name:
    /// positions are unioned, the type is overwritten, and the description
    /// and source are overwritten when the incoming ones are non-empty.
    pub fn add_element(&mut self, entity: Entity) {
        match self.entities.get_mut(&entity.name) {
            Some(existing) => {
                existing.merge_positions(entity.positions);
                if !entity.entity_type.is_empty() {
                    existing.entity_type = entity.entity_type;
                }
                if !entity.description.is_empty() {
                    existing.description = entity.description;
                }
                if !entity.source.is_empty() {
                    existing.source = entity.source;
                }
                existing.updated_at = entity.updated_at;
            }
            None => {
                self.entities.insert(entity.name.clone(), entity);
            }
        }
    }

    /// Insert `relation` or overwrite the non-key fields of the existing one.
    pub fn add_relation(&mut self, relation: Relation) {
        match self.relations.get_mut(&relation.key()) {
            Some(existing) => {
                existing.description = relation.description;
                existing.weight = relation.weight;
                existing.direction = relation.direction;
                existing.updated_at = relation.updated_at;
            }
            None => {
                self.relations.insert(relation.key(), relation);
            }
        }
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn relation(&self, key: &RelationKey) -> Option<&Relation> {
        self.relations.get(key)
    }

    pub fn contains_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Split relations into those whose endpoints resolve and those that
    /// dangle. An endpoint resolves when it is a known entity or when
    /// `mentioned` accepts the name.
    pub fn partition_relations<F>(&self, mentioned: F) -> (Vec<&Relation>, Vec<&Relation>)
    where
        F: Fn(&str) -> bool,
    {
        let resolves = |name: &str| self.contains_entity(name) || mentioned(name);
        self.relations
            .values()
            .partition(|r| resolves(&r.source) && resolves(&r.target))
    }
}

/// Split a `type:weight` relation label. Labels without a numeric suffix
/// come back unchanged with no weight.
pub fn split_weighted_type(label: &str) -> (String, Option<f64>) {
    if let Some((name, weight)) = label.rsplit_once(':') {
        if let Ok(w) = weight.trim().parse::<f64>() {
            if !name.trim().is_empty() {
                return (name.trim().to_string(), Some(w));
            }
        }
    }
    (label.trim().to_string(), None)
}

fn is_position_list(field: &str) -> bool {
    field
        .split(',')
        .all(|p| !p.trim().is_empty() && p.trim().chars().all(|c| c.is_ascii_digit()))
}

/// In-memory ontology guarded by one lock, mirrored to SQLite.
pub struct OntologyStore {
    ontology: Mutex<Ontology>,
    pool: SqlitePool,
}

impl OntologyStore {
    /// Open (and migrate) the mirror database. `None` keeps it in memory.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to create ontology tables")?;
        Ok(Self {
            ontology: Mutex::new(Ontology::default()),
            pool,
        })
    }

    pub async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        let mut ontology = self.ontology.lock().await;
        self.write_entity(&entity).await?;
        ontology.add_element(entity);
        Ok(())
    }

    /// Insert `entity` only when no entity of that name exists. The check
    /// and the write happen under the same lock. Returns whether it was
    /// inserted.
    pub async fn insert_entity_if_absent(&self, entity: Entity) -> Result<bool> {
        let mut ontology = self.ontology.lock().await;
        if ontology.contains_entity(&entity.name) {
            return Ok(false);
        }
        self.write_entity(&entity).await?;
        ontology.add_element(entity);
        Ok(true)
    }

    /// Mirror of [`Ontology::add_element`]: empty incoming fields keep the
    /// stored value. Callers hold the ontology lock.
    async fn write_entity(&self, entity: &Entity) -> Result<()> {
        let positions_json = serde_json::to_string(&entity.positions)?;
        sqlx::query(
            r#"
            INSERT INTO entities (name, type, description, positions, created_at, updated_at, source)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                type = CASE
                    WHEN excluded.type = '' THEN entities.type
                    ELSE excluded.type
                END,
                description = CASE
                    WHEN excluded.description = '' THEN entities.description
                    ELSE excluded.description
                END,
                positions = CASE
                    WHEN excluded.positions = '[]' THEN entities.positions
                    ELSE excluded.positions
                END,
                updated_at = excluded.updated_at,
                source = CASE
                    WHEN excluded.source = '' THEN entities.source
                    ELSE excluded.source
                END
            "#,
        )
        .bind(&entity.name)
        .bind(&entity.entity_type)
        .bind(&entity.description)
        .bind(&positions_json)
        .bind(entity.created_at.timestamp_millis())
        .bind(entity.updated_at.timestamp_millis())
        .bind(&entity.source)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert entity '{}'", entity.name))?;
        Ok(())
    }

    pub async fn upsert_relation(&self, relation: Relation) -> Result<()> {
        let mut ontology = self.ontology.lock().await;

        sqlx::query(
            r#"
            INSERT INTO relations (source, type, target, description, weight, direction, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, type, target) DO UPDATE SET
                description = excluded.description,
                weight = excluded.weight,
                direction = excluded.direction,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&relation.source)
        .bind(&relation.relation_type)
        .bind(&relation.target)
        .bind(&relation.description)
        .bind(relation.weight)
        .bind(relation.direction.as_str())
        .bind(relation.created_at.timestamp_millis())
        .bind(relation.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to upsert relation '{} {} {}'",
                relation.source, relation.relation_type, relation.target
            )
        })?;

        ontology.add_relation(relation);
        Ok(())
    }

    /// Copy of the in-memory ontology.
    pub async fn snapshot(&self) -> Ontology {
        self.ontology.lock().await.clone()
    }

    pub async fn entity_count(&self) -> usize {
        self.ontology.lock().await.entity_count()
    }

    pub async fn relation_count(&self) -> usize {
        self.ontology.lock().await.relation_count()
    }

    /// Read an entity back from the relational mirror.
    pub async fn db_entity(&self, name: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT name, type, description, positions, created_at, updated_at, source \
             FROM entities WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let positions: Vec<usize> = serde_json::from_str(&row.try_get::<String, _>("positions")?)
            .with_context(|| format!("Corrupt positions column for entity '{}'", name))?;

        Ok(Some(Entity {
            name: row.try_get("name")?,
            entity_type: row.try_get("type")?,
            description: row.try_get("description")?,
            positions,
            source: row.try_get("source")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        }))
    }

    /// Read a relation back from the relational mirror.
    pub async fn db_relation(&self, key: &RelationKey) -> Result<Option<Relation>> {
        let row = sqlx::query(
            "SELECT description, weight, direction, created_at, updated_at \
             FROM relations WHERE source = ? AND type = ? AND target = ?",
        )
        .bind(&key.source)
        .bind(&key.relation_type)
        .bind(&key.target)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let direction: String = row.try_get("direction")?;
        Ok(Some(Relation {
            source: key.source.clone(),
            relation_type: key.relation_type.clone(),
            target: key.target.clone(),
            description: row.try_get("description")?,
            weight: row.try_get("weight")?,
            direction: direction.parse().unwrap_or_default(),
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        }))
    }

    /// Load an ontology TSV in the output format: entity rows
    /// `name\ttype\tdescription[\tpositions]` and relation rows
    /// `source\ttype:weight\ttarget\tdescription`.
    ///
    /// Returns the number of entities and relations loaded.
    pub async fn load_tsv(&self, text: &str, source_tag: &str) -> Result<(usize, usize)> {
        let mut entities = 0;
        let mut relations = 0;

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            if fields.len() < 3 {
                tracing::warn!(line = lineno + 1, "Skipping malformed ontology row");
                continue;
            }

            let (label, weight) = split_weighted_type(fields[1]);
            if weight.is_some() {
                let description = fields.get(3..).map(|rest| rest.join(" ")).unwrap_or_default();
                let relation = Relation::new(fields[0], &label, fields[2], &description)
                    .with_weight(weight.unwrap_or_default());
                self.upsert_relation(relation).await?;
                relations += 1;
                continue;
            }

            let mut positions = Vec::new();
            let mut description = fields[2..].join(" ");
            if let Some(last) = fields.last().filter(|_| fields.len() >= 4) {
                if last.is_empty() || is_position_list(last) {
                    positions = last
                        .split(',')
                        .filter_map(|p| p.trim().parse::<usize>().ok())
                        .collect();
                    description = fields[2..fields.len() - 1].join(" ");
                }
            }

            let entity = Entity::new(fields[0], &label, description.trim())
                .with_positions(positions)
                .with_source(source_tag);
            self.upsert_entity(entity).await?;
            entities += 1;
        }

        tracing::info!(entities, relations, "Loaded existing ontology");
        Ok((entities, relations))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
