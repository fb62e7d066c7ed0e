//! Production `GraphRepo` backed by `sqlx::PgPool`, targeting the literal
//! relational schema of `spec.md` §4.7 (`nodes`, `node_labels`,
//! `node_attributes`, `relations`, `relation_labels`, `relation_attributes`)
//! directly with parameterized SQL. This is a deliberate divergence from an
//! Apache AGE-backed `cypher()` approach that would route every write
//! through a single opaque function call — see `DESIGN.md`. The
//! transactional-repo-trait pattern itself (and the sanitize-then-
//! parameterize discipline) is kept.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::PropolisError;
use crate::model::{
    generate_id, AttrMap, AttrType, AttrValue, Command, Direction, EntityPattern, ExecResult, MaterializedEntity,
    NodePattern, NodeRow, RelationPattern, RelationRow, SearchResults,
};

use super::GraphRepo;

pub struct PgGraphRepo {
    pool: PgPool,
    exec_timeout_ms: i64,
}

impl PgGraphRepo {
    pub fn new(pool: PgPool, exec_timeout_ms: u64) -> Self {
        Self { pool, exec_timeout_ms: exec_timeout_ms as i64 }
    }
}

fn map_sqlx(e: sqlx::Error) -> PropolisError {
    PropolisError::Transient(e.to_string())
}

#[async_trait::async_trait]
impl GraphRepo for PgGraphRepo {
    async fn execute(&self, command: Command) -> Result<ExecResult, PropolisError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", self.exec_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let result = run_command(&mut tx, command).await;
        match result {
            Ok(r) => {
                tx.commit().await.map_err(map_sqlx)?;
                Ok(r)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn run_command(tx: &mut Transaction<'_, Postgres>, command: Command) -> Result<ExecResult, PropolisError> {
    let now = Utc::now();
    match command {
        Command::Merge(EntityPattern::Node(pat)) => Ok(ExecResult::Node(merge_node(tx, &pat, now).await?)),
        Command::Merge(EntityPattern::Relation { left, relation, right }) => {
            let (_l, rel, _r) = merge_relation(tx, &left, &relation, &right, now).await?;
            Ok(ExecResult::Relation(rel))
        }
        Command::Match { entity, since } => {
            let results = match entity {
                EntityPattern::Node(pat) => match_node(tx, &pat, since).await?,
                EntityPattern::Relation { left, relation, right } => {
                    match_relation(tx, &left, &relation, &right, since).await?
                }
            };
            Ok(ExecResult::Results(results))
        }
        Command::Delete(_) | Command::Subscribe(_) => {
            Err(PropolisError::SyntaxError { offset: 0, lexeme: "reserved command".to_string() })
        }
    }
}

fn dedup_preserve_order(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.iter().filter(|i| seen.insert((*i).clone())).cloned().collect()
}

async fn replace_labels(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    fk_col: &str,
    id: &str,
    labels: &[String],
) -> Result<(), PropolisError> {
    sqlx::query(&format!("DELETE FROM {table} WHERE {fk_col} = $1"))
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    for label in labels {
        sqlx::query(&format!("INSERT INTO {table} ({fk_col}, label) VALUES ($1, $2)"))
            .bind(id)
            .bind(label)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
    }
    Ok(())
}

async fn replace_attrs(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    fk_col: &str,
    id: &str,
    attrs: &AttrMap,
) -> Result<(), PropolisError> {
    sqlx::query(&format!("DELETE FROM {table} WHERE {fk_col} = $1"))
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    for (name, value) in attrs {
        let kind = match value.kind {
            AttrType::Number => "number",
            AttrType::String => "string",
        };
        sqlx::query(&format!(
            "INSERT INTO {table} ({fk_col}, attr_name, attr_value, attr_type) VALUES ($1, $2, $3, $4)"
        ))
        .bind(id)
        .bind(name)
        .bind(&value.lexeme)
        .bind(kind)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    }
    Ok(())
}

async fn load_node(tx: &mut Transaction<'_, Postgres>, id: &str) -> Result<NodeRow, PropolisError> {
    let row: (String, DateTime<Utc>, Option<DateTime<Utc>>) =
        sqlx::query_as("SELECT id, created_at, updated_at FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx)?;
    let labels: Vec<(String,)> = sqlx::query_as("SELECT label FROM node_labels WHERE node_id = $1")
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    let attrs: Vec<(String, String, String)> =
        sqlx::query_as("SELECT attr_name, attr_value, attr_type FROM node_attributes WHERE node_id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx)?;
    let mut attributes = AttrMap::new();
    for (name, value, kind) in attrs {
        let kind = if kind == "number" { AttrType::Number } else { AttrType::String };
        attributes.insert(name, AttrValue { lexeme: value, kind });
    }
    Ok(NodeRow {
        id: row.0,
        created_at: row.1,
        updated_at: row.2,
        labels: labels.into_iter().map(|(l,)| l).collect(),
        attributes,
    })
}

async fn load_relation(tx: &mut Transaction<'_, Postgres>, id: &str) -> Result<RelationRow, PropolisError> {
    let row: (String, DateTime<Utc>, Option<DateTime<Utc>>, String, String, String) = sqlx::query_as(
        "SELECT id, created_at, updated_at, left_node_id, right_node_id, direction FROM relations WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    let labels: Vec<(String,)> = sqlx::query_as("SELECT label FROM relation_labels WHERE relation_id = $1")
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    let attrs: Vec<(String, String, String)> =
        sqlx::query_as("SELECT attr_name, attr_value, attr_type FROM relation_attributes WHERE relation_id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx)?;
    let mut attributes = AttrMap::new();
    for (name, value, kind) in attrs {
        let kind = if kind == "number" { AttrType::Number } else { AttrType::String };
        attributes.insert(name, AttrValue { lexeme: value, kind });
    }
    let direction = match row.5.as_str() {
        "left" => Direction::Left,
        "right" => Direction::Right,
        _ => Direction::Neutral,
    };
    Ok(RelationRow {
        id: row.0,
        created_at: row.1,
        updated_at: row.2,
        left_node_id: row.3,
        right_node_id: row.4,
        direction,
        labels: labels.into_iter().map(|(l,)| l).collect(),
        attributes,
    })
}

async fn find_node_candidates(
    tx: &mut Transaction<'_, Postgres>,
    pat: &NodePattern,
) -> Result<Vec<String>, PropolisError> {
    if pat.labels.is_empty() && pat.attrs.is_empty() {
        return Ok(Vec::new());
    }
    // Conjunctive selector: a row must carry every supplied label and every
    // supplied attribute predicate. Implemented as one EXISTS-per-predicate
    // against the id universe of `nodes`, enumerating columns explicitly
    // rather than relying on reflection (per `spec.md` §9 design note).
    let mut sql = String::from("SELECT id FROM nodes n WHERE 1 = 1");
    let mut binds: Vec<String> = Vec::new();
    for label in &pat.labels {
        binds.push(label.clone());
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM node_labels nl WHERE nl.node_id = n.id AND nl.label = ${})",
            binds.len()
        ));
    }
    for (name, value) in &pat.attrs {
        binds.push(name.clone());
        let name_idx = binds.len();
        binds.push(value.lexeme.clone());
        let value_idx = binds.len();
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM node_attributes na WHERE na.node_id = n.id AND na.attr_name = ${name_idx} AND na.attr_value = ${value_idx})"
        ));
    }
    let mut query = sqlx::query_as(&sql);
    for b in &binds {
        query = query.bind(b);
    }
    let rows: Vec<(String,)> = query.fetch_all(&mut **tx).await.map_err(map_sqlx)?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

async fn merge_node(tx: &mut Transaction<'_, Postgres>, pat: &NodePattern, now: DateTime<Utc>) -> Result<NodeRow, PropolisError> {
    let labels = dedup_preserve_order(&pat.labels);

    let target_id = if let Some(id_attr) = pat.attrs.get("id") {
        Some(id_attr.lexeme.clone())
    } else {
        let candidates = find_node_candidates(tx, pat).await?;
        match candidates.len() {
            0 => None,
            1 => Some(candidates.into_iter().next().unwrap()),
            n => return Err(PropolisError::MultiMatch { count: n }),
        }
    };

    let mut attributes = pat.attrs.clone();
    attributes.remove("id");

    let id = match target_id {
        Some(id) => {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM nodes WHERE id = $1")
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            if exists.is_some() {
                sqlx::query("UPDATE nodes SET updated_at = $2 WHERE id = $1")
                    .bind(&id)
                    .bind(now)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            } else {
                sqlx::query("INSERT INTO nodes (id, created_at) VALUES ($1, $2)")
                    .bind(&id)
                    .bind(now)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            }
            id
        }
        None => {
            let id = generate_id();
            sqlx::query("INSERT INTO nodes (id, created_at) VALUES ($1, $2)")
                .bind(&id)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            id
        }
    };

    replace_labels(tx, "node_labels", "node_id", &id, &labels).await?;
    replace_attrs(tx, "node_attributes", "node_id", &id, &attributes).await?;
    load_node(tx, &id).await
}

async fn merge_relation(
    tx: &mut Transaction<'_, Postgres>,
    left_pat: &NodePattern,
    rel_pat: &RelationPattern,
    right_pat: &NodePattern,
    now: DateTime<Utc>,
) -> Result<(NodeRow, RelationRow, NodeRow), PropolisError> {
    let left = Box::pin(merge_node(tx, left_pat, now)).await?;
    let right = Box::pin(merge_node(tx, right_pat, now)).await?;
    let labels = dedup_preserve_order(&rel_pat.labels);
    let direction_str = match rel_pat.direction {
        Direction::Left => "left",
        Direction::Right => "right",
        Direction::Neutral => "neutral",
    };

    let target_id = if let Some(id_attr) = rel_pat.attrs.get("id") {
        Some(id_attr.lexeme.clone())
    } else {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM relations WHERE left_node_id = $1 AND right_node_id = $2",
        )
        .bind(&left.id)
        .bind(&right.id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        // label/attr predicates are checked in-process: the candidate set
        // from the (left,right) tuple is small, unlike the node case.
        let mut matched = Vec::new();
        for (id,) in rows {
            let existing = load_relation(tx, &id).await?;
            if rel_pat.labels.iter().all(|l| existing.labels.contains(l))
                && rel_pat.attrs.iter().all(|(k, v)| existing.attributes.get(k) == Some(v))
            {
                matched.push(id);
            }
        }
        match matched.len() {
            0 => None,
            1 => Some(matched.into_iter().next().unwrap()),
            n => return Err(PropolisError::MultiMatch { count: n }),
        }
    };

    let mut attributes = rel_pat.attrs.clone();
    attributes.remove("id");

    let id = match target_id {
        Some(id) => {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM relations WHERE id = $1")
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            if exists.is_some() {
                sqlx::query(
                    "UPDATE relations SET updated_at = $2, left_node_id = $3, right_node_id = $4, direction = $5 WHERE id = $1",
                )
                .bind(&id)
                .bind(now)
                .bind(&left.id)
                .bind(&right.id)
                .bind(direction_str)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            } else {
                sqlx::query(
                    "INSERT INTO relations (id, created_at, left_node_id, right_node_id, direction) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&id)
                .bind(now)
                .bind(&left.id)
                .bind(&right.id)
                .bind(direction_str)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            id
        }
        None => {
            let id = generate_id();
            sqlx::query(
                "INSERT INTO relations (id, created_at, left_node_id, right_node_id, direction) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&id)
            .bind(now)
            .bind(&left.id)
            .bind(&right.id)
            .bind(direction_str)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
            id
        }
    };

    replace_labels(tx, "relation_labels", "relation_id", &id, &labels).await?;
    replace_attrs(tx, "relation_attributes", "relation_id", &id, &attributes).await?;
    let relation = load_relation(tx, &id).await?;
    Ok((left, relation, right))
}

async fn match_node(
    tx: &mut Transaction<'_, Postgres>,
    pat: &NodePattern,
    since: Option<DateTime<Utc>>,
) -> Result<SearchResults, PropolisError> {
    let ids = if pat.labels.is_empty() && pat.attrs.is_empty() {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM nodes").fetch_all(&mut **tx).await.map_err(map_sqlx)?;
        rows.into_iter().map(|(id,)| id).collect()
    } else {
        find_node_candidates(tx, pat).await?
    };

    let mut matched = Vec::new();
    for id in ids {
        let row = load_node(tx, &id).await?;
        if let Some(t) = since {
            if row.updated_at.unwrap_or(row.created_at) <= t {
                continue;
            }
        }
        matched.push(MaterializedEntity::Node(row));
    }

    let mut results = SearchResults::new();
    results.insert(pat.identifier.clone().unwrap_or_default(), matched);
    Ok(results)
}

fn stored_orientations(rel: &RelationRow) -> Vec<(String, String)> {
    match rel.direction {
        Direction::Right => vec![(rel.left_node_id.clone(), rel.right_node_id.clone())],
        Direction::Left => vec![(rel.right_node_id.clone(), rel.left_node_id.clone())],
        Direction::Neutral => {
            vec![(rel.left_node_id.clone(), rel.right_node_id.clone()), (rel.right_node_id.clone(), rel.left_node_id.clone())]
        }
    }
}

fn pattern_orientations<'a>(
    dir: Direction,
    left_pat: &'a NodePattern,
    right_pat: &'a NodePattern,
) -> Vec<(&'a NodePattern, &'a NodePattern)> {
    match dir {
        Direction::Right => vec![(left_pat, right_pat)],
        Direction::Left => vec![(right_pat, left_pat)],
        Direction::Neutral => vec![(left_pat, right_pat), (right_pat, left_pat)],
    }
}

async fn match_relation(
    tx: &mut Transaction<'_, Postgres>,
    left_pat: &NodePattern,
    rel_pat: &RelationPattern,
    right_pat: &NodePattern,
    since: Option<DateTime<Utc>>,
) -> Result<SearchResults, PropolisError> {
    let mut results = SearchResults::new();
    if let Some(name) = &left_pat.identifier {
        results.entry(name.clone()).or_default();
    }
    if let Some(name) = &right_pat.identifier {
        results.entry(name.clone()).or_default();
    }
    if let Some(name) = &rel_pat.identifier {
        results.entry(name.clone()).or_default();
    }

    let rel_ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM relations").fetch_all(&mut **tx).await.map_err(map_sqlx)?;

    'relations: for (rel_id,) in rel_ids {
        let rel = load_relation(tx, &rel_id).await?;
        if !rel_pat.labels.iter().all(|l| rel.labels.contains(l))
            || !rel_pat.attrs.iter().all(|(k, v)| rel.attributes.get(k) == Some(v))
        {
            continue;
        }

        for (from_id, to_id) in stored_orientations(&rel) {
            for (pat_from, pat_to) in pattern_orientations(rel_pat.direction, left_pat, right_pat) {
                let from_row = load_node(tx, &from_id).await?;
                let to_row = load_node(tx, &to_id).await?;
                let from_ok = pat_from.labels.iter().all(|l| from_row.labels.contains(l))
                    && pat_from.attrs.iter().all(|(k, v)| from_row.attributes.get(k) == Some(v));
                let to_ok = pat_to.labels.iter().all(|l| to_row.labels.contains(l))
                    && pat_to.attrs.iter().all(|(k, v)| to_row.attributes.get(k) == Some(v));
                if !from_ok || !to_ok {
                    continue;
                }
                if let Some(t) = since {
                    let any_recent = from_row.updated_at.unwrap_or(from_row.created_at) > t
                        || to_row.updated_at.unwrap_or(to_row.created_at) > t
                        || rel.updated_at.unwrap_or(rel.created_at) > t;
                    if !any_recent {
                        continue;
                    }
                }

                let (left_row, right_row) =
                    if std::ptr::eq(pat_from, left_pat) { (&from_row, &to_row) } else { (&to_row, &from_row) };

                if let Some(name) = &left_pat.identifier {
                    results.get_mut(name).unwrap().push(MaterializedEntity::Node(left_row.clone()));
                }
                if let Some(name) = &right_pat.identifier {
                    results.get_mut(name).unwrap().push(MaterializedEntity::Node(right_row.clone()));
                }
                if let Some(name) = &rel_pat.identifier {
                    results.get_mut(name).unwrap().push(MaterializedEntity::Relation(rel.clone()));
                }
                continue 'relations;
            }
        }
    }

    Ok(results)
}
