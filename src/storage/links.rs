//! Link graph operations: bidirectional creation, neighbor queries, and
//! cycle detection over the dependency subgraph.
//!
//! The dependency subgraph is the set of `depends_on` edges plus the
//! reversal of `blocks` edges. Cycle detection is a DFS over committed plus
//! staged edges, O(V+E) per check, entirely in memory.

use serde_json::Value;
use sqlx::{MySql, MySqlConnection, Row as _};
use std::collections::{HashMap, HashSet};

use crate::error::{MemoryBankError, Result};
use crate::model::relations::{self, DependencyRole};
use crate::model::BlockLink;
use crate::storage::reader::link_from_row;
use crate::storage::writer::{MutationContext, Writer};

/// A normalized dependency edge: `dependent` depends on `dependency`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
}

/// Which side of a block's links to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A link together with the id of the block on the far side.
#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct NeighborLink {
    pub neighbor_id: String,
    pub link: BlockLink,
}

/// Normalize a stored edge into the dependency subgraph, if it belongs there.
#[must_use]
pub fn dependency_edge(from_id: &str, to_id: &str, relation: &str) -> Option<DependencyEdge> {
    match relations::dependency_role(relation) {
        DependencyRole::Forward => Some(DependencyEdge {
            dependent: from_id.to_string(),
            dependency: to_id.to_string(),
        }),
        DependencyRole::Reverse => Some(DependencyEdge {
            dependent: to_id.to_string(),
            dependency: from_id.to_string(),
        }),
        DependencyRole::None => None,
    }
}

/// Whether adding `candidate` to `edges` closes a dependency cycle.
///
/// Walks dependencies transitively from the candidate's dependency; a path
/// back to the candidate's dependent means the new edge would close a loop.
#[must_use]
pub fn would_create_cycle(edges: &[DependencyEdge], candidate: &DependencyEdge) -> bool {
    if candidate.dependent == candidate.dependency {
        return true;
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.dependent.as_str())
            .or_default()
            .push(edge.dependency.as_str());
    }

    let mut stack = vec![candidate.dependency.as_str()];
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == candidate.dependent {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

/// Load every committed dependency edge on the session's branch.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn load_dependency_edges(conn: &mut MySqlConnection) -> Result<Vec<DependencyEdge>> {
    let rows = sqlx::query(
        "SELECT from_id, to_id, relation FROM block_links
         WHERE relation IN ('depends_on', 'blocks')",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let from_id: String = row.try_get("from_id").ok()?;
            let to_id: String = row.try_get("to_id").ok()?;
            let relation: String = row.try_get("relation").ok()?;
            dependency_edge(&from_id, &to_id, &relation)
        })
        .collect())
}

/// Create a link, optionally with its inverse.
///
/// When `bidirectional` is set and the relation declares an inverse, both
/// `(from, to, R)` and `(to, from, R⁻¹)` are created; if the second insert
/// fails the first is removed again so no half-pair survives. A relation
/// without an inverse fails with `NoInverseRelation`.
///
/// Returns the created links as `(from, to, relation)` triples.
///
/// # Errors
///
/// Everything [`Writer::insert_link`] can produce, plus `NoInverseRelation`.
pub async fn create_link(
    writer: &mut Writer<'_>,
    from_id: &str,
    to_id: &str,
    relation: &str,
    bidirectional: bool,
    priority: i64,
    metadata: &Value,
    ctx: &mut MutationContext,
) -> Result<Vec<(String, String, String)>> {
    let inverse = if bidirectional {
        Some(relations::inverse_of(relation).ok_or_else(|| {
            MemoryBankError::NoInverseRelation {
                relation: relation.to_string(),
            }
        })?)
    } else {
        None
    };

    writer
        .insert_link(from_id, to_id, relation, priority, metadata, ctx)
        .await?;
    let mut created = vec![(
        from_id.to_string(),
        to_id.to_string(),
        relation.to_string(),
    )];

    if let Some(inverse) = inverse {
        // The self-inverse pair (related_to) stores two mirrored rows.
        let second = writer
            .insert_link(to_id, from_id, inverse, priority, metadata, ctx)
            .await;
        if let Err(err) = second {
            let _ = writer.delete_link(from_id, to_id, relation, ctx).await;
            return Err(err);
        }
        created.push((to_id.to_string(), from_id.to_string(), inverse.to_string()));
    }

    Ok(created)
}

/// Delete every link touching `block_id`. Usable inside a transaction or on
/// a bare connection.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn delete_all_for<'e, E>(executor: E, block_id: &str) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = MySql>,
{
    let affected = sqlx::query("DELETE FROM block_links WHERE from_id = ? OR to_id = ?")
        .bind(block_id)
        .bind(block_id)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(affected)
}

/// The links around a block, with the far-side block id extracted.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn neighbors(
    conn: &mut MySqlConnection,
    block_id: &str,
    relation_filter: Option<&[String]>,
    direction: Direction,
) -> Result<Vec<NeighborLink>> {
    let mut results = Vec::new();

    if matches!(direction, Direction::Outgoing | Direction::Both) {
        let rows = sqlx::query(
            "SELECT from_id, to_id, relation, priority, link_metadata, created_by, created_at
             FROM block_links WHERE from_id = ? ORDER BY priority DESC, to_id ASC",
        )
        .bind(block_id)
        .fetch_all(&mut *conn)
        .await?;
        for row in &rows {
            let link = link_from_row(row)?;
            if relation_matches(relation_filter, &link.relation) {
                results.push(NeighborLink {
                    neighbor_id: link.to_id.clone(),
                    link,
                });
            }
        }
    }

    if matches!(direction, Direction::Incoming | Direction::Both) {
        let rows = sqlx::query(
            "SELECT from_id, to_id, relation, priority, link_metadata, created_by, created_at
             FROM block_links WHERE to_id = ? ORDER BY priority DESC, from_id ASC",
        )
        .bind(block_id)
        .fetch_all(&mut *conn)
        .await?;
        for row in &rows {
            let link = link_from_row(row)?;
            if relation_matches(relation_filter, &link.relation) {
                results.push(NeighborLink {
                    neighbor_id: link.from_id.clone(),
                    link,
                });
            }
        }
    }

    Ok(results)
}

fn relation_matches(filter: Option<&[String]>, relation: &str) -> bool {
    filter.is_none_or(|wanted| wanted.iter().any(|r| r == relation))
}
