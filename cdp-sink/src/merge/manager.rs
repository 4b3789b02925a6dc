//! Persistent toMerge / noMerge edges
//!
//! Every operation loads the neighbourhood of the members it touches into a
//! [`MergeGraph`], applies the change there and writes the neighbourhood
//! back, so the exclusivity rules live in one place.

use sqlx::SqliteConnection;
use uuid::Uuid;

use super::graph::MergeGraph;
use crate::db::merge_edges;
use crate::error::SinkResult;

pub async fn load_graph(conn: &mut SqliteConnection, members: &[Uuid]) -> SinkResult<MergeGraph> {
    let edges = merge_edges::edges_touching(conn, members).await?;
    Ok(MergeGraph::from_edges(&edges))
}

async fn save_graph(
    conn: &mut SqliteConnection,
    members: &[Uuid],
    graph: &MergeGraph,
) -> SinkResult<()> {
    merge_edges::replace_edges_touching(conn, members, &graph.edges()).await
}

/// Suggest merging two members; `false` when refused by a noMerge edge
pub async fn add_to_merge(conn: &mut SqliteConnection, a: Uuid, b: Uuid) -> SinkResult<bool> {
    let members = [a, b];
    let mut graph = load_graph(conn, &members).await?;
    if graph.is_to_merge(a, b) {
        return Ok(true);
    }
    if !graph.add_to_merge(a, b) {
        tracing::debug!(member_id = %a, other_member_id = %b, "Merge suggestion refused");
        return Ok(false);
    }
    save_graph(conn, &members, &graph).await?;
    tracing::info!(member_id = %a, other_member_id = %b, "Added merge suggestion");
    Ok(true)
}

/// Mark two members as distinct people, dropping any suggestion between them
pub async fn add_to_no_merge(conn: &mut SqliteConnection, a: Uuid, b: Uuid) -> SinkResult<()> {
    let members = [a, b];
    let mut graph = load_graph(conn, &members).await?;
    if graph.add_to_no_merge(a, b) {
        save_graph(conn, &members, &graph).await?;
        tracing::info!(member_id = %a, other_member_id = %b, "Marked members as not to merge");
    }
    Ok(())
}

/// Carry every edge of `secondary` over to `primary`
pub async fn absorb(conn: &mut SqliteConnection, primary: Uuid, secondary: Uuid) -> SinkResult<()> {
    let members = [primary, secondary];
    let mut graph = load_graph(conn, &members).await?;
    graph.absorb(primary, secondary);
    save_graph(conn, &members, &graph).await
}

pub async fn to_merge(conn: &mut SqliteConnection, member: Uuid) -> SinkResult<Vec<Uuid>> {
    Ok(load_graph(conn, &[member]).await?.to_merge(member))
}

pub async fn no_merge(conn: &mut SqliteConnection, member: Uuid) -> SinkResult<Vec<Uuid>> {
    Ok(load_graph(conn, &[member]).await?.no_merge(member))
}
