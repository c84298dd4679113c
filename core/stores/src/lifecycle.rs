use memory_weave_schemas::{ConsistencyReport, StoreHealth, StoreStats};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::StoreResult;
use crate::graph::GraphStore;
use crate::relational::RelationalStore;
use crate::vector::VectorStore;

/// Drives the three backends as one unit: schema setup, destructive reset,
/// health, stats, and read-time consistency checks. Reset order is graph,
/// vector, relational, so a crash mid-reset can never leave the relational
/// store claiming entries the derived stores have already dropped.
pub struct LifecycleManager {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorStore>,
    graph: Arc<GraphStore>,
}

impl LifecycleManager {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorStore>,
        graph: Arc<GraphStore>,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
        }
    }

    /// Create schemas on all three backends. Safe to call repeatedly.
    pub fn initialize_all(&self) -> StoreResult<()> {
        self.relational.initialize()?;
        self.vector.initialize()?;
        self.graph.initialize()?;
        info!("All stores initialized");
        Ok(())
    }

    /// Drop and recreate everything, derived stores first.
    pub fn reset_all(&self) -> StoreResult<()> {
        self.graph.reset()?;
        self.vector.reset()?;
        self.relational.reset()?;
        info!("All stores reset");
        Ok(())
    }

    /// Per-backend health. Never fails as a whole: an unreachable store is
    /// reported as such and the rest are still checked.
    pub fn health_check(&self) -> Vec<StoreHealth> {
        let health = vec![
            self.relational.health(),
            self.vector.health(),
            self.graph.health(),
        ];
        for status in &health {
            if !status.reachable {
                warn!(
                    "{} store unreachable: {}",
                    status.backend,
                    status.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        health
    }

    pub fn get_stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            relational_entries: self.relational.count_entries()?,
            vector_records: self.vector.count_records()?,
            graph_entities: self.graph.count_entities()?,
            graph_edges: self.graph.count_edges()?,
        })
    }

    /// Check the cross-store invariants: every vector record must have a
    /// relational counterpart, and every edge endpoint must resolve. Found
    /// violations are reported, never repaired here.
    pub fn check_consistency(&self) -> StoreResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        for entry_id in self.vector.all_entry_ids()? {
            if !self.relational.contains(&entry_id)? {
                warn!("Vector record {} has no relational counterpart", entry_id);
                report.orphaned_vectors.push(entry_id);
            }
        }

        report.dangling_edges = self.graph.dangling_edges()?;
        for edge_id in &report.dangling_edges {
            warn!("Edge {} references a missing entity", edge_id);
        }

        Ok(report)
    }
}
