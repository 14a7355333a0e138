use std::collections::{HashMap, HashSet};

use db::models::Entity;
use thiserror::Error;
use tracing::warn;

use super::config::{ConfigError, EntityConfig};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("dependency cycle between: {}", format_entities(.0))]
    DependencyCycle(Vec<Entity>),
    #[error("entity {0} is declared more than once")]
    DuplicateEntity(Entity),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

fn format_entities(entities: &[Entity]) -> String {
    entities
        .iter()
        .map(|e| e.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Execution order for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub order: Vec<Entity>,
    /// `(entity, dependency)` pairs whose dependency is not part of this run
    /// and is assumed to have been migrated earlier.
    pub external_dependencies: Vec<(Entity, Entity)>,
}

impl MigrationPlan {
    /// Kahn's algorithm over the declared dependencies; among ready entities
    /// the one declared first goes first.
    pub fn build(entities: &[EntityConfig]) -> Result<Self, OrchestrationError> {
        let mut position = HashMap::with_capacity(entities.len());
        for (idx, config) in entities.iter().enumerate() {
            if position.insert(config.entity, idx).is_some() {
                return Err(OrchestrationError::DuplicateEntity(config.entity));
            }
        }

        let mut external_dependencies = Vec::new();
        let mut indegree = vec![0usize; entities.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
        for (idx, config) in entities.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &config.dependencies {
                if !seen.insert(*dep) {
                    continue;
                }
                match position.get(dep) {
                    Some(&parent) => {
                        indegree[idx] += 1;
                        dependents[parent].push(idx);
                    }
                    None => {
                        warn!(
                            entity = %config.entity,
                            dependency = %dep,
                            "Dependency not selected for this run, assuming it was migrated earlier"
                        );
                        external_dependencies.push((config.entity, *dep));
                    }
                }
            }
        }

        let mut done = vec![false; entities.len()];
        let mut order = Vec::with_capacity(entities.len());
        while order.len() < entities.len() {
            let Some(next) = (0..entities.len()).find(|&i| !done[i] && indegree[i] == 0) else {
                let cycle = (0..entities.len())
                    .filter(|&i| !done[i])
                    .map(|i| entities[i].entity)
                    .collect();
                return Err(OrchestrationError::DependencyCycle(cycle));
            };
            done[next] = true;
            order.push(entities[next].entity);
            for &child in &dependents[next] {
                indegree[child] -= 1;
            }
        }

        Ok(Self {
            order,
            external_dependencies,
        })
    }
}
