//! Component C4: records experiment events, denormalizing the matching
//! assignment's `variant_id`/`assigned_at` at ingest time so downstream
//! aggregates never need to join back to the assignments table.
//!
//! Events never get rejected for lacking an assignment - pre-assignment
//! activity is stored with `assignment_at = NULL` and excluded from
//! post-assignment-valid aggregates instead (see `Event::is_valid`).

use crate::db::event_repo::AssignmentResolution;
use crate::db::{AssignmentRepo, EventRepo};
use crate::error::{ExperimentsError, Result};
use crate::models::{Event, NewEvent};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct EventIngestor {
    event_repo: Arc<EventRepo>,
    assignment_repo: Arc<AssignmentRepo>,
}

impl EventIngestor {
    pub fn new(event_repo: Arc<EventRepo>, assignment_repo: Arc<AssignmentRepo>) -> Self {
        Self {
            event_repo,
            assignment_repo,
        }
    }

    pub async fn record(&self, event: NewEvent) -> Result<Event> {
        event.validate().map_err(ExperimentsError::Validation)?;
        let resolution = self.resolve_one(&event).await?;
        self.event_repo.insert(&event, resolution).await
    }

    async fn resolve_one(&self, event: &NewEvent) -> Result<AssignmentResolution> {
        let Some(experiment_id) = event.experiment_id else {
            return Ok(AssignmentResolution {
                variant_id: None,
                assignment_at: None,
            });
        };
        let assignment = self.assignment_repo.get(experiment_id, &event.user_id).await?;
        Ok(match assignment {
            Some(a) => AssignmentResolution {
                variant_id: Some(a.variant_id),
                assignment_at: Some(a.assigned_at),
            },
            None => AssignmentResolution {
                variant_id: None,
                assignment_at: None,
            },
        })
    }

    /// Batch ingest: events are grouped by `experiment_id` so the
    /// assignment lookup is one query per group rather than one per event.
    /// Each event is still inserted (and can fail) independently - a bad
    /// row in the batch never aborts its neighbors.
    pub async fn record_batch(&self, events: Vec<NewEvent>) -> Vec<Result<Event>> {
        let mut results: Vec<Option<Result<Event>>> = events.iter().map(|_| None).collect();

        let mut groups: HashMap<Option<Uuid>, Vec<usize>> = HashMap::new();
        for (idx, event) in events.iter().enumerate() {
            if let Err(msg) = event.validate() {
                results[idx] = Some(Err(ExperimentsError::Validation(msg)));
                continue;
            }
            groups.entry(event.experiment_id).or_default().push(idx);
        }

        for (experiment_id, indices) in groups {
            let assignments = match experiment_id {
                Some(experiment_id) => {
                    let user_ids: Vec<String> =
                        indices.iter().map(|&i| events[i].user_id.clone()).collect();
                    match self.assignment_repo.get_for_experiment(experiment_id, &user_ids).await {
                        Ok(map) => map,
                        Err(err) => {
                            for &idx in &indices {
                                results[idx] = Some(Err(match &err {
                                    ExperimentsError::NotFound(m) => ExperimentsError::NotFound(m.clone()),
                                    other => ExperimentsError::Internal(other.to_string()),
                                }));
                            }
                            continue;
                        }
                    }
                }
                None => HashMap::new(),
            };

            for idx in indices {
                let event = &events[idx];
                let resolution = match assignments.get(&event.user_id) {
                    Some(a) => AssignmentResolution {
                        variant_id: Some(a.variant_id),
                        assignment_at: Some(a.assigned_at),
                    },
                    None => AssignmentResolution {
                        variant_id: None,
                        assignment_at: None,
                    },
                };
                results[idx] = Some(self.event_repo.insert(event, resolution).await);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(ExperimentsError::Internal("event skipped by batch grouping".to_string()))))
            .collect()
    }
}
