//! Orchestrates one fetch cycle: profile, game list, then achievements per game.
//!
//! The run task is the only writer of the published [`Snapshot`]. Per-game work
//! happens in a `JoinSet` owned by the run, so aborting a superseded run also
//! aborts everything it spawned.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::error::AppError;
use crate::exophase::{self, Endpoints};
use crate::models::{
    Achievement, Credentials, Game, GameReport, PipelineReport, Snapshot, StepOutcome,
};
use crate::source::{PageSource, Throttled};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Where updated credentials are persisted.
pub trait CredentialStore: Send {
    fn save_credentials(&self, credentials: &Credentials) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub endpoints: Endpoints,
    pub max_in_flight: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

pub struct Aggregator {
    source: Arc<dyn PageSource>,
    store: Box<dyn CredentialStore>,
    config: PipelineConfig,
    credentials: Credentials,
    snapshot: Arc<watch::Sender<Snapshot>>,
    last_run: u64,
    current: Option<JoinHandle<PipelineReport>>,
}

impl Aggregator {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Box<dyn CredentialStore>,
        config: PipelineConfig,
        credentials: Credentials,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            source,
            store,
            config,
            credentials,
            snapshot: Arc::new(snapshot),
            last_run: 0,
            current: None,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Start a new run, aborting any run still in flight. Returns the run number.
    pub fn start(&mut self) -> u64 {
        if let Some(previous) = self.current.take() {
            if !previous.is_finished() {
                info!(run = self.last_run, "superseding unfinished run");
            }
            previous.abort();
        }

        self.last_run += 1;
        let run = Run {
            run: self.last_run,
            source: Throttled::new(Arc::clone(&self.source), self.config.max_in_flight),
            endpoints: self.config.endpoints.clone(),
            credentials: self.credentials.clone(),
            snapshot: Arc::clone(&self.snapshot),
        };
        self.current = Some(tokio::spawn(run.execute()));
        self.last_run
    }

    /// Persist new credentials and restart the pipeline from the top.
    pub fn update_credentials(&mut self, credentials: Credentials) -> Result<u64, AppError> {
        self.store.save_credentials(&credentials)?;
        self.credentials = credentials;
        Ok(self.start())
    }

    /// Wait for the current run to finish.
    pub async fn wait(&mut self) -> Result<PipelineReport, AppError> {
        let handle = self
            .current
            .take()
            .ok_or_else(|| AppError::Internal("no pipeline run started".to_string()))?;
        handle
            .await
            .map_err(|e| AppError::Internal(format!("pipeline task: {e}")))
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.abort();
        }
    }
}

struct Run {
    run: u64,
    source: Throttled,
    endpoints: Endpoints,
    credentials: Credentials,
    snapshot: Arc<watch::Sender<Snapshot>>,
}

impl Run {
    async fn execute(self) -> PipelineReport {
        let run = self.run;
        let mut report = PipelineReport::new(run);
        self.publish(|s| {
            *s = Snapshot {
                run,
                ..Snapshot::default()
            }
        });

        let user_id = match exophase::resolve_profile(
            &self.source,
            &self.endpoints,
            &self.credentials.handle,
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(run, handle = %self.credentials.handle, error = %err, "profile resolution failed");
                report.profile = StepOutcome::Failed {
                    reason: err.to_string(),
                };
                self.finish_early();
                return report;
            }
        };
        report.profile = StepOutcome::Success;
        report.user_id = Some(user_id);

        let games = match exophase::fetch_games(
            &self.source,
            &self.endpoints,
            &self.credentials.username,
        )
        .await
        {
            Ok(games) => games,
            Err(err) => {
                warn!(run, username = %self.credentials.username, error = %err, "game list failed");
                report.games = Some(StepOutcome::Failed {
                    reason: err.to_string(),
                });
                self.finish_early();
                return report;
            }
        };
        report.games = Some(StepOutcome::Success);

        let listed = games.clone();
        self.publish(|s| {
            s.games = listed;
            s.achievements.clear();
            s.loading = false;
        });

        let mut tasks = JoinSet::new();
        for (index, game) in games.into_iter().enumerate() {
            let source = self.source.clone();
            let endpoints = self.endpoints.clone();
            tasks.spawn(async move {
                let (achievements, outcome) =
                    game_achievements(&source, &endpoints, &game).await;
                (index, game.id, achievements, outcome)
            });
        }

        let mut reports = BTreeMap::new();
        let mut earned: BTreeMap<usize, Vec<Achievement>> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, game_id, achievements, outcome)) => {
                    reports.insert(
                        index,
                        GameReport {
                            game_id,
                            earned: achievements.len(),
                            outcome,
                        },
                    );
                    earned.insert(index, achievements);
                    let merged = earned.values().flatten().cloned().collect::<Vec<_>>();
                    self.publish(|s| s.achievements = merged);
                }
                Err(err) => warn!(run, error = %err, "achievement task did not complete"),
            }
        }

        report.achievements = reports.into_values().collect();
        self.publish(|s| s.finished = true);
        info!(
            run,
            games = report.achievements.len(),
            achievements = earned.values().map(Vec::len).sum::<usize>(),
            "run complete"
        );
        report
    }

    /// Writes from a run older than the published one are discarded.
    fn publish(&self, update: impl FnOnce(&mut Snapshot)) {
        self.snapshot.send_if_modified(|s| {
            if s.run > self.run {
                return false;
            }
            update(s);
            true
        });
    }

    fn finish_early(&self) {
        self.publish(|s| {
            s.loading = false;
            s.finished = true;
        });
    }
}

/// Earned list plus detail pages for one game. Never fails the run.
async fn game_achievements(
    source: &Throttled,
    endpoints: &Endpoints,
    game: &Game,
) -> (Vec<Achievement>, StepOutcome) {
    let stubs = match exophase::fetch_earned(source, endpoints, game).await {
        Ok(Some(stubs)) => stubs,
        Ok(None) => {
            return (
                Vec::new(),
                StepOutcome::Skipped {
                    reason: "game url has no player fragment".to_string(),
                },
            );
        }
        Err(err) => {
            warn!(game_id = %game.id, error = %err, "earned list unavailable");
            return (
                Vec::new(),
                StepOutcome::Failed {
                    reason: err.to_string(),
                },
            );
        }
    };

    let results = stream::iter(stubs)
        .map(|stub| async move {
            let result = exophase::enrich(source, &game.id, &stub).await;
            (stub, result)
        })
        .buffered(source.capacity())
        .collect::<Vec<_>>()
        .await;

    let mut achievements = Vec::with_capacity(results.len());
    let mut reasons = Vec::new();
    for (stub, result) in results {
        match result {
            Ok(achievement) => achievements.push(achievement),
            Err(err) => {
                warn!(game_id = %game.id, award_id = %stub.award_id, error = %err, "dropping achievement");
                reasons.push(format!("{}: {err}", stub.award_id));
            }
        }
    }

    let outcome = if reasons.is_empty() {
        StepOutcome::Success
    } else if achievements.is_empty() {
        StepOutcome::Failed {
            reason: format!("all {} achievements failed: {}", reasons.len(), reasons.join("; ")),
        }
    } else {
        StepOutcome::Partial {
            dropped: reasons.len(),
            reasons,
        }
    };
    (achievements, outcome)
}
