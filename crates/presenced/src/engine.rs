use chrono::NaiveDateTime;
use presence_core::{
    AttendanceRecord, AttendanceSummary, EnrolledVector, FeatureVector, IdentityId,
    IdentitySummary, PeriodKey, RecognitionResult, SessionCoordinator,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] presence_core::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Point-in-time daemon state for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub store: &'static str,
    pub identities: usize,
    pub matchable_identities: usize,
    pub vectors: usize,
    pub generation: u64,
    pub dimension: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub identities: usize,
    pub vectors: usize,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    CreateIdentity {
        id: String,
        display_name: String,
        reply: Reply<IdentityId>,
    },
    Rename {
        id: IdentityId,
        display_name: String,
        reply: Reply<IdentitySummary>,
    },
    Enroll {
        id: IdentityId,
        vector: FeatureVector,
        reply: Reply<EnrolledVector>,
    },
    Remove {
        id: IdentityId,
        reply: Reply<usize>,
    },
    ProcessFrame {
        vectors: Vec<FeatureVector>,
        occurred_at: NaiveDateTime,
        deadline: Option<Instant>,
        reply: Reply<Vec<RecognitionResult>>,
    },
    Attendance {
        start: PeriodKey,
        end: PeriodKey,
        reply: Reply<Vec<AttendanceRecord>>,
    },
    History {
        id: IdentityId,
        reply: Reply<Vec<AttendanceRecord>>,
    },
    Summary {
        period: PeriodKey,
        reply: Reply<AttendanceSummary>,
    },
    Identities {
        reply: Reply<Vec<IdentitySummary>>,
    },
    Reload {
        reply: Reply<ReloadReport>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn create_identity(
        &self,
        id: String,
        display_name: String,
    ) -> Result<IdentityId, EngineError> {
        self.call(|reply| EngineRequest::CreateIdentity {
            id,
            display_name,
            reply,
        })
        .await
    }

    pub async fn rename_identity(
        &self,
        id: IdentityId,
        display_name: String,
    ) -> Result<IdentitySummary, EngineError> {
        self.call(|reply| EngineRequest::Rename {
            id,
            display_name,
            reply,
        })
        .await
    }

    pub async fn enroll(
        &self,
        id: IdentityId,
        vector: FeatureVector,
    ) -> Result<EnrolledVector, EngineError> {
        self.call(|reply| EngineRequest::Enroll { id, vector, reply })
            .await
    }

    pub async fn remove(&self, id: IdentityId) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Remove { id, reply }).await
    }

    /// Recognize one frame. `deadline` is fixed by the caller so queueing
    /// time counts against the frame budget.
    pub async fn process_frame(
        &self,
        vectors: Vec<FeatureVector>,
        occurred_at: NaiveDateTime,
        deadline: Option<Instant>,
    ) -> Result<Vec<RecognitionResult>, EngineError> {
        self.call(|reply| EngineRequest::ProcessFrame {
            vectors,
            occurred_at,
            deadline,
            reply,
        })
        .await
    }

    pub async fn attendance(
        &self,
        start: PeriodKey,
        end: PeriodKey,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::Attendance { start, end, reply })
            .await
    }

    pub async fn history(&self, id: IdentityId) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::History { id, reply }).await
    }

    pub async fn summary(&self, period: PeriodKey) -> Result<AttendanceSummary, EngineError> {
        self.call(|reply| EngineRequest::Summary { period, reply })
            .await
    }

    pub async fn identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::Identities { reply }).await
    }

    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        self.call(|reply| EngineRequest::Reload { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread that owns the coordinator.
pub fn spawn_engine(
    coordinator: SessionCoordinator,
    store: &'static str,
) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!(store, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&coordinator, store, req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn handle(coordinator: &SessionCoordinator, store: &'static str, req: EngineRequest) {
    let registry = coordinator.registry();
    let ledger = coordinator.ledger();
    // A dropped receiver means the D-Bus caller went away; nothing to do.
    match req {
        EngineRequest::CreateIdentity {
            id,
            display_name,
            reply,
        } => {
            let _ = reply.send(registry.create_identity(&id, &display_name).map_err(Into::into));
        }
        EngineRequest::Rename {
            id,
            display_name,
            reply,
        } => {
            let _ = reply.send(registry.rename_identity(&id, &display_name).map_err(Into::into));
        }
        EngineRequest::Enroll { id, vector, reply } => {
            let _ = reply.send(registry.enroll(&id, vector).map_err(Into::into));
        }
        EngineRequest::Remove { id, reply } => {
            let _ = reply.send(registry.remove(&id).map_err(Into::into));
        }
        EngineRequest::ProcessFrame {
            vectors,
            occurred_at,
            deadline,
            reply,
        } => {
            let period = PeriodKey::containing(occurred_at);
            let result = coordinator.process_frame(&vectors, occurred_at, period, deadline);
            let _ = reply.send(result.map_err(Into::into));
        }
        EngineRequest::Attendance { start, end, reply } => {
            let _ = reply.send(ledger.query(start, end).map_err(Into::into));
        }
        EngineRequest::History { id, reply } => {
            let _ = reply.send(ledger.query_by_identity(&id).map_err(Into::into));
        }
        EngineRequest::Summary { period, reply } => {
            let _ = reply.send(ledger.summary(period).map_err(Into::into));
        }
        EngineRequest::Identities { reply } => {
            let _ = reply.send(registry.identities().map_err(Into::into));
        }
        EngineRequest::Reload { reply } => {
            let result = registry.reload().map(|snapshot| ReloadReport {
                generation: snapshot.generation(),
                identities: snapshot.len(),
                vectors: snapshot.vector_count(),
            });
            let _ = reply.send(result.map_err(Into::into));
        }
        EngineRequest::Status { reply } => {
            let result = registry.identities().map(|identities| {
                let snapshot = registry.snapshot();
                EngineStatus {
                    store,
                    identities: identities.len(),
                    matchable_identities: snapshot.len(),
                    vectors: snapshot.vector_count(),
                    generation: snapshot.generation(),
                    dimension: registry.dimension(),
                    threshold: coordinator.threshold(),
                }
            });
            let _ = reply.send(result.map_err(Into::into));
        }
    }
}
