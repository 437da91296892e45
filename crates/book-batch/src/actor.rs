//! The per-jobId actor: a single `tokio::spawn`ed task owning one
//! [`JobState`], consuming commands off a serial mailbox so that no two
//! handler invocations for the same jobId are ever concurrent.

use std::sync::Arc;
use std::time::Duration;

use book_config::BatchConfig;
use book_core::{BookError, ErrorKind, ItemOutcome, ItemResult, JobState, JobStatus, TokenEnvelope};
use book_stream::{JobStream, MessageType};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::store::JobStore;
use crate::token::{generate_token, tokens_equal};

/// The outcome reported for a single batch item.
#[derive(Debug, Clone)]
pub enum ItemOutcomeUpdate {
    Success { book_id: String },
    Failure { error_kind: String },
}

/// A snapshot of a job's stream attachment endpoint, handed back to
/// `attachStream` callers.
pub struct StreamAttachment {
    pub replay: Vec<book_stream::StreamMessage>,
    pub receiver: tokio::sync::broadcast::Receiver<book_stream::StreamMessage>,
}

pub(crate) enum Command {
    ItemResult {
        index: usize,
        outcome: ItemOutcomeUpdate,
        respond: oneshot::Sender<Result<(), BookError>>,
    },
    AttachStream {
        token: String,
        last_seq: u64,
        respond: oneshot::Sender<Result<StreamAttachment, BookError>>,
    },
    Cancel {
        token: String,
        respond: oneshot::Sender<Result<(), BookError>>,
    },
    RefreshToken {
        token: String,
        respond: oneshot::Sender<Result<TokenEnvelope, BookError>>,
    },
    Snapshot {
        respond: oneshot::Sender<JobState>,
    },
}

pub(crate) fn spawn(
    state: JobState,
    stream: Arc<JobStream>,
    store: Arc<dyn JobStore>,
    config: BatchConfig,
    on_exit: impl FnOnce() + Send + 'static,
) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(state, rx, stream, store, config, on_exit));
    tx
}

async fn run(
    mut state: JobState,
    mut rx: mpsc::Receiver<Command>,
    stream: Arc<JobStream>,
    store: Arc<dyn JobStore>,
    config: BatchConfig,
    on_exit: impl FnOnce() + Send + 'static,
) {
    let elapsed = (Utc::now() - state.created_at).to_std().unwrap_or(Duration::ZERO);
    let remaining = config.cleanup().saturating_sub(elapsed);
    let alarm = tokio::time::sleep(remaining);
    tokio::pin!(alarm);

    loop {
        tokio::select! {
            _ = &mut alarm => {
                on_alarm(&mut state, &stream, &store, &config).await;
                break;
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => handle(cmd, &mut state, &stream, &store, &config).await,
                    None => break,
                }
            }
        }
    }
    on_exit();
}

async fn handle(
    cmd: Command,
    state: &mut JobState,
    stream: &Arc<JobStream>,
    store: &Arc<dyn JobStore>,
    config: &BatchConfig,
) {
    match cmd {
        Command::ItemResult { index, outcome, respond } => {
            let result = on_item_result(state, stream, store, config, index, outcome).await;
            let _ = respond.send(result);
        }
        Command::AttachStream { token, last_seq, respond } => {
            let result = on_attach_stream(state, stream, &token, last_seq).await;
            let _ = respond.send(result);
        }
        Command::Cancel { token, respond } => {
            let result = on_cancel(state, stream, store, &token).await;
            let _ = respond.send(result);
        }
        Command::RefreshToken { token, respond } => {
            let result = on_refresh_token(state, store, config, &token).await;
            let _ = respond.send(result);
        }
        Command::Snapshot { respond } => {
            let _ = respond.send(state.clone());
        }
    }
}

fn validate_token(state: &JobState, presented: &str) -> Result<(), BookError> {
    let Some(current) = state.auth_token.as_deref() else {
        return Err(BookError::new(ErrorKind::InvalidToken, "no active token for job"));
    };
    if !tokens_equal(current, presented) {
        return Err(BookError::new(ErrorKind::InvalidToken, "token does not match"));
    }
    let expires_at = state.auth_token_expires_at.unwrap_or_default();
    if Utc::now() >= expires_at {
        return Err(BookError::new(ErrorKind::ExpiredToken, "token has expired"));
    }
    Ok(())
}

async fn on_item_result(
    state: &mut JobState,
    stream: &Arc<JobStream>,
    store: &Arc<dyn JobStore>,
    config: &BatchConfig,
    index: usize,
    outcome: ItemOutcomeUpdate,
) -> Result<(), BookError> {
    {
        let item: &mut ItemResult = state
            .per_item_results
            .get_mut(index)
            .ok_or_else(|| BookError::new(ErrorKind::ValidationError, "item index out of range"))?;
        match &outcome {
            ItemOutcomeUpdate::Success { book_id } => {
                item.outcome = ItemOutcome::Success;
                item.book_id = Some(book_id.clone());
                item.error_kind = None;
            }
            ItemOutcomeUpdate::Failure { error_kind } => {
                item.outcome = ItemOutcome::Failure;
                item.book_id = None;
                item.error_kind = Some(error_kind.clone());
            }
        }
    }

    match &outcome {
        ItemOutcomeUpdate::Success { .. } => state.completed_items += 1,
        ItemOutcomeUpdate::Failure { .. } => state.failed_items += 1,
    }

    let item = state.per_item_results[index].clone();
    stream
        .send_item_done(serde_json::json!({
            "index": item.index,
            "outcome": item.outcome,
            "bookId": item.book_id,
            "errorKind": item.error_kind,
        }))
        .await;

    let done = state.completed_items + state.failed_items;
    let mut force_persist = false;
    if done >= state.total_items {
        let next = JobStatus::from_item_counts(state.total_items, state.failed_items);
        if state.status.can_transition_to(next) {
            state.status = next;
        }
        force_persist = true;
        let message_type = match next {
            JobStatus::Completed => MessageType::Completed,
            JobStatus::Failed => MessageType::Failed,
            JobStatus::Partial => MessageType::Partial,
            _ => MessageType::Completed,
        };
        stream
            .send_terminal(
                message_type,
                serde_json::json!({
                    "status": next,
                    "completedItems": state.completed_items,
                    "failedItems": state.failed_items,
                    "totalItems": state.total_items,
                }),
            )
            .await;
    } else {
        stream
            .send_progress(serde_json::json!({
                "completedItems": state.completed_items,
                "failedItems": state.failed_items,
                "totalItems": state.total_items,
            }))
            .await;
    }

    touch(state);
    maybe_persist(state, store, config, force_persist).await;
    Ok(())
}

async fn on_attach_stream(
    state: &JobState,
    stream: &Arc<JobStream>,
    presented: &str,
    last_seq: u64,
) -> Result<StreamAttachment, BookError> {
    validate_token(state, presented)?;
    if !stream.try_attach() {
        return Err(BookError::new(ErrorKind::Conflict, "a client is already attached to this job"));
    }
    stream
        .send_snapshot(serde_json::json!({
            "status": state.status,
            "completedItems": state.completed_items,
            "failedItems": state.failed_items,
            "totalItems": state.total_items,
        }))
        .await;
    let (replay, receiver) = stream.subscribe(last_seq).await;
    Ok(StreamAttachment { replay, receiver })
}

async fn on_cancel(
    state: &mut JobState,
    stream: &Arc<JobStream>,
    store: &Arc<dyn JobStore>,
    presented: &str,
) -> Result<(), BookError> {
    validate_token(state, presented)?;
    match state.status {
        JobStatus::Cancelled => Ok(()),
        JobStatus::Running | JobStatus::Pending => {
            state.status = JobStatus::Cancelled;
            touch(state);
            stream
                .send_terminal(MessageType::Cancelled, serde_json::json!({"status": "cancelled"}))
                .await;
            persist_now(state, store).await;
            Ok(())
        }
        _ => Err(BookError::new(ErrorKind::Conflict, "job is not running")),
    }
}

async fn on_refresh_token(
    state: &mut JobState,
    store: &Arc<dyn JobStore>,
    config: &BatchConfig,
    presented: &str,
) -> Result<TokenEnvelope, BookError> {
    validate_token(state, presented)?;
    let expires_at = state.auth_token_expires_at.unwrap_or_default();
    let now = Utc::now();
    let remaining = expires_at - now;
    let refresh_window = chrono::Duration::from_std(config.refresh_window()).unwrap_or_else(|_| chrono::Duration::zero());
    if remaining <= chrono::Duration::zero() || remaining > refresh_window {
        return Err(BookError::new(
            ErrorKind::ValidationError,
            "refresh is only permitted within the refresh window",
        ));
    }

    state.refresh_in_progress = true;
    let new_token = generate_token();
    let token_lifetime = chrono::Duration::from_std(config.token_lifetime()).unwrap_or_else(|_| chrono::Duration::hours(2));
    let new_expires_at = now + token_lifetime;
    let envelope = TokenEnvelope {
        auth_token: new_token.clone(),
        auth_token_expires_at: new_expires_at,
    };
    store
        .save_token(&state.job_id, &envelope)
        .await
        .map_err(|e| BookError::new(ErrorKind::StorageUnavailable, e.to_string()))?;

    state.auth_token = Some(new_token);
    state.auth_token_expires_at = Some(new_expires_at);
    state.refresh_in_progress = false;
    touch(state);
    persist_now(state, store).await;
    Ok(envelope)
}

async fn on_alarm(state: &mut JobState, stream: &Arc<JobStream>, store: &Arc<dyn JobStore>, config: &BatchConfig) {
    if state.status.is_terminal() {
        let _ = store.delete(&state.job_id).await;
        return;
    }

    let age = (Utc::now() - state.created_at).to_std().unwrap_or(Duration::ZERO);
    if age >= config.cleanup() {
        state.status = JobStatus::Expired;
        touch(state);
        stream
            .send_terminal(MessageType::Failed, serde_json::json!({"status": "expired"}))
            .await;
        persist_now(state, store).await;
        let _ = store.delete(&state.job_id).await;
    }
}

fn touch(state: &mut JobState) {
    state.version += 1;
    state.updated_at = Utc::now();
    state.updates_since_last_persist += 1;
}

async fn persist_now(state: &mut JobState, store: &Arc<dyn JobStore>) {
    if let Err(err) = store.save_state(state).await {
        tracing::warn!(job_id = %state.job_id, error = %err, "persisting job state failed, will retry on next throttle tick");
        return;
    }
    state.updates_since_last_persist = 0;
    state.last_persisted_at = Utc::now();
}

/// Persist when any of: forced (terminal transition), update-count
/// threshold, or time-since-last-persist threshold, per the throttling
/// rules.
async fn maybe_persist(state: &mut JobState, store: &Arc<dyn JobStore>, config: &BatchConfig, force: bool) {
    let elapsed = (Utc::now() - state.last_persisted_at).to_std().unwrap_or(Duration::ZERO);
    let should_persist = force
        || state.updates_since_last_persist >= config.persist_update_count
        || elapsed >= Duration::from_millis(config.persist_time_ms);
    if should_persist {
        persist_now(state, store).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileJobStore;
    use book_stream::StreamRegistry;

    fn new_state(job_id: &str, total: usize) -> JobState {
        let items: Vec<serde_json::Value> = (0..total).map(|i| serde_json::json!({"i": i})).collect();
        let token = TokenEnvelope {
            auth_token: "t".repeat(36),
            auth_token_expires_at: Utc::now() + chrono::Duration::hours(2),
        };
        JobState::launch(job_id.to_string(), "owner".to_string(), &items, Utc::now(), token)
    }

    #[tokio::test]
    async fn item_results_drive_completed_status() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let stream = StreamRegistry::new().get_or_create("job-1");
        let config = BatchConfig::default();
        let mut state = new_state("job-1", 2);

        on_item_result(&mut state, &stream, &store, &config, 0, ItemOutcomeUpdate::Success { book_id: "a".to_string() })
            .await
            .unwrap();
        assert_eq!(state.status, JobStatus::Running);

        on_item_result(&mut state, &stream, &store, &config, 1, ItemOutcomeUpdate::Success { book_id: "b".to_string() })
            .await
            .unwrap();
        assert_eq!(state.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let stream = StreamRegistry::new().get_or_create("job-1");
        let config = BatchConfig::default();
        let mut state = new_state("job-1", 1);
        let err = on_item_result(&mut state, &stream, &store, &config, 5, ItemOutcomeUpdate::Success { book_id: "a".to_string() })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn refresh_within_window_rotates_token() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let config = BatchConfig::default();
        let mut state = new_state("job-1", 1);
        let old_token = state.auth_token.clone().unwrap();
        state.auth_token_expires_at = Some(Utc::now() + chrono::Duration::minutes(5));

        let envelope = on_refresh_token(&mut state, &store, &config, &old_token).await.unwrap();
        assert_ne!(envelope.auth_token, old_token);
        assert_eq!(state.auth_token.as_deref(), Some(envelope.auth_token.as_str()));
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let config = BatchConfig::default();
        let mut state = new_state("job-1", 1);

        let err = on_refresh_token(&mut state, &store, &config, "wrong-token").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidToken);
    }

    #[tokio::test]
    async fn expired_job_transitions_to_expired_on_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let stream = StreamRegistry::new().get_or_create("job-1");
        let mut config = BatchConfig::default();
        config.cleanup_secs = 0;
        let mut state = new_state("job-1", 1);
        state.created_at = Utc::now() - chrono::Duration::hours(1);

        on_alarm(&mut state, &stream, &store, &config).await;
        assert_eq!(state.status, JobStatus::Expired);
    }

    #[tokio::test]
    async fn terminal_job_is_cleaned_up_on_alarm_without_expiring() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let stream = StreamRegistry::new().get_or_create("job-1");
        let config = BatchConfig::default();
        let mut state = new_state("job-1", 1);
        state.status = JobStatus::Completed;
        store.save_state(&state).await.unwrap();

        on_alarm(&mut state, &stream, &store, &config).await;
        assert_eq!(state.status, JobStatus::Completed);
        assert!(store.load_state("job-1").await.unwrap().is_none());
    }
}
