/// Job Store - lifecycle records and single-shot access tokens
///
/// **Responsibility:**
/// Persist job metadata with a short TTL, enforce the monotone status
/// machine (`queued → processing → completed | failed`), and issue/consume
/// the one-time token that authenticates a WebSocket attachment.
///
/// **Adapters:**
/// - `RedisJobStore` - production path over a shared connection manager.
///   Status transitions run inside a Lua script so concurrent writers
///   cannot skip states; tokens are consumed with a single GETDEL.
/// - `MemoryJobStore` - in-process map for tests and the `memory` backend.
///   Token lookup compares secrets in constant time.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crucible_common::config::Settings;
use crucible_common::redis::{job_key, token_key};
use crucible_common::types::{ExecutionResult, Job, JobStatus, Language};

/// Length of the random token secret; 48 alphanumeric chars carry well over
/// the required 128 bits of entropy.
const TOKEN_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found")]
    NotFound,
    #[error("illegal status transition")]
    IllegalTransition,
    #[error("store backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

fn backend<E: Into<anyhow::Error>>(err: E) -> StoreError {
    StoreError::Backend(err.into())
}

/// A freshly created job record plus the credential that unlocks it.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_id: Uuid,
    pub token: String,
    pub expires_at: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record with status `queued` and bind a one-time token
    /// to it. The token lifetime never exceeds the job TTL.
    async fn create(
        &self,
        code: &str,
        language: Language,
        filename: &str,
    ) -> Result<CreatedJob, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// `queued → processing`.
    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// `processing → completed`, storing the result.
    async fn mark_completed(
        &self,
        job_id: Uuid,
        result: &ExecutionResult,
    ) -> Result<(), StoreError>;

    /// `queued | processing → failed`, storing the error text.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        partial: Option<&ExecutionResult>,
    ) -> Result<(), StoreError>;

    /// Single-shot token consumption: the first call returns the bound job
    /// id, every later call returns `None`.
    async fn consume_token(&self, token: &str) -> Result<Option<Uuid>, StoreError>;
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn now_epoch_secs() -> String {
    Utc::now().timestamp().to_string()
}

// ---------------------------------------------------------------------------
// Redis adapter
// ---------------------------------------------------------------------------

/// Guarded status transition. Arguments: allowed-from list (comma separated),
/// new status, then field/value pairs to set alongside the status.
/// Returns 1 on success, 0 on an illegal transition, -1 when the key is gone.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if current == false then
  return -1
end
local allowed = false
for from in string.gmatch(ARGV[1], '[^,]+') do
  if current == from then
    allowed = true
  end
end
if not allowed then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
for i = 3, #ARGV - 1, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

pub struct RedisJobStore {
    conn: ConnectionManager,
    transition_script: redis::Script,
    job_ttl_secs: u64,
    token_ttl_secs: u64,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, settings: &Settings) -> Self {
        Self {
            conn,
            transition_script: redis::Script::new(TRANSITION_SCRIPT),
            job_ttl_secs: settings.job_ttl_secs,
            token_ttl_secs: settings.effective_token_ttl_secs(),
        }
    }

    async fn transition(
        &self,
        job_id: Uuid,
        allowed_from: &str,
        new_status: JobStatus,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.transition_script.key(job_key(&job_id));
        invocation.arg(allowed_from).arg(new_status.to_string());
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let outcome: i32 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        match outcome {
            1 => Ok(()),
            0 => Err(StoreError::IllegalTransition),
            _ => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(
        &self,
        code: &str,
        language: Language,
        filename: &str,
    ) -> Result<CreatedJob, StoreError> {
        let job_id = Uuid::new_v4();
        let token = generate_token();
        let expires_at = (Utc::now() + chrono::Duration::seconds(self.token_ttl_secs as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let fields: Vec<(&str, String)> = vec![
            ("job_id", job_id.to_string()),
            ("code", code.to_string()),
            ("language", language.to_string()),
            ("filename", filename.to_string()),
            ("status", JobStatus::Queued.to_string()),
            ("created_at", now_epoch_secs()),
        ];

        let mut conn = self.conn.clone();
        let key = job_key(&job_id);
        let _: () = conn.hset_multiple(&key, &fields).await.map_err(backend)?;
        let _: () = conn
            .expire(&key, self.job_ttl_secs as i64)
            .await
            .map_err(backend)?;
        let _: () = conn
            .set_ex(token_key(&token), job_id.to_string(), self.token_ttl_secs)
            .await
            .map_err(backend)?;

        debug!(job_id = %job_id, language = %language, "Job record created");
        Ok(CreatedJob {
            job_id,
            token,
            expires_at,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> = conn
            .hgetall(job_key(&job_id))
            .await
            .map_err(backend)?;
        if raw.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| -> Result<String, StoreError> {
            raw.get(name)
                .cloned()
                .ok_or_else(|| backend(anyhow::anyhow!("job record missing field `{}`", name)))
        };

        let language = Language::from_str(&field("language")?)
            .ok_or_else(|| backend(anyhow::anyhow!("job record has unknown language")))?;
        let status = JobStatus::from_str(&field("status")?)
            .ok_or_else(|| backend(anyhow::anyhow!("job record has unknown status")))?;
        let result = match raw.get("result") {
            Some(json) => Some(serde_json::from_str(json).map_err(backend)?),
            None => None,
        };

        Ok(Some(Job {
            job_id,
            code: field("code")?,
            language,
            filename: field("filename")?,
            status,
            created_at: field("created_at")?,
            completed_at: raw.get("completed_at").cloned(),
            result,
            error: raw.get("error").cloned(),
        }))
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.transition(job_id, "queued", JobStatus::Processing, &[])
            .await
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        result: &ExecutionResult,
    ) -> Result<(), StoreError> {
        let result_json = serde_json::to_string(result).map_err(backend)?;
        self.transition(
            job_id,
            "processing",
            JobStatus::Completed,
            &[("result", result_json), ("completed_at", now_epoch_secs())],
        )
        .await
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        partial: Option<&ExecutionResult>,
    ) -> Result<(), StoreError> {
        let mut fields = vec![
            ("error", error.to_string()),
            ("completed_at", now_epoch_secs()),
        ];
        if let Some(result) = partial {
            fields.push(("result", serde_json::to_string(result).map_err(backend)?));
        }
        self.transition(job_id, "queued,processing", JobStatus::Failed, &fields)
            .await
    }

    async fn consume_token(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        // GETDEL makes consumption atomic: no second caller can observe the
        // key between the read and the delete.
        let mut conn = self.conn.clone();
        let bound: Option<String> = conn.get_del(token_key(token)).await.map_err(backend)?;
        Ok(bound.and_then(|id| Uuid::parse_str(&id).ok()))
    }
}

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

struct StoredJob {
    job: Job,
    expires_at: Instant,
}

struct StoredToken {
    job_id: Uuid,
    expires_at: Instant,
}

pub struct MemoryJobStore {
    jobs: DashMap<Uuid, StoredJob>,
    tokens: DashMap<String, StoredToken>,
    job_ttl: Duration,
    token_ttl: Duration,
}

impl MemoryJobStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            jobs: DashMap::new(),
            tokens: DashMap::new(),
            job_ttl: Duration::from_secs(settings.job_ttl_secs),
            token_ttl: Duration::from_secs(settings.effective_token_ttl_secs()),
        }
    }

    fn transition(
        &self,
        job_id: Uuid,
        allowed_from: &[JobStatus],
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), StoreError> {
        let mut entry = self.jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;
        if entry.expires_at <= Instant::now() {
            return Err(StoreError::NotFound);
        }
        if !allowed_from.contains(&entry.job.status) {
            return Err(StoreError::IllegalTransition);
        }
        apply(&mut entry.job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        code: &str,
        language: Language,
        filename: &str,
    ) -> Result<CreatedJob, StoreError> {
        let job_id = Uuid::new_v4();
        let token = generate_token();
        let expires_at = (Utc::now() + chrono::Duration::seconds(self.token_ttl.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        self.jobs.insert(
            job_id,
            StoredJob {
                job: Job {
                    job_id,
                    code: code.to_string(),
                    language,
                    filename: filename.to_string(),
                    status: JobStatus::Queued,
                    created_at: now_epoch_secs(),
                    completed_at: None,
                    result: None,
                    error: None,
                },
                expires_at: Instant::now() + self.job_ttl,
            },
        );
        self.tokens.insert(
            token.clone(),
            StoredToken {
                job_id,
                expires_at: Instant::now() + self.token_ttl,
            },
        );

        Ok(CreatedJob {
            job_id,
            token,
            expires_at,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        match self.jobs.get(&job_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.job.clone())),
            _ => Ok(None),
        }
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.transition(job_id, &[JobStatus::Queued], |job| {
            job.status = JobStatus::Processing;
        })
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        result: &ExecutionResult,
    ) -> Result<(), StoreError> {
        self.transition(job_id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result.clone());
            job.completed_at = Some(now_epoch_secs());
        })
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        partial: Option<&ExecutionResult>,
    ) -> Result<(), StoreError> {
        self.transition(
            job_id,
            &[JobStatus::Queued, JobStatus::Processing],
            |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.result = partial.cloned();
                job.completed_at = Some(now_epoch_secs());
            },
        )
    }

    async fn consume_token(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        // Constant-time comparison over the stored secrets; the match is
        // removed before its job id is revealed.
        let mut matched: Option<String> = None;
        for entry in self.tokens.iter() {
            let key = entry.key();
            if key.len() == token.len()
                && bool::from(key.as_bytes().ct_eq(token.as_bytes()))
            {
                matched = Some(key.clone());
                break;
            }
        }

        let Some(key) = matched else {
            return Ok(None);
        };
        let Some((_, stored)) = self.tokens.remove(&key) else {
            return Ok(None);
        };
        if stored.expires_at <= Instant::now() {
            return Ok(None);
        }
        Ok(Some(stored.job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> MemoryJobStore {
        MemoryJobStore::new(&Settings::default())
    }

    #[tokio::test]
    async fn test_create_starts_queued() {
        let store = memory_store();
        let created = store
            .create("print('hi')", Language::Python, "main.py")
            .await
            .unwrap();

        let job = store.get(created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.filename, "main.py");
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_are_monotone() {
        let store = memory_store();
        let created = store
            .create("print('hi')", Language::Python, "main.py")
            .await
            .unwrap();
        let id = created.job_id;

        let result = ExecutionResult {
            success: true,
            exit_code: 0,
            execution_time: 0.1,
            stdout: "hi\n".into(),
            stderr: String::new(),
        };

        // Completing a queued job skips a state and must fail.
        assert!(matches!(
            store.mark_completed(id, &result).await,
            Err(StoreError::IllegalTransition)
        ));

        store.mark_processing(id).await.unwrap();
        assert!(matches!(
            store.mark_processing(id).await,
            Err(StoreError::IllegalTransition)
        ));

        store.mark_completed(id, &result).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        // Terminal states are final.
        assert!(matches!(
            store.mark_failed(id, "late", None).await,
            Err(StoreError::IllegalTransition)
        ));
    }

    #[tokio::test]
    async fn test_mark_failed_from_queued_and_processing() {
        let store = memory_store();

        let a = store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();
        store.mark_failed(a.job_id, "rejected", None).await.unwrap();
        let job = store.get(a.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("rejected"));

        let b = store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();
        store.mark_processing(b.job_id).await.unwrap();
        store.mark_failed(b.job_id, "spawn error", None).await.unwrap();
        assert_eq!(
            store.get(b.job_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let store = memory_store();
        let created = store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();

        assert_eq!(
            store.consume_token(&created.token).await.unwrap(),
            Some(created.job_id)
        );
        assert_eq!(store.consume_token(&created.token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let store = memory_store();
        store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();
        assert_eq!(store.consume_token("not-a-token").await.unwrap(), None);
        assert_eq!(
            store.consume_token(&"a".repeat(TOKEN_LEN)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mut settings = Settings::default();
        settings.token_ttl_secs = 0;
        let store = MemoryJobStore::new(&settings);
        let created = store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();
        assert_eq!(store.consume_token(&created.token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_job_not_found() {
        let mut settings = Settings::default();
        settings.job_ttl_secs = 0;
        let store = MemoryJobStore::new(&settings);
        let created = store
            .create("x", Language::Python, "main.py")
            .await
            .unwrap();
        assert!(store.get(created.job_id).await.unwrap().is_none());
        assert!(matches!(
            store.mark_processing(created.job_id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_tokens_are_unique_and_long_enough() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);
    }
}
