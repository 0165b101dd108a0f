use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use docwriter_types::{
    DocumentIndexRow, JobRecord, StagePhase, StatusEvent, TimelineEvent,
};

use crate::StoreError;

const TIMELINE_CAP: usize = 10_000;

/// Keyed store of per-job status rows, the append-only event timeline, the
/// per-owner document index, and small atomic counters used for
/// coordination (diagram fan-in, memory versions). State lives in maps and
/// is flushed to JSON files under the base directory.
pub struct StatusStore {
    base: PathBuf,
    jobs: RwLock<HashMap<String, JobRecord>>,
    index: RwLock<HashMap<String, HashMap<String, DocumentIndexRow>>>,
    timelines: RwLock<HashMap<String, Vec<TimelineEvent>>>,
    counters: RwLock<HashMap<String, u64>>,
}

async fn load_map<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

impl StatusStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            jobs: RwLock::new(load_map(&base.join("jobs.json")).await),
            index: RwLock::new(load_map(&base.join("index.json")).await),
            timelines: RwLock::new(load_map(&base.join("timelines.json")).await),
            counters: RwLock::new(load_map(&base.join("counters.json")).await),
            base,
        })
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let jobs = self.jobs.read().await;
        fs::write(
            self.base.join("jobs.json"),
            serde_json::to_vec_pretty(&*jobs)?,
        )
        .await?;
        drop(jobs);
        let index = self.index.read().await;
        fs::write(
            self.base.join("index.json"),
            serde_json::to_vec_pretty(&*index)?,
        )
        .await?;
        drop(index);
        let timelines = self.timelines.read().await;
        fs::write(
            self.base.join("timelines.json"),
            serde_json::to_vec_pretty(&*timelines)?,
        )
        .await?;
        drop(timelines);
        let counters = self.counters.read().await;
        fs::write(
            self.base.join("counters.json"),
            serde_json::to_vec_pretty(&*counters)?,
        )
        .await?;
        Ok(())
    }

    /// Create the job row and its index entry at admission time.
    pub async fn admit(&self, record: JobRecord) -> Result<(), StoreError> {
        {
            let mut jobs = self.jobs.write().await;
            let mut index = self.index.write().await;
            index
                .entry(record.owner_id.clone())
                .or_default()
                .insert(record.job_id.clone(), DocumentIndexRow::from(&record));
            jobs.insert(record.job_id.clone(), record);
        }
        self.flush().await
    }

    /// Owner-enforced lookup: a job owned by someone else is
    /// `NotAuthorized`, never `NotFound`.
    pub async fn get_job(&self, owner_id: &str, job_id: &str) -> Result<JobRecord, StoreError> {
        let jobs = self.jobs.read().await;
        match jobs.get(job_id) {
            None => Err(StoreError::NotFound(job_id.to_string())),
            Some(record) if record.owner_id != owner_id => Err(StoreError::NotAuthorized {
                owner_id: owner_id.to_string(),
                job_id: job_id.to_string(),
            }),
            Some(record) => Ok(record.clone()),
        }
    }

    /// Fold one status event into the job row, the timeline, and the
    /// document index. Replayed events (same identity) are no-ops.
    pub async fn apply_event(&self, event: &StatusEvent) -> Result<(), StoreError> {
        {
            let mut jobs = self.jobs.write().await;
            let record = jobs
                .entry(event.job_id.clone())
                .or_insert_with(|| {
                    JobRecord::admitted(
                        event.owner_id.clone(),
                        event.job_id.clone(),
                        "",
                        "",
                        1,
                    )
                });
            if record.owner_id != event.owner_id {
                warn!(
                    job_id = %event.job_id,
                    "status event owner does not match job row; dropping"
                );
                return Err(StoreError::NotAuthorized {
                    owner_id: event.owner_id.clone(),
                    job_id: event.job_id.clone(),
                });
            }
            record.stage = event.stage;
            if event.cycle.is_some() {
                record.cycle = event.cycle;
            }
            if let Some(message) = &event.message {
                record.message = message.clone();
            }
            if let Some(artifact) = &event.artifact {
                record.artifact = Some(artifact.clone());
            }
            if let Some(done) = event.cycles_completed {
                record.cycles_completed = done;
            }
            match event.phase {
                StagePhase::Failed => {
                    record.has_error = true;
                    record.last_error = event.message.clone();
                }
                StagePhase::Done => {
                    record.has_error = false;
                }
                _ => {}
            }
            record.updated_at = event.ts;

            let mut timelines = self.timelines.write().await;
            let timeline = timelines.entry(event.job_id.clone()).or_default();
            let identity = event.identity();
            if timeline.iter().all(|e| e.identity() != identity) {
                timeline.push(TimelineEvent::from(event.clone()));
                timeline.sort_by_key(|e| e.ts);
                if timeline.len() > TIMELINE_CAP {
                    let excess = timeline.len() - TIMELINE_CAP;
                    timeline.drain(..excess);
                }
            }

            let mut index = self.index.write().await;
            index
                .entry(record.owner_id.clone())
                .or_default()
                .insert(record.job_id.clone(), DocumentIndexRow::from(&*record));
        }
        self.flush().await
    }

    pub async fn timeline(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        self.get_job(owner_id, job_id).await?;
        let timelines = self.timelines.read().await;
        Ok(timelines.get(job_id).cloned().unwrap_or_default())
    }

    pub async fn list_documents(&self, owner_id: &str) -> Vec<DocumentIndexRow> {
        let index = self.index.read().await;
        let mut rows: Vec<DocumentIndexRow> = index
            .get(owner_id)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    pub async fn set_cancelled(&self, owner_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.get_job(owner_id, job_id).await?;
        {
            let mut jobs = self.jobs.write().await;
            if let Some(record) = jobs.get_mut(job_id) {
                record.cancelled = true;
            }
        }
        self.flush().await
    }

    pub async fn clear_error(&self, owner_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.get_job(owner_id, job_id).await?;
        {
            let mut jobs = self.jobs.write().await;
            if let Some(record) = jobs.get_mut(job_id) {
                record.has_error = false;
                record.last_error = None;
            }
        }
        self.flush().await
    }

    /// Atomic add; returns the new value. Used for fan-in decisions such as
    /// "last diagram rendered".
    pub async fn increment_counter(&self, key: &str, by: u64) -> Result<u64, StoreError> {
        let value = {
            let mut counters = self.counters.write().await;
            let slot = counters.entry(key.to_string()).or_insert(0);
            *slot += by;
            *slot
        };
        self.flush().await?;
        Ok(value)
    }

    pub async fn get_counter(&self, key: &str) -> u64 {
        *self.counters.read().await.get(key).unwrap_or(&0)
    }

    /// Optimistic concurrency control: succeeds only when the counter still
    /// holds `expected`, then advances it to `next`.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        next: u64,
    ) -> Result<(), StoreError> {
        {
            let mut counters = self.counters.write().await;
            let slot = counters.entry(key.to_string()).or_insert(0);
            if *slot != expected {
                return Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    found: *slot,
                });
            }
            *slot = next;
        }
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwriter_types::JobStage;

    async fn store() -> (tempfile::TempDir, StatusStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StatusStore::new(dir.path()).await.expect("store");
        (dir, store)
    }

    fn event(stage: JobStage, phase: StagePhase) -> StatusEvent {
        StatusEvent::new("u1", "j1", stage, phase)
    }

    #[tokio::test]
    async fn admission_creates_row_and_index_entry() {
        let (_dir, store) = store().await;
        store
            .admit(JobRecord::admitted("u1", "j1", "Title", "Audience", 2))
            .await
            .expect("admit");
        let record = store.get_job("u1", "j1").await.expect("job");
        assert_eq!(record.title, "Title");
        assert_eq!(store.list_documents("u1").await.len(), 1);
        assert!(store.list_documents("u2").await.is_empty());
    }

    #[tokio::test]
    async fn cross_owner_lookup_is_not_authorized() {
        let (_dir, store) = store().await;
        store
            .admit(JobRecord::admitted("u1", "j1", "T", "A", 1))
            .await
            .expect("admit");
        assert!(matches!(
            store.get_job("u2", "j1").await,
            Err(StoreError::NotAuthorized { .. })
        ));
        assert!(matches!(
            store.get_job("u1", "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn events_update_row_and_append_timeline_once() {
        let (_dir, store) = store().await;
        store
            .admit(JobRecord::admitted("u1", "j1", "T", "A", 2))
            .await
            .expect("admit");
        let mut done = event(JobStage::Plan, StagePhase::Done);
        done.message = Some("planned".to_string());
        done.artifact = Some("jobs/u1/j1/plan.json".to_string());
        store.apply_event(&done).await.expect("apply");
        store.apply_event(&done).await.expect("replay");

        let record = store.get_job("u1", "j1").await.expect("job");
        assert_eq!(record.stage, JobStage::Plan);
        assert_eq!(record.message, "planned");
        assert_eq!(record.artifact.as_deref(), Some("jobs/u1/j1/plan.json"));
        let timeline = store.timeline("u1", "j1").await.expect("timeline");
        assert_eq!(timeline.len(), 1, "replayed event must not duplicate");
    }

    #[tokio::test]
    async fn failed_sets_error_and_done_clears_it() {
        let (_dir, store) = store().await;
        store
            .admit(JobRecord::admitted("u1", "j1", "T", "A", 2))
            .await
            .expect("admit");
        let mut failed = event(JobStage::Write, StagePhase::Failed);
        failed.message = Some("transient: model unavailable".to_string());
        store.apply_event(&failed).await.expect("apply");
        let record = store.get_job("u1", "j1").await.expect("job");
        assert!(record.has_error);
        assert_eq!(
            record.last_error.as_deref(),
            Some("transient: model unavailable")
        );

        store
            .apply_event(&event(JobStage::Write, StagePhase::Done))
            .await
            .expect("apply");
        assert!(!store.get_job("u1", "j1").await.expect("job").has_error);
    }

    #[tokio::test]
    async fn timeline_orders_late_events_by_timestamp() {
        let (_dir, store) = store().await;
        store
            .admit(JobRecord::admitted("u1", "j1", "T", "A", 2))
            .await
            .expect("admit");
        let later = event(JobStage::Write, StagePhase::Done);
        let mut earlier = event(JobStage::Write, StagePhase::Start);
        earlier.ts = later.ts - chrono::Duration::seconds(5);
        store.apply_event(&later).await.expect("apply");
        store.apply_event(&earlier).await.expect("apply late");
        let timeline = store.timeline("u1", "j1").await.expect("timeline");
        assert_eq!(timeline[0].phase, StagePhase::Start);
        assert_eq!(timeline[1].phase, StagePhase::Done);
    }

    #[tokio::test]
    async fn counters_increment_and_cas() {
        let (_dir, store) = store().await;
        assert_eq!(store.increment_counter("k", 1).await.expect("inc"), 1);
        assert_eq!(store.increment_counter("k", 1).await.expect("inc"), 2);
        store.compare_and_swap("v", 0, 1).await.expect("cas");
        assert!(matches!(
            store.compare_and_swap("v", 0, 2).await,
            Err(StoreError::VersionConflict { found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = StatusStore::new(dir.path()).await.expect("store");
            store
                .admit(JobRecord::admitted("u1", "j1", "T", "A", 3))
                .await
                .expect("admit");
            store.increment_counter("k", 7).await.expect("inc");
        }
        let store = StatusStore::new(dir.path()).await.expect("reload");
        assert_eq!(store.get_job("u1", "j1").await.expect("job").cycles_requested, 3);
        assert_eq!(store.get_counter("k").await, 7);
    }
}
