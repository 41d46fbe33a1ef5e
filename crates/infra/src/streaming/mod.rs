//! Status streamer: server-sent event streams for jobs.
//!
//! Two modes share one event model ([`StreamEvent`]):
//! - chat jobs forward provider chunks as they arrive,
//! - long-running jobs are polled on a fixed interval until they finish.

pub mod chat;
pub mod event;
pub mod poll;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use pulse_ai::{ChatRequest, ModelTarget, ProviderRouter};
use pulse_core::{JobId, UserId};

pub use event::{DONE_DATA, JobProgress, StreamEvent, TIMEOUT_MESSAGE};
pub use poll::estimate_progress;

use crate::jobs::JobLifecycleManager;

pub type EventStream = BoxStream<'static, StreamEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamerConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 120,
        }
    }
}

impl StreamerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StatusStreamer {
    manager: Arc<JobLifecycleManager>,
    router: Arc<ProviderRouter>,
    config: StreamerConfig,
    shutdown: CancellationToken,
}

impl StatusStreamer {
    pub fn new(
        manager: Arc<JobLifecycleManager>,
        router: Arc<ProviderRouter>,
        config: StreamerConfig,
    ) -> Self {
        Self {
            manager,
            router,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends every open status stream (server shutdown).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> StreamerConfig {
        self.config
    }

    /// Run a created chat job and stream its output.
    ///
    /// Ends with `Done` after the job completed, or a single `Error`.
    pub fn stream_chat(&self, job_id: JobId, target: ModelTarget, request: ChatRequest) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(chat::drive_chat(
            self.manager.clone(),
            self.router.clone(),
            job_id,
            target,
            request,
            tx,
        ));
        UnboundedReceiverStream::new(rx).boxed()
    }

    /// Stream status snapshots of one of `user_id`'s jobs until it finishes.
    pub fn stream_job_status(&self, user_id: UserId, job_id: JobId) -> EventStream {
        poll::poll_job(
            self.manager.clone(),
            user_id,
            job_id,
            self.config.poll_interval,
            self.config.max_attempts,
            self.shutdown.child_token(),
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_ai::{ChatMessage, Provider, ProviderKind, ScriptedProvider};
    use pulse_billing::PlanTier;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::jobs::{InMemoryJobStore, JobOutput, JobStatus, JobUsage, NewJob};
    use crate::ledger::{InMemoryLedgerStore, UsageLedger};

    async fn test_streamer(provider: ScriptedProvider) -> (StatusStreamer, Arc<JobLifecycleManager>, UserId) {
        let ledger = UsageLedger::new(InMemoryLedgerStore::arc());
        let user = UserId::new();
        ledger.open_subscription(user, PlanTier::Plus).await.unwrap();
        let manager = Arc::new(JobLifecycleManager::new(InMemoryJobStore::arc(), ledger));
        let router = ProviderRouter::builder()
            .with_provider(ProviderKind::OpenAi, Provider::Scripted(provider))
            .build();
        let streamer = StatusStreamer::new(manager.clone(), Arc::new(router), StreamerConfig::default());
        (streamer, manager, user)
    }

    async fn chat_job(manager: &JobLifecycleManager, user: UserId) -> (JobId, ModelTarget, ChatRequest) {
        let params = json!({
            "provider": "openai",
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Greet me"}],
        });
        let job = manager.create(user, NewJob::new(crate::jobs::JobKind::Chat, params)).await.unwrap();
        let request = ChatRequest::new("gpt-4", vec![ChatMessage::user("Greet me")]);
        (job.id, ModelTarget::new(ProviderKind::OpenAi, "gpt-4"), request)
    }

    async fn wait_for_status(manager: &JobLifecycleManager, job_id: JobId, status: JobStatus) {
        for _ in 0..1000 {
            if manager.load(job_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached {status}");
    }

    #[tokio::test]
    async fn chat_chunks_are_forwarded_in_order_then_done() {
        let (streamer, manager, user) =
            test_streamer(ScriptedProvider::chunks(["Hel", "lo", " world"])).await;
        let (job_id, target, request) = chat_job(&manager, user).await;

        let events: Vec<StreamEvent> = streamer.stream_chat(job_id, target, request).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::chunk("Hel"),
                StreamEvent::chunk("lo"),
                StreamEvent::chunk(" world"),
                StreamEvent::Chunk {
                    content: String::new(),
                    finish_reason: Some("stop".to_string()),
                },
                StreamEvent::Done,
            ]
        );

        let job = manager.get(user, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_text.as_deref(), Some("Hello world"));
        let usage = job.usage.unwrap();
        assert!(usage.approximate);
        let summary = manager.ledger().summary(user).await.unwrap();
        assert_eq!(summary.usage.chat_tokens.used, usage.amount);
        assert_eq!(summary.usage.chat_tokens.reserved, 0);
    }

    #[tokio::test]
    async fn disconnected_client_does_not_stop_the_job() {
        let provider = ScriptedProvider::chunks(["a", "b", "c", "d"])
            .with_chunk_delay(Duration::from_millis(10));
        let (streamer, manager, user) = test_streamer(provider).await;
        let (job_id, target, request) = chat_job(&manager, user).await;

        let mut stream = streamer.stream_chat(job_id, target, request);
        assert_eq!(stream.next().await, Some(StreamEvent::chunk("a")));
        drop(stream);

        wait_for_status(&manager, job_id, JobStatus::Completed).await;
        let job = manager.load(job_id).await.unwrap();
        assert_eq!(job.result_text.as_deref(), Some("abcd"));
        assert!(manager.ledger().reconcile(user).await.unwrap());
    }

    #[tokio::test]
    async fn provider_failure_mid_stream_fails_the_job_with_partial_usage() {
        let provider = ScriptedProvider::failing_after(["partial answer"], "connection reset");
        let (streamer, manager, user) = test_streamer(provider).await;
        let (job_id, target, request) = chat_job(&manager, user).await;

        let events: Vec<StreamEvent> = streamer.stream_chat(job_id, target, request).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], StreamEvent::Error { message } if !message.contains("reset")));

        let job = manager.load(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("connection reset"));
        let summary = manager.ledger().summary(user).await.unwrap();
        assert!(summary.usage.chat_tokens.used > 0);
        assert_eq!(summary.usage.chat_tokens.reserved, 0);
    }

    #[tokio::test]
    async fn cancelling_mid_stream_ends_with_an_error_and_charges_what_was_streamed() {
        let provider = ScriptedProvider::chunks(["one", " two", " three"])
            .with_chunk_delay(Duration::from_millis(20));
        let (streamer, manager, user) = test_streamer(provider).await;
        let (job_id, target, request) = chat_job(&manager, user).await;

        let mut stream = streamer.stream_chat(job_id, target, request);
        assert_eq!(stream.next().await, Some(StreamEvent::chunk("one")));
        manager.cancel(user, job_id, None).await.unwrap();

        let rest: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(rest.last(), Some(&StreamEvent::error(chat::CANCELLED_MESSAGE)));

        let job = manager.load(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        let summary = manager.ledger().summary(user).await.unwrap();
        assert!(summary.usage.chat_tokens.used > 0);
        assert_eq!(summary.usage.chat_tokens.reserved, 0);
        assert!(manager.ledger().reconcile(user).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn video_status_stream_tracks_the_worker_and_ends_with_done() {
        let (streamer, manager, user) = test_streamer(ScriptedProvider::echo()).await;
        let job = manager
            .create(user, NewJob::new(crate::jobs::JobKind::Video, json!({"duration": 4})))
            .await
            .unwrap();

        let worker = {
            let manager = manager.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                manager.begin(job_id).await.unwrap();
                tokio::time::sleep(Duration::from_secs(9)).await;
                manager
                    .complete(
                        job_id,
                        JobOutput::url("https://cdn.example.com/v.mp4"),
                        JobUsage::new(pulse_billing::ResourceKind::VideoSeconds, 4),
                    )
                    .await
                    .unwrap();
            })
        };

        let started = Instant::now();
        let events: Vec<StreamEvent> = streamer.stream_job_status(user, job.id).collect().await;
        worker.await.unwrap();

        // Completed on the fourth read: t = 0, 5, 10, 15.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let snapshots: Vec<&JobProgress> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect();
        let statuses: Vec<JobStatus> = snapshots.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Processing,
                JobStatus::Completed,
            ]
        );
        assert!(snapshots.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert_eq!(snapshots.last().unwrap().progress, 100);
        assert_eq!(
            snapshots.last().unwrap().result_url.as_deref(),
            Some("https://cdn.example.com/v.mp4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_stream_times_out_after_its_attempt_budget() {
        let (streamer, manager, user) = test_streamer(ScriptedProvider::echo()).await;
        let streamer = StatusStreamer::new(
            manager.clone(),
            streamer.router.clone(),
            StreamerConfig::default().with_max_attempts(3),
        );
        let job = manager
            .create(user, NewJob::new(crate::jobs::JobKind::Video, json!({})))
            .await
            .unwrap();

        let events: Vec<StreamEvent> = streamer.stream_job_status(user, job.id).collect().await;
        assert_eq!(events.len(), 4);
        assert_eq!(events.last(), Some(&StreamEvent::Timeout));
    }

    #[tokio::test]
    async fn status_of_someone_elses_job_is_an_error() {
        let (streamer, manager, user) = test_streamer(ScriptedProvider::echo()).await;
        let job = manager
            .create(user, NewJob::new(crate::jobs::JobKind::Cv, json!({})))
            .await
            .unwrap();

        let events: Vec<StreamEvent> = streamer.stream_job_status(UserId::new(), job.id).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }
}
