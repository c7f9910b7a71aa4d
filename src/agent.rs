//! Agent wiring: startup order, background tasks and shutdown.

use crate::api::ServerClient;
use crate::cache::MediaCache;
use crate::config::Settings;
use crate::display::{DisplayCommand, DisplayHandle};
use crate::error::Result;
use crate::heartbeat::spawn_heartbeat;
use crate::identity::{effective_device_id, IdentityResolver};
use crate::logs::{spawn_log_flush, PlaybackLog};
use crate::scheduler::{PlaybackState, Scheduler, SchedulerSettings};
use crate::store::Store;
use crate::sync::{spawn_playlist_sync, PlaylistSync};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct Agent {
    settings: Settings,
    store: Arc<Store>,
    api: ServerClient,
}

/// Background tasks aborted together when the agent stops.
#[derive(Default)]
struct TaskSet(Vec<JoinHandle<()>>);

impl TaskSet {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// A started agent. Dropping it stops every background task.
pub struct RunningAgent {
    pub device_id: String,
    pub sync: Arc<PlaylistSync>,
    pub log: Arc<PlaybackLog>,
    pub state: watch::Receiver<PlaybackState>,
    scheduler: JoinHandle<()>,
    _tasks: TaskSet,
}

impl RunningAgent {
    /// Wait for playback to end (the display closed).
    pub async fn wait(mut self) {
        if let Err(e) = (&mut self.scheduler).await {
            tracing::error!("Scheduler task failed: {}", e);
        }
    }
}

impl Agent {
    pub fn new(settings: Settings) -> Result<Self> {
        let store = Arc::new(Store::open(&settings.data_dir, settings.logs.max_unsynced)?);
        let api = ServerClient::new(
            &settings.server.base_url,
            settings.request_timeout(),
            settings.media_timeout(),
        )?;
        Ok(Self {
            settings,
            store,
            api,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Start the agent and play until the display closes.
    pub async fn run(self, display: DisplayHandle) -> Result<()> {
        let running = self.start(display).await?;
        running.wait().await;
        Ok(())
    }

    /// Resolve the device identity, publish whatever playlist is on disk and
    /// start the periodic tasks and the scheduler.
    pub async fn start(self, display: DisplayHandle) -> Result<RunningAgent> {
        let Agent {
            settings,
            store,
            api,
        } = self;

        let resolver = IdentityResolver::new(store.clone(), api.clone());
        let supplied = settings.device_id.as_deref();
        let mut identity = resolver.resolve(supplied).await;

        if settings.identity.refresh_on_start {
            if let Ok(device_id) = effective_device_id(supplied, identity.as_ref()) {
                match resolver.refresh(&device_id).await {
                    Ok(fresh) => identity = Some(fresh),
                    Err(e) => tracing::warn!("Identity refresh failed, keeping current record: {}", e),
                }
            }
        }

        let device_id = match effective_device_id(supplied, identity.as_ref()) {
            Ok(device_id) => device_id,
            Err(e) => {
                let _ = display.commands.send(DisplayCommand::ShowError {
                    message: "No device id configured".into(),
                });
                return Err(e);
            }
        };
        tracing::info!("Running as device {}", device_id);

        let cache = Arc::new(MediaCache::new(
            store.clone(),
            api.clone(),
            settings.cache.fetch_attempts,
            Duration::from_millis(settings.cache.retry_backoff_ms),
        ));
        let sync = Arc::new(PlaylistSync::new(store.clone(), api.clone(), cache.clone()));
        sync.prime().await;
        let log = Arc::new(PlaybackLog::new(store, api.clone()));

        let mut tasks = TaskSet::default();
        tasks.push(spawn_playlist_sync(
            sync.clone(),
            device_id.clone(),
            settings.intervals.playlist_sync(),
        ));
        tasks.push(spawn_log_flush(log.clone(), settings.intervals.log_flush()));
        tasks.push(spawn_heartbeat(
            api,
            device_id.clone(),
            settings.intervals.heartbeat(),
        ));
        tasks.push(spawn_connectivity(
            sync.connectivity(),
            display.commands.clone(),
        ));

        let scheduler = Scheduler::new(
            device_id.clone(),
            sync.subscribe(),
            cache,
            log.clone(),
            display,
            SchedulerSettings::from(&settings.playback),
        );
        let state = scheduler.state();
        let scheduler = tokio::spawn(scheduler.run());

        Ok(RunningAgent {
            device_id,
            sync,
            log,
            state,
            scheduler,
            _tasks: tasks,
        })
    }
}

/// Mirror the online flag onto the display's offline badge.
fn spawn_connectivity(
    mut online: watch::Receiver<bool>,
    commands: mpsc::UnboundedSender<DisplayCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *online.borrow_and_update();
            if commands
                .send(DisplayCommand::Connectivity { online: current })
                .is_err()
            {
                break;
            }
            if online.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::link;
    use crate::error::AgentError;

    fn settings(dir: &std::path::Path, device_id: Option<&str>) -> Settings {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut settings = Settings::default();
        settings.device_id = device_id.map(str::to_string);
        settings.data_dir = dir.to_path_buf();
        settings.server.base_url = format!("http://127.0.0.1:{}", port);
        settings.server.request_timeout_secs = 1;
        settings
    }

    #[tokio::test]
    async fn test_start_without_any_device_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(settings(dir.path(), None)).unwrap();
        let (handle, _port) = link();

        let err = agent.start(handle).await.err().unwrap();
        assert!(matches!(err, AgentError::MissingDeviceId));
    }

    #[tokio::test]
    async fn test_offline_start_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(settings(dir.path(), Some("dev-1"))).unwrap();
        let (handle, mut port) = link();

        let mut running = agent.start(handle).await.unwrap();
        assert_eq!(running.device_id, "dev-1");

        running
            .state
            .wait_for(|s| matches!(s, PlaybackState::Error { .. }))
            .await
            .unwrap();
        assert!(!running.sync.is_online());

        let mut saw_offline_badge = false;
        while let Ok(command) = port.commands.try_recv() {
            if command == (DisplayCommand::Connectivity { online: false }) {
                saw_offline_badge = true;
            }
        }
        assert!(saw_offline_badge);
    }
}
