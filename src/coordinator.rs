use crate::connection::ErrorClass;
use crate::device::{self, Device};
use crate::extract::FieldMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Fields of the device as of the last successful poll.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Snapshot {
    pub taken_at: jiff::Timestamp,
    pub fields: FieldMap,
}

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("device no longer accepts the configured credentials")]
    AuthenticationRequired(#[source] device::Error),
    #[error("could not update the readings of the device")]
    UpdateFailed(#[source] device::Error),
}

impl From<device::Error> for UpdateError {
    fn from(error: device::Error) -> Self {
        match error.class() {
            ErrorClass::Authentication => UpdateError::AuthenticationRequired(error),
            ErrorClass::Communication | ErrorClass::General => UpdateError::UpdateFailed(error),
        }
    }
}

#[derive(Clone, Debug)]
pub enum UpdateEvent {
    Updated(Arc<Snapshot>),
    Failed(Arc<UpdateError>),
}

/// Polls the device periodically and keeps hold of the most recent [`Snapshot`].
pub struct Coordinator {
    device: Device,
    interval: Duration,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    events: broadcast::Sender<UpdateEvent>,
}

impl Coordinator {
    pub fn new(device: Device, interval: Duration) -> Self {
        let (snapshot, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        Self {
            device,
            interval,
            snapshot,
            events,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Run a single poll cycle.
    ///
    /// A failed cycle leaves the previous snapshot in place.
    pub async fn refresh(&mut self) -> Result<Arc<Snapshot>, Arc<UpdateError>> {
        match self.device.fetch_all().await {
            Ok(fields) => {
                let snapshot = Arc::new(Snapshot {
                    taken_at: jiff::Timestamp::now(),
                    fields,
                });
                self.snapshot.send_replace(Some(Arc::clone(&snapshot)));
                debug!(message = "snapshot updated", fields = snapshot.fields.len());
                let event = UpdateEvent::Updated(Arc::clone(&snapshot));
                let _ignore_no_receivers = self.events.send(event);
                Ok(snapshot)
            }
            Err(e) => {
                let error = Arc::new(UpdateError::from(e));
                warn!(
                    message = "poll cycle failed",
                    error = (&*error as &dyn std::error::Error)
                );
                let event = UpdateEvent::Failed(Arc::clone(&error));
                let _ignore_no_receivers = self.events.send(event);
                Err(error)
            }
        }
    }

    /// Keep refreshing in the background, starting right away.
    pub fn spawn(mut self) -> CoordinatorHandle {
        let snapshot = self.subscribe();
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let _failures_are_broadcast = self.refresh().await;
            }
        }));
        CoordinatorHandle { task, snapshot }
    }
}

pub struct CoordinatorHandle {
    #[allow(unused)] // exists for its drop handler
    task: AbortOnDropHandle<()>,
    snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
}

impl CoordinatorHandle {
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Session;
    use crate::connection::tests::{credentials, session_for};
    use crate::device::{MergePolicy, POLLED_PAGES};
    use crate::extract::FieldValue;
    use mockito::Server;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    async fn serve_pages(server: &mut Server) -> Vec<mockito::Mock> {
        let mut mocks = Vec::new();
        for page in POLLED_PAGES {
            let body = format!(r#"<PAGE><INPUT NAME="{page}" VALUE="x"/></PAGE>"#);
            let mock = server
                .mock("GET", format!("/{}", page.path()).as_str())
                .with_status(200)
                .with_body(body)
                .create_async()
                .await;
            mocks.push(mock);
        }
        mocks
    }

    /// Answers every request with the same page until `silent` is set, then stops answering.
    async fn flaky_device(silent: Arc<AtomicBool>) -> Session {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                if silent.load(Ordering::SeqCst) {
                    held.push(stream);
                    continue;
                }
                let mut request = Vec::new();
                let mut buffer = [0; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buffer[..n]),
                    }
                }
                let body = r#"<PAGE><INPUT NAME="__T1_REAL_.1f" VALUE="42.5"/></PAGE>"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/xml\r\ncontent-length: {}\r\n\
                     connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        let base = reqwest::Url::parse(&format!("http://{address}/")).unwrap();
        Session::new(base, credentials(), Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn failed_poll_keeps_previous_snapshot() {
        let mut server = Server::new_async().await;
        let mut mocks = serve_pages(&mut server).await;
        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let mut coordinator = Coordinator::new(device, DEFAULT_INTERVAL);
        let mut events = coordinator.events();
        let watcher = coordinator.subscribe();
        assert!(coordinator.snapshot().is_none());

        let first = coordinator.refresh().await.unwrap();
        assert_eq!(first.fields.len(), 3);
        assert!(
            matches!(events.try_recv(), Ok(UpdateEvent::Updated(s)) if Arc::ptr_eq(&s, &first))
        );
        assert!(Arc::ptr_eq(watcher.borrow().as_ref().unwrap(), &first));

        // Unmatched requests are answered with `501`.
        mocks.remove(1).remove_async().await;
        let error = coordinator.refresh().await.unwrap_err();
        assert!(matches!(*error, UpdateError::UpdateFailed(_)), "{error:?}");
        assert!(matches!(events.try_recv(), Ok(UpdateEvent::Failed(_))));
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &first));
        assert!(Arc::ptr_eq(watcher.borrow().as_ref().unwrap(), &first));
    }

    #[tokio::test]
    async fn timed_out_poll_keeps_previous_snapshot() {
        let silent = Arc::new(AtomicBool::new(false));
        let session = flaky_device(Arc::clone(&silent)).await;
        let device = Device::new(session, MergePolicy::Abort);
        let mut coordinator = Coordinator::new(device, DEFAULT_INTERVAL);

        let first = coordinator.refresh().await.unwrap();
        assert_eq!(first.fields["__T1_REAL_.1f"], FieldValue::Float(42.5));

        silent.store(true, Ordering::SeqCst);
        let error = coordinator.refresh().await.unwrap_err();
        let UpdateError::UpdateFailed(ref cause) = *error else {
            panic!("unexpected error: {error:?}");
        };
        assert_eq!(cause.class(), ErrorClass::Communication);
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &first));
    }

    #[tokio::test]
    async fn rejected_credentials_require_authentication() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/PAGE214.XML").with_status(403).create_async().await;
        let session = session_for(&server, Duration::from_secs(5));
        let device = Device::new(session, MergePolicy::SkipFailed);
        let mut coordinator = Coordinator::new(device, DEFAULT_INTERVAL);
        let mut events = coordinator.events();

        let error = coordinator.refresh().await.unwrap_err();
        assert!(matches!(*error, UpdateError::AuthenticationRequired(_)));
        match events.try_recv() {
            Ok(UpdateEvent::Failed(e)) => {
                assert!(matches!(*e, UpdateError::AuthenticationRequired(_)))
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(coordinator.snapshot().is_none());
    }

    #[tokio::test]
    async fn spawned_coordinator_publishes_snapshots() {
        let mut server = Server::new_async().await;
        serve_pages(&mut server).await;
        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let handle = Coordinator::new(device, Duration::from_secs(3600)).spawn();
        let mut watcher = handle.subscribe();

        let snapshot = watcher.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert_eq!(snapshot.fields.len(), 3);
        assert!(Arc::ptr_eq(&handle.snapshot().unwrap(), &snapshot));
    }
}
