use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::error::SpallocError;
use crate::messages::{
    JobMachineInfo, Machine, Request, Response, SessionId, SessionStatus, WhereIs,
};
use crate::transport::{LineReader, LineWriter, decode_response, encode_request, split_connection};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the allocation service.
    pub address: String,
    /// How long to wait for the reply of a single command.
    pub response_timeout: Duration,
    /// Pause between losing the connection and trying to connect again.
    pub reconnect_delay: Duration,
    /// How many times a command is sent before its transport error is returned.
    pub request_retries: u32,
}

impl ClientConfig {
    pub fn new(address: String) -> Self {
        Self {
            address,
            response_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            request_retries: 3,
        }
    }
}

struct ClientShared {
    config: ClientConfig,
    /// Replies to correlated commands.
    /// Holding this lock is what makes a caller the owner of the single outstanding request.
    responses: Mutex<mpsc::UnboundedReceiver<Response>>,
    writer: Mutex<Option<LineWriter>>,
    connected: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    /// Wakes the reader of the current connection so that it drops the connection.
    drop_connection: Notify,
}

/// Stream of session ids reported as changed by the service.
///
/// An empty batch is emitted after every (re)connection, because changes that happened while
/// disconnected were not delivered.
pub struct Notifications {
    receiver: mpsc::UnboundedReceiver<Vec<SessionId>>,
}

impl Notifications {
    /// Returns `None` once the client has been closed and its connection loop has ended.
    pub async fn next(&mut self) -> Option<Vec<SessionId>> {
        self.receiver.recv().await
    }
}

/// Handle used to issue commands to the allocation service. Cheap to clone.
#[derive(Clone)]
pub struct AllocatorClient {
    shared: Arc<ClientShared>,
}

/// Creates a client together with its notification stream and the connection loop.
///
/// The returned future has to be spawned; it connects, reads everything the service sends and
/// reconnects after failures until [`AllocatorClient::close`] is called.
pub fn create_allocator_client(
    config: ClientConfig,
) -> (
    AllocatorClient,
    Notifications,
    impl Future<Output = ()> + Send + 'static,
) {
    let (response_sender, response_receiver) = mpsc::unbounded_channel();
    let (notification_sender, notification_receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(ClientShared {
        config,
        responses: Mutex::new(response_receiver),
        writer: Mutex::new(None),
        connected: watch::Sender::new(false),
        closed: watch::Sender::new(false),
        drop_connection: Notify::new(),
    });
    let client = AllocatorClient {
        shared: shared.clone(),
    };
    let notifications = Notifications {
        receiver: notification_receiver,
    };
    let process = connection_loop(shared, response_sender, notification_sender);
    (client, notifications, process)
}

async fn connection_loop(
    shared: Arc<ClientShared>,
    response_sender: mpsc::UnboundedSender<Response>,
    notification_sender: mpsc::UnboundedSender<Vec<SessionId>>,
) {
    let address = shared.config.address.clone();
    let mut closed = shared.closed.subscribe();

    while !*closed.borrow() {
        let stream = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            stream = TcpStream::connect(address.as_str()) => stream,
        };
        match stream {
            Ok(stream) => {
                log::info!("Connected to allocation service at {address}");
                let (reader, writer) = split_connection(stream);
                *shared.writer.lock().await = Some(writer);
                shared.connected.send_replace(true);
                let _ = notification_sender.send(Vec::new());

                let result = read_loop(
                    &shared,
                    reader,
                    &response_sender,
                    &notification_sender,
                    &mut closed,
                )
                .await;

                shared.connected.send_replace(false);
                *shared.writer.lock().await = None;
                if let Err(error) = result {
                    if !*closed.borrow() {
                        log::error!("Error receiving from allocation service: {error}");
                    }
                }
            }
            Err(error) => {
                if !*closed.borrow() {
                    log::error!("Could not connect to allocation service at {address}: {error}");
                }
            }
        }

        if *closed.borrow() {
            break;
        }
        log::warn!(
            "Disconnected from allocation service, reconnecting in {:?}",
            shared.config.reconnect_delay
        );
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }
    shared.connected.send_replace(false);
    log::debug!("Allocation service connection loop has ended");
}

async fn read_loop(
    shared: &ClientShared,
    mut reader: LineReader,
    response_sender: &mpsc::UnboundedSender<Response>,
    notification_sender: &mpsc::UnboundedSender<Vec<SessionId>>,
    closed: &mut watch::Receiver<bool>,
) -> crate::Result<()> {
    let dropped = shared.drop_connection.notified();
    tokio::pin!(dropped);

    loop {
        let line = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return Ok(()),
            _ = &mut dropped => {
                log::debug!("Dropping connection to allocation service");
                return Ok(());
            }
            line = reader.next() => line,
        };
        let Some(line) = line else {
            log::debug!("Allocation service has closed the connection");
            return Ok(());
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        log::trace!("Received message: {line}");
        match decode_response(&line) {
            Ok(Response::JobsChanged(ids)) => {
                let _ = notification_sender.send(ids);
            }
            Ok(response) => {
                let _ = response_sender.send(response);
            }
            Err(error) => {
                log::error!("Unrecognized message from allocation service `{line}`: {error}");
            }
        }
    }
}

impl AllocatorClient {
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Stops the connection loop and fails every pending and future command with
    /// [`SpallocError::Closed`].
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
        self.shared.drop_connection.notify_waiters();
    }

    /// Waits until the connection loop has an established connection.
    pub async fn wait_for_connection(&self) -> crate::Result<()> {
        let mut connected = self.shared.connected.subscribe();
        let mut closed = self.shared.closed.subscribe();
        if !*connected.borrow() {
            log::debug!("Waiting for connection to allocation service");
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(SpallocError::Closed),
            result = connected.wait_for(|c| *c) => result.map(|_| ()).map_err(|_| SpallocError::Closed),
        }
    }

    /// Sends a command and waits for its reply.
    ///
    /// Only one command is in flight at any time; concurrent callers queue up in FIFO order.
    /// Transport failures drop the connection and the command is sent again once the
    /// connection is re-established, at most `request_retries` times.
    pub async fn call(&self, request: Request) -> crate::Result<Value> {
        let mut responses = self.shared.responses.lock().await;
        let attempts = self.shared.config.request_retries.max(1);
        let mut last_error = SpallocError::Closed;

        for attempt in 1..=attempts {
            self.wait_for_connection().await?;
            // Replies of exchanges that have timed out must not be taken for ours
            while responses.try_recv().is_ok() {}

            match self.exchange(&request, &mut responses).await {
                Ok(Response::Return(value)) => return Ok(value),
                Ok(Response::Exception(exception)) => {
                    let message = match exception {
                        Value::String(message) => message,
                        other => other.to_string(),
                    };
                    return Err(SpallocError::RemoteException(message));
                }
                Ok(Response::JobsChanged(_)) => {
                    last_error =
                        SpallocError::ProtocolError("notification in place of a reply".into());
                }
                Err(SpallocError::Closed) => return Err(SpallocError::Closed),
                Err(error) => {
                    log::debug!(
                        "Command `{}` failed (attempt {attempt}/{attempts}): {error}",
                        request.command
                    );
                    last_error = error;
                }
            }
            self.drop_connection().await;
        }
        Err(last_error)
    }

    async fn exchange(
        &self,
        request: &Request,
        responses: &mut mpsc::UnboundedReceiver<Response>,
    ) -> crate::Result<Response> {
        let message = encode_request(request)?;
        log::trace!("Sending message {message}");
        {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.send(message).await?,
                None => {
                    return Err(SpallocError::IoError(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "not connected to allocation service",
                    )));
                }
            }
        }

        let timeout = self.shared.config.response_timeout;
        let mut closed = self.shared.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(SpallocError::Closed),
            response = tokio::time::timeout(timeout, responses.recv()) => match response {
                Ok(Some(response)) => Ok(response),
                Ok(None) => Err(SpallocError::Closed),
                Err(_) => Err(SpallocError::Timeout(timeout)),
            },
        }
    }

    async fn drop_connection(&self) {
        *self.shared.writer.lock().await = None;
        self.shared.connected.send_replace(false);
        self.shared.drop_connection.notify_waiters();
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: Request) -> crate::Result<T> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_job(
        &self,
        boards: u32,
        owner: &str,
        tags: &[String],
    ) -> crate::Result<SessionId> {
        self.call_typed(Request::create_job(boards, owner, tags))
            .await
    }

    pub async fn destroy_job(&self, id: SessionId) -> crate::Result<()> {
        self.call(Request::destroy_job(id)).await.map(|_| ())
    }

    pub async fn job_state(&self, id: SessionId) -> crate::Result<SessionStatus> {
        self.call_typed(Request::get_job_state(id)).await
    }

    pub async fn job_machine_info(&self, id: SessionId) -> crate::Result<JobMachineInfo> {
        self.call_typed(Request::get_job_machine_info(id)).await
    }

    pub async fn notify_job(&self, id: SessionId, enable: bool) -> crate::Result<()> {
        let request = if enable {
            Request::notify_job(id)
        } else {
            Request::no_notify_job(id)
        };
        self.call(request).await.map(|_| ())
    }

    pub async fn keepalive(&self, id: SessionId) -> crate::Result<()> {
        self.call(Request::job_keepalive(id)).await.map(|_| ())
    }

    pub async fn list_machines(&self) -> crate::Result<Vec<Machine>> {
        self.call_typed(Request::list_machines()).await
    }

    pub async fn power_job_boards(&self, id: SessionId, power_on: bool) -> crate::Result<()> {
        let request = if power_on {
            Request::power_on_job_boards(id)
        } else {
            Request::power_off_job_boards(id)
        };
        self.call(request).await.map(|_| ())
    }

    /// Returns `None` when the chip is not part of the session's allocation.
    pub async fn where_is(
        &self,
        id: SessionId,
        chip_x: u32,
        chip_y: u32,
    ) -> crate::Result<Option<WhereIs>> {
        self.call_typed(Request::where_is(id, chip_x, chip_y)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::client::{ClientConfig, create_allocator_client};
    use crate::error::SpallocError;
    use crate::messages::SessionState;
    use crate::tests::server::{FakeAllocator, unused_address};

    fn test_config(address: String) -> ClientConfig {
        ClientConfig {
            address,
            response_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(50),
            request_retries: 2,
        }
    }

    #[tokio::test]
    async fn call_returns_reply() {
        let server = FakeAllocator::start(|request| match request["command"].as_str() {
            Some("create_job") => Some(json!({"return": 42})),
            Some("get_job_state") => Some(json!({"return": {"state": 3, "power": true}})),
            _ => Some(json!({"return": null})),
        })
        .await;
        let (client, _notifications, process) =
            create_allocator_client(test_config(server.address()));
        tokio::spawn(process);

        let id = client.create_job(3, "tester", &[]).await.unwrap();
        assert_eq!(id, 42);
        let status = client.job_state(id).await.unwrap();
        assert_eq!(status.state, SessionState::Ready);
        client.keepalive(id).await.unwrap();

        let commands = server.received();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0]["command"], "create_job");
        assert_eq!(commands[0]["args"], json!([3]));
        assert_eq!(commands[0]["kwargs"]["owner"], "tester");
        assert_eq!(commands[2]["command"], "job_keepalive");
        client.close();
    }

    #[tokio::test]
    async fn exception_is_not_retried() {
        let server =
            FakeAllocator::start(|_| Some(json!({"exception": "No such job 5"}))).await;
        let (client, _notifications, process) =
            create_allocator_client(test_config(server.address()));
        tokio::spawn(process);

        match client.destroy_job(5).await {
            Err(SpallocError::RemoteException(message)) => assert_eq!(message, "No such job 5"),
            r => panic!("Unexpected result {r:?}"),
        }
        assert_eq!(server.received().len(), 1);
        client.close();
    }

    #[tokio::test]
    async fn missing_reply_times_out_after_retries() {
        let server = FakeAllocator::start(|_| None).await;
        let (client, _notifications, process) =
            create_allocator_client(test_config(server.address()));
        tokio::spawn(process);

        match client.keepalive(1).await {
            Err(SpallocError::Timeout(_)) => {}
            r => panic!("Unexpected result {r:?}"),
        }
        assert_eq!(server.received().len(), 2);
        client.close();
    }

    #[tokio::test]
    async fn notifications_are_delivered_independently() {
        let server = FakeAllocator::start(|_| Some(json!({"return": null}))).await;
        let (client, mut notifications, process) =
            create_allocator_client(test_config(server.address()));
        tokio::spawn(process);

        // Marker of the initial connection
        assert_eq!(notifications.next().await, Some(vec![]));

        server.send(json!({"jobs_changed": [3, 4]}));
        client.notify_job(3, true).await.unwrap();
        assert_eq!(notifications.next().await, Some(vec![3, 4]));
        client.close();
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let server = FakeAllocator::start(|_| Some(json!({"return": [] }))).await;
        let (client, mut notifications, process) =
            create_allocator_client(test_config(server.address()));
        tokio::spawn(process);

        assert_eq!(notifications.next().await, Some(vec![]));
        server.disconnect();
        assert_eq!(notifications.next().await, Some(vec![]));
        assert!(client.list_machines().await.unwrap().is_empty());
        assert_eq!(server.connection_count(), 2);
        client.close();
    }

    #[tokio::test]
    async fn close_unblocks_waiting_requests() {
        let address = unused_address().await;
        let (client, mut notifications, process) = create_allocator_client(test_config(address));
        let handle = tokio::spawn(process);

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.job_state(1).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_connected());
        client.close();

        assert!(matches!(waiting.await.unwrap(), Err(SpallocError::Closed)));
        handle.await.unwrap();
        assert_eq!(notifications.next().await, None);
    }
}
