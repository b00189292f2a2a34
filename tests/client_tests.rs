use async_trait::async_trait;
use flagsync::{
    ClientComponents, ConnectionState, ConnectionStatus, DataSource, DataSourceContext,
    DataSourceError, DataSourceFactory, ErrorCode, ErrorKind, FlagChange, FlagSyncClient,
    FlagSyncOptions, Identity, InMemoryStorage, Item, Snapshot, TestData,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(2);

fn options() -> FlagSyncOptions {
    FlagSyncOptions::new("mob-test-key")
}

fn client_for(test_data: &TestData, identity: &str) -> FlagSyncClient {
    FlagSyncClient::with_components(
        options(),
        Identity::new(identity),
        ClientComponents::default().data_source_factory(Arc::new(test_data.clone())),
    )
    .unwrap()
}

async fn wait_for_state(client: &FlagSyncClient, state: ConnectionState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.status().state != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}, still {}",
            state,
            client.status().state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Source that never receives data; stands in for a network that has not
/// answered yet.
struct PendingSource {
    disposed: watch::Sender<bool>,
}

#[async_trait]
impl DataSource for PendingSource {
    async fn start(&self) -> bool {
        let mut disposed = self.disposed.subscribe();
        let _ = disposed.wait_for(|disposed| *disposed).await;
        false
    }

    fn is_initialized(&self) -> bool {
        false
    }

    async fn dispose(&self) {
        self.disposed.send_replace(true);
    }
}

struct PendingFactory;

impl DataSourceFactory for PendingFactory {
    fn build(&self, _context: DataSourceContext) -> Arc<dyn DataSource> {
        let (disposed, _) = watch::channel(false);
        Arc::new(PendingSource { disposed })
    }
}

/// Source driven by hand. It keeps the sink it was built with and never
/// checks whether it was disposed, so writes after a replacement reach the
/// sink.
struct ManualSource {
    context: DataSourceContext,
    outcome: watch::Sender<Option<bool>>,
}

impl ManualSource {
    fn deliver(&self, snapshot: Snapshot) {
        self.context.sink.init(&self.context.identity, snapshot);
        self.context
            .sink
            .update_status(Some(ConnectionState::Valid), None);
        self.outcome.send_replace(Some(true));
    }

    fn upsert(&self, item: Item) {
        self.context.sink.upsert(&self.context.identity, item);
    }

    fn interrupt(&self) {
        self.context.sink.update_status(
            Some(ConnectionState::Interrupted),
            Some(DataSourceError::network("connection reset")),
        );
    }
}

#[async_trait]
impl DataSource for ManualSource {
    async fn start(&self) -> bool {
        let mut outcome = self.outcome.subscribe();
        let started = match outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.unwrap_or(false),
            Err(_) => false,
        };
        started
    }

    fn is_initialized(&self) -> bool {
        *self.outcome.borrow() == Some(true)
    }

    async fn dispose(&self) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(false);
            true
        });
    }
}

#[derive(Default)]
struct ManualFactory {
    sources: Mutex<Vec<Arc<ManualSource>>>,
}

impl ManualFactory {
    fn built(&self) -> usize {
        self.sources.lock().len()
    }

    fn source(&self, index: usize) -> Arc<ManualSource> {
        Arc::clone(&self.sources.lock()[index])
    }
}

impl DataSourceFactory for ManualFactory {
    fn build(&self, context: DataSourceContext) -> Arc<dyn DataSource> {
        let (outcome, _) = watch::channel(None);
        let source = Arc::new(ManualSource { context, outcome });
        self.sources.lock().push(Arc::clone(&source));
        source
    }
}

fn manual_client(factory: &Arc<ManualFactory>) -> FlagSyncClient {
    FlagSyncClient::with_components(
        options(),
        Identity::new("user-1"),
        ClientComponents::default().data_source_factory(factory.clone()),
    )
    .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_start_delivers_initial_data() {
    let test_data = TestData::new();
    test_data.update(test_data.flag("new-ui").value(true));
    test_data.set_value("theme", "dark");
    let client = client_for(&test_data, "user-1");

    assert!(client.start().await);

    assert!(client.is_initialized());
    assert_eq!(client.current_value("new-ui").unwrap().bool_value(), Some(true));
    assert_eq!(client.all_values().get("theme"), Some(&json!("dark")));

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Valid);
    assert!(status.last_successful_connection.is_some());
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_reads_before_start_are_empty() {
    let test_data = TestData::new();
    test_data.set_value("flag", 1);
    let client = client_for(&test_data, "user-1");

    assert!(client.current_value("flag").is_none());
    assert!(client.all_values().is_empty());
    assert_eq!(client.status().state, ConnectionState::Initializing);
}

#[tokio::test]
async fn test_updates_reach_change_stream() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let mut changes = client.change_events();
    test_data.set_value("banner", "hello");

    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        change,
        FlagChange {
            key: "banner".to_string(),
            old_value: json!(null),
            new_value: json!("hello"),
            deleted: false,
        }
    );
    assert_eq!(client.current_value("banner").unwrap().version, 1);
}

#[tokio::test]
async fn test_flag_listener_sees_only_its_key() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let (tx, rx) = mpsc::channel();
    client.register_flag_listener(
        "watched",
        Arc::new(move |change: &FlagChange| {
            let _ = tx.send(change.clone());
        }),
    );

    test_data.set_value("other", 1);
    test_data.set_value("watched", 2);

    let change = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(change.key, "watched");
    assert_eq!(change.new_value, json!(2));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[tokio::test]
async fn test_unregistered_listener_is_not_called() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let (tx, rx) = mpsc::channel();
    let id = client.register_change_listener(Arc::new(move |change: &FlagChange| {
        let _ = tx.send(change.key.clone());
    }));

    assert!(client.unregister_change_listener(id));
    assert!(!client.unregister_change_listener(id));

    test_data.set_value("flag", true);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[tokio::test]
async fn test_version_only_update_is_silent() {
    let test_data = TestData::new();
    test_data.set_value("flag", "same");
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let mut changes = client.change_events();
    test_data.set_value("flag", "same");

    assert_eq!(client.current_value("flag").unwrap().version, 2);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_stale_push_is_ignored() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    test_data.upsert_item(flagsync::Item::new("flag", 5, "current"));
    test_data.upsert_item(flagsync::Item::new("flag", 3, "stale"));

    let item = client.current_value("flag").unwrap();
    assert_eq!(item.version, 5);
    assert_eq!(item.value, json!("current"));
}

#[tokio::test]
async fn test_delete_hides_flag() {
    let test_data = TestData::new();
    test_data.set_value("flag", true);
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let mut changes = client.change_events();
    test_data.delete("flag");

    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(change.deleted);
    assert!(client.current_value("flag").is_none());
    assert!(!client.all_values().contains_key("flag"));
}

#[tokio::test]
async fn test_force_offline_takes_precedence() {
    let test_data = TestData::new();
    test_data.set_value("flag", "online");
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);
    assert_eq!(test_data.source_count(), 1);

    assert!(client.set_offline(true, WAIT).await);
    assert!(client.is_offline());
    assert_eq!(client.status().state, ConnectionState::SetOffline);
    assert_eq!(test_data.source_count(), 0);

    // reachability changes do not bring a source back while forced offline
    client.set_network_available(false).await;
    client.set_network_available(true).await;
    assert_eq!(client.status().state, ConnectionState::SetOffline);
    assert_eq!(test_data.source_count(), 0);

    // last known values stay readable
    assert_eq!(client.current_value("flag").unwrap().value, json!("online"));

    assert!(client.set_offline(false, WAIT).await);
    wait_for_state(&client, ConnectionState::Valid).await;
    assert_eq!(test_data.source_count(), 1);
}

#[tokio::test]
async fn test_start_offline_builds_no_source() {
    let test_data = TestData::new();
    let client = FlagSyncClient::with_components(
        FlagSyncOptions::builder("mob-test-key").offline(true).build(),
        Identity::new("user-1"),
        ClientComponents::default().data_source_factory(Arc::new(test_data.clone())),
    )
    .unwrap();

    assert!(client.start().await);

    assert!(!client.is_initialized());
    assert_eq!(client.status().state, ConnectionState::SetOffline);
    assert_eq!(test_data.source_count(), 0);
}

#[tokio::test]
async fn test_network_loss_stops_source_and_recovers() {
    let test_data = TestData::new();
    test_data.set_value("flag", 1);
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    client.set_network_available(false).await;
    assert_eq!(client.status().state, ConnectionState::NetworkUnavailable);
    assert_eq!(test_data.source_count(), 0);
    assert_eq!(client.current_value("flag").unwrap().value, json!(1));

    client.set_network_available(true).await;
    wait_for_state(&client, ConnectionState::Valid).await;
    assert_eq!(test_data.source_count(), 1);
}

#[tokio::test]
async fn test_background_disabled_freezes_flags() {
    let test_data = TestData::new();
    let client = FlagSyncClient::with_components(
        FlagSyncOptions::builder("mob-test-key")
            .disable_background_updating(true)
            .build(),
        Identity::new("user-1"),
        ClientComponents::default().data_source_factory(Arc::new(test_data.clone())),
    )
    .unwrap();
    assert!(client.start().await);

    client.set_in_background(true).await;
    assert_eq!(client.status().state, ConnectionState::BackgroundDisabled);
    assert_eq!(test_data.source_count(), 0);

    test_data.set_value("flag", "missed");
    assert!(client.current_value("flag").is_none());

    client.set_in_background(false).await;
    wait_for_state(&client, ConnectionState::Valid).await;
    assert_eq!(client.current_value("flag").unwrap().value, json!("missed"));
}

#[tokio::test]
async fn test_attached_signals_drive_connection() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    let (network_tx, network_rx) = watch::channel(true);
    client.attach_signals(Some(network_rx), None);

    network_tx.send_replace(false);
    wait_for_state(&client, ConnectionState::NetworkUnavailable).await;

    network_tx.send_replace(true);
    wait_for_state(&client, ConnectionState::Valid).await;
}

#[tokio::test]
async fn test_switch_identity_serves_overrides() {
    let test_data = TestData::new();
    test_data.update(test_data.flag("theme").value("dark").value_for("user-2", "light"));
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);
    assert_eq!(client.current_value("theme").unwrap().value, json!("dark"));

    let mut changes = client.change_events();
    assert!(client.switch_identity(Identity::new("user-2"), WAIT).await);

    assert_eq!(client.identity(), Identity::new("user-2"));
    assert_eq!(client.current_value("theme").unwrap().value, json!("light"));
    assert_eq!(test_data.source_count(), 1);

    let mut saw_light = false;
    while let Ok(change) = changes.try_recv() {
        if change.key == "theme" && change.new_value == json!("light") {
            saw_light = true;
        }
    }
    assert!(saw_light);
}

#[tokio::test]
async fn test_switch_identity_uses_cache_from_previous_run() {
    let storage = Arc::new(InMemoryStorage::new());
    let returning = Identity::new("user-2");

    {
        let test_data = TestData::new();
        test_data.set_value("color", "blue");
        let client = FlagSyncClient::with_components(
            options(),
            returning.clone(),
            ClientComponents::default()
                .data_source_factory(Arc::new(test_data.clone()))
                .storage(storage.clone()),
        )
        .unwrap();
        assert!(client.start().await);
        client.close().await;
    }

    let client = FlagSyncClient::with_components(
        options(),
        Identity::new("user-1"),
        ClientComponents::default()
            .data_source_factory(Arc::new(PendingFactory))
            .storage(storage.clone()),
    )
    .unwrap();
    assert!(!client.start_with_timeout(Duration::from_millis(50)).await);
    assert!(client.current_value("color").is_none());

    // no fresh data arrives, but the cached values are served at once
    assert!(
        !client
            .switch_identity(returning, Duration::from_millis(50))
            .await
    );
    assert_eq!(client.current_value("color").unwrap().value, json!("blue"));
    assert_eq!(client.status().state, ConnectionState::Initializing);
}

#[tokio::test]
async fn test_cached_values_served_at_construction() {
    let storage = Arc::new(InMemoryStorage::new());

    {
        let test_data = TestData::new();
        test_data.set_value("color", "green");
        let client = FlagSyncClient::with_components(
            options(),
            Identity::new("user-1"),
            ClientComponents::default()
                .data_source_factory(Arc::new(test_data.clone()))
                .storage(storage.clone()),
        )
        .unwrap();
        assert!(client.start().await);
        client.close().await;
    }

    let client = FlagSyncClient::with_components(
        options(),
        Identity::new("user-1"),
        ClientComponents::default()
            .data_source_factory(Arc::new(PendingFactory))
            .storage(storage),
    )
    .unwrap();

    assert_eq!(client.current_value("color").unwrap().value, json!("green"));
}

#[tokio::test]
async fn test_unrecoverable_error_shuts_down() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    test_data.fail(DataSourceError::response(401));

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Shutdown);
    let error = status.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::ErrorResponse);
    assert_eq!(error.status_code, Some(401));

    // never rebuilt afterwards
    client.set_network_available(false).await;
    client.set_network_available(true).await;
    assert_eq!(client.status().state, ConnectionState::Shutdown);
}

#[tokio::test]
async fn test_recoverable_error_interrupts() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    test_data.update_status(
        ConnectionState::Interrupted,
        Some(DataSourceError::network("connection reset")),
    );

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Interrupted);
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::NetworkError);

    test_data.update_status(ConnectionState::Valid, None);
    assert_eq!(client.status().state, ConnectionState::Valid);
}

#[tokio::test]
async fn test_status_listener_receives_transitions() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");

    let (tx, rx) = mpsc::channel();
    client.register_status_listener(Arc::new(move |status: &ConnectionStatus| {
        let _ = tx.send(status.state);
    }));

    assert!(client.start().await);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ConnectionState::Valid);

    assert!(client.set_offline(true, WAIT).await);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ConnectionState::SetOffline);
}

#[tokio::test]
async fn test_close_shuts_everything_down() {
    let test_data = TestData::new();
    let client = client_for(&test_data, "user-1");
    assert!(client.start().await);

    client.close().await;

    assert_eq!(client.status().state, ConnectionState::Shutdown);
    assert_eq!(test_data.source_count(), 0);
    assert!(!client.start().await);
}

#[tokio::test]
async fn test_independent_clients_share_test_data() {
    let test_data = TestData::new();
    let first = client_for(&test_data, "user-1");
    let second = client_for(&test_data, "user-2");
    assert!(first.start().await);
    assert!(second.start().await);

    test_data.set_value("shared", "yes");

    assert_eq!(first.current_value("shared").unwrap().value, json!("yes"));
    assert_eq!(second.current_value("shared").unwrap().value, json!("yes"));
}

#[test]
fn test_blocking_api_outside_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let test_data = TestData::new();
    test_data.update(test_data.flag("theme").value("dark").value_for("user-2", "light"));

    let client = {
        let _guard = runtime.enter();
        client_for(&test_data, "user-1")
    };

    assert!(client.start_blocking(WAIT));
    assert_eq!(client.current_value("theme").unwrap().value, json!("dark"));

    assert!(client.switch_identity_blocking(Identity::new("user-2"), WAIT));
    assert_eq!(client.current_value("theme").unwrap().value, json!("light"));

    assert!(client.set_offline_blocking(true, WAIT));
    assert!(client.set_offline_blocking(false, WAIT));
}

#[test]
fn test_new_requires_runtime() {
    let error = FlagSyncClient::new(options(), Identity::new("user-1")).unwrap_err();

    assert_eq!(error.code, ErrorCode::InitFailed);
}

#[tokio::test]
async fn test_new_rejects_invalid_options() {
    let error = FlagSyncClient::new(FlagSyncOptions::new(""), Identity::new("user-1")).unwrap_err();

    assert_eq!(error.code, ErrorCode::ConfigInvalidMobileKey);
    assert!(error.is_config_error());
}

#[tokio::test]
async fn test_timed_out_start_completes_later() {
    let factory = Arc::new(ManualFactory::default());
    let client = manual_client(&factory);

    assert!(!client.start_with_timeout(Duration::from_millis(50)).await);
    assert!(!client.is_initialized());
    assert_eq!(client.status().state, ConnectionState::Initializing);

    // the source kept running after the wait gave up
    factory
        .source(0)
        .deliver(Snapshot::from_items([Item::new("late", 1, "arrived")]));

    wait_until(|| client.is_initialized()).await;
    assert_eq!(client.current_value("late").unwrap().value, json!("arrived"));
    assert_eq!(client.status().state, ConnectionState::Valid);
    assert_eq!(factory.built(), 1);
    assert!(client.start_with_timeout(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_replaced_source_writes_are_dropped() {
    let factory = Arc::new(ManualFactory::default());
    let client = manual_client(&factory);
    assert!(!client.start_with_timeout(Duration::from_millis(10)).await);
    let first = factory.source(0);
    first.deliver(Snapshot::from_items([Item::new("a", 1, 1)]));
    wait_until(|| client.is_initialized()).await;

    let mut changes = client.change_events();
    assert!(client.set_offline(true, WAIT).await);

    first.deliver(Snapshot::from_items([Item::new("a", 5, 99), Item::new("b", 1, 2)]));
    first.upsert(Item::new("a", 6, 100));
    first.interrupt();

    assert_eq!(client.current_value("a").unwrap().value, json!(1));
    assert!(client.current_value("b").is_none());
    assert_eq!(client.status().state, ConnectionState::SetOffline);

    // back online: only the replacement may write
    assert!(client.set_offline(false, WAIT).await);
    assert_eq!(factory.built(), 2);
    let second = factory.source(1);
    first.upsert(Item::new("a", 7, 101));
    assert_eq!(client.current_value("a").unwrap().value, json!(1));

    second.upsert(Item::new("a", 2, 2));
    assert_eq!(client.current_value("a").unwrap().value, json!(2));

    // a rebuild on entering the background cuts off the second source too
    client.set_in_background(true).await;
    assert_eq!(factory.built(), 3);
    second.upsert(Item::new("a", 3, 3));
    assert_eq!(client.current_value("a").unwrap().value, json!(2));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let change = changes.try_recv().unwrap();
    assert_eq!(change.key, "a");
    assert_eq!(change.new_value, json!(2));
    assert!(changes.try_recv().is_err());
}
