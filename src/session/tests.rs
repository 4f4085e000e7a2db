use super::*;
use crate::config::{Credentials, LmConnectConfig, SimulatorConfig};
use crate::configuration::{ConfigurationKey, ConfigurationPlan};
use crate::device::{DeviceState, LaunchMonitor, PowerState};
use crate::error::LmConnectError;
use crate::events::EventCategory;
use crate::selector::{DeviceSelector, ScriptedInput};
use crate::shot::ShotType;
use crate::simulator::{SimulatedDevice, SimulatedSdk};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn create_test_config(target_shots: u32, video_directory: &Path) -> LmConnectConfig {
    let mut config = LmConnectConfig::default();
    config.session.target_shots = target_shots;
    config.session.discovery_timeout_secs = 1;
    config.session.fetch_grace_period_secs = 1;
    config.storage.video_directory = Some(video_directory.to_string_lossy().into_owned());
    config.simulator = SimulatorConfig::manual();
    config
}

fn credentials() -> Credentials {
    Credentials {
        account_id: "acme".to_string(),
        account_key: "secret".to_string(),
    }
}

fn simulated_devices(count: usize) -> Vec<Arc<SimulatedDevice>> {
    (1..=count)
        .map(|n| {
            Arc::new(SimulatedDevice::new(
                format!("LM-{}", n),
                SimulatorConfig::manual(),
            ))
        })
        .collect()
}

fn create_controller(
    config: &LmConnectConfig,
    devices: &[Arc<SimulatedDevice>],
) -> SessionController {
    let sdk = SimulatedSdk::new(SimulatorConfig::manual()).with_devices(devices.to_vec());
    SessionController::new(config.clone(), Arc::new(sdk))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wait for the device to finish applying the default plan
async fn wait_until_configured(device: &SimulatedDevice) {
    wait_until(|| device.is_connected() && device.applied_configuration().len() == 5).await;
}

#[tokio::test]
async fn test_end_to_end_second_of_three_devices() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(3);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["2"]));
    let plan = ConfigurationPlan::from_config(&config.device);

    let chosen = Arc::clone(&devices[1]);
    let driver = tokio::spawn(async move {
        wait_until_configured(&chosen).await;
        for n in 0..5 {
            let shot_id = chosen.next_shot_id();
            if n == 1 || n == 3 {
                chosen.emit_shot(ShotType::Preliminary, &shot_id);
            }
            chosen.emit_shot(ShotType::Flight, &shot_id);
        }
    });

    let outcome = controller
        .run(&credentials(), &mut selector, &plan)
        .await
        .unwrap();
    driver.await.unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::TargetReached { shots: 5 })
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(controller.counters().preliminary_shots(), 2);
    assert_eq!(
        controller.visited_states(),
        vec![
            SessionState::Uninitialized,
            SessionState::Authorizing,
            SessionState::Discovering,
            SessionState::AwaitingSelection,
            SessionState::Connecting,
            SessionState::Configuring,
            SessionState::Streaming,
            SessionState::Draining,
            SessionState::Disconnecting,
            SessionState::Closed,
        ]
    );

    let chosen = &devices[1];
    assert!(!chosen.is_connected());
    assert_eq!(chosen.disconnect_count(), 1);
    assert_eq!(chosen.subscriber_count(None), 0);
    assert_eq!(chosen.power_state(), PowerState::Sleep);
    assert_eq!(devices[0].connect_count(), 0);
    assert_eq!(devices[2].connect_count(), 0);
}

#[tokio::test]
async fn test_zero_target_completes_immediately() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(0, temp_dir.path());
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    let outcome = timeout(
        Duration::from_secs(5),
        controller.run(&credentials(), &mut selector, &ConfigurationPlan::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::TargetReached { shots: 0 })
    );
    assert_eq!(devices[0].connect_count(), 1);
    assert_eq!(devices[0].disconnect_count(), 1);
}

#[tokio::test]
async fn test_state_events_during_connect_are_not_lost() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(1, temp_dir.path());
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    // Emits as soon as the sinks are attached, racing the connect call
    let device = Arc::clone(&devices[0]);
    let racer = tokio::spawn(async move {
        wait_until(|| device.subscriber_count(None) == EventCategory::ALL.len()).await;
        for _ in 0..20 {
            device.emit_state(DeviceState::Processing);
            tokio::task::yield_now().await;
        }
    });

    controller.initialize(&credentials()).await.unwrap();
    let candidates = controller.discover_devices().await.unwrap();
    let device = controller
        .select_device(&candidates, &mut selector)
        .await
        .unwrap()
        .unwrap();
    controller
        .connect_and_configure(device, &ConfigurationPlan::new())
        .await
        .unwrap();
    racer.await.unwrap();

    let metrics = controller.event_bus().metrics();
    assert_eq!(metrics.undelivered, 0);
    // Connecting, Connected and Sleep from the connect call itself
    assert_eq!(metrics.count(EventCategory::State), 23);

    let counters = controller.counters();
    wait_until(|| counters.state_changes() == 23).await;

    controller.teardown().await;
}

#[tokio::test]
async fn test_configuration_failure_still_tears_down() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    devices[0].fail_configuration(ConfigurationKey::Club);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    let plan = ConfigurationPlan::from_config(&config.device);

    let outcome = controller
        .run(&credentials(), &mut selector, &plan)
        .await
        .unwrap();

    match &outcome {
        SessionOutcome::ConnectionFailed { device_id, error } => {
            assert_eq!(device_id, "LM-1");
            assert!(error.contains("(Club)"), "{}", error);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(controller.state(), SessionState::Failed);

    let device = &devices[0];
    assert!(!device.is_connected());
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(device.subscriber_count(None), 0);
    assert_eq!(device.power_state(), PowerState::Sleep);
    assert!(!device
        .attempted_keys()
        .contains(&ConfigurationKey::Location));
}

#[tokio::test]
async fn test_connect_failure_releases_subscriptions() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(2);
    devices[0].fail_connection();
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    let outcome = controller
        .run(&credentials(), &mut selector, &ConfigurationPlan::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        SessionOutcome::ConnectionFailed { ref device_id, .. } if device_id == "LM-1"
    ));
    assert_eq!(controller.state(), SessionState::Failed);
    assert_eq!(devices[0].connect_count(), 1);
    assert_eq!(devices[0].disconnect_count(), 0);
    assert_eq!(devices[0].subscriber_count(None), 0);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(3, temp_dir.path());
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    controller.initialize(&credentials()).await.unwrap();
    let candidates = controller.discover_devices().await.unwrap();
    let device = controller
        .select_device(&candidates, &mut selector)
        .await
        .unwrap()
        .unwrap();
    controller
        .connect_and_configure(device, &ConfigurationPlan::from_config(&config.device))
        .await
        .unwrap();
    assert_eq!(controller.state(), SessionState::Streaming);

    let first = controller.teardown().await;
    assert!(first.disconnected);
    assert!(first.power_restored);
    assert_eq!(first.unsubscribed, EventCategory::ALL.len());
    assert_eq!(controller.state(), SessionState::Closed);

    let second = controller.teardown().await;
    assert!(second.is_noop());
    assert_eq!(controller.teardown_into(SessionState::Failed).await, TeardownReport::default());
    assert_eq!(controller.state(), SessionState::Closed);

    assert_eq!(devices[0].disconnect_count(), 1);
    assert_eq!(
        devices[0]
            .attempted_keys()
            .iter()
            .filter(|k| **k == ConfigurationKey::PowerState)
            .count(),
        2
    );
}

#[tokio::test]
async fn test_failing_point_clouds_do_not_block_completion() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(3, temp_dir.path());
    let devices = simulated_devices(1);
    devices[0].deny_point_cloud();
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    let plan = ConfigurationPlan::from_config(&config.device);
    let stats = controller.fetch_stats();

    let device = Arc::clone(&devices[0]);
    let driver = tokio::spawn(async move {
        wait_until_configured(&device).await;
        for n in 1..=3u64 {
            device.emit_swing();
            if n < 3 {
                wait_until(|| stats.unauthorized() >= n).await;
            }
        }
    });

    let outcome = timeout(
        Duration::from_secs(10),
        controller.run(&credentials(), &mut selector, &plan),
    )
    .await
    .unwrap()
    .unwrap();
    driver.await.unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::TargetReached { shots: 3 })
    );
    assert!(controller.fetch_stats().unauthorized() >= 2);
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_cancellation_ends_the_wait() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(10, temp_dir.path());
    let devices = simulated_devices(1);
    let token = CancellationToken::new();
    let mut controller = create_controller(&config, &devices).with_cancellation_token(token.clone());
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    let plan = ConfigurationPlan::from_config(&config.device);

    let device = Arc::clone(&devices[0]);
    tokio::spawn(async move {
        wait_until_configured(&device).await;
        device.emit_shot(ShotType::Flight, &device.next_shot_id());
        sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let outcome = controller
        .run(&credentials(), &mut selector, &plan)
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::Cancelled { .. })
    ));
    assert_eq!(outcome.exit_code(), 130);
    assert!(!devices[0].is_connected());
}

#[tokio::test]
async fn test_completion_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(10, temp_dir.path());
    config.session.completion_timeout_secs = Some(1);
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    let outcome = controller
        .run(&credentials(), &mut selector, &ConfigurationPlan::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::TimedOut { shots: 0 })
    );
    assert_eq!(devices[0].disconnect_count(), 1);
}

#[tokio::test]
async fn test_unexpected_disconnect_releases_the_wait() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    let plan = ConfigurationPlan::from_config(&config.device);

    let device = Arc::clone(&devices[0]);
    tokio::spawn(async move {
        wait_until_configured(&device).await;
        device.emit_state(DeviceState::Disconnected);
    });

    let outcome = timeout(
        Duration::from_secs(5),
        controller.run(&credentials(), &mut selector, &plan),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Completed(CompletionOutcome::DeviceLost { shots: 0 })
    );
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    let sdk = SimulatedSdk::new(SimulatorConfig::manual())
        .with_devices(devices.clone())
        .reject_credentials();
    let mut controller = SessionController::new(config, Arc::new(sdk));
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    let result = controller
        .run(&credentials(), &mut selector, &ConfigurationPlan::new())
        .await;

    assert!(matches!(result, Err(LmConnectError::Authorization { .. })));
    assert_eq!(
        controller.visited_states(),
        vec![
            SessionState::Uninitialized,
            SessionState::Authorizing,
            SessionState::Failed
        ]
    );
    assert_eq!(devices[0].connect_count(), 0);
}

#[tokio::test]
async fn test_no_devices_found() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let mut controller = create_controller(&config, &[]);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));

    let outcome = controller
        .run(&credentials(), &mut selector, &ConfigurationPlan::new())
        .await
        .unwrap();

    assert_eq!(outcome, SessionOutcome::NoDevicesFound);
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_selecting_none_closes_the_session() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(3);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["7", "4"]));

    let outcome = controller
        .run(&credentials(), &mut selector, &ConfigurationPlan::new())
        .await
        .unwrap();

    assert_eq!(outcome, SessionOutcome::SelectionAborted);
    assert_eq!(controller.state(), SessionState::Closed);
    assert!(devices.iter().all(|d| d.connect_count() == 0));
    assert!(controller.teardown().await.is_noop());
}

#[tokio::test]
async fn test_operations_out_of_order_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);

    assert!(matches!(
        controller.await_completion().await,
        Err(LmConnectError::Session { .. })
    ));
    assert!(controller.discover_devices().await.is_err());
    assert_eq!(controller.state(), SessionState::Uninitialized);

    let device: Arc<dyn LaunchMonitor> = devices[0].clone();
    assert!(controller
        .connect_and_configure(device, &ConfigurationPlan::new())
        .await
        .is_err());
    assert_eq!(devices[0].subscriber_count(None), 0);
}

/// Connect to the only device with an empty plan
async fn connect_single(controller: &mut SessionController) {
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    controller.initialize(&credentials()).await.unwrap();
    let candidates = controller.discover_devices().await.unwrap();
    let device = controller
        .select_device(&candidates, &mut selector)
        .await
        .unwrap()
        .unwrap();
    controller
        .connect_and_configure(device, &ConfigurationPlan::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shot_burst_beyond_backlog_warning_is_fully_counted() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(300, temp_dir.path());
    config.session.completion_timeout_secs = Some(5);
    assert!(config.system.event_backlog_warning < 300);
    let devices = simulated_devices(1);
    let mut controller = create_controller(&config, &devices);

    connect_single(&mut controller).await;

    // Published back to back, before the dispatcher gets to run
    for _ in 0..300 {
        let shot_id = devices[0].next_shot_id();
        devices[0].emit_shot(ShotType::Flight, &shot_id);
    }
    assert_eq!(controller.event_bus().metrics().count(EventCategory::Shot), 300);

    let outcome = controller.await_completion().await.unwrap();
    assert_eq!(outcome, CompletionOutcome::TargetReached { shots: 300 });

    controller.teardown().await;
}

#[tokio::test]
async fn test_disconnected_before_connect_is_not_device_lost() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(1, temp_dir.path());
    config.session.completion_timeout_secs = Some(5);
    let devices = simulated_devices(1);
    // The initial Disconnected state reaches the session before connect runs
    devices[0].announce_state_on_subscribe();
    let mut controller = create_controller(&config, &devices);

    connect_single(&mut controller).await;
    assert_eq!(controller.state(), SessionState::Streaming);

    // Disconnected, then Connecting, Connected and Sleep from connect
    let counters = controller.counters();
    wait_until(|| counters.state_changes() == 4).await;
    let shot_id = devices[0].next_shot_id();
    devices[0].emit_shot(ShotType::Flight, &shot_id);

    let outcome = controller.await_completion().await.unwrap();
    assert_eq!(outcome, CompletionOutcome::TargetReached { shots: 1 });
    assert!(devices[0].is_connected());

    controller.teardown().await;
    assert!(!devices[0].is_connected());
}

#[tokio::test]
async fn test_transport_failure_while_configuring_is_connection_failure() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    devices[0].drop_link_on(ConfigurationKey::Club);
    let mut controller = create_controller(&config, &devices);
    let mut selector = DeviceSelector::new(ScriptedInput::new(["1"]));
    let plan = ConfigurationPlan::from_config(&config.device);

    let outcome = controller
        .run(&credentials(), &mut selector, &plan)
        .await
        .unwrap();

    match &outcome {
        SessionOutcome::ConnectionFailed { device_id, error } => {
            assert_eq!(device_id, "LM-1");
            assert!(error.contains("(Club)"), "{}", error);
            assert!(error.contains("set_configuration"), "{}", error);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(controller.state(), SessionState::Failed);
    assert!(!devices[0].is_connected());
    assert_eq!(devices[0].subscriber_count(None), 0);
}

#[tokio::test]
async fn test_unreachable_backend_is_an_authorization_failure() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(5, temp_dir.path());
    let devices = simulated_devices(1);
    let sdk = SimulatedSdk::new(SimulatorConfig::manual())
        .with_devices(devices.clone())
        .backend_unreachable();
    let mut controller = SessionController::new(config, Arc::new(sdk));

    let result = controller.initialize(&credentials()).await;

    match result {
        Err(LmConnectError::Authorization { message }) => {
            assert!(message.contains("unreachable"), "{}", message);
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
    assert_eq!(controller.state(), SessionState::Failed);
    assert!(controller.authorization().is_none());
}
