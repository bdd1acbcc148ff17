//! End-to-end flows through the alarm service context

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::sync::Arc;
use std::time::Duration;

use alarmsrv::board::{MemoryLink, SwitchEvent};
use alarmsrv::dispatcher::DispatcherStatus;
use alarmsrv::domain::AlarmState;
use alarmsrv::messages::{Message, MessageType, Payload, ServiceEvent};
use alarmsrv::messaging::{InboundHandler, MemoryMessaging};
use alarmsrv::storage::{MemoryAlarmStore, StoredAlarm};
use alarmsrv::{AlarmError, AlarmService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{remote_payload, test_config, wait_until};

struct Fixture {
    service: Arc<AlarmService>,
    messaging: Arc<MemoryMessaging>,
    store: Arc<MemoryAlarmStore>,
    link: Arc<MemoryLink>,
}

async fn fixture_with(store: MemoryAlarmStore) -> Fixture {
    let messaging = Arc::new(MemoryMessaging::new("alarms"));
    let store = Arc::new(store);
    let link = Arc::new(MemoryLink::new());
    let service = AlarmService::bootstrap(
        test_config(),
        messaging.clone(),
        store.clone(),
        Some(link.clone()),
    )
    .await
    .unwrap();
    Fixture {
        service,
        messaging,
        store,
        link,
    }
}

async fn fixture() -> Fixture {
    fixture_with(MemoryAlarmStore::new()).await
}

fn start(service: &Arc<AlarmService>) -> (CancellationToken, JoinHandle<alarmsrv::Result<()>>) {
    let cancel = CancellationToken::new();
    let task = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };
    (cancel, task)
}

fn alerts_for(messaging: &MemoryMessaging, sid: &str, state: AlarmState) -> usize {
    messaging
        .broadcasts()
        .iter()
        .filter(|m| m.message_type == MessageType::Alert)
        .filter_map(|m| m.alarm())
        .filter(|a| a.id == sid && a.state == state)
        .count()
}

#[tokio::test]
async fn test_board_switch_reaches_every_listener() {
    let f = fixture().await;
    f.service.on_board_ready(true).await;
    assert_eq!(f.link.switch("master"), Some(true));
    let (cancel, task) = start(&f.service);

    let change = f
        .service
        .on_switch(&SwitchEvent::new("gs", true))
        .unwrap();
    assert_eq!(change.alarm.state, AlarmState::Critical);

    let messaging = f.messaging.clone();
    assert!(
        wait_until(
            || alerts_for(&messaging, "gs", AlarmState::Critical) == 1,
            Duration::from_secs(2)
        )
        .await
    );
    let link = f.link.clone();
    assert!(wait_until(|| link.switch("buzzer") == Some(true), Duration::from_secs(2)).await);

    let gs = f.service.manager().get_alarm("gs").unwrap();
    let store = f.store.clone();
    assert!(
        wait_until(
            || store.log().iter().any(|e| e.alarm_id == gs.id && e.state == AlarmState::Critical),
            Duration::from_secs(2)
        )
        .await
    );
    assert!(f
        .store
        .stored()
        .iter()
        .any(|s| s.sid == "gs" && s.state == AlarmState::Critical));

    let status = f.service.status();
    assert_eq!(status.dispatcher, DispatcherStatus::Running);
    assert_eq!(status.sources.get("local"), Some(&true));

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(f.service.status().dispatcher, DispatcherStatus::Stopped);
    assert_eq!(f.link.switch("master"), Some(false));
}

#[tokio::test]
async fn test_persistence_failure_does_not_block_broadcast() {
    let f = fixture().await;
    f.service.on_board_ready(true).await;
    f.store.set_fail_writes(true);
    let (cancel, task) = start(&f.service);

    f.service.on_switch(&SwitchEvent::new("hw", true)).unwrap();
    f.service.on_switch(&SwitchEvent::new("hw", false)).unwrap();

    let messaging = f.messaging.clone();
    assert!(
        wait_until(
            // One from the board coming up, one from the switch
            || alerts_for(&messaging, "hw", AlarmState::Lowered) == 2,
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(alerts_for(&f.messaging, "hw", AlarmState::Critical), 1);
    assert!(f.store.log().is_empty());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_remote_source_disable_and_restore() {
    let f = fixture().await;
    assert!(f.messaging.subscriptions().contains("remote1"));

    f.service
        .on_message(Message::service_event("remote1", ServiceEvent::Connected))
        .await;
    // Connected triggers a list request
    assert!(f.messaging.sent().iter().any(|m| {
        m.target.as_deref() == Some("remote1")
            && m.command_payload().is_some_and(|c| c.name == "list-alarms")
    }));

    let list = vec![
        remote_payload("eng", "Engine", AlarmState::Moderate, "oil pressure"),
        remote_payload("fire", "Fire", AlarmState::Lowered, ""),
    ];
    f.service
        .on_message(Message {
            message_type: MessageType::CommandResponse,
            sender: "remote1".to_string(),
            target: Some("alarms".to_string()),
            payload: Payload::AlarmsList(list),
        })
        .await;

    let manager = f.service.manager();
    let eng = manager.get_alarm(("remote1", "eng")).unwrap();
    assert_eq!(eng.state, AlarmState::Moderate);
    assert_eq!(eng.message, "oil pressure");

    f.service
        .on_message(Message::service_event("remote1", ServiceEvent::Disconnecting))
        .await;
    assert!(manager
        .alarms_of("remote1")
        .iter()
        .all(|a| a.state == AlarmState::Disabled));

    // Alerts while the peer is away are dropped
    let mut alert = Message::alert("remote1", &eng);
    if let Payload::Alarm(payload) = &mut alert.payload {
        payload.state = AlarmState::Lowered;
    }
    f.service.on_message(alert).await;
    assert_eq!(
        manager.get_alarm(("remote1", "eng")).unwrap().state,
        AlarmState::Disabled
    );

    // A sid first seen while the peer is away joins its siblings disabled
    let mut bilge = alarmsrv::Alarm::new(0, "remote1", "bilge", "Bilge");
    bilge.state = AlarmState::Critical;
    f.service.on_message(Message::alert("remote1", &bilge)).await;
    assert_eq!(
        manager.get_alarm(("remote1", "bilge")).unwrap().state,
        AlarmState::Disabled
    );

    f.service
        .on_message(Message::service_event("remote1", ServiceEvent::Connected))
        .await;
    assert_eq!(
        manager.get_alarm(("remote1", "eng")).unwrap().state,
        AlarmState::Moderate
    );
    assert_eq!(
        manager.get_alarm(("remote1", "bilge")).unwrap().state,
        AlarmState::Lowered
    );
    assert_eq!(
        manager.get_alarm(("remote1", "fire")).unwrap().state,
        AlarmState::Lowered
    );
}

#[tokio::test]
async fn test_unknown_senders_are_ignored() {
    let f = fixture().await;
    let mut stranger = alarmsrv::Alarm::new(99, "stranger", "x", "X");
    stranger.state = AlarmState::Critical;
    f.service
        .on_message(Message::alert("stranger", &stranger))
        .await;
    assert!(f.service.manager().alarms_of("stranger").is_empty());
}

#[tokio::test]
async fn test_command_flow() {
    let f = fixture().await;
    f.service.on_board_ready(true).await;

    f.service
        .on_message(Message::command("console", "alarms", "list-alarms", &[]))
        .await;
    f.service
        .on_message(Message::command(
            "console",
            "alarms",
            "test-alarm",
            &["iv", "MODERATE", "30"],
        ))
        .await;
    f.service
        .on_message(Message::command("console", "alarms", "test-alarm", &["gs"]))
        .await;
    f.service
        .on_message(Message::command("console", "alarms", "reboot", &[]))
        .await;

    let replies: Vec<Message> = f
        .messaging
        .sent()
        .into_iter()
        .filter(|m| m.target.as_deref() == Some("console"))
        .collect();
    assert_eq!(replies.len(), 4);

    assert_eq!(replies[0].message_type, MessageType::CommandResponse);
    assert_eq!(replies[0].alarms_list_payload().unwrap().len(), 3);

    let tested = replies[1].alarm().unwrap();
    assert_eq!(tested.id, "iv");
    assert!(tested.is_testing);
    assert_eq!(tested.state, AlarmState::Moderate);

    // Second concurrent test is refused
    assert_eq!(replies[2].message_type, MessageType::Error);
    let Payload::Error(info) = &replies[2].payload else {
        panic!("expected error payload");
    };
    assert_eq!(info.error_code, "ALARM_CONFLICT");

    let Payload::Error(info) = &replies[3].payload else {
        panic!("expected error payload");
    };
    assert_eq!(info.error_code, "ALARM_VALIDATION_ERROR");

    let active = f.service.status().active_test.unwrap();
    assert_eq!(active.sid, "iv");

    f.service
        .on_message(Message::command("console", "alarms", "end-test", &["iv"]))
        .await;
    let iv = f.service.manager().get_alarm("iv").unwrap();
    assert!(!iv.is_testing);
    assert_eq!(iv.state, AlarmState::Lowered);
    assert!(f.service.status().active_test.is_none());
}

#[tokio::test]
async fn test_shutdown_ends_running_test() {
    let f = fixture().await;
    f.service.on_board_ready(true).await;
    let (cancel, task) = start(&f.service);

    f.service
        .tests()
        .start_test("gs", None, None, Some(Duration::from_secs(60)))
        .unwrap();
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(!f.service.manager().get_alarm("gs").unwrap().is_testing);
    assert!(f.messaging.broadcasts().iter().any(|m| {
        m.service_event_payload() == Some(ServiceEvent::Disconnecting)
    }));
    // Tests are never persisted
    assert!(f.store.log().iter().all(|e| e.state != AlarmState::Critical));
}

#[tokio::test]
async fn test_stored_remote_alarms_start_disabled() {
    let stored = StoredAlarm {
        id: 42,
        sid: "eng".to_string(),
        name: "Engine".to_string(),
        source: "remote2".to_string(),
        active: true,
        state: AlarmState::Critical,
        last_raised: None,
        last_lowered: None,
        last_disabled: None,
    };
    let f = fixture_with(MemoryAlarmStore::with_alarms(vec![stored])).await;

    let eng = f.service.manager().get_alarm(("remote2", "eng")).unwrap();
    assert_eq!(eng.id, 42);
    assert_eq!(eng.state, AlarmState::Disabled);
    assert!(f.service.reconciler().is_remote("remote2"));
    assert!(f.messaging.subscriptions().contains("remote2"));

    // New registrations never reuse a stored id
    let gs = f.service.manager().get_alarm("gs").unwrap();
    assert_ne!(gs.id, 42);
}

#[tokio::test]
async fn test_store_load_failure_is_configuration_error() {
    let store = Arc::new(MemoryAlarmStore::new());
    store.set_fail_loads(true);
    let err = AlarmService::bootstrap(
        test_config(),
        Arc::new(MemoryMessaging::new("alarms")),
        store,
        None,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, AlarmError::Configuration(_)));
}

#[tokio::test]
async fn test_inactive_stored_alarm_keeps_its_id() {
    let stored = StoredAlarm {
        id: 42,
        sid: "gs".to_string(),
        name: "Gensets".to_string(),
        source: "local".to_string(),
        active: false,
        state: AlarmState::Lowered,
        last_raised: None,
        last_lowered: None,
        last_disabled: None,
    };
    let f = fixture_with(MemoryAlarmStore::with_alarms(vec![stored])).await;

    let manager = f.service.manager();
    assert_eq!(manager.get_alarm("gs").unwrap().id, 42);
    assert!(manager.get_alarm("iv").unwrap().id > 42);
    assert!(manager.get_alarm("hw").unwrap().id > 42);
}
