//! Federation liveness, relay fan-out and dispatcher routing

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mesh_federation::{
    Dispatcher, Error, FIRST_AVAILABLE_STAR, FederationEvent, LOCAL_STAR, RelayCall, RelayRequest,
    RelayResponse, Star, StarFederation, StarTransport,
};
use mesh_registry::config::{DispatcherConfig, DynamicConfig, StarConfig};
use mesh_registry::{
    DisabledLauncher, LogOnlyControl, RegistrationRequest, ServiceIdentity, headers,
};

#[derive(Debug, Default)]
struct MockTransport {
    reachable: Mutex<HashSet<String>>,
    fail_exchange: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, RelayCall)>>,
}

impl MockTransport {
    fn set_reachable(&self, url: &str, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    fn fail_exchanges_to(&self, name: &str) {
        self.fail_exchange.lock().unwrap().insert(name.to_string());
    }

    fn calls_to(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(star, _)| star == name)
            .count()
    }
}

#[async_trait]
impl StarTransport for MockTransport {
    async fn ping(&self, star: &Star) -> mesh_federation::Result<()> {
        if self.reachable.lock().unwrap().contains(&star.url) {
            Ok(())
        } else {
            Err(Error::Transport(format!("no route to {}", star.url)))
        }
    }

    async fn exchange(
        &self,
        star: &Star,
        call: &RelayCall,
    ) -> mesh_federation::Result<RelayResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((star.name.clone(), call.clone()));
        if self.fail_exchange.lock().unwrap().contains(&star.name) {
            // a slow failing peer must not hold up the others
            smol::Timer::after(Duration::from_millis(30)).await;
            return Err(Error::Transport(format!("exchange failed on {}", star.name)));
        }
        Ok(RelayResponse::ok(
            star.name.clone(),
            star.url.clone(),
            Some(serde_json::json!({ "url": call.url })),
        ))
    }
}

const LOCAL_URL: &str = "http://star-a:9000";

fn three_star_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.url = LOCAL_URL.to_string();
    config.stars.instances = vec![
        StarConfig {
            name: "star-a".to_string(),
            url: LOCAL_URL.to_string(),
        },
        StarConfig {
            name: "star-b".to_string(),
            url: "http://star-b:9000".to_string(),
        },
        StarConfig {
            name: "star-c".to_string(),
            url: "http://star-c:9000".to_string(),
        },
    ];
    config
}

fn federation_with(
    config: DispatcherConfig,
    transport: Arc<MockTransport>,
) -> Arc<StarFederation> {
    StarFederation::new(Arc::new(DynamicConfig::new(config)), transport)
}

#[smol_potat::test]
async fn local_star_is_recognized_and_always_active() {
    let transport = Arc::new(MockTransport::default());
    let federation = federation_with(three_star_config(), transport);

    assert_eq!(federation.local_star().name, "star-a");
    let active = federation.active_stars();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "star-a");
}

#[smol_potat::test]
async fn probing_adds_reachable_peers_to_the_active_set() {
    let transport = Arc::new(MockTransport::default());
    transport.set_reachable("http://star-b:9000", true);
    let federation = federation_with(three_star_config(), transport.clone());

    federation.probe_all().await;
    federation.update_active_now();
    let names: Vec<String> = federation
        .active_stars()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    assert_eq!(names, ["star-a", "star-b"]);
}

#[smol_potat::test]
async fn joining_and_leaving_emit_events() {
    let transport = Arc::new(MockTransport::default());
    let federation = federation_with(three_star_config(), transport.clone());
    let events = federation.subscribe();

    transport.set_reachable("http://star-b:9000", true);
    federation.probe_all().await;
    federation.update_active_now();
    assert!(matches!(
        events.recv().await.unwrap(),
        FederationEvent::StarJoined(star) if star.name == "star-b"
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        FederationEvent::StarsChanged { active } if active.len() == 2
    ));

    transport.set_reachable("http://star-b:9000", false);
    federation.probe_all().await;
    federation.update_active_now();
    assert!(matches!(
        events.recv().await.unwrap(),
        FederationEvent::StarLeft(star) if star.name == "star-b"
    ));
}

#[smol_potat::test]
async fn missing_activity_expires_a_peer() {
    let transport = Arc::new(MockTransport::default());
    let mut config = three_star_config();
    config.stars.alive_check_interval_ms = 20;
    let federation = federation_with(config, transport);

    federation.mark_star_alive("http://star-b:9000");
    federation.update_active_now();
    assert_eq!(federation.active_stars().len(), 2);

    // twice the probe interval without activity
    smol::Timer::after(Duration::from_millis(60)).await;
    federation.update_active_now();
    assert_eq!(federation.active_stars().len(), 1);
}

#[smol_potat::test]
async fn pseudo_star_names_resolve() {
    let transport = Arc::new(MockTransport::default());
    let federation = federation_with(three_star_config(), transport);

    assert_eq!(federation.star(LOCAL_STAR).unwrap().name, "star-a");
    assert_eq!(federation.star(FIRST_AVAILABLE_STAR).unwrap().name, "star-a");
    assert_eq!(federation.star("star-c").unwrap().name, "star-c");
    assert!(federation.star("star-z").is_none());
}

#[smol_potat::test]
async fn relay_fans_out_and_isolates_failures() {
    let transport = Arc::new(MockTransport::default());
    transport.set_reachable("http://star-b:9000", true);
    transport.set_reachable("http://star-c:9000", true);
    let federation = federation_with(three_star_config(), transport.clone());
    federation.probe_all().await;
    federation.update_active_now();

    transport.fail_exchanges_to("star-b");
    let responses = federation
        .relay(&RelayRequest::get("metrics").path("/values"))
        .await
        .unwrap();
    assert_eq!(responses.len(), 3);

    let by_star: BTreeMap<String, u16> = responses
        .iter()
        .map(|r| (r.star_name.clone(), r.status))
        .collect();
    assert_eq!(by_star["star-a"], 200);
    assert_eq!(by_star["star-b"], 503);
    assert_eq!(by_star["star-c"], 200);

    // answers carry the relayed URL and the answering star
    let ok = responses.iter().find(|r| r.star_name == "star-c").unwrap();
    assert_eq!(ok.star_url, "http://star-c:9000");
    assert_eq!(
        ok.content.as_ref().unwrap()["url"],
        "http://star-c:9000/metrics/values"
    );
}

#[smol_potat::test]
async fn relay_can_exclude_the_local_star() {
    let transport = Arc::new(MockTransport::default());
    transport.set_reachable("http://star-b:9000", true);
    let federation = federation_with(three_star_config(), transport.clone());
    federation.probe_all().await;
    federation.update_active_now();

    let responses = federation
        .relay(&RelayRequest::get("metrics").exclude_local())
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].star_name, "star-b");
    assert_eq!(transport.calls_to("star-a"), 0);
}

#[smol_potat::test]
async fn relay_single_calls_only_the_first_target() {
    let transport = Arc::new(MockTransport::default());
    transport.set_reachable("http://star-b:9000", true);
    let federation = federation_with(three_star_config(), transport.clone());
    federation.probe_all().await;
    federation.update_active_now();

    let response = federation
        .relay_single(&RelayRequest::get("metrics"))
        .await
        .unwrap();
    assert_eq!(response.star_name, "star-a");
    assert_eq!(transport.calls_to("star-b"), 0);
}

#[smol_potat::test]
async fn relay_forwards_the_user_token() {
    let transport = Arc::new(MockTransport::default());
    transport.set_reachable("http://star-b:9000", true);
    let federation = federation_with(three_star_config(), transport.clone());
    federation.probe_all().await;
    federation.update_active_now();

    federation
        .relay(&RelayRequest::get("metrics").user_token("token-1"))
        .await
        .unwrap();
    let calls = transport.calls.lock().unwrap();
    assert!(!calls.is_empty());
    for (_, call) in calls.iter() {
        let token = call
            .headers
            .iter()
            .find(|(key, _)| key == headers::X_USER_TOKEN)
            .map(|(_, value)| value.as_str());
        assert_eq!(token, Some("token-1"));
    }
}

#[smol_potat::test]
async fn relay_without_targets_is_an_error() {
    let transport = Arc::new(MockTransport::default());
    let federation = federation_with(three_star_config(), transport);

    let err = federation
        .relay(&RelayRequest::get("metrics").exclude_local())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoActiveStars));

    // star-b is configured but not active
    let err = federation
        .relay_single(&RelayRequest::get("metrics").on_star("star-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoActiveStars));

    let err = federation
        .relay_single(&RelayRequest::get("metrics").on_star("star-z"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownStar(_)));
}

#[smol_potat::test]
async fn dispatcher_routes_locally_and_across_stars() {
    let transport = Arc::new(MockTransport::default());
    let mut config = three_star_config();
    config.services.initial_register_window_ms = 0;
    let dispatcher = Dispatcher::new(
        ServiceIdentity::parse("main/dispatcher/1.0").unwrap(),
        Arc::new(DynamicConfig::new(config)),
        Arc::new(DisabledLauncher),
        Arc::new(LogOnlyControl),
        transport,
    )
    .unwrap();

    // the dispatcher registered itself under its public URL
    let own = dispatcher
        .registry()
        .registered(dispatcher.instance_id())
        .unwrap();
    assert_eq!(own.base_url, LOCAL_URL);

    let instance = dispatcher
        .registry()
        .register(
            &RegistrationRequest {
                id: "main/metrics/1.0".to_string(),
                instance_id: None,
                start_time: None,
                protocol: None,
                url: None,
            },
            "127.0.0.1:9500".parse().unwrap(),
        )
        .unwrap();

    let url = dispatcher
        .target_url("/metrics/values", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(url, format!("{}/values", instance.base_url));

    let mut foreign = BTreeMap::new();
    foreign.insert(headers::X_STAR_TARGET.to_string(), "star-b".to_string());
    let url = dispatcher
        .target_url("/metrics/values", &foreign)
        .await
        .unwrap();
    assert_eq!(url, "http://star-b:9000/metrics/values");

    // naming the local star routes locally
    let mut local = BTreeMap::new();
    local.insert(headers::X_STAR_TARGET.to_string(), "star-a".to_string());
    let url = dispatcher.target_url("/metrics/values", &local).await.unwrap();
    assert_eq!(url, format!("{}/values", instance.base_url));
}
