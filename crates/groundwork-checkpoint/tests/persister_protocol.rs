//! Protocol scenarios against a mock coordination service: schema
//! negotiation, the verbatim-then-delta upgrade path, and failure
//! retention of the diff baseline.

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use groundwork_checkpoint::diff::{apply_edits, sha256_hex};
use groundwork_checkpoint::persister::SnapshotPersister;
use groundwork_checkpoint::transport::{
    ServiceClient, StaticTokenSource, TokenSource, UpdateIdentifier,
};
use groundwork_engine::deployment::Snapshot;
use groundwork_engine::resource::ResourceState;
use groundwork_types::deployment::{DeploymentV3, UntypedDeployment};
use groundwork_types::urn::{StackId, UpdateId};
use groundwork_types::wire::TextEdit;

const BASE: &str = "/api/stacks/owner/project/stack/update/update-id";

fn update_identifier() -> UpdateIdentifier {
    UpdateIdentifier {
        stack: StackId {
            owner: "owner".into(),
            project: "project".into(),
            stack: "stack".into(),
        },
        update_id: UpdateId::new("update-id"),
    }
}

fn capabilities_body(delta_cutoff: Option<u64>, v4: bool) -> serde_json::Value {
    let mut capabilities = Vec::new();
    if let Some(cutoff) = delta_cutoff {
        capabilities.push(serde_json::json!({
            "capability": "delta-checkpoint-uploads",
            "configuration": {"checkpointCutoffSizeBytes": cutoff},
        }));
    }
    if v4 {
        capabilities.push(serde_json::json!({
            "capability": "deployment-schema-version",
            "version": 1,
            "configuration": {"version": 4},
        }));
    }
    serde_json::json!({ "capabilities": capabilities })
}

async fn mock_service(delta_cutoff: Option<u64>, v4: bool) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(capabilities_body(delta_cutoff, v4)))
        .mount(&server)
        .await;

    for endpoint in ["checkpoint", "checkpointverbatim", "checkpointdelta"] {
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/{endpoint}")))
            .and(header("authorization", "token test-token"))
            .and(header("content-encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
    }

    server
}

async fn persister_for(server: &MockServer) -> SnapshotPersister {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let client = ServiceClient::new(
        server.uri(),
        update_identifier(),
        Arc::new(StaticTokenSource("test-token".into())) as Arc<dyn TokenSource>,
    );
    SnapshotPersister::connect(client).await.unwrap()
}

fn snapshot(resources: &[(&str, bool)]) -> Snapshot {
    Snapshot {
        resources: resources
            .iter()
            .map(|(urn, refresh_before_update)| {
                let mut state = ResourceState::new(*urn);
                state.refresh_before_update = *refresh_before_update;
                Arc::new(state)
            })
            .collect(),
        ..Default::default()
    }
}

/// Decompressed bodies of the PATCH requests received at one endpoint,
/// in arrival order.
async fn raw_bodies_at(server: &MockServer, endpoint: &str) -> Vec<Vec<u8>> {
    let wanted = format!("{BASE}/{endpoint}");
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|request| request.url.path() == wanted)
        .map(|request| {
            let mut decoder = GzDecoder::new(request.body.as_slice());
            let mut body = Vec::new();
            decoder
                .read_to_end(&mut body)
                .expect("request body is gzip");
            body
        })
        .collect()
}

/// The same bodies, parsed as JSON for field assertions.
async fn bodies_at(server: &MockServer, endpoint: &str) -> Vec<serde_json::Value> {
    raw_bodies_at(server, endpoint)
        .await
        .iter()
        .map(|body| serde_json::from_slice(body).expect("request body is JSON"))
        .collect()
}

fn resource_urns(deployment: &DeploymentV3) -> Vec<String> {
    deployment
        .resources
        .iter()
        .map(|r| r.urn.as_str().to_string())
        .collect()
}

/// Mimics the service side of the diff protocol: applies a verbatim or
/// delta body to the persisted text, verifying the checkpoint hash.
struct PersistedState {
    text: String,
}

impl PersistedState {
    /// Persist a verbatim body, keeping the exact bytes the client
    /// chose: the raw text is the baseline every later delta applies to.
    fn accept_verbatim(&mut self, raw_body: &[u8]) {
        let request: groundwork_types::wire::PatchCheckpointVerbatimRequest =
            serde_json::from_slice(raw_body).unwrap();
        self.text = request.untyped_deployment.get().to_string();
    }

    fn accept_delta(&mut self, body: &serde_json::Value) {
        let edits: Vec<TextEdit> =
            serde_json::from_value(body["deploymentDelta"].clone()).unwrap();
        let applied = apply_edits(&self.text, &edits).unwrap();
        assert_eq!(
            body["checkpointHash"].as_str().unwrap(),
            sha256_hex(&applied),
            "service-side hash verification failed"
        );
        self.text = applied;
    }

    fn untyped(&self) -> UntypedDeployment {
        serde_json::from_str(&self.text).unwrap()
    }

    fn typed(&self) -> DeploymentV3 {
        serde_json::from_str(self.untyped().deployment.get()).unwrap()
    }
}

#[tokio::test]
async fn no_capabilities_sends_regular_v3_checkpoint() {
    let server = mock_service(None, false).await;
    let mut persister = persister_for(&server).await;

    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();

    let bodies = bodies_at(&server, "checkpoint").await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["isInvalid"], false);
    assert_eq!(bodies[0]["version"], 3);
    assert!(bodies[0].get("features").is_none());

    let deployment: DeploymentV3 =
        serde_json::from_value(bodies[0]["deployment"].clone()).unwrap();
    assert_eq!(resource_urns(&deployment), vec!["urn-1"]);

    assert!(bodies_at(&server, "checkpointverbatim").await.is_empty());
    assert!(bodies_at(&server, "checkpointdelta").await.is_empty());
}

#[tokio::test]
async fn v4_feature_with_v4_service_sends_tagged_v4() {
    let server = mock_service(None, true).await;
    let mut persister = persister_for(&server).await;

    // A v3-shaped snapshot still goes out as v3...
    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();
    // ...and one using a v4 feature goes out as v4 with the tag.
    persister.save(&snapshot(&[("urn-1", true)])).await.unwrap();

    let bodies = bodies_at(&server, "checkpoint").await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["version"], 3);
    assert!(bodies[0].get("features").is_none());

    assert_eq!(bodies[1]["version"], 4);
    assert_eq!(
        bodies[1]["features"],
        serde_json::json!(["refreshBeforeUpdate"])
    );
    let deployment: DeploymentV3 =
        serde_json::from_value(bodies[1]["deployment"].clone()).unwrap();
    assert!(deployment.resources[0].refresh_before_update);
}

#[tokio::test]
async fn v4_feature_without_v4_service_downgrades_to_v3() {
    let server = mock_service(None, false).await;
    let mut persister = persister_for(&server).await;

    persister.save(&snapshot(&[("urn-1", true)])).await.unwrap();

    let bodies = bodies_at(&server, "checkpoint").await;
    assert_eq!(bodies[0]["version"], 3);
    assert!(bodies[0].get("features").is_none());

    // The feature tag is dropped but the per-resource field still rides
    // inside the v3 payload.
    let deployment: DeploymentV3 =
        serde_json::from_value(bodies[0]["deployment"].clone()).unwrap();
    assert!(deployment.resources[0].refresh_before_update);
}

#[tokio::test]
async fn delta_protocol_first_verbatim_then_deltas() {
    let server = mock_service(Some(1), true).await;
    let mut persister = persister_for(&server).await;
    let mut persisted = PersistedState {
        text: String::new(),
    };

    // Save 1: always verbatim, establishing the baseline.
    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();
    let verbatims = bodies_at(&server, "checkpointverbatim").await;
    assert_eq!(verbatims.len(), 1);
    assert_eq!(verbatims[0]["sequenceNumber"], 1);
    assert_eq!(verbatims[0]["version"], 3);
    let raw_verbatims = raw_bodies_at(&server, "checkpointverbatim").await;
    persisted.accept_verbatim(&raw_verbatims[0]);
    assert_eq!(persisted.untyped().version, 3);
    assert_eq!(resource_urns(&persisted.typed()), vec!["urn-1"]);

    // Save 2: a resource appears; ships as a delta.
    persister
        .save(&snapshot(&[("urn-1", false), ("urn-2", false)]))
        .await
        .unwrap();
    let deltas = bodies_at(&server, "checkpointdelta").await;
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0]["sequenceNumber"], 2);
    persisted.accept_delta(&deltas[0]);
    assert_eq!(resource_urns(&persisted.typed()), vec!["urn-1", "urn-2"]);

    // Save 3: a resource disappears; still the diff protocol.
    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();
    let deltas = bodies_at(&server, "checkpointdelta").await;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[1]["sequenceNumber"], 3);
    persisted.accept_delta(&deltas[1]);
    assert_eq!(resource_urns(&persisted.typed()), vec!["urn-1"]);

    // Save 4: a v4 feature appears mid-update; the delta carries the
    // version-4 envelope.
    persister.save(&snapshot(&[("urn-1", true)])).await.unwrap();
    let deltas = bodies_at(&server, "checkpointdelta").await;
    assert_eq!(deltas.len(), 3);
    assert_eq!(deltas[2]["sequenceNumber"], 4);
    assert_eq!(deltas[2]["version"], 4);
    persisted.accept_delta(&deltas[2]);
    assert_eq!(persisted.untyped().version, 4);
    assert_eq!(
        persisted.untyped().features,
        Some(vec!["refreshBeforeUpdate".to_string()])
    );
    assert!(persisted.typed().resources[0].refresh_before_update);

    // No regular checkpoints were ever sent.
    assert!(bodies_at(&server, "checkpoint").await.is_empty());
}

#[tokio::test]
async fn below_cutoff_snapshots_stay_verbatim() {
    let server = mock_service(Some(1024 * 1024), false).await;
    let mut persister = persister_for(&server).await;

    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();
    persister
        .save(&snapshot(&[("urn-1", false), ("urn-2", false)]))
        .await
        .unwrap();

    let verbatims = bodies_at(&server, "checkpointverbatim").await;
    assert_eq!(verbatims.len(), 2);
    assert_eq!(verbatims[0]["sequenceNumber"], 1);
    assert_eq!(verbatims[1]["sequenceNumber"], 2);
    assert!(bodies_at(&server, "checkpointdelta").await.is_empty());
}

#[tokio::test]
async fn failed_save_retains_the_baseline() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(capabilities_body(Some(1), false)))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{BASE}/checkpointverbatim")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;
    // The first delta attempt is rejected; later ones succeed.
    Mock::given(method("PATCH"))
        .and(path(format!("{BASE}/checkpointdelta")))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{BASE}/checkpointdelta")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let mut persister = persister_for(&server).await;
    let mut persisted = PersistedState {
        text: String::new(),
    };

    persister.save(&snapshot(&[("urn-1", false)])).await.unwrap();
    let raw_verbatims = raw_bodies_at(&server, "checkpointverbatim").await;
    persisted.accept_verbatim(&raw_verbatims[0]);

    // The rejected save surfaces the HTTP failure...
    let err = persister
        .save(&snapshot(&[("urn-1", false), ("urn-2", false)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));

    // ...and the baseline did not advance: the retry's delta applies
    // cleanly to the state established by the verbatim save, with a
    // body identical to the failed attempt modulo the sequence number.
    persister
        .save(&snapshot(&[("urn-1", false), ("urn-2", false)]))
        .await
        .unwrap();

    let deltas = bodies_at(&server, "checkpointdelta").await;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0]["sequenceNumber"], 2);
    assert_eq!(deltas[1]["sequenceNumber"], 3);
    assert_eq!(deltas[0]["deploymentDelta"], deltas[1]["deploymentDelta"]);
    assert_eq!(deltas[0]["checkpointHash"], deltas[1]["checkpointHash"]);

    persisted.accept_delta(&deltas[1]);
    assert_eq!(resource_urns(&persisted.typed()), vec!["urn-1", "urn-2"]);
}

#[tokio::test]
async fn capability_fetch_failure_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/capabilities"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    let client = ServiceClient::new(
        server.uri(),
        update_identifier(),
        Arc::new(StaticTokenSource("test-token".into())) as Arc<dyn TokenSource>,
    );
    let err = SnapshotPersister::connect(client).await.unwrap_err();
    assert!(err.to_string().contains("503"));
}
