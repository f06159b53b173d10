//! Common test utilities and helpers

use mnemograph_core::{
    context::{CharRatioEstimator, ContextAssembler, ContextConfig},
    export::ExportEngine,
    mutation::{
        AddObservationsRequest, CreateEntitiesRequest, EntitySpec, MutationEngine, ObservationSpec,
    },
    notify::NullNotifier,
    storage::libsql::{ConnectionMode, LibsqlStore},
    types::{AuthType, RequestContext},
    vector::InMemoryVectorIndex,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything a test needs, wired against one temp database
pub struct TestHarness {
    pub store: Arc<LibsqlStore>,
    pub vector: Arc<InMemoryVectorIndex>,
    pub mutations: MutationEngine,
    pub export: ExportEngine,
    pub assembler: ContextAssembler,
}

/// Create a store on a temp file. libSQL's `:memory:` mode gives every
/// connection its own database, so migrations would not persist; a
/// uuid-suffixed temp file sidesteps that.
pub async fn create_test_store() -> Arc<LibsqlStore> {
    let temp_file = format!(
        "{}/mnemograph_test_{}.db",
        std::env::temp_dir().display(),
        uuid::Uuid::new_v4()
    );
    Arc::new(
        LibsqlStore::new(ConnectionMode::Local(temp_file))
            .await
            .expect("Failed to create test storage"),
    )
}

pub async fn harness() -> TestHarness {
    let store = create_test_store().await;
    let vector = Arc::new(InMemoryVectorIndex::new());

    let mutations = MutationEngine::new(
        store.clone(),
        vector.clone(),
        Arc::new(NullNotifier),
        false,
        Duration::from_secs(1),
    );
    let export = ExportEngine::new(store.clone(), false);
    let assembler = ContextAssembler::new(
        store.clone(),
        Arc::new(CharRatioEstimator::default()),
        ContextConfig::default(),
        false,
    );

    TestHarness {
        store,
        vector,
        mutations,
        export,
        assembler,
    }
}

/// Trusted local bypass context for a tenant
pub fn dev_context(tenant: &str) -> RequestContext {
    RequestContext::dev(tenant, "test-agent")
}

/// JWT context with the given roles
pub fn jwt_context(tenant: &str, user: &str, roles: &[&str]) -> RequestContext {
    RequestContext {
        tenant_id: tenant.to_string(),
        user_id: user.to_string(),
        auth_type: AuthType::Jwt,
        api_key_id: None,
        roles: roles.iter().map(|r| r.to_string()).collect(),
        scopes: Vec::new(),
    }
}

/// Create one entity through the mutation pipeline
pub async fn create_entity(
    harness: &TestHarness,
    context: &RequestContext,
    name: &str,
    entity_type: &str,
) {
    harness
        .mutations
        .create_entities(
            context,
            &CreateEntitiesRequest {
                entities: vec![EntitySpec {
                    name: name.to_string(),
                    entity_type: entity_type.to_string(),
                }],
            },
        )
        .await
        .expect("entity creation failed");
}

/// Attach one observation to an entity
pub async fn add_observation(
    harness: &TestHarness,
    context: &RequestContext,
    entity_name: &str,
    contents: &[&str],
    message_type: Option<&str>,
) {
    harness
        .mutations
        .add_observations(
            context,
            &AddObservationsRequest {
                observations: vec![ObservationSpec {
                    entity_name: entity_name.to_string(),
                    contents: contents.iter().map(|c| c.to_string()).collect(),
                    message_type: message_type.map(String::from),
                    sensitive: None,
                }],
            },
        )
        .await
        .expect("observation creation failed");
}
