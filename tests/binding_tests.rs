//! Tests for the binding snapshot engine

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;

use threescale_operator::crd::{
    Api, ApiLimitSpec, ApiMappingRuleSpec, ApiMetricSpec, ApiPlanSpec, ApiSpec, Binding,
    BindingSpec, LabelSelector, SecretReference,
};
use threescale_operator::error::SyncError;
use threescale_operator::reconcilers::binding::{
    binding_account, desired_state, parse_state, plan, reconcile, BindingContext, BindingOutcome,
    InternalApi, InternalPlan, Plan, State,
};
use threescale_operator::remote::Owner;

use common::{provider_secret, FakeGateway, FixedClock, MemoryStore, ADMIN_URL, NAMESPACE};

// ============================================================================
// Test Helpers
// ============================================================================

fn api(name: &str, team: &str) -> Api {
    let mut api = Api::new(
        name,
        ApiSpec {
            description: format!("{} api", name),
            metrics: vec![ApiMetricSpec {
                name: "searches".to_string(),
                unit: "search".to_string(),
                description: String::new(),
            }],
            plans: vec![ApiPlanSpec {
                name: "basic".to_string(),
                default: true,
                trial_period: 0,
                approval_required: false,
                limits: vec![ApiLimitSpec {
                    period: "day".to_string(),
                    max_value: 500,
                    metric: "searches".to_string(),
                }],
            }],
            mapping_rules: vec![ApiMappingRuleSpec {
                method: "get".to_string(),
                path: "/search".to_string(),
                increment: 1,
                metric: "searches".to_string(),
            }],
        },
    );
    api.metadata.namespace = Some(NAMESPACE.to_string());
    api.metadata.labels = Some(BTreeMap::from([("team".to_string(), team.to_string())]));
    api
}

fn binding() -> Binding {
    let mut binding = Binding::new(
        "pets-binding",
        BindingSpec {
            credentials_ref: SecretReference {
                name: "pets-account".to_string(),
                namespace: None,
            },
            api_selector: LabelSelector {
                match_labels: BTreeMap::from([("team".to_string(), "pets".to_string())]),
            },
        },
    );
    binding.metadata.namespace = Some(NAMESPACE.to_string());
    binding
}

struct Env {
    apis: Arc<MemoryStore<Api>>,
    bindings: Arc<MemoryStore<Binding>>,
    gateway: Arc<FakeGateway>,
}

impl Env {
    fn new() -> Self {
        let bindings = Arc::new(MemoryStore::new());
        bindings.insert(binding());
        Self {
            apis: Arc::new(MemoryStore::new()),
            bindings,
            gateway: FakeGateway::new(),
        }
    }

    /// One pass against the latest stored binding
    async fn pass(&self) -> threescale_operator::Result<BindingOutcome> {
        let mut ctx = BindingContext {
            binding: self.bindings.fetch(NAMESPACE, "pets-binding").unwrap(),
            namespace: NAMESPACE.to_string(),
            apis: self.apis.clone(),
            bindings: self.bindings.clone(),
            gateway: self.gateway.clone(),
            clock: Arc::new(FixedClock::at(1_700_000_000)),
        };
        reconcile(&mut ctx).await
    }

    fn stored_status(&self) -> threescale_operator::crd::BindingStatus {
        self.bindings
            .fetch(NAMESPACE, "pets-binding")
            .and_then(|b| b.status)
            .unwrap_or_default()
    }
}

fn internal(description: &str) -> InternalApi {
    InternalApi {
        description: description.to_string(),
        ..Default::default()
    }
}

fn state(entries: &[(&str, InternalApi)]) -> State {
    entries
        .iter()
        .map(|(name, api)| (name.to_string(), api.clone()))
        .collect()
}

// ============================================================================
// Planning
// ============================================================================

#[test]
fn equal_desired_and_current_plans_nothing() {
    let desired = state(&[("pets", internal("a"))]);
    assert!(plan(&desired, &desired, &State::new()).is_empty());
}

#[test]
fn missing_and_differing_apis_are_created_and_updated() {
    let desired = state(&[("pets", internal("a")), ("stores", internal("b"))]);
    let current = state(&[("stores", internal("old"))]);

    let result = plan(&desired, &current, &State::new());

    assert_eq!(
        result,
        Plan {
            create: vec!["pets".to_string()],
            update: vec!["stores".to_string()],
            delete: vec![],
        }
    );
}

#[test]
fn deletion_needs_previous_and_current() {
    let desired = State::new();
    let previous = state(&[("pets", internal("a")), ("gone", internal("b"))]);
    let current = state(&[("pets", internal("a")), ("foreign", internal("c"))]);

    let result = plan(&desired, &current, &previous);

    // "gone" is already absent remotely and "foreign" was never applied here
    assert_eq!(result.delete, vec!["pets".to_string()]);
    assert!(result.create.is_empty());
}

#[test]
fn empty_or_missing_serialized_state_is_empty() {
    assert!(parse_state(None).unwrap().is_empty());
    assert!(parse_state(Some("")).unwrap().is_empty());
    assert!(parse_state(Some("not json")).is_err());
}

// ============================================================================
// Desired state
// ============================================================================

#[test]
fn desired_state_adds_hits_and_normalizes_rules() {
    let desired = desired_state(&[api("search", "pets")]).unwrap();
    let search = &desired["search"];

    assert!(search.metrics.contains_key("hits"));
    assert!(search.metrics.contains_key("searches"));
    let rule = &search.mapping_rules["GET:/search"];
    assert_eq!(rule.method, "GET");
    assert_eq!(search.plans["basic"].limits["searches:day"].max_value, 500);
}

#[test]
fn unknown_metric_reference_is_invalid() {
    let mut broken = api("search", "pets");
    broken.spec.plans[0].limits[0].metric = "missing".to_string();

    let err = desired_state(&[broken]).unwrap_err();
    assert!(matches!(err.classify(), SyncError::Invalid(m) if m.contains("missing")));
}

#[test]
fn plan_to_product_spec_keeps_plan_fields() {
    let mut search = InternalApi::from_resource(&api("search", "pets")).unwrap();
    search.plans.insert(
        "trial".to_string(),
        InternalPlan {
            name: "trial".to_string(),
            trial_period: 14,
            approval_required: true,
            ..Default::default()
        },
    );

    let spec = search.to_product_spec("search");

    assert_eq!(spec.system_name, "search");
    assert_eq!(spec.mapping_rules.len(), 1);
    let trial = &spec.application_plans["trial"];
    assert_eq!(trial.trial_period, Some(14));
    assert_eq!(trial.apps_require_approval, Some(true));
    assert!(spec.application_plans["basic"].default);
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test]
async fn credentials_default_to_binding_namespace() {
    let secrets = MemoryStore::<Secret>::new();
    secrets.insert(provider_secret("pets-account"));

    let account = binding_account(&binding(), &secrets).await.unwrap();
    assert_eq!(account.admin_url, ADMIN_URL);
}

#[tokio::test]
async fn credentials_in_other_namespace_are_honoured() {
    let secrets = MemoryStore::<Secret>::new();
    let mut secret = provider_secret("shared-account");
    secret.metadata.namespace = Some("tenants".to_string());
    secrets.insert(secret);

    let mut binding = binding();
    binding.spec.credentials_ref = SecretReference {
        name: "shared-account".to_string(),
        namespace: Some("tenants".to_string()),
    };

    assert!(binding_account(&binding, &secrets).await.is_ok());

    binding.spec.credentials_ref.namespace = None;
    let err = binding_account(&binding, &secrets).await.unwrap_err();
    assert!(matches!(err.classify(), SyncError::Orphan(_)));
}

// ============================================================================
// Reconcile
// ============================================================================

#[tokio::test]
async fn first_pass_creates_selected_apis_and_records_state() {
    let env = Env::new();
    env.apis.insert(api("search", "pets"));
    env.apis.insert(api("billing", "finance"));

    let outcome = env.pass().await.unwrap();

    assert_eq!(outcome.applied.create, vec!["search".to_string()]);
    assert!(outcome.status_written);

    let product = env.gateway.product_named("search").expect("product created");
    assert!(env.gateway.product_named("billing").is_none());
    assert_eq!(env.gateway.metrics_of(Owner::Product(product.id)).len(), 2);
    assert_eq!(env.gateway.mapping_rules_of(Owner::Product(product.id)).len(), 1);
    let plans = env.gateway.plans_of(product.id);
    assert_eq!(plans.len(), 1);
    assert!(plans[0].default);
    assert_eq!(env.gateway.limits_of(plans[0].id).len(), 1);

    let status = env.stored_status();
    assert!(status.last_sync.is_some());
    let previous = parse_state(status.previous_state.as_deref()).unwrap();
    assert_eq!(previous.keys().collect::<Vec<_>>(), vec!["search"]);
    assert_eq!(status.current_state, status.desired_state);
}

#[tokio::test]
async fn converged_binding_is_left_alone() {
    let env = Env::new();
    env.apis.insert(api("search", "pets"));
    env.pass().await.unwrap();
    env.gateway.reset_calls();

    let outcome = env.pass().await.unwrap();

    assert!(outcome.applied.is_empty());
    assert!(!outcome.status_written);
    assert!(env.gateway.writes().is_empty(), "writes: {:?}", env.gateway.writes());
}

#[tokio::test]
async fn remote_drift_is_corrected() {
    let env = Env::new();
    env.apis.insert(api("search", "pets"));
    env.pass().await.unwrap();

    let product = env.gateway.product_named("search").unwrap();
    let plan_id = env.gateway.plans_of(product.id)[0].id;
    env.gateway
        .tables
        .lock()
        .unwrap()
        .limits
        .retain(|_, (plan, _)| *plan != plan_id);

    let outcome = env.pass().await.unwrap();

    assert_eq!(outcome.applied.update, vec!["search".to_string()]);
    assert_eq!(env.gateway.limits_of(plan_id).len(), 1);
}

#[tokio::test]
async fn deselected_api_is_deleted() {
    let env = Env::new();
    env.apis.insert(api("search", "pets"));
    env.apis.insert(api("adopt", "pets"));
    env.pass().await.unwrap();

    env.apis.remove(NAMESPACE, "adopt");
    let outcome = env.pass().await.unwrap();

    assert_eq!(outcome.applied.delete, vec!["adopt".to_string()]);
    assert!(env.gateway.product_named("adopt").is_none());
    assert!(env.gateway.product_named("search").is_some());

    let previous = parse_state(env.stored_status().previous_state.as_deref()).unwrap();
    assert!(!previous.contains_key("adopt"));
}

#[tokio::test]
async fn products_not_applied_by_the_binding_survive() {
    let env = Env::new();
    env.gateway.seed_product("legacy");
    env.apis.insert(api("search", "pets"));

    env.pass().await.unwrap();
    env.apis.remove(NAMESPACE, "search");
    env.pass().await.unwrap();

    assert!(env.gateway.product_named("legacy").is_some());
    assert!(env.gateway.product_named("search").is_none());
}

#[tokio::test]
async fn invalid_api_fails_the_pass_without_remote_writes() {
    let env = Env::new();
    let mut broken = api("search", "pets");
    broken.spec.mapping_rules[0].method = "FETCH".to_string();
    env.apis.insert(broken);

    let err = env.pass().await.unwrap_err();

    assert!(matches!(err.classify(), SyncError::Invalid(_)));
    assert!(env.gateway.calls().is_empty());
    assert!(env.stored_status().previous_state.is_none());
}

#[tokio::test]
async fn api_with_two_default_plans_is_invalid() {
    let env = Env::new();
    let mut broken = api("search", "pets");
    let mut premium = broken.spec.plans[0].clone();
    premium.name = "premium".to_string();
    broken.spec.plans.push(premium);
    env.apis.insert(broken);

    let err = env.pass().await.unwrap_err();

    assert!(matches!(err.classify(), SyncError::Invalid(m) if m.contains("basic, premium")));
    assert!(env.gateway.calls().is_empty());
}

#[tokio::test]
async fn remote_failure_leaves_previous_state_untouched() {
    let env = Env::new();
    env.apis.insert(api("search", "pets"));
    env.gateway.fail_on("create_plan");

    let err = env.pass().await.unwrap_err();

    assert!(matches!(err.classify(), SyncError::Transient(m) if m.contains("api search")));
    assert!(env.stored_status().previous_state.is_none());
}
