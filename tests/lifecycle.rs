//! End-to-end lifecycle of one shoot's accounting extension against in-memory
//! collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use parking_lot::Mutex;
use serde_json::{json, Value};

use accounting::assembler::ResourceAssembler;
use accounting::bundle::{BundleScope, ResourceBundle};
use accounting::cache::{FetchAll, FetchAllCache};
use accounting::config::ControllerConfiguration;
use accounting::controller::{reconcile, Actuator, Context, KubeClient, DEFAULT_RESYNC_INTERVAL};
use accounting::crd::{
    Cluster, ClusterSpec, Extension, ExtensionSpec, ExtensionStatus, LastOperationState,
};
use accounting::error::ERR_RETRYABLE_INFRA_DEPENDENCIES;
use accounting::imagevector::ImageVector;
use accounting::inventory::InventoryRecord;
use accounting::manifest_store::{ApplyOutcome, ManifestStore};
use accounting::{Error, CLUSTER_BUNDLE, CONTROL_PLANE_BUNDLE, EXTENSION_TYPE, FINALIZER};

const NAMESPACE: &str = "shoot--p1--c1";

const CONFIG: &str = r#"
apiVersion: accounting.fits.extensions.config.gardener.cloud/v1alpha1
kind: ControllerConfiguration
accounting:
  metalURL: https://metal.example.com/metal
  metalHMAC: change-me
  hostname: accounting.example.com
  port: "9000"
  ca: CA-PEM
  cert: CERT-PEM
  key: KEY-PEM
"#;

fn cluster(hibernated: bool) -> Cluster {
    Cluster::new(
        NAMESPACE,
        ClusterSpec {
            cloud_profile: Value::Null,
            seed: Value::Null,
            shoot: json!({
                "metadata": {"name": "c1", "namespace": "garden-p1", "uid": "c1"},
                "spec": {
                    "hibernation": {"enabled": hibernated},
                    "provider": {
                        "type": "metal",
                        "infrastructureConfig": {
                            "apiVersion": "metal.provider.extensions.gardener.cloud/v1alpha1",
                            "kind": "InfrastructureConfig",
                            "partitionID": "fra-equ01",
                            "projectID": "p1"
                        }
                    }
                }
            }),
        },
    )
}

#[derive(Default)]
struct FakeKube {
    clusters: Mutex<HashMap<String, Cluster>>,
    statuses: Mutex<Vec<ExtensionStatus>>,
    finalizers: Mutex<Vec<String>>,
    access_secrets: AtomicUsize,
}

impl FakeKube {
    fn with_cluster(cluster: Cluster) -> Self {
        let fake = Self::default();
        fake.set_cluster(cluster);
        fake
    }

    fn set_cluster(&self, cluster: Cluster) {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.clusters.lock().insert(name, cluster);
    }

    fn last_status(&self) -> ExtensionStatus {
        self.statuses.lock().last().cloned().expect("status patched")
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.clusters.lock().get(name).cloned())
    }

    async fn ensure_access_secret(&self, _secret: &Secret) -> Result<(), Error> {
        self.access_secrets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn patch_extension_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error> {
        self.statuses.lock().push(status.clone());
        Ok(())
    }

    async fn add_finalizer(&self, _extension: &Extension) -> Result<(), Error> {
        self.finalizers.lock().push(FINALIZER.to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, _extension: &Extension) -> Result<(), Error> {
        self.finalizers.lock().retain(|f| f != FINALIZER);
        Ok(())
    }

    async fn remove_operation_annotation(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Store keeping bundles in memory, keyed by namespace and name
#[derive(Default)]
struct MemoryStore {
    bundles: Mutex<HashMap<(String, String), (String, ResourceBundle)>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    fn bundle(&self, name: &str) -> Option<ResourceBundle> {
        self.bundles
            .lock()
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .map(|(_, b)| b.clone())
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn apply_bundle(&self, bundle: &ResourceBundle) -> Result<ApplyOutcome, Error> {
        let digest = bundle.digest()?;
        let key = (bundle.namespace.clone(), bundle.name.clone());
        let mut bundles = self.bundles.lock();
        if bundles.get(&key).is_some_and(|(d, _)| *d == digest) {
            return Ok(ApplyOutcome::Unchanged);
        }
        bundles.insert(key, (digest, bundle.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(ApplyOutcome::Applied)
    }

    async fn delete_bundle(
        &self,
        _scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        self.bundles
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn is_deleted(
        &self,
        _scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        Ok(!self
            .bundles
            .lock()
            .contains_key(&(namespace.to_string(), name.to_string())))
    }
}

#[derive(Default)]
struct Inventory {
    fetches: AtomicUsize,
    down: AtomicBool,
}

#[async_trait]
impl FetchAll<String, InventoryRecord> for Inventory {
    async fn fetch_all(&self) -> Result<HashMap<String, InventoryRecord>, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::fetch("metal-api unavailable"));
        }
        Ok(HashMap::from([(
            "p1".to_string(),
            InventoryRecord {
                project_id: "p1".to_string(),
                tenant_id: "t1".to_string(),
                name: "proj-one".to_string(),
            },
        )]))
    }
}

struct Harness {
    kube: Arc<FakeKube>,
    store: Arc<MemoryStore>,
    inventory: Arc<Inventory>,
    ctx: Arc<Context>,
}

fn harness(ttl: Duration) -> Harness {
    let kube = Arc::new(FakeKube::with_cluster(cluster(false)));
    let store = Arc::new(MemoryStore::default());
    let inventory = Arc::new(Inventory::default());

    let actuator = Actuator::new(
        Arc::new(ControllerConfiguration::from_yaml(CONFIG).unwrap()),
        kube.clone(),
        store.clone(),
        FetchAllCache::new(ttl, inventory.clone()),
        ResourceAssembler::new(ImageVector::embedded().unwrap()),
    );
    let ctx = Arc::new(Context::new(kube.clone(), actuator));
    Harness {
        kube,
        store,
        inventory,
        ctx,
    }
}

fn extension() -> Arc<Extension> {
    let mut ext = Extension::new(
        "accounting",
        ExtensionSpec {
            type_: EXTENSION_TYPE.to_string(),
            provider_config: None,
        },
    );
    ext.metadata.namespace = Some(NAMESPACE.to_string());
    Arc::new(ext)
}

fn exporter_env(bundle: &ResourceBundle) -> HashMap<String, String> {
    let deployment = bundle
        .find("Deployment", "accounting-exporter")
        .expect("exporter deployment");
    deployment.manifest["spec"]["template"]["spec"]["containers"][0]["env"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["name"].as_str().unwrap().to_string(),
                e["value"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn replicas(bundle: &ResourceBundle) -> i64 {
    bundle
        .find("Deployment", "accounting-exporter")
        .expect("exporter deployment")
        .manifest["spec"]["replicas"]
        .as_i64()
        .unwrap()
}

/// Story: a new shoot in project p1 gets an exporter labelled with tenant t1
/// and project "proj-one", and a second reconcile writes nothing.
#[tokio::test]
async fn story_new_shoot_gets_a_labelled_exporter() {
    let h = harness(Duration::from_secs(1800));

    let action = reconcile(extension(), h.ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));

    let control_plane = h.store.bundle(CONTROL_PLANE_BUNDLE).unwrap();
    let env = exporter_env(&control_plane);
    assert_eq!(env["KUBE_COUNTER_TENANT"], "t1");
    assert_eq!(env["KUBE_COUNTER_PROJECT_ID"], "p1");
    assert_eq!(env["KUBE_COUNTER_PROJECT_NAME"], "proj-one");
    assert_eq!(env["KUBE_COUNTER_CLUSTER_ID"], "c1");
    assert_eq!(env["KUBE_COUNTER_PARTITION"], "fra-equ01");
    assert_eq!(replicas(&control_plane), 1);

    let shoot = h.store.bundle(CLUSTER_BUNDLE).unwrap();
    assert_eq!(shoot.scope, BundleScope::Cluster);
    assert!(shoot.find("ClusterRole", "system:accounting-exporter").is_some());

    assert_eq!(h.kube.finalizers.lock().as_slice(), [FINALIZER.to_string()]);
    assert_eq!(h.store.writes(), 2);

    reconcile(extension(), h.ctx.clone()).await.unwrap();
    assert_eq!(h.store.writes(), 2, "unchanged inputs must not write");
    assert_eq!(h.inventory.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.kube.access_secrets.load(Ordering::SeqCst), 2);
}

/// Story: hibernating the shoot scales the exporter to zero and leaves the
/// shoot-side bundle untouched.
#[tokio::test]
async fn story_hibernation_scales_to_zero() {
    let h = harness(Duration::from_secs(1800));
    reconcile(extension(), h.ctx.clone()).await.unwrap();
    let awake = h.store.bundle(CONTROL_PLANE_BUNDLE).unwrap();

    h.kube.set_cluster(cluster(true));
    reconcile(extension(), h.ctx.clone()).await.unwrap();

    let asleep = h.store.bundle(CONTROL_PLANE_BUNDLE).unwrap();
    assert_eq!(replicas(&asleep), 0);
    assert_eq!(exporter_env(&asleep), exporter_env(&awake));
    assert_eq!(h.store.writes(), 3, "only the control-plane bundle changes");
}

/// Story: deleting the Extension removes both bundles and releases the
/// finalizer.
#[tokio::test]
async fn story_delete_cleans_up() {
    let h = harness(Duration::from_secs(1800));
    reconcile(extension(), h.ctx.clone()).await.unwrap();

    let mut deleting = (*extension()).clone();
    deleting.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    deleting.metadata.deletion_timestamp =
        Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));

    let action = reconcile(Arc::new(deleting), h.ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.bundle(CONTROL_PLANE_BUNDLE).is_none());
    assert!(h.store.bundle(CLUSTER_BUNDLE).is_none());
    assert!(h.kube.finalizers.lock().is_empty());
    assert_eq!(
        h.kube.last_status().last_operation.unwrap().state,
        LastOperationState::Succeeded
    );
}

/// Story: when the inventory is down after the snapshot expired, the
/// reconcile fails retryably and the applied bundles stay as they were.
#[tokio::test(start_paused = true)]
async fn story_inventory_outage_keeps_applied_state() {
    let ttl = Duration::from_secs(60);
    let h = harness(ttl);
    reconcile(extension(), h.ctx.clone()).await.unwrap();

    h.inventory.down.store(true, Ordering::SeqCst);
    tokio::time::advance(ttl + Duration::from_secs(1)).await;

    let err = reconcile(extension(), h.ctx.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
    assert!(err.is_retryable());

    let status = h.kube.last_status();
    assert_eq!(status.last_operation.unwrap().state, LastOperationState::Error);
    assert_eq!(
        status.last_error.unwrap().codes,
        vec![ERR_RETRYABLE_INFRA_DEPENDENCIES.to_string()]
    );
    assert_eq!(h.store.writes(), 2);
    assert!(h.store.bundle(CONTROL_PLANE_BUNDLE).is_some());
}
