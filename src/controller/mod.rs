use std::collections::HashSet;

use futures_util::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher};
use kube::{Api, Client, Config, ResourceExt};
use tracing::{info, warn};

use crate::config::*;
use crate::controller::storage_class_utils::is_controlling_storage_class;
use crate::errors::Result;
use crate::ext::ReflinkerResourceExt;
use crate::guid::Guid;
use crate::quantity_parser::QuantityParser;
use crate::types::ClaimCoordinates;
use crate::{cleanup, introspector, job_builder, volume_publisher};

pub mod storage_class_utils;

enum WatchedResource {
    Pvc(Event<PersistentVolumeClaim>),
    Pv(Event<PersistentVolume>),
    Job(Event<Job>),
}

/// The [Controller] watches claims, SnapshotVolumes, and backup/cleanup
/// Jobs, and drives the state machine in §4.3: Pending claim -> resolve
/// source -> publish pre-bound volume -> run backup -> bind or clean up.
///
/// `concluded_jobs` is a cache, not state: it only suppresses duplicate
/// log lines and redundant API calls for a Job whose terminal status was
/// already handled in this process's lifetime. Every action it guards
/// (bind, delete) is itself idempotent, so losing this cache on restart
/// is harmless — the controller carries no state that restart-safety
/// actually depends on.
pub struct Controller {
    client: Client,
    concluded_jobs: HashSet<String>,
}

impl Controller {
    pub async fn create() -> Result<Self> {
        let client = Client::try_default()
            .await
            .or_else(|_| Client::try_from(Config::incluster_env().expect("failed to load in-cluster kube config")))
            .expect("failed to create kube client");

        Ok(Controller {
            client,
            concluded_jobs: HashSet::new(),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(version = VERSION, "controller started");
        self.watch_resources().await
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    async fn watch_resources(&mut self) -> Result<()> {
        let claims = Api::<PersistentVolumeClaim>::all(self.client());
        let volumes = Api::<PersistentVolume>::all(self.client());
        let jobs = Api::<Job>::all(self.client());

        let managed_label_selector = Some(format!("{MANAGED_BY_LABEL_KEY}={MANAGED_BY_LABEL_VALUE}"));

        let (_, claim_writer) = reflector::store();
        let (_, volume_writer) = reflector::store();
        let (_, job_writer) = reflector::store();

        let claim_reflector =
            reflector(claim_writer, watcher(claims, watcher::Config::default())).map_ok(WatchedResource::Pvc);
        let volume_reflector = reflector(
            volume_writer,
            watcher(
                volumes,
                watcher::Config {
                    label_selector: managed_label_selector.clone(),
                    ..watcher::Config::default()
                },
            ),
        )
        .map_ok(WatchedResource::Pv);
        let job_reflector = reflector(
            job_writer,
            watcher(
                jobs,
                watcher::Config {
                    label_selector: managed_label_selector,
                    ..watcher::Config::default()
                },
            ),
        )
        .map_ok(WatchedResource::Job);

        let stream = stream::select_all(vec![
            claim_reflector.boxed(),
            volume_reflector.boxed(),
            job_reflector.boxed(),
        ]);
        tokio::pin!(stream);

        while let Ok(Some(watched)) = stream.try_next().await {
            let outcome = match watched {
                WatchedResource::Pvc(event) => self.process_claim_event(event).await,
                WatchedResource::Pv(event) => self.process_volume_event(event).await,
                WatchedResource::Job(event) => self.process_job_event(event).await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "failed to process event");
            }
        }

        Ok(())
    }

    async fn process_claim_event(&mut self, event: Event<PersistentVolumeClaim>) -> Result<()> {
        for claim in event.into_iter_applied() {
            let Some(spec) = claim.spec.as_ref() else { continue };
            let Some(storage_class_name) = spec.storage_class_name.as_ref() else { continue };

            if !is_controlling_storage_class(&self.client(), storage_class_name).await? {
                continue;
            }

            let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
            match phase {
                "Pending" => self.handle_pending_claim(&claim, storage_class_name).await?,
                "Bound" => info!(claim = %claim.full_name(), "claim already bound"),
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_pending_claim(&self, claim: &PersistentVolumeClaim, storage_class_name: &str) -> Result<()> {
        process_pending_claim(self.client(), claim.clone(), storage_class_name.to_string()).await
    }

    async fn process_volume_event(&mut self, event: Event<PersistentVolume>) -> Result<()> {
        match event {
            Event::Applied(volume) => {
                if volume.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
                    warn!(volume = %volume.full_name(), "SnapshotVolume entered Failed phase, deleting");
                    let volumes: Api<PersistentVolume> = Api::all(self.client());
                    let _ = volumes.delete(&volume.name_any(), &Default::default()).await;
                }
            }
            Event::Deleted(volume) => {
                let reclaim_policy = volume
                    .spec
                    .as_ref()
                    .and_then(|s| s.persistent_volume_reclaim_policy.clone())
                    .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string());
                let annotations = volume.annotations().clone();
                cleanup::handle_volume_deleted(&self.client(), &volume.name_any(), &reclaim_policy, &annotations)
                    .await?;
            }
            Event::Restarted(_) => {}
        }
        Ok(())
    }

    async fn process_job_event(&mut self, event: Event<Job>) -> Result<()> {
        for job in event.into_iter_applied() {
            let name = job.name_any();
            let Some(guid) = Guid::from_backup_job_name(&name) else {
                // Not a backup job (e.g. a cleanup job), nothing to do.
                continue;
            };

            let status = job.status.as_ref();
            let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0) > 0;
            let failed = status.and_then(|s| s.failed).unwrap_or(0) > 0;

            if succeeded && self.concluded_jobs.insert(format!("{name}/succeeded")) {
                let storage_class = self.read_storage_class_for_volume(guid).await?;
                if let Some(storage_class) = storage_class {
                    match volume_publisher::bind(&self.client(), guid, &storage_class).await {
                        Ok(volume_publisher::BindOutcome::Bound(pv)) => {
                            info!(volume = %pv.full_name(), "backup succeeded, volume bound");
                        }
                        Ok(volume_publisher::BindOutcome::AlreadyBoundOrGone) => {}
                        Err(e) => warn!(job = %name, error = %e, "failed to bind volume after successful backup"),
                    }
                }
            }

            if failed && self.concluded_jobs.insert(format!("{name}/failed")) {
                warn!(job = %name, "backup job failed, deleting pre-bound volume");
                cleanup::delete_volume_for_failed_backup(&self.client(), guid).await?;
            }
        }
        Ok(())
    }

    async fn read_storage_class_for_volume(&self, guid: Guid) -> Result<Option<String>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client());
        let Some(volume) = volumes.get_opt(&guid.volume_name()).await? else {
            return Ok(None);
        };
        Ok(volume
            .annotations()
            .get(ANNOTATION_STORAGE_CLASS)
            .cloned())
    }
}

/// The actual Pending-claim handling logic (§4.3), pulled out of
/// `Controller` so it owns everything it touches and can re-enqueue
/// itself via `tokio::spawn` on a transient failure (§5/§7/§8: "transient
/// failure; requeue after `delay_secs`").
///
/// Boxed rather than a plain `async fn` because it calls itself on the
/// retry path — recursive `async fn`s don't have a statically known
/// size without this.
fn process_pending_claim(
    client: Client,
    claim: PersistentVolumeClaim,
    storage_class_name: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    Box::pin(process_pending_claim_inner(client, claim, storage_class_name))
}

async fn process_pending_claim_inner(client: Client, claim: PersistentVolumeClaim, storage_class_name: String) -> Result<()> {
    let guid = Guid::from_claim_uid(claim.uid().as_deref());
    let volumes: Api<PersistentVolume> = Api::all(client.clone());

    // Idempotent: a SnapshotVolume already existing for this guid means
    // we've already started work on this claim, even if this process
    // restarted in between.
    if volumes.get_opt(&guid.volume_name()).await?.is_some() {
        return Ok(());
    }

    let sc_info = match introspector::read_storage_class(&client, &storage_class_name).await {
        Ok(info) => info,
        Err(e) => {
            warn!(claim = %claim.full_name(), error = %e, "could not read storage class");
            return Ok(());
        }
    };

    let resolved = match introspector::resolve(client.clone(), &claim).await {
        Ok(resolved) => resolved,
        Err(e) if e.is_permanent() => {
            warn!(claim = %claim.full_name(), error = %e, "permanently unable to resolve source, giving up");
            return Ok(());
        }
        Err(e) => {
            let delay = e
                .requeue_delay()
                .unwrap_or_else(|| std::time::Duration::from_secs(NOT_YET_READY_REQUEUE_SECS));
            info!(
                claim = %claim.full_name(),
                error = %e,
                delay_secs = delay.as_secs(),
                "source not ready yet, requeueing"
            );
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let full_name = claim.full_name();
                if let Err(e) = process_pending_claim(client, claim, storage_class_name).await {
                    warn!(claim = %full_name, error = %e, "requeued claim reconciliation failed");
                }
            });
            return Ok(());
        }
    };

    let spec = claim.spec.as_ref().expect("checked above");
    let requested_storage = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage").cloned())
        .unwrap_or_else(|| k8s_openapi::apimachinery::pkg::api::resource::Quantity("0".into()));

    if let Ok(Some(bytes)) = requested_storage.to_bytes() {
        info!(claim = %claim.full_name(), bytes, "requested capacity");
    }

    let claim_coordinates = ClaimCoordinates {
        namespace: claim.namespace().expect("namespaced resource"),
        name: claim.name_any(),
        uid: claim.uid(),
        storage_class: storage_class_name.clone(),
        requested_storage,
    };

    let (source_pvc_name, _) = introspector::require_claim_data_source(&claim)?;

    info!(claim = %claim.full_name(), guid = %guid, "publishing pre-bound snapshot volume");
    volume_publisher::publish_pre_bound(
        &client,
        guid,
        &claim_coordinates,
        &resolved,
        &sc_info.reclaim_policy,
        &source_pvc_name,
    )
    .await?;

    let backup_job_req = job_builder::BackupJobRequest {
        guid,
        job_namespace: &resolved.source_namespace,
        source_pvc_name: &source_pvc_name,
        resolved: &resolved,
        owner: None,
    };

    let jobs: Api<Job> = Api::namespaced(client.clone(), &resolved.source_namespace);
    if jobs.get_opt(&guid.backup_job_name()).await?.is_none() {
        let job = job_builder::build_backup_job(&backup_job_req);
        jobs.create(&kube::api::PostParams::default(), &job).await?;
        info!(job = %guid.backup_job_name(), "deployed backup job");
    }

    Ok(())
}
