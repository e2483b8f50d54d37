//! Retried application and service package activation.
//!
//! The activator is the idempotent front door for "bring application A at
//! version V up" and "bring service package P at version V up". Concurrent
//! requests for the same activation id are serialized through a
//! single-writer pending map; failed attempts retry with bounded
//! exponential backoff and report health once per operation.

use crate::application::{Application, ApplicationMap};
use crate::context::HostingContext;
use crate::deps::HealthReportCode;
use crate::operation_status::{OperationState, OperationStatus};
use crate::versioned_service_package::{VersionedServicePackage, FILE_STORE_SERVICE_PACKAGE};
use crate::{Error, Result};
use futures::future::join_all;
use hosting_model::{
    ApplicationIdentifier, ApplicationVersion, ServicePackageIdentifier,
    ServicePackageInstanceIdentifier, ServicePackageVersionInstance,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Health property activation operations report under.
const ACTIVATION_PROPERTY: &str = "Activation";

struct PendingEntry {
    instance_id: u64,
    ensure_latest_version: bool,
    status: OperationStatus,
    cancel: async_channel::Sender<()>,
    done: async_channel::Receiver<()>,
}

#[derive(Default)]
struct PendingInner {
    map: HashMap<String, PendingEntry>,
    closed: bool,
}

/// Single-writer-per-key map of in-flight activations.
#[derive(Default)]
struct PendingActivationMap {
    inner: Mutex<PendingInner>,
}

impl PendingActivationMap {
    /// Insert a pending entry for `activation_id`.
    ///
    /// The replacement predicate: an `ensure_latest_version` operation
    /// replaces an existing one that is not itself `ensure_latest_version`;
    /// everything else refuses with [`Error::ActivationInProgress`].
    fn start(&self, activation_id: &str, entry: PendingEntry) -> Result<()> {
        let replaced = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return Err(Error::ObjectClosed);
            }

            let admissible = match inner.map.get(activation_id) {
                None => true,
                Some(existing) => entry.ensure_latest_version && !existing.ensure_latest_version,
            };
            if !admissible {
                return Err(Error::ActivationInProgress(activation_id.to_string()));
            }
            inner.map.insert(activation_id.to_string(), entry)
        };

        if let Some(old) = replaced {
            debug!("Replacing pending activation {}", activation_id);
            old.cancel.close();
        }
        Ok(())
    }

    fn update_status(&self, activation_id: &str, instance_id: u64, status: OperationStatus) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.map.get_mut(activation_id) {
            if entry.instance_id == instance_id {
                entry.status = status;
            }
        }
    }

    fn complete_and_remove(&self, activation_id: &str, instance_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner
            .map
            .get(activation_id)
            .map(|entry| entry.instance_id == instance_id)
            .unwrap_or(false)
        {
            inner.map.remove(activation_id);
        }
    }

    fn status(&self, activation_id: &str) -> Option<OperationStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.get(activation_id).map(|entry| entry.status.clone())
    }

    fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.len()
    }

    fn close(&self) -> Vec<PendingEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.map.drain().map(|(_, entry)| entry).collect()
    }
}

/// Outcome of re-ensuring one service package instance after an upgrade.
#[derive(Debug)]
pub struct EnsureAfterUpgradeOutcome {
    /// The instance that was re-ensured.
    pub id: ServicePackageInstanceIdentifier,
    /// Final operation status when the operation ran to completion.
    pub status: Option<OperationStatus>,
    /// Error, when the ensure failed or short-circuited.
    pub error: Option<Error>,
}

/// Retried, idempotent activation of applications and service packages.
pub struct Activator {
    ctx: Arc<HostingContext>,
    applications: Arc<ApplicationMap>,
    pending: PendingActivationMap,
}

impl Activator {
    /// Create an activator over the node's application map.
    pub fn new(ctx: Arc<HostingContext>, applications: Arc<ApplicationMap>) -> Self {
        Self {
            ctx,
            applications,
            pending: PendingActivationMap::default(),
        }
    }

    /// The node's application map.
    pub fn applications(&self) -> &Arc<ApplicationMap> {
        &self.applications
    }

    /// Status of an in-flight activation, if any.
    pub fn pending_status(&self, activation_id: &str) -> Option<OperationStatus> {
        self.pending.status(activation_id)
    }

    /// Number of in-flight activations.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Operation id for an activation of `id` at `version`.
    pub fn operation_id(id: impl std::fmt::Display, version: impl std::fmt::Display) -> String {
        format!("Activate:{id}:{version}")
    }

    /// Bring an application up at a version, retrying failures.
    pub async fn activate_application(
        &self,
        application_id: ApplicationIdentifier,
        application_version: ApplicationVersion,
        application_name: String,
        max_failure_count: u32,
        only_if_used: bool,
        ensure_latest_version: bool,
    ) -> Result<(OperationStatus, Arc<Application>)> {
        let activation_id = Self::operation_id(&application_id, application_version);

        let ctx = self.ctx.clone();
        let applications = self.applications.clone();
        let deactivator = self.ctx.deps.deactivator.clone();
        let usage_id = application_id.clone();
        let attempt_id = application_id.clone();
        let attempt_name = application_name.clone();

        self.run_activation(
            activation_id,
            application_name,
            max_failure_count,
            only_if_used,
            ensure_latest_version,
            move || deactivator.is_application_used(&usage_id),
            || {},
            move || {
                let ctx = ctx.clone();
                let applications = applications.clone();
                let application_id = attempt_id.clone();
                let application_name = attempt_name.clone();
                async move {
                    let application = applications.get_or_insert_with(&application_id, || {
                        Application::new(ctx.clone(), application_id.clone(), application_name.clone())
                    });
                    application
                        .activate(application_version, ensure_latest_version)
                        .await?;
                    Ok(application)
                }
            },
        )
        .await
    }

    /// Bring one service package instance up at a version, retrying
    /// failures.
    pub async fn activate_service_package_instance(
        &self,
        application: Arc<Application>,
        service_package_instance_id: ServicePackageInstanceIdentifier,
        version_instance: ServicePackageVersionInstance,
        max_failure_count: u32,
        only_if_used: bool,
        ensure_latest_version: bool,
    ) -> Result<(OperationStatus, Arc<VersionedServicePackage>)> {
        let activation_id =
            Self::operation_id(&service_package_instance_id, version_instance.version);

        let config = self.ctx.config();
        // The system file store tolerates slow anonymous-access setup; its
        // activations run under a longer deadline.
        let attempt_timeout = if service_package_instance_id.application_id().is_system()
            && service_package_instance_id.service_package_name() == FILE_STORE_SERVICE_PACKAGE
        {
            config.fss_activation_timeout()
        } else {
            config.activation_timeout()
        };

        let deactivator = self.ctx.deps.deactivator.clone();
        let usage_id = service_package_instance_id.clone();
        let mismatch_deactivator = self.ctx.deps.deactivator.clone();
        let mismatch_id = service_package_instance_id.clone();
        let attempt_app = application.clone();
        let attempt_sp_id = service_package_instance_id.clone();
        let application_name = application.name().to_string();

        self.run_activation(
            activation_id,
            application_name,
            max_failure_count,
            only_if_used,
            ensure_latest_version,
            move || deactivator.is_service_package_instance_used(&usage_id),
            move || mismatch_deactivator.schedule_deactivation_if_not_used(&mismatch_id),
            move || {
                let application = attempt_app.clone();
                let id = attempt_sp_id.clone();
                async move {
                    application
                        .activate_service_package_instance(
                            id,
                            version_instance,
                            ensure_latest_version,
                            attempt_timeout,
                        )
                        .await
                }
            },
        )
        .await
    }

    /// Re-ensure every deactivator-known instance of the upgraded service
    /// packages at its new version, in parallel.
    pub async fn ensure_service_package_instances_after_upgrade(
        &self,
        application: &Arc<Application>,
        upgraded_versions: &HashMap<ServicePackageIdentifier, ServicePackageVersionInstance>,
    ) -> Vec<EnsureAfterUpgradeOutcome> {
        let known = self
            .ctx
            .deps
            .deactivator
            .service_package_instances_of(application.id());

        let max_failure_count = self.ctx.config().activation_max_failure_count;

        let ensures = known.into_iter().filter_map(|instance_id| {
            let version_instance = upgraded_versions.get(&instance_id.service_package_id).copied()?;
            let application = application.clone();
            Some(async move {
                let result = self
                    .activate_service_package_instance(
                        application,
                        instance_id.clone(),
                        version_instance,
                        max_failure_count,
                        true, /* only_if_used */
                        true, /* ensure_latest_version */
                    )
                    .await;
                match result {
                    Ok((status, _)) => EnsureAfterUpgradeOutcome {
                        id: instance_id,
                        status: Some(status),
                        error: None,
                    },
                    Err(e) => {
                        info!("Ensure after upgrade of {} finished with {}", instance_id, e);
                        EnsureAfterUpgradeOutcome {
                            id: instance_id,
                            status: None,
                            error: Some(e),
                        }
                    }
                }
            })
        });

        join_all(ensures).await
    }

    /// Cancel every pending activation and wait for each to complete. New
    /// operations after close receive [`Error::ObjectClosed`].
    pub async fn close(&self) {
        let entries = self.pending.close();
        info!("Activator closing, draining {} pending activations", entries.len());
        for entry in &entries {
            entry.cancel.close();
        }
        for entry in entries {
            let _ = entry.done.recv().await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_activation<T, U, M, F, Fut>(
        &self,
        activation_id: String,
        application_name: String,
        max_failure_count: u32,
        only_if_used: bool,
        ensure_latest_version: bool,
        is_used: U,
        on_version_mismatch: M,
        attempt: F,
    ) -> Result<(OperationStatus, T)>
    where
        U: Fn() -> bool,
        M: Fn(),
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let instance_id = self.ctx.next_sequence();
        let (cancel_tx, cancel_rx) = async_channel::bounded::<()>(1);
        let (done_tx, done_rx) = async_channel::bounded::<()>(1);

        let mut status = OperationStatus::new(&activation_id);
        status.state = OperationState::InProgress;

        self.pending.start(
            &activation_id,
            PendingEntry {
                instance_id,
                ensure_latest_version,
                status: status.clone(),
                cancel: cancel_tx,
                done: done_rx,
            },
        )?;
        // Dropped on every exit path; close() observes it as completion.
        let _done_guard = done_tx;

        // Activations driven without an application name carry no health.
        let health_enabled = !application_name.is_empty();
        if health_enabled {
            if let Err(e) = self.ctx.deps.health.register_source(
                &activation_id,
                &application_name,
                ACTIVATION_PROPERTY,
            ) {
                self.complete_activation(&activation_id, instance_id, &mut status, Some(e.clone()), false);
                return Err(e);
            }
        }

        let config = self.ctx.config();
        let mut health_reported = false;

        loop {
            // Yield once per round so concurrent starters for the same id
            // observe the pending entry before the attempt runs.
            smol::future::yield_now().await;

            if only_if_used && !is_used() {
                let e = Error::ActivationEntityNotInUse(activation_id.clone());
                debug!("{}: entity no longer in use, short-circuiting", activation_id);
                self.complete_activation(
                    &activation_id,
                    instance_id,
                    &mut status,
                    Some(e.clone()),
                    health_enabled,
                );
                return Err(e);
            }

            if is_canceled(&cancel_rx) {
                let e = Error::OperationCanceled;
                self.complete_activation(
                    &activation_id,
                    instance_id,
                    &mut status,
                    Some(e.clone()),
                    health_enabled,
                );
                return Err(e);
            }

            match attempt().await {
                Ok(value) => {
                    self.complete_activation(
                        &activation_id,
                        instance_id,
                        &mut status,
                        None,
                        health_enabled,
                    );
                    debug!("{}: completed after {} failures", activation_id, status.failure_count);
                    return Ok((status, value));
                }
                Err(
                    e @ (Error::ApplicationVersionMismatch { .. }
                    | Error::ServicePackageVersionMismatch { .. }),
                ) => {
                    // The cluster moved on; activation at this version will
                    // never succeed. Let the deactivator reclaim the entity.
                    warn!("{}: version mismatch, not retrying: {}", activation_id, e);
                    on_version_mismatch();
                    self.complete_activation(
                        &activation_id,
                        instance_id,
                        &mut status,
                        Some(e.clone()),
                        health_enabled,
                    );
                    return Err(e);
                }
                Err(e) if e.is_internal() => {
                    debug!("{}: internal error, not counted: {}", activation_id, e);
                    status.internal_failure_count += 1;
                    self.pending.update_status(&activation_id, instance_id, status.clone());
                }
                Err(e) => {
                    status.failure_count += 1;
                    status.last_error = Some(e.clone());
                    warn!(
                        "{}: attempt failed ({}), failure_count={}",
                        activation_id, e, status.failure_count
                    );

                    if status.failure_count == 1 {
                        self.ctx.service_types.register_failure(&activation_id);
                    }
                    if health_enabled && !health_reported {
                        health_reported = true;
                        let _ = self.ctx.deps.health.report(
                            &activation_id,
                            ACTIVATION_PROPERTY,
                            HealthReportCode::ActivationFailed,
                            &e.to_string(),
                            self.ctx.next_sequence(),
                        );
                    }
                    self.pending.update_status(&activation_id, instance_id, status.clone());

                    if status.failure_count >= max_failure_count {
                        self.complete_activation(
                            &activation_id,
                            instance_id,
                            &mut status,
                            Some(e.clone()),
                            health_enabled,
                        );
                        return Err(e);
                    }
                }
            }

            let due = config.retry_due_time(status.failure_count);
            let canceled = smol::future::or(
                async {
                    smol::Timer::after(due).await;
                    false
                },
                async {
                    let _ = cancel_rx.recv().await;
                    true
                },
            )
            .await;

            if canceled {
                let e = Error::OperationCanceled;
                self.complete_activation(
                    &activation_id,
                    instance_id,
                    &mut status,
                    Some(e.clone()),
                    health_enabled,
                );
                return Err(e);
            }
        }
    }

    fn complete_activation(
        &self,
        activation_id: &str,
        instance_id: u64,
        status: &mut OperationStatus,
        error: Option<Error>,
        health_enabled: bool,
    ) {
        status.state = OperationState::Completed;
        status.last_error = error;

        if status.failure_count > 0 {
            self.ctx.service_types.unregister_failure(activation_id);
        }
        if health_enabled {
            self.ctx
                .deps
                .health
                .unregister_source(activation_id, ACTIVATION_PROPERTY);
        }
        self.pending.complete_and_remove(activation_id, instance_id);
    }
}

fn is_canceled(cancel_rx: &async_channel::Receiver<()>) -> bool {
    match cancel_rx.try_recv() {
        Ok(()) => true,
        Err(async_channel::TryRecvError::Closed) => true,
        Err(async_channel::TryRecvError::Empty) => false,
    }
}
