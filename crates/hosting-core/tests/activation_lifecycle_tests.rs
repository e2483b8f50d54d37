//! End-to-end activation lifecycle scenarios against in-memory fakes.

use hosting_core::deps::HealthReportCode;
use hosting_core::test_support::{exe_code_package, package_description, TestHost};
use hosting_core::{Activator, ApplicationMap, Error, VspState, CPU_CORRECTION_FACTOR};
use hosting_model::{
    ApplicationIdentifier, ApplicationVersion, RolloutVersion, ServicePackageIdentifier,
    ServicePackageInstanceIdentifier, ServicePackageResourceGovernanceDescription,
    ServicePackageVersion, ServicePackageVersionInstance,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn app_version() -> ApplicationVersion {
    ApplicationVersion(RolloutVersion::new(1, 0))
}

fn sp_version(major: u64) -> ServicePackageVersion {
    ServicePackageVersion {
        application_version: app_version(),
        rollout_version: RolloutVersion::new(major, 0),
    }
}

struct Fixture {
    host: TestHost,
    activator: Arc<Activator>,
    app_id: ApplicationIdentifier,
    sp_instance_id: ServicePackageInstanceIdentifier,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let activator = Arc::new(Activator::new(host.ctx.clone(), Arc::new(ApplicationMap::new())));

    let app_id = ApplicationIdentifier::new("EchoType", 1);
    let sp_id = ServicePackageIdentifier::new(app_id.clone(), "EchoPkg");

    let mut description =
        package_description("checksum-a", vec![exe_code_package("Main", RolloutVersion::new(1, 0))]);
    description.resource_governance = ServicePackageResourceGovernanceDescription {
        is_governed: true,
        cpu_cores: 2.0,
        memory_in_mb: 512,
    };
    host.package_store.add_description(sp_id.clone(), sp_version(1), description);

    Fixture {
        host,
        activator,
        app_id,
        sp_instance_id: ServicePackageInstanceIdentifier::shared(sp_id),
        _dir: dir,
    }
}

#[smol_potat::test]
async fn test_open_then_close() {
    let f = fixture();

    let (status, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    assert_eq!(status.failure_count, 0);

    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application.clone(),
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    assert_eq!(vsp.state(), VspState::Opened);
    let marker = vsp.current_package_file_path().unwrap();
    assert!(marker.exists());
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1.0:1.0");

    assert_eq!(f.host.ctx.resource_manager.used_cores_scaled(), 2 * CPU_CORRECTION_FACTOR);
    assert_eq!(f.host.ctx.resource_manager.used_memory_mb(), 512);
    assert_eq!(f.host.process_activator.running_count(), 1);
    assert_eq!(
        f.host.health.count_of(HealthReportCode::ServicePackageActivated),
        1
    );

    let main = vsp.code_package("Main").unwrap();

    application
        .deactivate_service_package_instance(&f.sp_instance_id, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(vsp.state(), VspState::Closed);
    assert!(!marker.exists());
    assert_eq!(f.host.ctx.resource_manager.used_cores_scaled(), 0);
    assert_eq!(f.host.ctx.resource_manager.used_memory_mb(), 0);
    assert!(vsp.active_code_package_names().is_empty());
    assert!(!main.retry_pending());
    assert_eq!(f.host.process_activator.running_count(), 0);
    assert_eq!(f.host.environment.cleanups().len(), 1);
}

#[smol_potat::test]
async fn test_concurrent_activation_of_same_id() {
    let f = fixture();

    let first = f.activator.activate_application(
        f.app_id.clone(),
        app_version(),
        "/app/a1".to_string(),
        3,
        false,
        false,
    );
    let second = f.activator.activate_application(
        f.app_id.clone(),
        app_version(),
        "/app/a1".to_string(),
        3,
        false,
        false,
    );

    let (r1, r2) = futures::join!(first, second);

    let (oks, errs): (Vec<_>, Vec<_>) = [r1, r2].into_iter().partition(|r| r.is_ok());
    assert_eq!(oks.len(), 1);
    assert_eq!(errs.len(), 1);
    assert!(matches!(
        errs.into_iter().next().unwrap().unwrap_err(),
        Error::ActivationInProgress(_)
    ));
    assert_eq!(f.activator.pending_count(), 0);
}

#[smol_potat::test]
async fn test_retry_then_success_counts_failures_once_in_health() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();

    f.host
        .process_activator
        .fail_next_activations(2, Error::NotFound("image not staged".to_string()));

    let (status, vsp) = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            5,
            false,
            false,
        )
        .await
        .unwrap();

    assert_eq!(vsp.state(), VspState::Opened);
    assert_eq!(status.failure_count, 2);
    assert_eq!(f.host.health.count_of(HealthReportCode::ActivationFailed), 1);
}

#[smol_potat::test]
async fn test_zero_max_failure_count_exhausts_on_first_failure() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();

    f.host
        .process_activator
        .fail_next_activations(1, Error::NotFound("missing".to_string()));

    let result = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            0,
            false,
            false,
        )
        .await;

    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(f.activator.pending_count(), 0);
}

#[smol_potat::test]
async fn test_activate_is_idempotent_for_open_code_package() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let main = vsp.code_package("Main").unwrap();
    assert_eq!(main.stats().activation_count, 1);

    main.activate(TIMEOUT).await.unwrap();
    assert_eq!(main.stats().activation_count, 1);
    assert_eq!(f.host.process_activator.activation_attempts(), 1);
}

#[smol_potat::test]
async fn test_zero_timeout_fails_without_external_io() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let main = vsp.code_package("Main").unwrap();
    main.deactivate(TIMEOUT).await.unwrap();
    let attempts = f.host.process_activator.activation_attempts();

    let result = main.activate(Duration::ZERO).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(f.host.process_activator.activation_attempts(), attempts);
}

#[smol_potat::test]
async fn test_only_if_used_short_circuits_without_health() {
    let f = fixture();
    f.host.deactivator.mark_application_unused(f.app_id.clone());

    let result = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, true, false)
        .await;

    assert!(matches!(result, Err(Error::ActivationEntityNotInUse(_))));
    assert_eq!(f.host.health.count_of(HealthReportCode::ActivationFailed), 0);
    assert_eq!(f.activator.pending_count(), 0);
}

#[smol_potat::test]
async fn test_version_mismatch_is_not_retried_and_schedules_deactivation() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();

    // The cluster already moved the application to 2.0; this instance is
    // unused, so the mismatch queues it for deactivation.
    f.host
        .deactivator
        .mark_service_package_unused(f.sp_instance_id.clone());

    let newer = ServicePackageVersion {
        application_version: ApplicationVersion(RolloutVersion::new(2, 0)),
        rollout_version: RolloutVersion::new(2, 0),
    };
    let result = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(newer, 1),
            5,
            false,
            false,
        )
        .await;

    assert!(matches!(result, Err(Error::ApplicationVersionMismatch { .. })));
    assert_eq!(f.host.deactivator.scheduled(), vec![f.sp_instance_id.clone()]);
    // A single attempt: version mismatch never retries.
    assert_eq!(f.host.process_activator.activation_attempts(), 0);
}

#[smol_potat::test]
async fn test_ensure_latest_version_replaces_non_latest_pending_op() {
    let dir = tempfile::tempdir().unwrap();
    // A very long retry backoff parks the first operation between attempts.
    let config = hosting_model::HostingConfig {
        activation_retry_backoff_millis: 60_000,
        activation_max_retry_interval_secs: 120,
        auto_detect_available_resources: false,
        local_resource_manager_test_mode: true,
        ..Default::default()
    };
    let host = TestHost::with_config(dir.path(), config);
    let activator = Arc::new(Activator::new(host.ctx.clone(), Arc::new(ApplicationMap::new())));

    let app_id = ApplicationIdentifier::new("EchoType", 1);
    let sp_id = ServicePackageIdentifier::new(app_id.clone(), "EchoPkg");
    host.package_store.add_description(
        sp_id.clone(),
        sp_version(1),
        package_description("c", vec![exe_code_package("Main", RolloutVersion::new(1, 0))]),
    );
    let sp_instance_id = ServicePackageInstanceIdentifier::shared(sp_id);

    let (_, application) = activator
        .activate_application(app_id, app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();

    host.process_activator
        .fail_next_activations(1, Error::NotFound("not staged yet".to_string()));

    let stuck_activator = activator.clone();
    let stuck_app = application.clone();
    let stuck_id = sp_instance_id.clone();
    let stuck = smol::spawn(async move {
        stuck_activator
            .activate_service_package_instance(
                stuck_app,
                stuck_id,
                ServicePackageVersionInstance::new(sp_version(1), 1),
                u32::MAX,
                false,
                false,
            )
            .await
    });

    // Wait until the first op has consumed its failure and parked in its
    // retry sleep.
    let activation_id = Activator::operation_id(&sp_instance_id, sp_version(1));
    for _ in 0..400 {
        if activator
            .pending_status(&activation_id)
            .map(|s| s.failure_count == 1)
            .unwrap_or(false)
        {
            break;
        }
        smol::Timer::after(Duration::from_millis(5)).await;
    }

    // ensure_latest_version replaces the parked op and runs to success.
    let ensure = activator
        .activate_service_package_instance(
            application,
            sp_instance_id,
            ServicePackageVersionInstance::new(sp_version(1), 1),
            u32::MAX,
            false,
            true,
        )
        .await;
    assert!(ensure.is_ok());

    let stuck_result = stuck.await;
    assert!(matches!(stuck_result, Err(Error::OperationCanceled)));
}

#[smol_potat::test]
async fn test_activator_close_drains_pending_operations() {
    let f = fixture();

    f.host
        .process_activator
        .fail_next_activations(10_000, Error::NotFound("never succeeds".to_string()));

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();

    let pending_activator = f.activator.clone();
    let pending_app = application.clone();
    let pending_id = f.sp_instance_id.clone();
    let pending = smol::spawn(async move {
        pending_activator
            .activate_service_package_instance(
                pending_app,
                pending_id,
                ServicePackageVersionInstance::new(sp_version(1), 1),
                u32::MAX,
                false,
                false,
            )
            .await
    });

    for _ in 0..200 {
        if f.activator.pending_count() > 0 {
            break;
        }
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert_eq!(f.activator.pending_count(), 1);

    f.activator.close().await;
    assert_eq!(f.activator.pending_count(), 0);

    let result = pending.await;
    assert!(matches!(result, Err(Error::OperationCanceled)));

    // New submissions after close are rejected.
    let rejected = f
        .activator
        .activate_application(
            ApplicationIdentifier::new("Other", 2),
            app_version(),
            "/app/a2".to_string(),
            3,
            false,
            false,
        )
        .await;
    assert!(matches!(rejected, Err(Error::ObjectClosed)));
}

#[smol_potat::test]
async fn test_code_package_restarts_after_unexpected_exit() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let main = vsp.code_package("Main").unwrap();
    assert_eq!(main.stats().activation_count, 1);

    assert!(f.host.process_activator.send_exit_for_exe("Main.exe", 1));

    // The supervisor schedules a retry and brings a fresh instance up.
    for _ in 0..200 {
        if main.stats().activation_count >= 2 && f.host.process_activator.running_count() == 1 {
            break;
        }
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert!(main.stats().activation_count >= 2);
    assert_eq!(main.stats().exit_failure_count, 1);
    assert_eq!(f.host.process_activator.running_count(), 1);
}

#[smol_potat::test]
async fn test_continuous_failures_move_code_package_to_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = hosting_model::HostingConfig {
        activation_retry_backoff_millis: 5,
        activation_max_retry_interval_secs: 1,
        auto_detect_available_resources: false,
        local_resource_manager_test_mode: true,
        ..Default::default()
    };
    config.activation_max_failure_count = 2;
    let host = TestHost::with_config(dir.path(), config);
    let activator = Activator::new(host.ctx.clone(), Arc::new(ApplicationMap::new()));

    let app_id = ApplicationIdentifier::new("EchoType", 1);
    let sp_id = ServicePackageIdentifier::new(app_id.clone(), "EchoPkg");
    host.package_store.add_description(
        sp_id.clone(),
        sp_version(1),
        package_description("c", vec![exe_code_package("Main", RolloutVersion::new(1, 0))]),
    );

    let (_, application) = activator
        .activate_application(app_id, app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let sp_instance_id = ServicePackageInstanceIdentifier::shared(sp_id);
    let (_, vsp) = activator
        .activate_service_package_instance(
            application,
            sp_instance_id,
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let main = vsp.code_package("Main").unwrap();

    // Every exit fails and every re-activation fails; the budget of 2
    // continuous failures runs out and retries stop.
    f_fail_forever(&host);
    assert!(host.process_activator.send_exit_for_exe("Main.exe", 7));

    for _ in 0..400 {
        if main.is_failed() {
            break;
        }
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert!(main.is_failed());
    assert!(!main.retry_pending());
}

fn f_fail_forever(host: &TestHost) {
    host.process_activator
        .fail_next_activations(10_000, Error::NotFound("gone".to_string()));
}

#[smol_potat::test]
async fn test_ensure_after_upgrade_walks_known_instances() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application.clone(),
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let sp_id = f.sp_instance_id.service_package_id.clone();
    f.host.deactivator.add_known_instance(f.sp_instance_id.clone());
    // Same content at the new version stamp: the ensure re-stamps in place.
    f.host.package_store.add_description(
        sp_id.clone(),
        sp_version(2),
        package_description("checksum-a", vec![exe_code_package("Main", RolloutVersion::new(1, 0))]),
    );

    let upgraded = std::collections::HashMap::from([(
        sp_id,
        ServicePackageVersionInstance::new(sp_version(2), 2),
    )]);
    let outcomes = f
        .activator
        .ensure_service_package_instances_after_upgrade(&application, &upgraded)
        .await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].error.is_none());
    assert_eq!(vsp.current_version_instance().version, sp_version(2));
    // The re-stamp never restarted the code package.
    assert_eq!(f.host.process_activator.activation_attempts(), 1);
}

#[smol_potat::test]
async fn test_query_manager_restart_and_abort() {
    let f = fixture();

    let (_, application) = f
        .activator
        .activate_application(f.app_id.clone(), app_version(), "/app/a1".to_string(), 3, false, false)
        .await
        .unwrap();
    let (_, vsp) = f
        .activator
        .activate_service_package_instance(
            application,
            f.sp_instance_id.clone(),
            ServicePackageVersionInstance::new(sp_version(1), 1),
            3,
            false,
            false,
        )
        .await
        .unwrap();

    let query = hosting_core::HostingQueryManager::new(
        f.host.ctx.clone(),
        f.activator.applications().clone(),
    );

    let main = vsp.code_package("Main").unwrap();
    let instance_id = main.current_instance_id();

    query
        .restart_code_package(&f.sp_instance_id, "Main", instance_id, None)
        .await
        .unwrap();
    assert_eq!(main.stats().activation_count, 2);

    // A stale instance id is a no-op.
    query
        .restart_code_package(&f.sp_instance_id, "Main", instance_id, None)
        .await
        .unwrap();
    assert_eq!(main.stats().activation_count, 2);

    let infos = query.deployed_code_packages(&f.sp_instance_id).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "Main");

    query.abort_code_package(&f.sp_instance_id, "Main").await.unwrap();
    assert_eq!(f.host.process_activator.running_count(), 0);

    let missing = query
        .restart_code_package(&f.sp_instance_id, "Ghost", 1, None)
        .await;
    assert!(matches!(missing, Err(Error::CodePackageNotFound(_))));
}
