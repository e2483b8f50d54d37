//! On-demand activation: activator-gated dependents, activator termination,
//! guest type hosts, forced failover, and registration timeouts.

use hosting_core::test_support::{exe_code_package, package_description, TestHost};
use hosting_core::{Error, VersionedServicePackage, VspState};
use hosting_model::{
    ActivationContext, ApplicationHostContext, ApplicationIdentifier, ApplicationVersion,
    CodePackageContext, CodePackageInstanceIdentifier, CodePackageOperationRequest,
    CodePackageOperationType, ContainerHealthStatusInfo, HostingConfig, RolloutVersion,
    ServicePackageDescription, ServicePackageIdentifier, ServicePackageInstanceIdentifier,
    ServicePackageVersion, ServicePackageVersionInstance, ServiceTypeDescription,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn sp_version(major: u64) -> ServicePackageVersion {
    ServicePackageVersion {
        application_version: ApplicationVersion(RolloutVersion::new(1, 0)),
        rollout_version: RolloutVersion::new(major, 0),
    }
}

fn on_demand_description() -> ServicePackageDescription {
    let mut controller = exe_code_package("Controller", RolloutVersion::new(1, 0));
    controller.is_activator = true;
    package_description(
        "content-v1",
        vec![
            controller,
            exe_code_package("WorkerA", RolloutVersion::new(1, 0)),
            exe_code_package("WorkerB", RolloutVersion::new(1, 0)),
        ],
    )
}

fn shared_instance_id(name: &str) -> ServicePackageInstanceIdentifier {
    ServicePackageInstanceIdentifier::shared(ServicePackageIdentifier::new(
        ApplicationIdentifier::new("GuestType", 9),
        name,
    ))
}

async fn open_on_demand(host: &TestHost) -> Arc<VersionedServicePackage> {
    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        shared_instance_id("OnDemandPkg"),
        1,
        "/app/guest".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        on_demand_description(),
    );
    vsp.open(TIMEOUT).await.unwrap();
    vsp
}

fn operation_request(
    vsp: &VersionedServicePackage,
    operation_type: CodePackageOperationType,
    activator_instance_id: i64,
    names: Vec<&str>,
    all: bool,
) -> CodePackageOperationRequest {
    CodePackageOperationRequest {
        operation_type,
        host_context: ApplicationHostContext {
            host_id: "host-1".to_string(),
            process_id: 4242,
        },
        code_context: CodePackageContext {
            code_package_instance_id: CodePackageInstanceIdentifier::new(
                vsp.id(),
                "Controller",
            ),
            activator_instance_id,
        },
        code_package_names: names.into_iter().map(str::to_string).collect(),
        environment_block: HashMap::new(),
        timeout_millis: 5_000,
        is_all_code_packages: all,
    }
}

#[smol_potat::test]
async fn test_open_loads_only_the_activator() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;

    assert!(vsp.is_on_demand_activation_enabled());
    assert_eq!(vsp.active_code_package_names(), vec!["Controller"]);
    assert_ne!(vsp.activator_code_package_instance_id(), 0);
    assert_eq!(host.process_activator.running_count(), 1);
}

#[smol_potat::test]
async fn test_dependent_activate_and_deactivate() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;
    let activator_id = vsp.activator_code_package_instance_id();

    vsp.on_demand_code_package_operation(operation_request(
        &vsp,
        CodePackageOperationType::Activate,
        activator_id,
        vec!["WorkerA"],
        false,
    ))
    .await
    .unwrap();

    let mut names = vsp.active_code_package_names();
    names.sort();
    assert_eq!(names, vec!["Controller", "WorkerA"]);
    assert_eq!(host.process_activator.running_count(), 2);
    assert_eq!(vsp.state(), VspState::Opened);

    vsp.on_demand_code_package_operation(operation_request(
        &vsp,
        CodePackageOperationType::Deactivate,
        activator_id,
        vec!["WorkerA"],
        false,
    ))
    .await
    .unwrap();

    assert_eq!(vsp.active_code_package_names(), vec!["Controller"]);
    assert_eq!(host.process_activator.running_count(), 1);
}

#[smol_potat::test]
async fn test_activate_all_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;
    let activator_id = vsp.activator_code_package_instance_id();

    vsp.on_demand_code_package_operation(operation_request(
        &vsp,
        CodePackageOperationType::Activate,
        activator_id,
        vec![],
        true,
    ))
    .await
    .unwrap();

    let mut names = vsp.active_code_package_names();
    names.sort();
    assert_eq!(names, vec!["Controller", "WorkerA", "WorkerB"]);
    assert_eq!(host.process_activator.running_count(), 3);
}

#[smol_potat::test]
async fn test_stale_activator_instance_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;
    let activator_id = vsp.activator_code_package_instance_id();

    let result = vsp
        .on_demand_code_package_operation(operation_request(
            &vsp,
            CodePackageOperationType::Activate,
            activator_id + 1,
            vec!["WorkerA"],
            false,
        ))
        .await;

    assert!(matches!(result, Err(Error::InstanceIdMismatch { .. })));
    assert_eq!(vsp.state(), VspState::Opened);
    assert_eq!(vsp.active_code_package_names(), vec!["Controller"]);
}

#[smol_potat::test]
async fn test_unknown_dependent_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;
    let activator_id = vsp.activator_code_package_instance_id();

    let result = vsp
        .on_demand_code_package_operation(operation_request(
            &vsp,
            CodePackageOperationType::Activate,
            activator_id,
            vec!["NoSuchWorker"],
            false,
        ))
        .await;

    assert!(matches!(result, Err(Error::CodePackageNotFound(_))));
    assert_eq!(vsp.state(), VspState::Opened);
}

#[smol_potat::test]
async fn test_activator_termination_drains_and_aborts_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());
    let vsp = open_on_demand(&host).await;
    let old_activator_id = vsp.activator_code_package_instance_id();

    vsp.on_demand_code_package_operation(operation_request(
        &vsp,
        CodePackageOperationType::Activate,
        old_activator_id,
        vec!["WorkerA", "WorkerB"],
        false,
    ))
    .await
    .unwrap();
    assert_eq!(host.process_activator.running_count(), 3);

    // The activator dies.
    assert!(host.process_activator.send_exit_for_exe("Controller.exe", 1));

    // Dependents are aborted, then the activator's own supervisor brings a
    // fresh instance up with a new instance id.
    let mut fresh_id = 0;
    for _ in 0..400 {
        fresh_id = vsp.activator_code_package_instance_id();
        let names = vsp.active_code_package_names();
        if fresh_id != 0 && fresh_id != old_activator_id && names == vec!["Controller"] {
            break;
        }
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert_ne!(fresh_id, 0);
    assert_ne!(fresh_id, old_activator_id);
    assert_eq!(vsp.active_code_package_names(), vec!["Controller"]);
    assert_eq!(host.process_activator.running_count(), 1);

    // A request still referencing the dead activator instance is rejected.
    let result = vsp
        .on_demand_code_package_operation(operation_request(
            &vsp,
            CodePackageOperationType::Activate,
            old_activator_id,
            vec!["WorkerA"],
            false,
        ))
        .await;
    assert!(matches!(result, Err(Error::InstanceIdMismatch { .. })));
}

#[smol_potat::test]
async fn test_exclusive_guest_application_uses_implicit_type_host() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());

    let mut description = package_description(
        "guest-v1",
        vec![exe_code_package("GuestCode", RolloutVersion::new(1, 0))],
    );
    description.service_types.push(ServiceTypeDescription {
        service_type_name: "GuestServiceType".to_string(),
        use_implicit_host: true,
        is_stateful: true,
    });

    let id = ServicePackageInstanceIdentifier::new(
        ServicePackageIdentifier::new(ApplicationIdentifier::new("GuestType", 9), "GuestPkg"),
        ActivationContext::new_exclusive(),
        "activation-1",
    );
    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        id,
        1,
        "/app/guest".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        description,
    );
    vsp.open(TIMEOUT).await.unwrap();

    // In-proc guest hosting synthesizes the type host as the activator.
    assert!(vsp.is_guest_application());
    assert!(vsp.is_on_demand_activation_enabled());
    assert_eq!(vsp.active_code_package_names(), vec!["ImplicitTypeHost"]);
    assert_eq!(
        host.process_activator.descriptions()[0].exe_path,
        "GuestTypeHost"
    );
}

#[smol_potat::test]
async fn test_stateless_guest_opt_out_loads_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostingConfig {
        disable_on_demand_activation_for_stateless_guest_app: true,
        activation_retry_backoff_millis: 10,
        auto_detect_available_resources: false,
        local_resource_manager_test_mode: true,
        ..Default::default()
    };
    let host = TestHost::with_config(dir.path(), config);

    let mut description = package_description(
        "guest-v1",
        vec![exe_code_package("GuestCode", RolloutVersion::new(1, 0))],
    );
    description.service_types.push(ServiceTypeDescription {
        service_type_name: "GuestServiceType".to_string(),
        use_implicit_host: true,
        is_stateful: false,
    });

    let id = ServicePackageInstanceIdentifier::new(
        ServicePackageIdentifier::new(ApplicationIdentifier::new("GuestType", 9), "GuestPkg"),
        ActivationContext::new_exclusive(),
        "activation-1",
    );
    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        id,
        1,
        "/app/guest".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        description,
    );
    vsp.open(TIMEOUT).await.unwrap();

    assert!(!vsp.is_on_demand_activation_enabled());
    let mut names = vsp.active_code_package_names();
    names.sort();
    assert_eq!(names, vec!["GuestCode", "ImplicitTypeHost"]);
}

#[smol_potat::test]
async fn test_forced_failover_terminates_type_host_with_due_time_retry() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());

    // Shared guest package: the type host is loaded eagerly.
    let mut description = package_description(
        "guest-v1",
        vec![exe_code_package("GuestCode", RolloutVersion::new(1, 0))],
    );
    description.service_types.push(ServiceTypeDescription {
        service_type_name: "GuestServiceType".to_string(),
        use_implicit_host: true,
        is_stateful: false,
    });
    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        shared_instance_id("GuestPkg"),
        1,
        "/app/guest".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        description,
    );
    vsp.open(TIMEOUT).await.unwrap();

    // Below the threshold nothing happens.
    assert!(!vsp.terminate_type_host_on_continuous_failure().await.unwrap());

    for _ in 0..5 {
        host.ctx.service_types.register_failure(vsp.failure_id());
    }

    // First lookup races with registration; the due-time hint drives a
    // retry that succeeds.
    host.activator_client.script_terminate_results(vec![
        Err(Error::NotFound("not registered yet".to_string())),
        Ok(()),
    ]);

    assert!(vsp.terminate_type_host_on_continuous_failure().await.unwrap());
    assert_eq!(host.activator_client.terminated().len(), 2);
}

#[smol_potat::test]
async fn test_registration_timeout_makes_not_found_authoritative() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostingConfig {
        service_type_registration_timeout_secs: 0,
        activation_retry_backoff_millis: 10,
        auto_detect_available_resources: false,
        local_resource_manager_test_mode: true,
        ..Default::default()
    };
    let host = TestHost::with_config(dir.path(), config);

    let mut description = package_description(
        "guest-v1",
        vec![exe_code_package("GuestCode", RolloutVersion::new(1, 0))],
    );
    description.service_types.push(ServiceTypeDescription {
        service_type_name: "GuestServiceType".to_string(),
        use_implicit_host: false,
        is_stateful: true,
    });
    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        shared_instance_id("GuestPkg"),
        1,
        "/app/guest".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        description,
    );
    vsp.open(TIMEOUT).await.unwrap();

    // Give the zero-length registration window a moment to elapse.
    smol::Timer::after(Duration::from_millis(20)).await;

    // Continuous failures past the threshold, then an authoritative miss
    // disables the type.
    host.ctx.service_types.register_failure(vsp.failure_id());
    host.ctx.service_types.register_failure(vsp.failure_id());

    assert!(vsp.on_service_type_registration_not_found("GuestServiceType"));

    let type_id = hosting_model::ServiceTypeInstanceIdentifier::new(
        vsp.id().clone(),
        "GuestServiceType",
    );
    assert!(host.ctx.service_types.is_disabled(&type_id));
}

#[smol_potat::test]
async fn test_unhealthy_container_restarts_when_policy_asks() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::new(dir.path());

    let mut container_cp = exe_code_package("Sidecar", RolloutVersion::new(1, 0));
    container_cp.entry_point = hosting_model::EntryPointDescription::Container {
        image: "registry.example.com/sidecar:1".to_string(),
        commands: vec![],
        entry_point: None,
        isolation: None,
    };
    container_cp.container_policies = Some(hosting_model::ContainerPoliciesDescription {
        health_config: Some(hosting_model::ContainerHealthConfig {
            include_docker_health_status_in_system_health_report: true,
            restart_container_on_unhealthy_docker_health_status: true,
        }),
        ..Default::default()
    });
    let description = package_description("container-v1", vec![container_cp]);

    let vsp = VersionedServicePackage::new(
        host.ctx.clone(),
        shared_instance_id("ContainerPkg"),
        1,
        "/app/containers".to_string(),
        ServicePackageVersionInstance::new(sp_version(1), 1),
        description,
    );
    vsp.open(TIMEOUT).await.unwrap();

    let sidecar = vsp.code_package("Sidecar").unwrap();
    assert_eq!(sidecar.stats().activation_count, 1);
    let container_name = sidecar.container_name().unwrap();

    vsp.on_container_health_changed(&[ContainerHealthStatusInfo {
        host_id: "host-1".to_string(),
        container_name,
        time_stamp_utc: chrono::Utc::now(),
        is_healthy: false,
    }])
    .await;

    assert_eq!(sidecar.stats().activation_count, 2);
    assert_eq!(host.process_activator.running_count(), 1);
}
