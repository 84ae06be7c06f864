//! Plan engine integration tests
//!
//! These drive the public API the way the binary does: build a manifest,
//! fabricate a machine probe, and check the resulting plan's shape and
//! dispositions. Execution is covered elsewhere; everything here is pure.

use std::collections::HashMap;

use gradestack::{
    build_plan, MachineArch, NetworkState, ProbeReport, ProvisionManifest, ProvisionStage,
    ProvisionStep, StepKind,
};

// =============================================================================
// Helpers
// =============================================================================

/// A probe of a machine with nothing installed
fn blank_probe(arch: MachineArch) -> ProbeReport {
    ProbeReport {
        arch,
        running_as_root: true,
        debian_family: true,
        network: NetworkState::Online,
        installed_versions: HashMap::new(),
        env_manager_present: false,
        environment_present: false,
        path_line_present: false,
        shell_hooks_present: false,
    }
}

/// A probe of a machine that already matches the manifest
fn satisfied_probe(manifest: &ProvisionManifest) -> ProbeReport {
    let mut installed_versions = HashMap::new();
    for name in &manifest.system_packages {
        installed_versions.insert(name.clone(), "1.0".to_string());
    }
    installed_versions.insert(
        manifest.converter.name.clone(),
        format!("{}-1", manifest.converter.version),
    );

    ProbeReport {
        arch: MachineArch::X86_64,
        running_as_root: true,
        debian_family: true,
        network: NetworkState::Online,
        installed_versions,
        env_manager_present: true,
        environment_present: true,
        path_line_present: true,
        shell_hooks_present: true,
    }
}

// =============================================================================
// Plan Shape
// =============================================================================

#[test]
fn test_default_manifest_is_valid() {
    let manifest = ProvisionManifest::default();
    assert!(manifest.validate().is_ok());
}

#[test]
fn test_blank_machine_gets_full_pipeline() {
    let manifest = ProvisionManifest::default();
    let plan = build_plan(&manifest, &blank_probe(MachineArch::X86_64));

    assert_eq!(plan.steps.len(), 8);
    assert_eq!(plan.pending_count(), 8);
    assert!(!plan.is_fully_satisfied());

    // Order is fixed: index refresh first, shell hooks last
    assert!(matches!(
        plan.steps[0].step,
        ProvisionStep::RefreshPackageIndex
    ));
    assert!(matches!(
        plan.steps[7].step,
        ProvisionStep::InitShellHooks { .. }
    ));
}

#[test]
fn test_plan_walks_stages_in_order() {
    let manifest = ProvisionManifest::default();
    let plan = build_plan(&manifest, &blank_probe(MachineArch::X86_64));

    let orders: Vec<u8> = plan
        .steps
        .iter()
        .map(|planned| planned.step.stage().order())
        .collect();
    let mut sorted = orders.clone();
    sorted.sort_unstable();
    assert_eq!(orders, sorted, "steps must follow pipeline stage order");

    // Eight steps across seven stages: the manager install has two steps
    let stages: Vec<ProvisionStage> = plan
        .steps
        .iter()
        .map(|planned| planned.step.stage())
        .collect();
    assert_eq!(
        stages
            .iter()
            .filter(|stage| **stage == ProvisionStage::InstallingEnvManager)
            .count(),
        2
    );
}

#[test]
fn test_satisfied_machine_plans_no_work() {
    let manifest = ProvisionManifest::default();
    let plan = build_plan(&manifest, &satisfied_probe(&manifest));

    assert_eq!(plan.steps.len(), 8, "shape is fixed even when satisfied");
    assert_eq!(plan.pending_count(), 0);
    assert!(plan.is_fully_satisfied());
}

// =============================================================================
// Disposition Rules
// =============================================================================

#[test]
fn test_outdated_converter_triggers_index_refresh() {
    let manifest = ProvisionManifest::default();
    let mut probe = satisfied_probe(&manifest);
    probe
        .installed_versions
        .insert(manifest.converter.name.clone(), "2.5-3".to_string());

    let plan = build_plan(&manifest, &probe);

    assert_eq!(plan.pending_count(), 2);
    let pending_kinds: Vec<StepKind> = plan
        .steps
        .iter()
        .filter(|planned| planned.disposition.is_pending())
        .map(|planned| planned.step.kind())
        .collect();
    assert_eq!(pending_kinds, vec![StepKind::PackageIndex, StepKind::Converter]);
}

#[test]
fn test_missing_environment_does_not_touch_packages() {
    let manifest = ProvisionManifest::default();
    let mut probe = satisfied_probe(&manifest);
    probe.environment_present = false;

    let plan = build_plan(&manifest, &probe);

    assert_eq!(plan.pending_count(), 1);
    let pending: Vec<&ProvisionStep> = plan
        .steps
        .iter()
        .filter(|planned| planned.disposition.is_pending())
        .map(|planned| &planned.step)
        .collect();
    assert!(matches!(pending[0], ProvisionStep::CreateEnvironment { .. }));
}

#[test]
fn test_custom_manifest_flows_into_steps() {
    let mut manifest = ProvisionManifest::default();
    manifest.system_packages = vec!["curl".to_string(), "jq".to_string()];
    manifest.environment.name = "grading-2026".to_string();

    let plan = build_plan(&manifest, &blank_probe(MachineArch::X86_64));

    match &plan.steps[1].step {
        ProvisionStep::InstallPackages { packages } => {
            assert_eq!(packages, &["curl".to_string(), "jq".to_string()]);
        }
        other => panic!("expected InstallPackages, got {}", other),
    }
    match &plan.steps[6].step {
        ProvisionStep::CreateEnvironment { name, .. } => assert_eq!(name, "grading-2026"),
        other => panic!("expected CreateEnvironment, got {}", other),
    }
    assert!(plan.summary().contains("grading-2026"));
}

// =============================================================================
// Architecture Selection
// =============================================================================

#[test]
fn test_exactly_one_installer_asset_per_arch() {
    let manifest = ProvisionManifest::default();

    for (arch, expected) in [
        (MachineArch::X86_64, "Miniforge3-Linux-x86_64.sh"),
        (MachineArch::Aarch64, "Miniforge3-Linux-aarch64.sh"),
    ] {
        let plan = build_plan(&manifest, &blank_probe(arch));

        let downloads: Vec<&ProvisionStep> = plan
            .steps
            .iter()
            .filter(|planned| {
                matches!(planned.step, ProvisionStep::DownloadInstaller { .. })
            })
            .map(|planned| &planned.step)
            .collect();
        assert_eq!(downloads.len(), 1, "one download step per plan");

        match downloads[0] {
            ProvisionStep::DownloadInstaller { url, file_name } => {
                assert_eq!(file_name, expected);
                assert!(url.ends_with(expected), "url should end with asset: {}", url);
            }
            _ => unreachable!(),
        }
    }
}

#[test]
fn test_plan_records_probed_arch() {
    let manifest = ProvisionManifest::default();

    let plan = build_plan(&manifest, &blank_probe(MachineArch::Aarch64));
    assert_eq!(plan.arch, MachineArch::Aarch64);
    assert!(plan.summary().contains("aarch64"));
}
