//! Manifest handling for saving and loading the desired provisioning state.
//!
//! The manifest is the single source of truth for what a finished machine
//! looks like: which OS packages are present, which pinned converter build is
//! installed, where the environment manager lives, and which named environment
//! exists. Execution code compares observed state against this file and only
//! acts on the difference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{MachineArch, PackageSource};

/// A package pinned to an exact upstream build, installed straight from a
/// downloaded `.deb` rather than from the distribution repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebPackage {
    pub name: String,
    pub version: String,
    pub url: String,
}

impl DebPackage {
    /// File name of the downloaded archive, derived from the URL.
    pub fn file_name(&self) -> String {
        self.url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("package.deb")
            .to_string()
    }

    /// Whether an installed Debian version string satisfies this pin.
    ///
    /// The pin names the upstream version; the installed string usually
    /// carries a packaging revision on top (`3.1.11.1` vs `3.1.11.1-1`).
    /// Only `-` and `+` are accepted as boundary characters so that a pin of
    /// `3.1.11.1` does not match an installed `3.1.11.12`.
    pub fn version_satisfied_by(&self, installed: &str) -> bool {
        let installed = installed.trim();
        if installed.is_empty() {
            return false;
        }
        installed == self.version
            || installed
                .strip_prefix(&self.version)
                .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('+'))
    }
}

/// Where the environment manager comes from and where it gets installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvManagerSpec {
    /// Product name as it appears in the published installer assets.
    pub product: String,
    /// Base URL the installer assets are downloaded from.
    pub release_base: String,
    /// Installation prefix on the target machine.
    pub install_prefix: PathBuf,
}

impl EnvManagerSpec {
    /// Installer asset name for the given machine architecture.
    pub fn installer_asset(&self, arch: MachineArch) -> String {
        format!("{}-Linux-{}.sh", self.product, arch.asset_suffix())
    }

    /// Full download URL for the installer asset.
    pub fn installer_url(&self, arch: MachineArch) -> String {
        format!(
            "{}/{}",
            self.release_base.trim_end_matches('/'),
            self.installer_asset(arch)
        )
    }

    /// Directory the manager's executables land in after installation.
    pub fn bin_dir(&self) -> PathBuf {
        self.install_prefix.join("bin")
    }
}

/// The named environment created from a dependency-specification file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondaEnvironment {
    pub name: String,
    pub spec_file: PathBuf,
}

/// Flattened desired-state view of one package the provisioner manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    /// Pinned version, or `None` when any repository version is acceptable.
    pub version: Option<String>,
    pub source: PackageSource,
}

/// Desired end state of a provisioned machine. Can be saved/loaded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionManifest {
    /// OS packages installed from the distribution repositories.
    pub system_packages: Vec<String>,
    /// Document converter pinned to an exact upstream build.
    pub converter: DebPackage,
    /// Environment manager bootstrap source and install location.
    pub env_manager: EnvManagerSpec,
    /// Named environment built from a dependency-specification file.
    pub environment: CondaEnvironment,
    /// Shell startup file that receives the PATH export.
    pub startup_file: PathBuf,
    /// Working directory for downloaded artifacts.
    pub scratch_dir: PathBuf,
    /// Archiver handed to the environment manager via `TAR`.
    pub tar_binary: PathBuf,
}

impl ProvisionManifest {
    /// Create a manifest with the stock defaults.
    #[allow(dead_code)] // API: Constructor for external consumers
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the manifest to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize manifest to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write manifest to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load a manifest from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest from {:?}", path.as_ref()))?;

        let manifest: Self =
            serde_json::from_str(&content).context("Failed to parse manifest JSON")?;

        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<()> {
        // Validate repository package names
        for name in &self.system_packages {
            validate_package_name(name)?;
        }

        // Validate the converter pin
        validate_package_name(&self.converter.name)?;
        if self.converter.version.trim().is_empty() {
            anyhow::bail!("Converter version must be specified");
        }
        if self.converter.version.contains(char::is_whitespace) {
            anyhow::bail!("Converter version cannot contain whitespace");
        }
        let url = self.converter.url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("Converter URL must start with http:// or https://");
        }
        if !url.ends_with(".deb") {
            anyhow::bail!("Converter URL must point at a .deb archive");
        }

        // Validate the environment manager source
        let product = self.env_manager.product.trim();
        if product.is_empty() {
            anyhow::bail!("Environment manager product must be specified");
        }
        if product.contains(char::is_whitespace) {
            // The product name becomes part of the installer asset name
            anyhow::bail!("Environment manager product cannot contain whitespace");
        }
        let release_base = self.env_manager.release_base.trim();
        if !release_base.starts_with("http://") && !release_base.starts_with("https://") {
            anyhow::bail!("Release base URL must start with http:// or https://");
        }
        if !self.env_manager.install_prefix.is_absolute() {
            anyhow::bail!("Environment manager install prefix must be an absolute path");
        }

        // Validate the named environment
        let env_name = self.environment.name.trim();
        if env_name.is_empty() {
            anyhow::bail!("Environment name must be specified");
        }
        if env_name.contains(char::is_whitespace) {
            // The name is passed as a single command-line argument
            anyhow::bail!("Environment name cannot contain whitespace");
        }
        if !self.environment.spec_file.is_absolute() {
            anyhow::bail!("Dependency-specification file must be an absolute path");
        }

        // Validate host paths
        if !self.startup_file.is_absolute() {
            anyhow::bail!("Shell startup file must be an absolute path");
        }
        if !self.scratch_dir.is_absolute() {
            anyhow::bail!("Scratch directory must be an absolute path");
        }
        if !self.tar_binary.is_absolute() {
            anyhow::bail!("Tar binary must be an absolute path");
        }

        Ok(())
    }

    /// Flatten the manifest into one desired-state record per managed package.
    pub fn package_records(&self) -> Vec<PackageRecord> {
        let mut records: Vec<PackageRecord> = self
            .system_packages
            .iter()
            .map(|name| PackageRecord {
                name: name.clone(),
                version: None,
                source: PackageSource::Repo,
            })
            .collect();

        records.push(PackageRecord {
            name: self.converter.name.clone(),
            version: Some(self.converter.version.clone()),
            source: PackageSource::DirectDeb,
        });

        records
    }
}

impl Default for ProvisionManifest {
    fn default() -> Self {
        Self {
            system_packages: [
                "wget",
                "pandoc",
                "texlive-xetex",
                "texlive-fonts-recommended",
                "texlive-plain-generic",
                "build-essential",
                "libcurl4-gnutls-dev",
                "libxml2-dev",
                "libssl-dev",
                "libgit2-dev",
                "texlive-lang-chinese",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            converter: DebPackage {
                name: "pandoc".to_string(),
                version: "3.1.11.1".to_string(),
                url: "https://github.com/jgm/pandoc/releases/download/3.1.11.1/pandoc-3.1.11.1-1-amd64.deb".to_string(),
            },
            env_manager: EnvManagerSpec {
                product: "Miniforge3".to_string(),
                release_base: "https://github.com/conda-forge/miniforge/releases/latest/download"
                    .to_string(),
                install_prefix: PathBuf::from("/root/miniforge3"),
            },
            environment: CondaEnvironment {
                name: "otter-env".to_string(),
                spec_file: PathBuf::from("/autograder/source/environment.yml"),
            },
            startup_file: PathBuf::from("/root/.bashrc"),
            scratch_dir: PathBuf::from("/tmp"),
            tar_binary: PathBuf::from("/bin/tar"),
        }
    }
}

/// Check a package name against the Debian naming rules.
///
/// Names are lowercase alphanumerics plus `.`, `+`, `-`, with an optional
/// `:arch` qualifier. Everything in the manifest ends up on a command line,
/// so this doubles as the injection guard for package entries.
fn validate_package_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Package name must be specified");
    }
    if name != name.trim() {
        anyhow::bail!("Package name '{}' has surrounding whitespace", name);
    }
    if let Some(first_char) = name.chars().next() {
        if !first_char.is_ascii_lowercase() && !first_char.is_ascii_digit() {
            anyhow::bail!(
                "Package name '{}' must start with a lowercase letter or digit",
                name
            );
        }
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | ':'))
    {
        anyhow::bail!(
            "Package name '{}' contains characters outside the Debian package charset",
            name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_manifest() -> ProvisionManifest {
        ProvisionManifest {
            system_packages: vec!["wget".to_string(), "build-essential".to_string()],
            environment: CondaEnvironment {
                name: "grading-env".to_string(),
                spec_file: PathBuf::from("/autograder/source/environment.yml"),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_manifest_is_valid() {
        let manifest = ProvisionManifest::default();
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_default_manifest_matches_stock_provisioning() {
        let manifest = ProvisionManifest::default();

        assert!(manifest.system_packages.contains(&"wget".to_string()));
        assert!(manifest
            .system_packages
            .contains(&"texlive-lang-chinese".to_string()));
        assert_eq!(manifest.converter.name, "pandoc");
        assert_eq!(manifest.converter.version, "3.1.11.1");
        assert!(manifest.converter.url.ends_with("amd64.deb"));
        assert_eq!(
            manifest.env_manager.install_prefix,
            PathBuf::from("/root/miniforge3")
        );
        assert_eq!(manifest.environment.name, "otter-env");
        assert_eq!(manifest.startup_file, PathBuf::from("/root/.bashrc"));
        assert_eq!(manifest.tar_binary, PathBuf::from("/bin/tar"));
    }

    #[test]
    fn test_manifest_new_equals_default() {
        let new_manifest = ProvisionManifest::new();
        let default_manifest = ProvisionManifest::default();

        assert_eq!(new_manifest.system_packages, default_manifest.system_packages);
        assert_eq!(new_manifest.converter.url, default_manifest.converter.url);
        assert_eq!(
            new_manifest.environment.name,
            default_manifest.environment.name
        );
    }

    // =========================================================================
    // Serialization Tests
    // =========================================================================

    #[test]
    fn test_save_and_load_json_manifest() {
        let manifest = create_test_manifest();

        let mut temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        temp_file.write_all(json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let loaded = ProvisionManifest::load_from_file(&path);
        assert!(loaded.is_ok());
        let loaded = loaded.unwrap();

        assert_eq!(loaded.system_packages, manifest.system_packages);
        assert_eq!(loaded.environment.name, manifest.environment.name);
        assert_eq!(loaded.converter.version, manifest.converter.version);
    }

    #[test]
    fn test_roundtrip_save_load() {
        let original = create_test_manifest();
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        original.save_to_file(&path).unwrap();
        let loaded = ProvisionManifest::load_from_file(&path).unwrap();

        assert_eq!(loaded.system_packages, original.system_packages);
        assert_eq!(loaded.converter.name, original.converter.name);
        assert_eq!(loaded.converter.version, original.converter.version);
        assert_eq!(loaded.converter.url, original.converter.url);
        assert_eq!(loaded.env_manager.product, original.env_manager.product);
        assert_eq!(
            loaded.env_manager.release_base,
            original.env_manager.release_base
        );
        assert_eq!(
            loaded.env_manager.install_prefix,
            original.env_manager.install_prefix
        );
        assert_eq!(loaded.environment.name, original.environment.name);
        assert_eq!(loaded.environment.spec_file, original.environment.spec_file);
        assert_eq!(loaded.startup_file, original.startup_file);
        assert_eq!(loaded.scratch_dir, original.scratch_dir);
        assert_eq!(loaded.tar_binary, original.tar_binary);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ProvisionManifest::load_from_file(Path::new("/nonexistent/path"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ invalid json }").unwrap();
        temp_file.flush().unwrap();

        let result = ProvisionManifest::load_from_file(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_load_json_missing_required_field() {
        let mut temp_file = NamedTempFile::new().unwrap();
        // JSON missing everything but the package list
        temp_file
            .write_all(b"{\"system_packages\": [\"wget\"]}")
            .unwrap();
        temp_file.flush().unwrap();

        let result = ProvisionManifest::load_from_file(temp_file.path());
        assert!(result.is_err(), "Should fail on missing required fields");
    }

    #[test]
    fn test_json_with_extra_fields_ignored() {
        let manifest = ProvisionManifest::default();
        let mut json: serde_json::Value = serde_json::to_value(&manifest).unwrap();

        // Add unknown fields that might exist in future versions
        json["unknown_future_field"] = serde_json::json!("some_value");
        json["another_unknown"] = serde_json::json!(12345);

        let json_str = serde_json::to_string(&json).unwrap();

        let result: Result<ProvisionManifest, _> = serde_json::from_str(&json_str);
        assert!(
            result.is_ok(),
            "Unknown fields should be ignored for forward compatibility"
        );
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_empty_package_name() {
        let mut manifest = create_test_manifest();
        manifest.system_packages.push(String::new());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_package_name_shell_metacharacters() {
        for bad in ["wget;reboot", "wget && true", "$(hostname)", "a b", "pkg`id`"] {
            let mut manifest = create_test_manifest();
            manifest.system_packages.push(bad.to_string());
            assert!(
                manifest.validate().is_err(),
                "Package name {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validation_package_name_uppercase_rejected() {
        let mut manifest = create_test_manifest();
        manifest.system_packages.push("Wget".to_string());
        let result = manifest.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("lowercase"));
    }

    #[test]
    fn test_validation_package_name_debian_charset_accepted() {
        for good in ["g++", "libstdc++6", "libxml2-dev", "gcc-12", "libc6:amd64", "0ad"] {
            let mut manifest = create_test_manifest();
            manifest.system_packages.push(good.to_string());
            assert!(
                manifest.validate().is_ok(),
                "Package name {:?} should be accepted",
                good
            );
        }
    }

    #[test]
    fn test_validation_converter_url_scheme() {
        let mut manifest = create_test_manifest();
        manifest.converter.url = "ftp://releases.example.org/pandoc.deb".to_string();
        let result = manifest.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("http"));
    }

    #[test]
    fn test_validation_converter_url_must_point_at_deb() {
        let mut manifest = create_test_manifest();
        manifest.converter.url = "https://releases.example.org/pandoc.tar.gz".to_string();
        let result = manifest.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(".deb"));
    }

    #[test]
    fn test_validation_empty_converter_version() {
        let mut manifest = create_test_manifest();
        manifest.converter.version = String::new();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_release_base_scheme() {
        let mut manifest = create_test_manifest();
        manifest.env_manager.release_base = "file:///srv/installers".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_relative_install_prefix() {
        let mut manifest = create_test_manifest();
        manifest.env_manager.install_prefix = PathBuf::from("miniforge3");
        let result = manifest.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("absolute"));
    }

    #[test]
    fn test_validation_empty_environment_name() {
        let mut manifest = create_test_manifest();
        manifest.environment.name = "  ".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_environment_name_with_whitespace() {
        let mut manifest = create_test_manifest();
        manifest.environment.name = "grading env".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_relative_spec_file() {
        let mut manifest = create_test_manifest();
        manifest.environment.spec_file = PathBuf::from("environment.yml");
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_relative_startup_file() {
        let mut manifest = create_test_manifest();
        manifest.startup_file = PathBuf::from(".bashrc");
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_relative_scratch_dir() {
        let mut manifest = create_test_manifest();
        manifest.scratch_dir = PathBuf::from("tmp");
        assert!(manifest.validate().is_err());
    }

    // =========================================================================
    // Desired-State View Tests
    // =========================================================================

    #[test]
    fn test_package_records_cover_all_sources() {
        let manifest = create_test_manifest();
        let records = manifest.package_records();

        assert_eq!(records.len(), manifest.system_packages.len() + 1);

        for name in &manifest.system_packages {
            assert!(records.contains(&PackageRecord {
                name: name.clone(),
                version: None,
                source: PackageSource::Repo,
            }));
        }

        let converter_record = records.last().unwrap();
        assert_eq!(converter_record.name, "pandoc");
        assert_eq!(converter_record.version, Some("3.1.11.1".to_string()));
        assert_eq!(converter_record.source, PackageSource::DirectDeb);
    }

    #[test]
    fn test_converter_version_prefix_match() {
        let converter = ProvisionManifest::default().converter;

        assert!(converter.version_satisfied_by("3.1.11.1"));
        assert!(converter.version_satisfied_by("3.1.11.1-1"));
        assert!(converter.version_satisfied_by("3.1.11.1+b1"));
        assert!(converter.version_satisfied_by("  3.1.11.1-1  "));

        assert!(!converter.version_satisfied_by("3.1.11.12"));
        assert!(!converter.version_satisfied_by("3.1.12-1"));
        assert!(!converter.version_satisfied_by("2.19.2-1"));
        assert!(!converter.version_satisfied_by("3.1.11.1~rc1"));
        assert!(!converter.version_satisfied_by(""));
    }

    #[test]
    fn test_converter_file_name_from_url() {
        let converter = ProvisionManifest::default().converter;
        assert_eq!(converter.file_name(), "pandoc-3.1.11.1-1-amd64.deb");
    }

    // =========================================================================
    // Installer Asset Tests
    // =========================================================================

    #[test]
    fn test_installer_asset_per_architecture() {
        let spec = ProvisionManifest::default().env_manager;

        assert_eq!(
            spec.installer_asset(MachineArch::X86_64),
            "Miniforge3-Linux-x86_64.sh"
        );
        assert_eq!(
            spec.installer_asset(MachineArch::Aarch64),
            "Miniforge3-Linux-aarch64.sh"
        );
    }

    #[test]
    fn test_installer_url_joins_release_base() {
        let spec = ProvisionManifest::default().env_manager;
        assert_eq!(
            spec.installer_url(MachineArch::X86_64),
            "https://github.com/conda-forge/miniforge/releases/latest/download/Miniforge3-Linux-x86_64.sh"
        );

        // A trailing slash on the base must not produce a double slash
        let mut spec = spec;
        spec.release_base.push('/');
        assert_eq!(
            spec.installer_url(MachineArch::Aarch64),
            "https://github.com/conda-forge/miniforge/releases/latest/download/Miniforge3-Linux-aarch64.sh"
        );
    }

    #[test]
    fn test_bin_dir_under_install_prefix() {
        let spec = ProvisionManifest::default().env_manager;
        assert_eq!(spec.bin_dir(), PathBuf::from("/root/miniforge3/bin"));
    }
}
