//! Asset catalog resolution.
//!
//! Scans the configured asset tree for the base image, driver packages,
//! update packages, and post-deployment scripts that match a device/OS
//! combination. Resolution is pure read/validate: nothing on disk is
//! mutated, and an empty result set is not an error. Drivers and updates
//! are described by JSON descriptors colocated with their payloads.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    BaseImage,
    Driver,
    Update,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Inf,
    Appx,
    Exe,
}

impl DriverType {
    /// INF packages are applied into the mounted image; the rest are staged
    /// for post-deployment installation.
    pub fn serviceable(&self) -> bool {
        matches!(self, Self::Inf)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Inf => "inf",
            Self::Appx => "appx",
            Self::Exe => "exe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Msu,
    Cab,
    Exe,
    Msi,
}

impl UpdateType {
    pub fn serviceable(&self) -> bool {
        matches!(self, Self::Msu | Self::Cab)
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "msu" => Some(Self::Msu),
            "cab" => Some(Self::Cab),
            "exe" => Some(Self::Exe),
            "msi" => Some(Self::Msi),
            _ => None,
        }
    }
}

/// A discovered file (or driver directory) relevant to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub name: String,
    pub kind: AssetKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAsset {
    #[serde(flatten)]
    pub asset: Asset,
    pub driver_type: DriverType,
    pub family_id: Option<u32>,
    pub supported_os: Vec<u32>,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAsset {
    #[serde(flatten)]
    pub asset: Asset,
    pub update_type: UpdateType,
    pub version: Option<String>,
    pub supported_os: Vec<u32>,
    pub order: u32,
    pub reboot_required: bool,
}

/// Everything resolved for one device/OS combination. Produced fresh per
/// call; never persisted as a standalone entity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAssets {
    pub base_image: Option<Asset>,
    pub drivers: Vec<DriverAsset>,
    pub updates: Vec<UpdateAsset>,
    pub scripts: Vec<Asset>,
}

impl ResolvedAssets {
    pub fn invalid_count(&self) -> usize {
        self.drivers.iter().filter(|d| !d.asset.valid).count()
            + self.updates.iter().filter(|u| !u.asset.valid).count()
            + self.scripts.iter().filter(|s| !s.valid).count()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriverDescriptor {
    driver_name: Option<String>,
    driver_family_id: Option<u32>,
    #[serde(default)]
    supported_operating_systems: Vec<u32>,
    order: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDescriptor {
    update_name: Option<String>,
    update_type: Option<UpdateType>,
    update_version: Option<String>,
    #[serde(default)]
    supported_operating_systems: Vec<u32>,
    download_file_name: String,
    order: Option<u32>,
    #[serde(default)]
    reboot_required: bool,
}

const DEFAULT_ORDER: u32 = 9999;
const SCRIPT_EXTENSIONS: &[&str] = &["ps1", "cmd", "bat", "py"];

pub struct AssetCatalog {
    images_dir: PathBuf,
    drivers_dir: PathBuf,
    updates_dir: PathBuf,
    scripts_dir: PathBuf,
    min_image_bytes: u64,
}

impl AssetCatalog {
    pub fn new(assets_root: &Path, min_image_bytes: u64) -> Self {
        Self {
            images_dir: assets_root.join("sbi"),
            drivers_dir: assets_root.join("drivers"),
            updates_dir: assets_root.join("updates"),
            scripts_dir: assets_root.join("postdeploy"),
            min_image_bytes,
        }
    }

    /// Directory whose contents are seeded into the image's payload area.
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn resolve(
        &self,
        profile: &crate::core::devices::DeviceProfile,
        os_id: u32,
    ) -> ResolvedAssets {
        ResolvedAssets {
            base_image: self.resolve_base_image(os_id),
            drivers: self.resolve_drivers(profile, os_id),
            updates: self.resolve_updates(os_id),
            scripts: self.resolve_scripts(),
        }
    }

    /// Prefer a `.wim` whose filename mentions the OS id; fall back to the
    /// lexicographically first image so resolution stays deterministic.
    fn resolve_base_image(&self, os_id: u32) -> Option<Asset> {
        let mut images: Vec<PathBuf> = list_files(&self.images_dir)
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("wim")))
            .collect();
        images.sort();

        let os_tag = os_id.to_string();
        let chosen = images
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&os_tag))
            })
            .or(images.first())?;

        let size = file_size(chosen);
        Some(Asset {
            name: chosen
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("image")
                .to_string(),
            kind: AssetKind::BaseImage,
            path: chosen.clone(),
            size_bytes: size,
            valid: size >= self.min_image_bytes,
        })
    }

    fn resolve_drivers(
        &self,
        profile: &crate::core::devices::DeviceProfile,
        os_id: u32,
    ) -> Vec<DriverAsset> {
        let required_families = profile.driver_families_for(os_id);
        let mut drivers = Vec::new();

        for descriptor_path in find_descriptors(&self.drivers_dir) {
            let raw = match std::fs::read_to_string(&descriptor_path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(file = %descriptor_path.display(), error = %e, "unreadable driver descriptor");
                    continue;
                }
            };
            let descriptor: DriverDescriptor = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(file = %descriptor_path.display(), error = %e, "malformed driver descriptor");
                    continue;
                }
            };

            if !descriptor.supported_operating_systems.is_empty()
                && !descriptor.supported_operating_systems.contains(&os_id)
            {
                continue;
            }
            if let Some(family) = descriptor.driver_family_id
                && !required_families.is_empty()
                && !required_families.contains(&family)
            {
                continue;
            }

            let package_dir = descriptor_path.parent().unwrap_or(&self.drivers_dir);
            let driver_type = detect_driver_type(package_dir);
            let valid = has_file_with_extension(package_dir, driver_type.extension());

            drivers.push(DriverAsset {
                asset: Asset {
                    name: descriptor.driver_name.unwrap_or_else(|| {
                        package_dir
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("driver")
                            .to_string()
                    }),
                    kind: AssetKind::Driver,
                    path: package_dir.to_path_buf(),
                    size_bytes: dir_size(package_dir),
                    valid,
                },
                driver_type,
                family_id: descriptor.driver_family_id,
                supported_os: descriptor.supported_operating_systems,
                order: descriptor.order.unwrap_or(DEFAULT_ORDER),
            });
        }

        drivers.sort_by(|a, b| {
            (a.family_id, a.order, &a.asset.name).cmp(&(b.family_id, b.order, &b.asset.name))
        });
        drivers
    }

    /// Updates are ordered by the descriptor's explicit `order` field so
    /// prerequisites land before cumulative updates and applications.
    fn resolve_updates(&self, os_id: u32) -> Vec<UpdateAsset> {
        let mut updates = Vec::new();

        for descriptor_path in find_descriptors(&self.updates_dir) {
            let raw = match std::fs::read_to_string(&descriptor_path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(file = %descriptor_path.display(), error = %e, "unreadable update descriptor");
                    continue;
                }
            };
            let descriptor: UpdateDescriptor = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(file = %descriptor_path.display(), error = %e, "malformed update descriptor");
                    continue;
                }
            };

            if !descriptor.supported_operating_systems.is_empty()
                && !descriptor.supported_operating_systems.contains(&os_id)
            {
                continue;
            }

            let package = descriptor_path
                .parent()
                .unwrap_or(&self.updates_dir)
                .join(&descriptor.download_file_name);
            let update_type = descriptor.update_type.or_else(|| {
                package
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(UpdateType::from_extension)
            });
            let Some(update_type) = update_type else {
                tracing::warn!(file = %package.display(), "update package type unknown, skipping");
                continue;
            };

            let size = file_size(&package);
            updates.push(UpdateAsset {
                asset: Asset {
                    name: descriptor.update_name.unwrap_or_else(|| {
                        descriptor.download_file_name.clone()
                    }),
                    kind: AssetKind::Update,
                    path: package.clone(),
                    size_bytes: size,
                    valid: package.is_file() && size > 0,
                },
                update_type,
                version: descriptor.update_version,
                supported_os: descriptor.supported_operating_systems,
                order: descriptor.order.unwrap_or(DEFAULT_ORDER),
                reboot_required: descriptor.reboot_required,
            });
        }

        updates.sort_by(|a, b| (a.order, &a.asset.name).cmp(&(b.order, &b.asset.name)));
        updates
    }

    fn resolve_scripts(&self) -> Vec<Asset> {
        let mut scripts: Vec<Asset> = list_files_recursive(&self.scripts_dir)
            .into_iter()
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SCRIPT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .map(|p| {
                let size = file_size(&p);
                Asset {
                    name: p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("script")
                        .to_string(),
                    kind: AssetKind::Script,
                    path: p,
                    size_bytes: size,
                    valid: size > 0,
                }
            })
            .collect();
        scripts.sort_by(|a, b| a.path.cmp(&b.path));
        scripts
    }
}

fn detect_driver_type(dir: &Path) -> DriverType {
    if has_file_with_extension(dir, "inf") {
        DriverType::Inf
    } else if has_file_with_extension(dir, "appx") {
        DriverType::Appx
    } else {
        DriverType::Exe
    }
}

fn has_file_with_extension(dir: &Path, ext: &str) -> bool {
    list_files_recursive(dir)
        .iter()
        .any(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext)))
}

fn find_descriptors(root: &Path) -> Vec<PathBuf> {
    let mut descriptors: Vec<PathBuf> = list_files_recursive(root)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    descriptors.sort();
    descriptors
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

fn list_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn dir_size(dir: &Path) -> u64 {
    list_files_recursive(dir).iter().map(|p| file_size(p)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::devices::{DeviceProfile, OsSupport};

    fn profile(families: Vec<u32>) -> DeviceProfile {
        DeviceProfile {
            device_id: "test".to_string(),
            os_support: vec![OsSupport {
                os_id: 10,
                driver_family_ids: families,
            }],
            description: None,
        }
    }

    struct Tree {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn tree() -> Tree {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for sub in ["sbi", "drivers", "updates", "postdeploy"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        Tree { _dir: dir, root }
    }

    fn add_driver(root: &Path, name: &str, descriptor: &str, payload: &str) {
        let dir = root.join("drivers").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("driver.json"), descriptor).unwrap();
        std::fs::write(dir.join(payload), b"payload").unwrap();
    }

    fn add_update(root: &Path, name: &str, descriptor: &str, payload: Option<&str>) {
        let dir = root.join("updates").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("update.json"), descriptor).unwrap();
        if let Some(payload) = payload {
            std::fs::write(dir.join(payload), b"update bits").unwrap();
        }
    }

    #[test]
    fn picks_base_image_matching_os_id() {
        let t = tree();
        std::fs::write(t.root.join("sbi/w11_base.wim"), b"img").unwrap();
        std::fs::write(t.root.join("sbi/w10_base.wim"), b"img").unwrap();

        let catalog = AssetCatalog::new(&t.root, 0);
        let resolved = catalog.resolve(&profile(vec![]), 10);
        let base = resolved.base_image.unwrap();
        assert_eq!(base.name, "w10_base");
        assert!(base.valid);
    }

    #[test]
    fn undersized_base_image_is_invalid() {
        let t = tree();
        std::fs::write(t.root.join("sbi/w10.wim"), b"tiny").unwrap();

        let catalog = AssetCatalog::new(&t.root, 1024);
        let resolved = catalog.resolve(&profile(vec![]), 10);
        assert!(!resolved.base_image.unwrap().valid);
    }

    #[test]
    fn no_image_resolves_to_none() {
        let t = tree();
        let catalog = AssetCatalog::new(&t.root, 0);
        assert!(catalog.resolve(&profile(vec![]), 10).base_image.is_none());
    }

    #[test]
    fn filters_drivers_by_os_and_family() {
        let t = tree();
        add_driver(
            &t.root,
            "net",
            r#"{"driverName":"Net","driverFamilyId":7,"supportedOperatingSystems":[10],"order":2}"#,
            "net.inf",
        );
        add_driver(
            &t.root,
            "gpu",
            r#"{"driverName":"Gpu","driverFamilyId":9,"supportedOperatingSystems":[10],"order":1}"#,
            "gpu.inf",
        );
        add_driver(
            &t.root,
            "old",
            r#"{"driverName":"Old","driverFamilyId":7,"supportedOperatingSystems":[8]}"#,
            "old.inf",
        );

        let catalog = AssetCatalog::new(&t.root, 0);
        let resolved = catalog.resolve(&profile(vec![7]), 10);
        assert_eq!(resolved.drivers.len(), 1);
        assert_eq!(resolved.drivers[0].asset.name, "Net");
        assert!(resolved.drivers[0].driver_type.serviceable());
    }

    #[test]
    fn updates_sorted_by_explicit_order() {
        let t = tree();
        add_update(
            &t.root,
            "cumulative",
            r#"{"updateName":"Cumulative","supportedOperatingSystems":[10],"downloadFileName":"kb2.msu","order":20}"#,
            Some("kb2.msu"),
        );
        add_update(
            &t.root,
            "prereq",
            r#"{"updateName":"Servicing stack","supportedOperatingSystems":[10],"downloadFileName":"kb1.msu","order":10}"#,
            Some("kb1.msu"),
        );
        add_update(
            &t.root,
            "app",
            r#"{"updateName":"App","supportedOperatingSystems":[10],"downloadFileName":"setup.exe","order":30}"#,
            Some("setup.exe"),
        );

        let catalog = AssetCatalog::new(&t.root, 0);
        let resolved = catalog.resolve(&profile(vec![]), 10);
        let names: Vec<&str> = resolved.updates.iter().map(|u| u.asset.name.as_str()).collect();
        assert_eq!(names, vec!["Servicing stack", "Cumulative", "App"]);
        assert_eq!(resolved.updates[0].update_type, UpdateType::Msu);
        assert!(!resolved.updates[2].update_type.serviceable());
    }

    #[test]
    fn missing_update_payload_marks_asset_invalid() {
        let t = tree();
        add_update(
            &t.root,
            "ghost",
            r#"{"updateName":"Ghost","supportedOperatingSystems":[10],"downloadFileName":"gone.cab"}"#,
            None,
        );

        let catalog = AssetCatalog::new(&t.root, 0);
        let resolved = catalog.resolve(&profile(vec![]), 10);
        assert_eq!(resolved.updates.len(), 1);
        assert!(!resolved.updates[0].asset.valid);
        assert_eq!(resolved.invalid_count(), 1);
    }

    #[test]
    fn discovers_scripts_by_extension() {
        let t = tree();
        std::fs::write(t.root.join("postdeploy/install.ps1"), b"Write-Host hi").unwrap();
        std::fs::write(t.root.join("postdeploy/readme.md"), b"docs").unwrap();

        let catalog = AssetCatalog::new(&t.root, 0);
        let resolved = catalog.resolve(&profile(vec![]), 10);
        assert_eq!(resolved.scripts.len(), 1);
        assert_eq!(resolved.scripts[0].name, "install.ps1");
    }
}
