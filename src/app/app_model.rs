use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::error::AppError;

pub const TYPE_ACTIVITY: &str = "a";

/// One component entry of the static-analysis component model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentModel {
    pub class_name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub exported: Option<bool>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InnerClass,
    Disabled,
    NotExported,
    UnsupportedType,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::InnerClass => "inner class",
            SkipReason::Disabled => "not enabled",
            SkipReason::NotExported => "not exported",
            SkipReason::UnsupportedType => "unsupported component type",
        }
    }
}

impl ComponentModel {
    /// Why this component cannot be tested, if it cannot.
    pub fn skip_reason(&self, only_exported: bool) -> Option<SkipReason> {
        if self.class_name.contains('$') {
            Some(SkipReason::InnerClass)
        } else if self.enabled == Some(false) {
            Some(SkipReason::Disabled)
        } else if only_exported && self.exported == Some(false) {
            Some(SkipReason::NotExported)
        } else if self.kind != TYPE_ACTIVITY {
            Some(SkipReason::UnsupportedType)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawAppModel {
    package: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    components: Vec<ComponentModel>,
}

/// Package plus its components, ordered by class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppModel {
    pub package: String,
    pub version: Option<String>,
    pub components: Vec<ComponentModel>,
}

impl AppModel {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let parsed: RawAppModel = serde_json::from_str(raw)
            .map_err(|err| AppError::validation(format!("Failed to parse component model: {err}"), ""))?;
        if parsed.package.trim().is_empty() {
            return Err(AppError::validation("Component model has no package", ""));
        }
        let mut components = parsed.components;
        components.sort_by(|a, b| a.class_name.cmp(&b.class_name));
        components.dedup_by(|a, b| a.class_name == b.class_name);
        Ok(Self {
            package: parsed.package,
            version: parsed.version,
            components,
        })
    }

    pub fn load(model_root: &Path, apk: &Path) -> Result<Self, AppError> {
        let path = model_path(model_root, apk);
        let raw = fs::read_to_string(&path).map_err(|err| {
            AppError::dependency(format!("Failed to read {}: {err}", path.display()), "")
        })?;
        Self::from_json(&raw)
    }
}

/// `<model_root>/<apk stem>/ICCSpecification/ComponentModel.json`
pub fn model_path(model_root: &Path, apk: &Path) -> PathBuf {
    let stem = apk
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    model_root
        .join(stem)
        .join("ICCSpecification")
        .join("ComponentModel.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODEL: &str = r#"{
        "package": "com.x",
        "version": "1.0",
        "components": [
            {"className": "com.x.Zed", "type": "a", "exported": true},
            {"className": "com.x.Main", "type": "a"},
            {"className": "com.x.Main$Inner", "type": "a"},
            {"className": "com.x.Sync", "type": "s"},
            {"className": "com.x.Hidden", "type": "a", "exported": false},
            {"className": "com.x.Off", "type": "a", "enabled": false}
        ]
    }"#;

    #[test]
    fn components_are_sorted_by_class_name() {
        let model = AppModel::from_json(MODEL).expect("model");
        let names: Vec<&str> = model.components.iter().map(|c| c.class_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["com.x.Hidden", "com.x.Main", "com.x.Main$Inner", "com.x.Off", "com.x.Sync", "com.x.Zed"]
        );
    }

    #[test]
    fn skip_rules() {
        let model = AppModel::from_json(MODEL).expect("model");
        let reasons: Vec<Option<SkipReason>> =
            model.components.iter().map(|c| c.skip_reason(true)).collect();
        assert_eq!(
            reasons,
            vec![
                Some(SkipReason::NotExported),
                None,
                Some(SkipReason::InnerClass),
                Some(SkipReason::Disabled),
                Some(SkipReason::UnsupportedType),
                None,
            ]
        );
        assert_eq!(model.components[0].skip_reason(false), None);
    }

    #[test]
    fn loads_from_apk_stem_directory() {
        let dir = TempDir::new().expect("tmp");
        let apk = Path::new("/apks/demo-release.apk");
        let path = model_path(dir.path(), apk);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, MODEL).expect("write");
        assert!(path.ends_with("demo-release/ICCSpecification/ComponentModel.json"));
        assert_eq!(AppModel::load(dir.path(), apk).expect("load").package, "com.x");

        let err = AppModel::load(dir.path(), Path::new("other.apk")).expect_err("missing");
        assert_eq!(err.code, "ERR_DEPENDENCY");
    }
}
