//! Typed environment specification read by `cvd load` and checked by
//! `cvd lint`.

use std::collections::HashSet;
use std::path::Path;

use cvd_core::{is_valid_group_name, is_valid_instance_name};
use serde::{Deserialize, Serialize};

use crate::error::CvdError;

pub const DEFAULT_DISPLAY_WIDTH: u32 = 720;
pub const DEFAULT_DISPLAY_HEIGHT: u32 = 1280;
pub const DEFAULT_DISPLAY_DPI: u32 = 320;
pub const DEFAULT_REFRESH_RATE_HZ: u32 = 60;

/// A whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSpecification {
    pub common: CommonSpec,
    pub instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSpec {
    pub group_name: Option<String>,
    /// Local directory holding the host tools.
    pub host_package: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    pub name: Option<String>,
    /// Passed through to the launcher untouched.
    pub vm: serde_json::Value,
    pub disk: DiskSpec,
    pub graphics: GraphicsSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    /// Local image directory, or a remote build reference.
    pub default_build: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsSpec {
    pub displays: Vec<DisplaySpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySpec {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub refresh_rate_hertz: u32,
}

impl Default for DisplaySpec {
    fn default() -> Self {
        Self {
            width: DEFAULT_DISPLAY_WIDTH,
            height: DEFAULT_DISPLAY_HEIGHT,
            dpi: DEFAULT_DISPLAY_DPI,
            refresh_rate_hertz: DEFAULT_REFRESH_RATE_HZ,
        }
    }
}

impl InstanceSpec {
    /// Configured displays, or one default display when none are listed.
    #[must_use]
    pub fn displays(&self) -> Vec<DisplaySpec> {
        if self.graphics.displays.is_empty() {
            vec![DisplaySpec::default()]
        } else {
            self.graphics.displays.clone()
        }
    }

    /// The image directory if `default_build` names a local path.
    #[must_use]
    pub fn local_image_dir(&self) -> Option<&Path> {
        self.disk.default_build.as_deref().filter(|b| b.starts_with('/')).map(Path::new)
    }
}

impl EnvironmentSpecification {
    /// Parse JSON text.
    ///
    /// # Errors
    /// [`CvdError::BadRequest`] if the text is not a valid specification.
    pub fn parse(text: &str) -> Result<Self, CvdError> {
        serde_json::from_str(text).map_err(|e| CvdError::BadRequest(format!("invalid configuration: {e}")))
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    /// [`CvdError::Io`] if the file cannot be read, otherwise as
    /// [`parse`](Self::parse).
    pub fn load(path: &Path) -> Result<Self, CvdError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CvdError::io(format!("reading configuration {}", path.display()), e))?;
        Self::parse(&text)
    }

    /// Check names and display geometry.
    ///
    /// # Errors
    /// [`CvdError::BadRequest`] describing the first problem found.
    pub fn validate(&self) -> Result<(), CvdError> {
        let bad = |msg: String| Err(CvdError::BadRequest(msg));
        if self.instances.is_empty() {
            return bad("configuration lists no instances".to_owned());
        }
        if let Some(group) = &self.common.group_name {
            if !is_valid_group_name(group) {
                return bad(format!("invalid group name \"{group}\""));
            }
        }
        let mut names = HashSet::new();
        for (index, instance) in self.instances.iter().enumerate() {
            if let Some(name) = &instance.name {
                if !is_valid_instance_name(name) {
                    return bad(format!("instances[{index}]: invalid instance name \"{name}\""));
                }
                if !names.insert(name.as_str()) {
                    return bad(format!("instances[{index}]: instance name \"{name}\" repeated"));
                }
            }
            if !instance.vm.is_null() && !instance.vm.is_object() {
                return bad(format!("instances[{index}].vm must be an object"));
            }
            for (d, display) in instance.graphics.displays.iter().enumerate() {
                if display.width == 0 || display.height == 0 || display.dpi == 0 || display.refresh_rate_hertz == 0 {
                    return bad(format!("instances[{index}].graphics.displays[{d}] has a zero dimension"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> EnvironmentSpecification {
        match EnvironmentSpecification::parse(text) {
            Ok(s) => s,
            Err(e) => panic!("parse failed: {e}"),
        }
    }

    #[test]
    fn display_fields_default_individually() {
        let spec = parse(r#"{"instances":[{"graphics":{"displays":[{"width":1080}]}}, {}]}"#);
        let first = spec.instances[0].displays();
        assert_eq!(first, vec![DisplaySpec { width: 1080, ..DisplaySpec::default() }]);
        assert_eq!(spec.instances[1].displays(), vec![DisplaySpec::default()]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn validate_rejects_repeated_names_and_zero_geometry() {
        let repeated = parse(r#"{"instances":[{"name":"a"},{"name":"a"}]}"#);
        assert!(matches!(repeated.validate(), Err(CvdError::BadRequest(_))));
        let zero = parse(r#"{"instances":[{"graphics":{"displays":[{"dpi":0}]}}]}"#);
        assert!(matches!(zero.validate(), Err(CvdError::BadRequest(_))));
        assert!(parse("{}").validate().is_err());
    }

    #[test]
    fn malformed_json_is_bad_request() {
        assert!(matches!(EnvironmentSpecification::parse("{"), Err(CvdError::BadRequest(_))));
    }

    #[test]
    fn local_image_dir_needs_absolute_path() {
        let spec = parse(r#"{"instances":[{"disk":{"default_build":"/img"}},{"disk":{"default_build":"aosp-main/x"}}]}"#);
        assert_eq!(spec.instances[0].local_image_dir(), Some(Path::new("/img")));
        assert_eq!(spec.instances[1].local_image_dir(), None);
    }
}
