//! Environment-resolved configuration.
//!
//! All environment access happens here, exactly once, at startup. Every
//! component receives the resolved [`Settings`] through its constructor;
//! nothing else in the crate reads process environment state.

use std::env;
use std::path::PathBuf;

/// Filesystem root for kustomize overlays.
pub const DEFAULT_KUSTOMIZE_ROOT: &str = "./k8s/";
/// Overlay rendered by `workon --apply`.
pub const DEFAULT_KUSTOMIZE_OVERLAY: &str = "local";
/// Annotation key read from scalable resources to obtain the local port.
pub const DEFAULT_LOCAL_PORT_ANNOTATION: &str = "devexy/local-port";

/// Resolved configuration for a controller run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory containing the kustomize tree (`KUSTOMIZE_ROOT`).
    pub kustomize_root: PathBuf,
    /// Overlay name under `<root>/overlays` (`KUSTOMIZE_OVERLAY`).
    pub kustomize_overlay: String,
    /// Annotation key carrying the workload's local port (`LOCAL_PORT_ANNOTATION`).
    pub local_port_annotation: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kustomize_root: PathBuf::from(DEFAULT_KUSTOMIZE_ROOT),
            kustomize_overlay: DEFAULT_KUSTOMIZE_OVERLAY.to_string(),
            local_port_annotation: DEFAULT_LOCAL_PORT_ANNOTATION.to_string(),
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(|key| env::var(key).ok())
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            kustomize_root: lookup("KUSTOMIZE_ROOT")
                .map_or(defaults.kustomize_root, PathBuf::from),
            kustomize_overlay: lookup("KUSTOMIZE_OVERLAY")
                .unwrap_or(defaults.kustomize_overlay),
            local_port_annotation: lookup("LOCAL_PORT_ANNOTATION")
                .unwrap_or(defaults.local_port_annotation),
        }
    }

    /// Directory of the overlay selected for this run.
    #[must_use]
    pub fn overlay_dir(&self) -> PathBuf {
        self.kustomize_root
            .join("overlays")
            .join(&self.kustomize_overlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_environment_is_empty() {
        let settings = Settings::resolve(|_| None);
        assert_eq!(settings.kustomize_root, PathBuf::from("./k8s/"));
        assert_eq!(settings.kustomize_overlay, "local");
        assert_eq!(settings.local_port_annotation, "devexy/local-port");
    }

    #[test]
    fn environment_overrides_win() {
        let settings = Settings::resolve(|key| match key {
            "KUSTOMIZE_ROOT" => Some("/srv/manifests".to_string()),
            "KUSTOMIZE_OVERLAY" => Some("staging".to_string()),
            "LOCAL_PORT_ANNOTATION" => Some("acme/dev-port".to_string()),
            _ => None,
        });
        assert_eq!(settings.kustomize_root, PathBuf::from("/srv/manifests"));
        assert_eq!(settings.kustomize_overlay, "staging");
        assert_eq!(settings.local_port_annotation, "acme/dev-port");
    }

    #[test]
    fn overlay_dir_joins_root_and_overlay() {
        let settings = Settings::resolve(|key| match key {
            "KUSTOMIZE_ROOT" => Some("/srv/manifests".to_string()),
            "KUSTOMIZE_OVERLAY" => Some("staging".to_string()),
            _ => None,
        });
        assert_eq!(
            settings.overlay_dir(),
            PathBuf::from("/srv/manifests/overlays/staging")
        );
    }
}
