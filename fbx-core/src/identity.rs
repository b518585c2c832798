//! Application identity sent to the device at registration

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RegistrationConfig;

const SUFFIX_LEN: usize = 7;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const GENERATED_NAME_PREFIX: &str = "rust_app";

/// Immutable identity of the registering application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    app_id: String,
    app_name: String,
    app_version: String,
    device_name: String,
}

impl AppIdentity {
    /// Build an identity, generating whatever the caller left out.
    ///
    /// With neither id nor name, both are generated and the id is derived from
    /// the name. With only one, the other is derived from it plus a random
    /// suffix. Empty strings count as missing.
    pub fn new(
        app_id: Option<&str>,
        app_name: Option<&str>,
        app_version: Option<&str>,
        device_name: Option<&str>,
    ) -> Self {
        let defaults = RegistrationConfig::default();
        Self::with_defaults(app_id, app_name, app_version, device_name, &defaults)
    }

    pub fn with_defaults(
        app_id: Option<&str>,
        app_name: Option<&str>,
        app_version: Option<&str>,
        device_name: Option<&str>,
        defaults: &RegistrationConfig,
    ) -> Self {
        let suffix = random_suffix();

        let (app_id, app_name) = match (present(app_id), present(app_name)) {
            (Some(id), Some(name)) => (id, name),
            (None, Some(name)) => (format!("fbx.{name}{suffix}"), name),
            (Some(id), None) => {
                let name = format!("{id}{suffix}");
                (id, name)
            }
            (None, None) => {
                let name = format!("{GENERATED_NAME_PREFIX}{suffix}");
                (format!("fbx.{name}"), name)
            }
        };

        Self {
            app_id,
            app_name,
            app_version: present(app_version).unwrap_or_else(|| defaults.app_version.clone()),
            device_name: present(device_name).unwrap_or_else(|| defaults.device_name.clone()),
        }
    }

    /// Fully generated identity
    pub fn generated() -> Self {
        Self::new(None, None, None, None)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn present(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

/// `_` followed by 7 lowercase alphanumerics
fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let chars: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("_{chars}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_suffix(s: &str) -> bool {
        s.len() == SUFFIX_LEN + 1
            && s.starts_with('_')
            && s[1..].bytes().all(|b| SUFFIX_CHARSET.contains(&b))
    }

    #[test]
    fn test_generated_identity() {
        let identity = AppIdentity::generated();

        let suffix = identity.app_name().strip_prefix(GENERATED_NAME_PREFIX).unwrap();
        assert!(is_suffix(suffix));
        assert_eq!(identity.app_id(), format!("fbx.{}", identity.app_name()));
        assert_eq!(identity.app_version(), "1.0.0");
        assert_eq!(identity.device_name(), "Rust");
    }

    #[test]
    fn test_name_only_derives_id() {
        let identity = AppIdentity::new(None, Some("my_app"), None, None);
        assert_eq!(identity.app_name(), "my_app");
        let suffix = identity.app_id().strip_prefix("fbx.my_app").unwrap();
        assert!(is_suffix(suffix));
    }

    #[test]
    fn test_id_only_derives_name() {
        let identity = AppIdentity::new(Some("fbx.my_app"), None, None, None);
        assert_eq!(identity.app_id(), "fbx.my_app");
        let suffix = identity.app_name().strip_prefix("fbx.my_app").unwrap();
        assert!(is_suffix(suffix));
    }

    #[test]
    fn test_explicit_identity_kept() {
        let identity = AppIdentity::new(
            Some("fbx.my_amazing_app"),
            Some("My Amazing App"),
            Some("2.3.0"),
            Some("My cool PC"),
        );
        assert_eq!(identity.app_id(), "fbx.my_amazing_app");
        assert_eq!(identity.app_name(), "My Amazing App");
        assert_eq!(identity.app_version(), "2.3.0");
        assert_eq!(identity.device_name(), "My cool PC");
    }

    #[test]
    fn test_empty_strings_are_missing() {
        let identity = AppIdentity::new(Some(""), Some(""), Some(""), Some(""));
        assert!(identity.app_name().starts_with(GENERATED_NAME_PREFIX));
        assert_eq!(identity.app_version(), "1.0.0");
        assert_eq!(identity.device_name(), "Rust");
    }

    #[test]
    fn test_serializes_wire_fields() {
        let identity = AppIdentity::new(Some("fbx.a"), Some("A"), None, Some("pc"));
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["app_id"], "fbx.a");
        assert_eq!(json["app_name"], "A");
        assert_eq!(json["app_version"], "1.0.0");
        assert_eq!(json["device_name"], "pc");
    }
}
