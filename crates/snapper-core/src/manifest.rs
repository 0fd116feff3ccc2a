//! SnApp manifest types and validation.
//!
//! A manifest is the immutable on-disk descriptor (`snap.json`) declaring an
//! app's identity, entry point, capability requests, and host requirements.
//! Validation is the single place the kernel inspects manifest contents;
//! every later component trusts the registry's acceptance.
//!
//! Unknown permission tags and over-long short names are warnings, not
//! failures; a manifest written for a newer host still registers.

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::KernelError;
use crate::error::KernelResult;

/// Capability tag from the closed permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    StorageRead,
    StorageWrite,
    StorageDelete,
    SessionHook,
    PromptInject,
    UiTab,
    UiPanel,
    UiModal,
    UiToast,
    CommandRegister,
    ToolRegister,
    ToolWrap,
    FsRead,
    FsWrite,
    BusPublish,
    BusSubscribe,
    SystemExec,
    NetworkRequest,
}

impl Permission {
    /// Every member of the closed set, in declaration order.
    pub const ALL: [Permission; 18] = [
        Permission::StorageRead,
        Permission::StorageWrite,
        Permission::StorageDelete,
        Permission::SessionHook,
        Permission::PromptInject,
        Permission::UiTab,
        Permission::UiPanel,
        Permission::UiModal,
        Permission::UiToast,
        Permission::CommandRegister,
        Permission::ToolRegister,
        Permission::ToolWrap,
        Permission::FsRead,
        Permission::FsWrite,
        Permission::BusPublish,
        Permission::BusSubscribe,
        Permission::SystemExec,
        Permission::NetworkRequest,
    ];

    /// The manifest tag for this permission, e.g. `storage:read`.
    pub fn tag(self) -> &'static str {
        match self {
            Permission::StorageRead => "storage:read",
            Permission::StorageWrite => "storage:write",
            Permission::StorageDelete => "storage:delete",
            Permission::SessionHook => "session:hook",
            Permission::PromptInject => "prompt:inject",
            Permission::UiTab => "ui:tab",
            Permission::UiPanel => "ui:panel",
            Permission::UiModal => "ui:modal",
            Permission::UiToast => "ui:toast",
            Permission::CommandRegister => "command:register",
            Permission::ToolRegister => "tool:register",
            Permission::ToolWrap => "tool:wrap",
            Permission::FsRead => "fs:read",
            Permission::FsWrite => "fs:write",
            Permission::BusPublish => "bus:publish",
            Permission::BusSubscribe => "bus:subscribe",
            Permission::SystemExec => "system:exec",
            Permission::NetworkRequest => "network:request",
        }
    }

    /// Parse a manifest tag. `None` for tags outside the closed set.
    pub fn parse(tag: &str) -> Option<Permission> {
        Permission::ALL.into_iter().find(|p| p.tag() == tag)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Host requirements declared under the manifest's `openclaw` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenclawRequirements {
    /// Minimum host version the app was written against.
    pub min_version: String,
    /// Advisory list of hook names the app intends to subscribe to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

/// App-declared configuration schema and defaults. Opaque to the kernel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Value>,
}

/// Immutable descriptor loaded from an app directory's `snap.json`.
///
/// Permissions are kept as raw tags so a manifest that requests capabilities
/// this kernel does not know about still parses; [`SnappManifest::granted_permissions`]
/// filters to the closed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnappManifest {
    /// Kebab-case app identity, unique within the catalog.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Path to the factory module, relative to the app directory.
    pub entry: String,
    /// Requested capability tags.
    pub permissions: Vec<String>,
    /// Host requirements.
    pub openclaw: OpenclawRequirements,
    /// Short label for tight UI slots. Warned about above 5 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    /// Semantic version (major.minor.patch, optional prerelease/build).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ManifestConfig>,
}

impl SnappManifest {
    /// Validate this manifest against the registration rules.
    ///
    /// Hard failures: missing required fields (a required field that
    /// deserialized empty counts as missing), a non-kebab-case id, or a
    /// malformed version. Unknown permission tags and over-long short names
    /// only warn.
    pub fn validate(&self) -> KernelResult<()> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("entry", &self.entry),
            ("openclaw.minVersion", &self.openclaw.min_version),
        ] {
            if value.is_empty() {
                return Err(KernelError::InvalidManifest {
                    reason: format!("missing required field '{field}'"),
                });
            }
        }

        if !is_kebab_case(&self.id) {
            return Err(KernelError::InvalidManifest {
                reason: format!("id '{}' is not kebab-case", self.id),
            });
        }

        if let Some(version) = &self.version
            && !has_semver_prefix(version)
        {
            return Err(KernelError::InvalidManifest {
                reason: format!("version '{version}' is not major.minor.patch"),
            });
        }

        for tag in &self.permissions {
            if Permission::parse(tag).is_none() {
                warn!(snapp = %self.id, permission = %tag, "unknown permission tag ignored");
            }
        }

        if let Some(short) = &self.short_name
            && short.chars().count() > 5
        {
            warn!(snapp = %self.id, short_name = %short, "shortName longer than 5 characters");
        }

        Ok(())
    }

    /// The requested permissions that fall inside the closed set.
    pub fn granted_permissions(&self) -> HashSet<Permission> {
        self.permissions
            .iter()
            .filter_map(|tag| Permission::parse(tag))
            .collect()
    }
}

/// `^[a-z0-9]+(-[a-z0-9]+)*$` without pulling in a regex engine.
fn is_kebab_case(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    let mut prev_dash = true; // leading dash is invalid
    for c in id.chars() {
        match c {
            'a'..='z' | '0'..='9' => prev_dash = false,
            '-' if !prev_dash => prev_dash = true,
            _ => return false,
        }
    }
    !prev_dash
}

/// Whether `version` begins with `major.minor.patch` numeric components.
/// Anything after the third component (prerelease, build) is accepted.
fn has_semver_prefix(version: &str) -> bool {
    let mut rest = version;
    for i in 0..3 {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        if i < 2 {
            match rest.strip_prefix('.') {
                Some(r) => rest = r,
                None => return false,
            }
        }
    }
    rest.is_empty() || rest.starts_with(['-', '+', '.'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str) -> SnappManifest {
        SnappManifest {
            id: id.to_string(),
            name: "Test App".to_string(),
            entry: "./index".to_string(),
            permissions: vec!["storage:read".to_string()],
            openclaw: OpenclawRequirements {
                min_version: "2.0.0".to_string(),
                hooks: None,
            },
            short_name: None,
            version: None,
            description: None,
            icon: None,
            author: None,
            config: None,
        }
    }

    #[test]
    fn permission_tags_round_trip() {
        for p in Permission::ALL {
            assert_eq!(Permission::parse(p.tag()), Some(p), "tag {}", p.tag());
        }
        assert_eq!(Permission::parse("storage:execute"), None);
    }

    #[test]
    fn valid_manifest_passes() {
        manifest("my-app").validate().expect("should validate");
    }

    #[test]
    fn empty_required_field_is_missing() {
        let mut m = manifest("my-app");
        m.entry = String::new();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("entry"), "got: {err}");
    }

    #[test]
    fn missing_min_version_names_the_field() {
        let mut m = manifest("my-app");
        m.openclaw.min_version = String::new();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("openclaw.minVersion"), "got: {err}");
    }

    #[test]
    fn kebab_case_ids() {
        for ok in ["a", "abc", "a-b", "app-2", "a1-b2-c3"] {
            assert!(is_kebab_case(ok), "{ok} should be accepted");
        }
        for bad in ["", "-a", "a-", "a--b", "My-App", "a_b", "a.b"] {
            assert!(!is_kebab_case(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn invalid_id_rejected() {
        assert!(manifest("Not-Kebab").validate().is_err());
    }

    #[test]
    fn semver_prefix_check() {
        for ok in ["1.2.3", "0.0.1", "10.20.30", "1.2.3-rc.1", "1.2.3+build5"] {
            assert!(has_semver_prefix(ok), "{ok} should be accepted");
        }
        for bad in ["1.2", "1", "v1.2.3", "1.2.x", ""] {
            assert!(!has_semver_prefix(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn bad_version_rejected() {
        let mut m = manifest("my-app");
        m.version = Some("1.2".to_string());
        assert!(m.validate().is_err());
    }

    #[test]
    fn unknown_permission_is_not_fatal() {
        let mut m = manifest("my-app");
        m.permissions.push("quantum:entangle".to_string());
        m.validate().expect("unknown permission should only warn");
        assert_eq!(m.granted_permissions().len(), 1);
    }

    #[test]
    fn long_short_name_is_not_fatal() {
        let mut m = manifest("my-app");
        m.short_name = Some("toolong".to_string());
        m.validate().expect("long shortName should only warn");
    }

    #[test]
    fn manifest_parses_camel_case_json() {
        let json = r#"{
            "id": "notes",
            "name": "Notes",
            "entry": "./notes",
            "permissions": ["storage:read", "storage:write"],
            "shortName": "notes",
            "openclaw": { "minVersion": "2.0.0", "hooks": ["session_start"] },
            "config": { "defaults": { "theme": "dark" } }
        }"#;
        let m: SnappManifest = serde_json::from_str(json).expect("should parse");
        assert_eq!(m.short_name.as_deref(), Some("notes"));
        assert_eq!(m.openclaw.min_version, "2.0.0");
        assert!(
            m.granted_permissions().contains(&Permission::StorageWrite),
            "storage:write should be granted"
        );
        assert!(m.config.unwrap().defaults.is_some());
    }
}
