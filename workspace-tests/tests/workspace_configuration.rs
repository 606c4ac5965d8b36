use std::fs;
use std::path::Path;

/// Workspace layout checks: members exist and share the workspace package metadata
#[cfg(test)]
mod workspace_configuration_tests {
    use super::*;

    const MEMBERS: [&str; 6] = [
        "bridge-common",
        "bridge-engine",
        "bridge-relay",
        "bridge-page",
        "bridge-host",
        "workspace-tests",
    ];

    fn manifest(path: &str) -> toml::Value {
        let content = fs::read_to_string(path).unwrap_or_else(|e| panic!("cannot read {}: {}", path, e));
        content.parse::<toml::Value>().unwrap_or_else(|e| panic!("invalid toml in {}: {}", path, e))
    }

    #[test]
    fn test_root_manifest_lists_every_member() {
        let root = manifest("../Cargo.toml");
        let members: Vec<&str> = root["workspace"]["members"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m.as_str())
            .collect();
        for member in MEMBERS {
            assert!(members.contains(&member), "missing workspace member {}", member);
            assert!(Path::new(&format!("../{}/Cargo.toml", member)).exists());
        }
        assert_eq!(root["workspace"]["resolver"].as_str(), Some("2"));
    }

    #[test]
    fn test_members_inherit_workspace_version() {
        for member in MEMBERS {
            let crate_manifest = manifest(&format!("../{}/Cargo.toml", member));
            let version = &crate_manifest["package"]["version"];
            assert_eq!(
                version.get("workspace").and_then(|w| w.as_bool()),
                Some(true),
                "{} should use version.workspace",
                member
            );
        }
    }

    #[test]
    fn test_host_has_library_and_binary() {
        let host = manifest("../bridge-host/Cargo.toml");
        assert_eq!(host["lib"]["name"].as_str(), Some("bridge_host"));
        let bins = host["bin"].as_array().unwrap();
        assert_eq!(bins[0]["name"].as_str(), Some("bridge-host"));
        assert!(Path::new("../bridge-host/src/main.rs").exists());
    }

    #[test]
    fn test_page_tier_does_not_depend_on_engine() {
        // The page only reaches the engine through the relay
        let page = manifest("../bridge-page/Cargo.toml");
        let deps = page["dependencies"].as_table().unwrap();
        assert!(deps.contains_key("bridge-common"));
        assert!(!deps.contains_key("bridge-engine"));
        assert!(!deps.contains_key("bridge-relay"));
    }
}
