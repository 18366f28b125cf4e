use std::path::{Component, Path, PathBuf};

/// Check that `component` is a single, normal path segment.
///
/// Session ids end up in credential storage paths, so anything that could
/// escape the data directory is rejected.
pub fn validate_path_component(component: &str) -> Result<(), String> {
    if component.is_empty() {
        return Err("Path component cannot be empty".to_string());
    }

    let path = Path::new(component);
    let mut components = path.components();

    match components.next() {
        Some(Component::Normal(segment))
            if components.next().is_none() && segment.to_str() == Some(component) =>
        {
            Ok(())
        }
        _ => Err(format!("Invalid path component: {component}")),
    }
}

/// Credential storage directory for one identity: `{data_dir}/session-{id}`.
pub fn session_storage_dir(data_dir: &Path, session_id: &str) -> PathBuf {
    data_dir.join(format!("session-{session_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod validate_path_component {
        use super::*;

        #[test]
        fn accepts_plain_names() {
            assert!(validate_path_component("alice").is_ok());
            assert!(validate_path_component("acct-42_main").is_ok());
        }

        #[test]
        fn rejects_empty() {
            assert!(validate_path_component("").is_err());
        }

        #[test]
        fn rejects_traversal() {
            assert!(validate_path_component("..").is_err());
            assert!(validate_path_component(".").is_err());
            assert!(validate_path_component("../etc").is_err());
        }

        #[test]
        fn rejects_separators() {
            assert!(validate_path_component("a/b").is_err());
            assert!(validate_path_component("/abs").is_err());
            assert!(validate_path_component("trailing/").is_err());
        }
    }

    #[test]
    fn session_storage_dir_prefixes_id() {
        let dir = session_storage_dir(Path::new("/var/courier"), "alice");
        assert_eq!(dir, PathBuf::from("/var/courier/session-alice"));
    }
}
