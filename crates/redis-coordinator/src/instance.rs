use std::path::Path;

use uuid::Uuid;

/// Load or create the persisted instance identity.
///
/// The file stores a bare UUID; the running process appends its own PID to
/// form `UUID-PID` so concurrent processes on one host stay distinct. An id
/// with four hyphens is a bare UUID; with five, the last segment is a PID to
/// strip before reuse.
pub fn load_or_create_instance_id(path: &Path, pid: u32) -> String {
    if let Ok(persisted) = std::fs::read_to_string(path) {
        let persisted = persisted.trim();
        if !persisted.is_empty() {
            let uuid_part = match persisted.matches('-').count() {
                5 => persisted.rsplit_once('-').map(|(head, _)| head).unwrap_or(persisted),
                4 => persisted,
                n => {
                    tracing::warn!(
                        dash_count = n,
                        id = persisted,
                        "unexpected instance id format, using as-is"
                    );
                    persisted
                }
            };
            let instance_id = format!("{uuid_part}-{pid}");
            tracing::info!(instance_id = %instance_id, "loaded persisted instance id");
            return instance_id;
        }
    }

    let uuid_part = Uuid::new_v4().to_string();
    if let Err(e) = std::fs::write(path, &uuid_part) {
        tracing::warn!(error = %e, path = %path.display(), "failed to persist instance id");
    }
    let instance_id = format!("{uuid_part}-{pid}");
    tracing::info!(instance_id = %instance_id, "created new instance id");
    instance_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reloads_bare_uuid() {
        let dir = std::env::temp_dir().join(format!("coord-id-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".redis_instance_id");

        let first = load_or_create_instance_id(&path, 111);
        assert!(first.ends_with("-111"));

        // File holds the bare UUID (4 hyphens), not the PID-qualified id.
        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored.matches('-').count(), 4);

        let second = load_or_create_instance_id(&path, 222);
        assert!(second.ends_with("-222"));
        assert_eq!(
            first.rsplit_once('-').unwrap().0,
            second.rsplit_once('-').unwrap().0
        );
    }

    #[test]
    fn strips_pid_from_legacy_file() {
        let dir = std::env::temp_dir().join(format!("coord-id-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".redis_instance_id");

        let uuid = Uuid::new_v4().to_string();
        std::fs::write(&path, format!("{uuid}-9999")).unwrap();

        let id = load_or_create_instance_id(&path, 42);
        assert_eq!(id, format!("{uuid}-42"));
    }
}
