#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::config::DbConfig;
    use crate::database::{is_segment_filename, Database, DbError};

    #[test]
    fn test_open_missing_directory_without_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope");

        let result = Database::open(&path, false);
        assert!(matches!(result, Err(DbError::NoDatabaseFound(_))));
    }

    #[test]
    fn test_open_creates_directory_when_asked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh");

        let db = Database::open(&path, true).unwrap();
        assert!(path.is_dir());
        db.close().unwrap();
    }

    #[test]
    fn test_open_rejects_plain_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"not a database").unwrap();

        let result = Database::open(&path, false);
        assert!(matches!(result, Err(DbError::NotADirectory(_))));
    }

    #[test]
    fn test_open_rejects_foreign_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), b"hello").unwrap();

        let result = Database::open(dir.path(), true);
        assert!(matches!(result, Err(DbError::NotValidDatabase(_))));
    }

    #[test]
    fn test_open_rejects_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        // A writer died between writing and renaming.
        fs::write(dir.path().join("main.keys.3.tmp"), b"partial").unwrap();

        let result = Database::open(dir.path(), true);
        assert!(matches!(result, Err(DbError::StaleTempFile(_))));
    }

    #[test]
    fn test_empty_directory_is_a_valid_database() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path(), false).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_second_open_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path(), true).unwrap();

        let second = Database::open(dir.path(), true);
        assert!(matches!(second, Err(DbError::DatabaseInUse)));

        db.close().unwrap();
    }

    #[test]
    fn test_remove_refuses_held_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path, true).unwrap();

        assert!(matches!(
            Database::remove(&path),
            Err(DbError::DatabaseInUse)
        ));

        db.close().unwrap();
        Database::remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_tolerates_temp_litter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crashed");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("main.keys.1.tmp"), b"partial").unwrap();

        // Open must refuse the crashed directory, remove must still work.
        assert!(matches!(
            Database::open(&path, false),
            Err(DbError::StaleTempFile(_))
        ));
        Database::remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Database::open_with_config(dir.path(), true, DbConfig { max_segments: 0 });
        assert!(matches!(result, Err(DbError::InvalidConfig(_))));
    }

    #[test]
    fn test_segment_filename_recognition() {
        assert!(is_segment_filename("main.keys.1"));
        assert!(is_segment_filename("main.data.42"));
        assert!(is_segment_filename("main.merged..7.keys.42"));
        assert!(is_segment_filename("a.b.keys.0"));

        assert!(!is_segment_filename("main.keys.1.tmp"));
        assert!(!is_segment_filename("main.keys."));
        assert!(!is_segment_filename("main.keys.abc"));
        assert!(!is_segment_filename("lockfile"));
        assert!(!is_segment_filename("README.md"));
    }
}
