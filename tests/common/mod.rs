use chapterflow::config::Config;
use chapterflow::storage::Database;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn create_temp_database() -> (Database, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("chapterflow.db");
    let db = Database::new_with_path(db_path).expect("failed to create database with path");
    (db, tmp)
}

#[allow(dead_code)]
pub fn config_for(db: &Database) -> Config {
    let mut config = Config::default();
    config.storage.db_path = Some(db.path().to_path_buf());
    config
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
