// tests/backups.rs

//! Backup rotation and restore instructions on a real directory tree.

mod common;

use armnas::Error;
use common::Appliance;
use filetime::FileTime;
use std::fs;

fn seed_backups(appliance: &Appliance, count: i64) {
    fs::create_dir_all(appliance.path("backups")).unwrap();
    for i in 0..count {
        let path = appliance.path(&format!("backups/backup_pre_update_0.1.{}_20240101_00000{}.tar.gz", i, i));
        fs::write(&path, b"archive").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000 + i * 60, 0)).unwrap();
    }
}

#[test]
fn test_rotation_keeps_newest_five() {
    let appliance = Appliance::new();
    seed_backups(&appliance, 7);
    fs::write(appliance.path("backups/README"), "not a backup").unwrap();

    let backups = appliance.backups();
    let removed = backups.rotate(5).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&"backup_pre_update_0.1.0_20240101_000000.tar.gz".to_string()));
    assert!(removed.contains(&"backup_pre_update_0.1.1_20240101_000001.tar.gz".to_string()));

    let kept: Vec<_> = backups.list().unwrap().into_iter().map(|b| b.filename).collect();
    assert_eq!(kept.len(), 5);
    assert_eq!(kept[0], "backup_pre_update_0.1.6_20240101_000006.tar.gz");
    assert!(appliance.path("backups/README").exists());

    // Nothing more to do
    assert!(backups.rotate(5).unwrap().is_empty());
}

#[test]
fn test_created_backup_survives_rotation() {
    let appliance = Appliance::new();
    seed_backups(&appliance, 5);

    let backups = appliance.backups();
    let record = backups.create_backup(Some("manual"), None).unwrap();
    backups.rotate(5).unwrap();

    let kept: Vec<_> = backups.list().unwrap().into_iter().map(|b| b.filename).collect();
    assert_eq!(kept.len(), 5);
    assert_eq!(kept[0], record.filename);
    assert!(!kept.contains(&"backup_pre_update_0.1.0_20240101_000000.tar.gz".to_string()));
}

#[test]
fn test_restore_plan_and_delete() {
    let appliance = Appliance::new();
    let backups = appliance.backups();
    let record = backups.create_backup(Some("pre_update"), Some("0.2.0")).unwrap();

    let plan = backups.restore_command(&record.filename).unwrap();
    assert!(plan.command.contains("tar -xzf"));
    assert!(plan.command.contains(&record.filename));

    backups.delete(&record.filename).unwrap();
    assert!(matches!(backups.delete(&record.filename), Err(Error::NotFound(_))));
    assert!(matches!(
        backups.restore_command(&record.filename),
        Err(Error::NotFound(_))
    ));
}
