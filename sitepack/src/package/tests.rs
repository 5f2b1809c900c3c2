use super::*;

use std::fs::write;

use chrono::TimeZone;

use crate::filter::Component;

fn package() -> Package {
    Package::builder(7, "mysite")
        .hash("abc123")
        .storage(1)
        .storage(2)
        .build()
}

#[test]
fn test_builder() {
    let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    let package = Package::builder(1, "site")
        .created_at(created_at)
        .components(ComponentSet::new([Component::Database]))
        .format(ArchiveFormat::DupArchive)
        .storage(3)
        .build();

    assert_eq!(PackageStatus::PRE_PROCESS, package.status());
    assert!(package.hash.ends_with("_20240301123000"));
    assert_eq!(20 + 1 + 14, package.hash.len());
    assert_eq!(1, package.upload_infos.len());
    assert_eq!(3, package.upload_infos[0].storage_id);
    assert!(package.archive_file_name().ends_with("_archive.daf"));
    assert_eq!(
        format!("site_{}_installer.php", package.hash),
        package.installer_file_name()
    );
}

#[test]
fn test_status_transitions() {
    let mut package = package();

    package.set_status(PackageStatus::DB_START).unwrap();
    package.set_status(PackageStatus::DB_START).unwrap();
    package.set_status(PackageStatus::ARC_START).unwrap();

    // no going backwards
    package.set_status(PackageStatus::SCANNING).unwrap_err();
    assert_eq!(PackageStatus::ARC_START, package.status());

    // failure is always possible
    package.fail(PackageStatus::BUILD_CANCELLED).unwrap();
    assert_eq!(PackageStatus::BUILD_CANCELLED, package.status());

    // and terminal
    package.set_status(PackageStatus::COMPLETE).unwrap_err();
    package.fail(PackageStatus::ERROR).unwrap_err();
    assert_eq!(PackageStatus::BUILD_CANCELLED, package.status());
}

#[test]
fn test_fail_requires_negative() {
    let mut package = package();
    let err = package.fail(PackageStatus::COMPLETE).unwrap_err();
    assert_eq!("NotAFailureStatus", err.name());
}

#[test]
fn test_display_status() {
    let mut package = package();
    package.set_status(PackageStatus::ARC_START).unwrap();

    let mut pending = HashSet::new();
    assert_eq!(PackageStatus::ARC_START, package.display_status(&pending));

    pending.insert(package.id);
    assert_eq!(PackageStatus::PENDING_CANCEL, package.display_status(&pending));
    assert_eq!(PackageStatus::ARC_START, package.status());
}

#[test]
fn test_is_building() {
    let mut package = package();
    assert!(!package.is_building());
    assert_eq!(package.status().is_building(), package.is_building());

    package.set_status(PackageStatus::SCANNING).unwrap();
    assert!(package.is_building());

    package.set_status(PackageStatus::COPIED_PACKAGE).unwrap();
    assert!(!package.is_building());

    package.fail(PackageStatus::STORAGE_CANCELLED).unwrap();
    assert!(!package.is_building());
}

#[test]
fn test_archive_size_while_building() {
    let dir = tempfile::tempdir().unwrap();
    let mut package = package();
    package.set_status(PackageStatus::ARC_START).unwrap();
    package.archive.size = 999;

    let prefix = package.name_hash();
    write(dir.path().join(format!("{}_archive.zip.tmp", prefix)), [0u8; 100]).unwrap();
    write(dir.path().join(format!("{}_database.sql", prefix)), [0u8; 20]).unwrap();
    write(dir.path().join("othersite_abc123_archive.zip"), [0u8; 50]).unwrap();

    assert_eq!(120, package.archive_size(dir.path()));

    // missing directory
    assert_eq!(0, package.archive_size(&dir.path().join("gone")));

    package.set_status(PackageStatus::COPIED_PACKAGE).unwrap();
    assert_eq!(999, package.archive_size(dir.path()));
}

#[test]
fn test_latest_upload_wins() {
    let mut package = package();
    package.upload_infos[0].failed = true;
    package.add_upload(1);

    let latest = package.latest_uploads();
    assert_eq!(2, latest.len());
    assert_eq!(1, latest[0].storage_id);
    assert!(!latest[0].failed);
    assert_eq!(2, latest[1].storage_id);

    assert!(!package.latest_upload(1).unwrap().failed);
    assert_eq!(vec![1, 2], package.storage_ids());
    assert!(package.latest_upload(5).is_none());
}

#[test]
fn test_transfer_outcome() {
    let mut package = package();
    assert_eq!(None, package.transfer_outcome());

    for info in package.upload_infos.iter_mut() {
        info.start();
    }
    package.upload_infos[0].failed = true;
    assert_eq!(None, package.transfer_outcome());

    package.upload_infos[1].copied_installer = true;
    package.upload_infos[1].copied_archive = true;
    assert_eq!(Some(PackageStatus::COMPLETE), package.transfer_outcome());

    package.upload_infos[1].failed = true;
    assert_eq!(Some(PackageStatus::STORAGE_FAILED), package.transfer_outcome());

    for info in package.upload_infos.iter_mut() {
        info.cancel();
    }
    assert_eq!(
        Some(PackageStatus::STORAGE_CANCELLED),
        package.transfer_outcome()
    );
}

#[test]
fn test_transfer_percent() {
    let mut package = package();
    package.upload_infos[0].set_progress(50.0);
    package.upload_infos[1].cancel();
    assert_eq!(75.0, package.transfer_percent());
}

#[test]
fn test_reset_build_state() {
    let mut package = package();
    package.set_status(PackageStatus::COMPLETE).unwrap();
    package.archive.size = 10;
    package.database.tables_total = 12;
    package.database.excluded_tables = vec!["wp_logs".to_string()];
    package.upload_infos[0].copied_archive = true;
    package.add_upload(1);

    package.reset_build_state();

    assert_eq!(7, package.id);
    assert_eq!("abc123", package.hash);
    assert_eq!(PackageStatus::PRE_PROCESS, package.status());
    assert_eq!(0, package.archive.size);
    assert_eq!(0, package.database.tables_total);
    assert_eq!(vec!["wp_logs".to_string()], package.database.excluded_tables);
    assert_eq!(vec![UploadInfo::new(1), UploadInfo::new(2)], package.upload_infos);
}

#[test]
fn test_serde() {
    let mut package = package();
    package.set_status(PackageStatus::from_raw(87)).unwrap();

    let json = serde_json::to_value(&package).unwrap();
    assert_eq!(87, json["status"]);

    let reparsed: Package = serde_json::from_value(json).unwrap();
    assert_eq!(package, reparsed);
}
